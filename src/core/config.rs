//! Engine and connection configuration.
//!
//! Configuration is immutable after construction: [`StreamConfig`] is
//! validated once when the engine is built and invalid combinations are
//! rejected with a [`ConfigError`] instead of surfacing later as runtime
//! misbehavior.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::ConfigError;

/// Compression algorithm applied to chunk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    /// No compression.
    None,
    /// RFC 1952 gzip.
    Gzip,
    /// RFC 1951 raw deflate.
    Deflate,
}

impl Default for CompressionKind {
    fn default() -> Self {
        Self::None
    }
}

/// On-the-wire encoding of a batched chunk payload.
///
/// Both ends of a stream must agree on this value; the batch payload is only
/// bit-exact between peers sharing the same format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFormat {
    /// JSON array of `{event_type, payload_b64}` objects.
    JsonArray,
    /// Binary records: u32-be type length, type bytes, u32-be payload
    /// length, payload bytes, repeated per event.
    LengthPrefixed,
}

impl Default for BatchFormat {
    fn default() -> Self {
        Self::JsonArray
    }
}

/// Configuration for the streaming engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Capacity of the input queue (accepted events awaiting a worker).
    pub event_buffer_size: usize,
    /// Capacity of the output queue (chunks awaiting the consumer).
    pub chunk_buffer_size: usize,
    /// Payloads larger than this many bytes are split into chunks.
    pub max_chunk_size: usize,
    /// Maximum latency before a partial batch is flushed.
    pub flush_interval: Duration,
    /// Whether the batching stage is active.
    pub batch_enabled: bool,
    /// Events per batch before it is emitted.
    pub batch_size: usize,
    /// Maximum age of a partial batch before the flush ticker emits it.
    pub batch_timeout: Duration,
    /// Hard cap on events held by the batcher at any moment.
    pub max_batch_size: usize,
    /// Wire encoding for batch payloads.
    pub batch_format: BatchFormat,
    /// Whether the compression stage is active.
    pub compression_enabled: bool,
    /// Algorithm used when compression is enabled.
    pub compression: CompressionKind,
    /// Compression level, 0 (none) through 9 (best).
    pub compression_level: u32,
    /// Payloads smaller than this many bytes pass through uncompressed.
    pub min_compression_size: usize,
    /// Token capacity of the flow controller.
    pub max_concurrent_events: usize,
    /// Bound on waiting for a flow-control token or a queue slot.
    pub backpressure_timeout: Duration,
    /// Bound on graceful close.
    pub drain_timeout: Duration,
    /// Whether sequence numbers are assigned and tracked.
    pub sequence_enabled: bool,
    /// Whether the receive side restores monotonic ordering.
    pub ordering_required: bool,
    /// Capacity of the receive-side reorder window, in events.
    pub out_of_order_buffer: usize,
    /// Number of pipeline workers.
    pub worker_count: usize,
    /// Cap on a single SSE field length when parsing.
    pub max_field_len: usize,
    /// Interval between keep-alive comment frames on an idle stream.
    /// Zero disables keep-alives.
    pub keepalive_interval: Duration,
    /// Optional `retry:` hint (milliseconds) emitted on the first frame.
    pub retry_ms: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1024,
            chunk_buffer_size: 1024,
            max_chunk_size: 64 * 1024,
            flush_interval: Duration::from_millis(50),
            batch_enabled: false,
            batch_size: 16,
            batch_timeout: Duration::from_millis(25),
            max_batch_size: 64,
            batch_format: BatchFormat::JsonArray,
            compression_enabled: false,
            compression: CompressionKind::None,
            compression_level: 6,
            min_compression_size: 1024,
            max_concurrent_events: 256,
            backpressure_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
            sequence_enabled: true,
            ordering_required: false,
            out_of_order_buffer: 64,
            worker_count: 4,
            max_field_len: 1024 * 1024,
            keepalive_interval: Duration::from_secs(15),
            retry_ms: None,
        }
    }
}

impl StreamConfig {
    /// Validate the configuration, returning the first violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_buffer_size == 0 {
            return Err(ConfigError::new("event_buffer_size", "must be greater than zero"));
        }
        if self.chunk_buffer_size == 0 {
            return Err(ConfigError::new("chunk_buffer_size", "must be greater than zero"));
        }
        if self.max_chunk_size == 0 {
            return Err(ConfigError::new("max_chunk_size", "must be greater than zero"));
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::new("flush_interval", "must be greater than zero"));
        }
        if self.batch_enabled {
            if self.batch_size == 0 {
                return Err(ConfigError::new("batch_size", "must be greater than zero"));
            }
            if self.max_batch_size < self.batch_size {
                return Err(ConfigError::new(
                    "max_batch_size",
                    format!("must be at least batch_size ({})", self.batch_size),
                ));
            }
        }
        if self.compression_enabled {
            if self.compression == CompressionKind::None {
                return Err(ConfigError::new(
                    "compression",
                    "an algorithm is required when compression is enabled",
                ));
            }
            if self.compression_level > 9 {
                return Err(ConfigError::new("compression_level", "must be in 0..=9"));
            }
        }
        if self.max_concurrent_events == 0 {
            return Err(ConfigError::new(
                "max_concurrent_events",
                "must be greater than zero",
            ));
        }
        if self.backpressure_timeout.is_zero() {
            return Err(ConfigError::new(
                "backpressure_timeout",
                "must be greater than zero",
            ));
        }
        if self.ordering_required {
            if !self.sequence_enabled {
                return Err(ConfigError::new(
                    "ordering_required",
                    "requires sequence_enabled",
                ));
            }
            if self.out_of_order_buffer == 0 {
                return Err(ConfigError::new(
                    "out_of_order_buffer",
                    "must be greater than zero when ordering is required",
                ));
            }
        }
        if self.worker_count == 0 {
            return Err(ConfigError::new("worker_count", "must be greater than zero"));
        }
        if self.max_field_len == 0 {
            return Err(ConfigError::new("max_field_len", "must be greater than zero"));
        }
        Ok(())
    }

    /// How long an incomplete chunk group may wait for its remaining chunks.
    pub fn reassembly_timeout(&self) -> Duration {
        self.backpressure_timeout * 2
    }

    /// Upper bound on bytes buffered by the reassembler.
    pub fn reassembly_memory_limit(&self) -> usize {
        self.max_chunk_size.saturating_mul(self.out_of_order_buffer.max(1))
    }

    /// Set the chunking threshold.
    pub fn with_max_chunk_size(mut self, bytes: usize) -> Self {
        self.max_chunk_size = bytes;
        self
    }

    /// Enable batching with the given batch size.
    pub fn with_batching(mut self, batch_size: usize) -> Self {
        self.batch_enabled = true;
        self.batch_size = batch_size;
        self.max_batch_size = self.max_batch_size.max(batch_size);
        self
    }

    /// Enable compression with the given algorithm.
    pub fn with_compression(mut self, kind: CompressionKind) -> Self {
        self.compression_enabled = kind != CompressionKind::None;
        self.compression = kind;
        self
    }

    /// Set the flow-control capacity.
    pub fn with_max_concurrent_events(mut self, n: usize) -> Self {
        self.max_concurrent_events = n;
        self
    }

    /// Set the backpressure wait bound.
    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    /// Enable receive-side reordering with the given window capacity.
    pub fn with_ordering(mut self, out_of_order_buffer: usize) -> Self {
        self.sequence_enabled = true;
        self.ordering_required = true;
        self.out_of_order_buffer = out_of_order_buffer;
        self
    }

    /// Set the number of pipeline workers.
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n;
        self
    }
}

/// Reconnection policy for the receive-side connection manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReconnectPolicy {
    /// Fail immediately on the first connection error.
    None,
    /// Retry at a fixed interval.
    FixedInterval {
        /// Delay between attempts.
        delay: Duration,
        /// Give up after this many attempts; `None` retries forever.
        max_attempts: Option<u32>,
    },
    /// Retry with exponentially growing, jittered delays.
    ExponentialBackoff {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Upper bound on the delay.
        max_delay: Duration,
        /// Growth factor applied after each attempt.
        multiplier: f64,
        /// Fractional jitter applied to each delay (0.2 = plus or minus 20%).
        jitter: f64,
        /// Give up after this many attempts; `None` retries forever.
        max_attempts: Option<u32>,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Maximum number of attempts, if bounded.
    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            Self::None => Some(1),
            Self::FixedInterval { max_attempts, .. }
            | Self::ExponentialBackoff { max_attempts, .. } => *max_attempts,
        }
    }
}

/// Configuration for one SSE connection on the receive side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Stream endpoint URL.
    pub url: String,
    /// Extra request headers sent with every attempt.
    pub headers: Vec<(String, String)>,
    /// Silence longer than this (no bytes, including comments) counts as a
    /// read error and triggers reconnection.
    pub heartbeat_timeout: Duration,
    /// Reconnection policy.
    pub reconnect: ReconnectPolicy,
}

impl ConnectionConfig {
    /// Create a configuration for the given endpoint with defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            heartbeat_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Add a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the reconnection policy.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(StreamConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let config = StreamConfig {
            worker_count: 0,
            ..StreamConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "worker_count");
    }

    #[test]
    fn rejects_batch_cap_below_batch_size() {
        let config = StreamConfig {
            batch_enabled: true,
            batch_size: 32,
            max_batch_size: 8,
            ..StreamConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "max_batch_size");
    }

    #[test]
    fn rejects_compression_without_algorithm() {
        let config = StreamConfig {
            compression_enabled: true,
            compression: CompressionKind::None,
            ..StreamConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "compression");
    }

    #[test]
    fn ordering_requires_sequencing() {
        let config = StreamConfig {
            sequence_enabled: false,
            ordering_required: true,
            ..StreamConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().field, "ordering_required");
    }

    #[test]
    fn reassembly_timeout_derives_from_backpressure() {
        let config = StreamConfig {
            backpressure_timeout: Duration::from_millis(200),
            ..StreamConfig::default()
        };
        assert_eq!(config.reassembly_timeout(), Duration::from_millis(400));
    }
}
