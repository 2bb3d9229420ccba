//! Error taxonomy for the streaming engine.
//!
//! Focused enums cover the individual failure domains (framing, codec,
//! sequencing, connection); the crate-level [`Error`] aggregates them so the
//! public API can expose a single error type. Callers that retry should use
//! [`Error::is_transient`] to distinguish recoverable conditions
//! (backpressure, cancellation) from permanent ones (closed engine, invalid
//! input).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Why the engine dropped an event instead of delivering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The output queue stayed full for the whole backpressure timeout.
    ConsumerBackpressure,
    /// The engine shut down while the event was still in flight.
    Shutdown,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConsumerBackpressure => write!(f, "consumer_backpressure"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Configuration rejected at construction time.
#[derive(Debug, Clone, Error)]
#[error("invalid value for `{field}`: {reason}")]
pub struct ConfigError {
    /// Name of the offending configuration field.
    pub field: &'static str,
    /// Human-readable description of the violation.
    pub reason: String,
}

impl ConfigError {
    pub(crate) fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// SSE wire-format parsing failures.
#[derive(Debug, Clone, Error)]
pub enum ParseError {
    /// The byte stream contained invalid UTF-8.
    #[error("malformed UTF-8 in SSE stream")]
    InvalidUtf8,
    /// A single field exceeded the configured length cap.
    #[error("SSE field exceeds {limit} bytes")]
    FieldTooLong {
        /// The configured cap that was exceeded.
        limit: usize,
    },
    /// A chunk envelope could not be decoded.
    #[error("invalid chunk envelope: {0}")]
    InvalidEnvelope(String),
}

/// Event (de)serialization failures at the codec seam.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Encoding the event payload failed.
    #[error("failed to encode event: {0}")]
    Encode(String),
    /// Decoding a payload for the given event type failed.
    #[error("failed to decode `{event_type}` event: {reason}")]
    Decode {
        /// The type tag of the undecodable event.
        event_type: String,
        /// Description from the underlying codec.
        reason: String,
    },
}

/// Sequence-number protocol violations on the receive side.
#[derive(Debug, Clone, Error)]
pub enum SequenceError {
    /// The reorder window overflowed and delivery skipped past a gap.
    #[error("sequence gap: missing {missing_from}..={missing_to}")]
    SequenceGap {
        /// First sequence number that was never delivered.
        missing_from: u64,
        /// Last sequence number that was never delivered.
        missing_to: u64,
    },
    /// Two events arrived carrying the same sequence number.
    #[error("duplicate sequence number {sequence}")]
    DuplicateSequence {
        /// The repeated sequence number.
        sequence: u64,
    },
}

/// Network and HTTP failures on the receive side.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// The initial HTTP request could not be issued or was rejected.
    #[error("connect failed: {0}")]
    Connect(String),
    /// Reading from the response body failed mid-stream.
    #[error("stream read failed: {0}")]
    Read(String),
    /// No bytes (not even comment pings) arrived within the heartbeat window.
    #[error("heartbeat timed out after {0:?}")]
    HeartbeatTimeout(Duration),
    /// The reconnect policy ran out of attempts.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    AttemptsExhausted {
        /// How many attempts were made before giving up.
        attempts: u32,
    },
    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,
}

/// Crate-level error type aggregating all failure domains.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Bad input at the API boundary.
    #[error("validation failed: {0}")]
    Validation(String),
    /// Invalid configuration, rejected at construction.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// SSE wire-format parse failure.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Event codec failure.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Sequence protocol violation.
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    /// Network or HTTP failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// No pipeline capacity became available within the timeout.
    #[error("backpressure: no capacity within {timeout:?}")]
    Backpressure {
        /// The bound that expired.
        timeout: Duration,
    },
    /// A single event failed inside the pipeline and was dropped.
    #[error("event processing failed: {0}")]
    Processing(String),
    /// The compression stage rejected its input.
    #[error("compression failed: {0}")]
    Compression(String),
    /// A chunk group was dropped before all its chunks arrived.
    #[error("chunk reassembly timed out for event {event_id} ({received}/{expected} chunks)")]
    ChunkTimeout {
        /// Identifier shared by the incomplete chunk group.
        event_id: String,
        /// How many chunks had arrived.
        received: u32,
        /// How many chunks the group declared.
        expected: u32,
    },
    /// The engine dropped an event and is reporting why.
    #[error("event dropped: {reason}")]
    EventDropped {
        /// The drop cause.
        reason: DropReason,
    },
    /// The operation was cancelled by deadline or shutdown.
    #[error("operation cancelled")]
    Cancelled,
    /// The engine has not been started yet.
    #[error("engine not started")]
    NotStarted,
    /// `start` was called on an engine that already left the initial state.
    #[error("engine already started")]
    AlreadyStarted,
    /// The engine has been closed.
    #[error("engine closed")]
    Closed,
    /// Graceful close exceeded its drain bound; the engine force-closed.
    #[error("drain did not complete within {0:?}")]
    DrainTimeout(Duration),
}

/// Coarse classification used for error coalescing and telemetry labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Config,
    Parse,
    Codec,
    Sequence,
    Connection,
    Backpressure,
    Processing,
    Compression,
    ChunkTimeout,
    Dropped,
    Cancelled,
    Lifecycle,
    DrainTimeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::Config => "config",
            Self::Parse => "parse",
            Self::Codec => "codec",
            Self::Sequence => "sequence",
            Self::Connection => "connection",
            Self::Backpressure => "backpressure",
            Self::Processing => "processing",
            Self::Compression => "compression",
            Self::ChunkTimeout => "chunk_timeout",
            Self::Dropped => "dropped",
            Self::Cancelled => "cancelled",
            Self::Lifecycle => "lifecycle",
            Self::DrainTimeout => "drain_timeout",
        };
        write!(f, "{name}")
    }
}

impl Error {
    /// Classify this error for coalescing and metric labels.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Config,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Codec(_) => ErrorKind::Codec,
            Self::Sequence(_) => ErrorKind::Sequence,
            Self::Connection(_) => ErrorKind::Connection,
            Self::Backpressure { .. } => ErrorKind::Backpressure,
            Self::Processing(_) => ErrorKind::Processing,
            Self::Compression(_) => ErrorKind::Compression,
            Self::ChunkTimeout { .. } => ErrorKind::ChunkTimeout,
            Self::EventDropped { .. } => ErrorKind::Dropped,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotStarted | Self::AlreadyStarted | Self::Closed => ErrorKind::Lifecycle,
            Self::DrainTimeout(_) => ErrorKind::DrainTimeout,
        }
    }

    /// Whether the caller may retry the operation that produced this error.
    ///
    /// Transient errors (backpressure, cancellation) are worth retrying;
    /// everything else reflects a permanent condition or a per-event loss
    /// the caller cannot recover by resending blindly.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backpressure { .. } | Self::Cancelled)
    }
}
