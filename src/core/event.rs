//! Event model and the codec seam.
//!
//! The engine never interprets payload bytes; the domain layer supplies an
//! event type implementing [`StreamEvent`] and a codec implementing
//! [`EventCodec`]. [`JsonCodec`] covers the common case of serde-encoded
//! events, and [`EventRegistry`] lets the domain layer attach per-type
//! decode handlers without touching engine code.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::error::CodecError;

/// A domain event the engine can carry.
///
/// The engine only looks at the type tag (copied onto chunks) and the
/// optional timestamp; payload content is opaque.
pub trait StreamEvent: Send + Sync + Clone + 'static {
    /// The event's type tag, copied onto every chunk it produces.
    fn event_type(&self) -> &str;

    /// Optional wall-clock timestamp in milliseconds since the epoch.
    fn timestamp_ms(&self) -> Option<i64> {
        None
    }
}

/// Serialization seam between domain events and payload bytes.
pub trait EventCodec<E>: Send + Sync {
    /// Serialize an event into its payload bytes.
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError>;

    /// Reconstruct an event from its type tag and payload bytes.
    fn decode(&self, event_type: &str, data: &[u8]) -> Result<E, CodecError>;
}

/// JSON codec for serde-encodable event types.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<E> EventCodec<E> for JsonCodec
where
    E: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(event).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, event_type: &str, data: &[u8]) -> Result<E, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode {
            event_type: event_type.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// Per-type decode handler.
pub type DecodeHandler<E> =
    Arc<dyn Fn(&[u8]) -> Result<E, CodecError> + Send + Sync>;

/// Dispatch table mapping event type tags to decode handlers.
///
/// Lookups hit the registered handler for a known tag and fall back to the
/// wrapped codec for everything else, so the domain layer can add variants
/// without modifying the engine.
pub struct EventRegistry<E> {
    fallback: Arc<dyn EventCodec<E>>,
    handlers: HashMap<String, DecodeHandler<E>>,
}

impl<E> EventRegistry<E> {
    /// Create a registry backed by the given fallback codec.
    pub fn new(fallback: Arc<dyn EventCodec<E>>) -> Self {
        Self {
            fallback,
            handlers: HashMap::new(),
        }
    }

    /// Register a decode handler for one event type tag.
    ///
    /// A later registration for the same tag replaces the earlier one.
    pub fn register<F>(&mut self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&[u8]) -> Result<E, CodecError> + Send + Sync + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
    }

    /// Whether a dedicated handler exists for the tag.
    pub fn has_handler(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Decode a payload, dispatching on the type tag.
    pub fn decode(&self, event_type: &str, data: &[u8]) -> Result<E, CodecError> {
        match self.handlers.get(event_type) {
            Some(handler) => handler(data),
            None => self.fallback.decode(event_type, data),
        }
    }
}

impl<E> EventCodec<E> for EventRegistry<E>
where
    E: Send + Sync,
{
    fn encode(&self, event: &E) -> Result<Vec<u8>, CodecError> {
        self.fallback.encode(event)
    }

    fn decode(&self, event_type: &str, data: &[u8]) -> Result<E, CodecError> {
        Self::decode(self, event_type, data)
    }
}

/// A generic tagged event for callers without a dedicated event enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Optional wall-clock stamp, milliseconds since the epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl RawEvent {
    /// Create an event with the given tag and payload.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: None,
        }
    }

    /// Attach a timestamp.
    pub fn with_timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }
}

impl StreamEvent for RawEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp
    }
}

/// An event delivered by the receive pipeline, tagged with its sequence.
#[derive(Debug, Clone)]
pub struct SequencedEvent<E> {
    /// Engine-assigned sequence number; 0 when sequencing is disabled.
    pub sequence_num: u64,
    /// The decoded domain event.
    pub event: E,
    /// When the receive pipeline completed this event.
    pub received_at: DateTime<Utc>,
}

impl<E> SequencedEvent<E> {
    pub(crate) fn new(sequence_num: u64, event: E) -> Self {
        Self {
            sequence_num,
            event,
            received_at: Utc::now(),
        }
    }
}
