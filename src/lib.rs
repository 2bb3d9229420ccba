//! flowstream library root
//!
//! A client- and server-side transport engine for HTTP Server-Sent Events
//! carrying structured event streams between an agent runtime and its user
//! interfaces. The send side is a worker-pool pipeline (flow control,
//! serialization, optional batching and compression, chunking) ending in a
//! consumer-paced chunk queue; the receive side parses the SSE byte stream
//! back into typed events with reassembly, optional reordering, and a
//! reconnecting connection state machine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use flowstream::prelude::*;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<()> {
//! let engine = StreamEngine::new(StreamConfig::default(), Arc::new(JsonCodec))?;
//! let _chunks = engine.chunks()?;
//! engine.start().await?;
//! engine
//!     .send_event(RawEvent::new("hello", json!({"payload": "world"})))
//!     .await?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod core;
pub mod engine;
pub mod observability;
pub mod wire;

// Root re-exports for the common surface
pub use crate::core::config::{
    BatchFormat, CompressionKind, ConnectionConfig, ReconnectPolicy, StreamConfig,
};
pub use crate::core::error::{Error, ErrorKind, Result};
pub use crate::core::event::{
    EventCodec, EventRegistry, JsonCodec, RawEvent, SequencedEvent, StreamEvent,
};
pub use crate::engine::{EngineMetrics, EngineState, StreamEngine};
pub use crate::wire::chunker::StreamChunk;

// Module shorthands
pub use crate::connection::{ConnectionHook, ConnectionManager, ConnectionState};
pub use crate::observability::{HealthProbe, InMemoryHooks, NoopHooks, ObservabilityHooks};

/// Commonly used types in one import.
pub mod prelude {
    pub use crate::connection::stats::{ConnectionEvent, ConnectionEventKind};
    pub use crate::connection::transport::{SseRequest, SseTransport};
    pub use crate::connection::{ConnectionHook, ConnectionManager, ConnectionState};
    pub use crate::core::clock::{Clock, SystemClock};
    pub use crate::core::config::{
        BatchFormat, CompressionKind, ConnectionConfig, ReconnectPolicy, StreamConfig,
    };
    pub use crate::core::error::{Error, ErrorKind, Result};
    pub use crate::core::event::{
        EventCodec, EventRegistry, JsonCodec, RawEvent, SequencedEvent, StreamEvent,
    };
    pub use crate::engine::{EngineMetrics, EngineState, StreamEngine};
    pub use crate::observability::{HealthProbe, InMemoryHooks, NoopHooks, ObservabilityHooks};
    pub use crate::wire::chunker::StreamChunk;
}
