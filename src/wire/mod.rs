//! SSE wire concerns: buffer pooling, frame encoding/decoding, chunk
//! splitting and reassembly, and rendering chunks back into frames.

pub mod buffer_pool;
pub mod chunker;
pub mod framer;
pub mod render;
