//! Rendering engine output back into SSE frames.
//!
//! A plain event chunk travels as readable text; chunks that belong to a
//! multi-chunk group, carry compressed bytes, or are otherwise not valid
//! UTF-8 travel as the JSON chunk envelope. The SSE `id:` field carries the
//! sequence number so peers can resume with `Last-Event-ID` and the receive
//! side can resequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::stream::{unfold, Stream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::wire::chunker::{ChunkEnvelope, StreamChunk};
use crate::wire::framer::Framer;

/// Comment text used for idle keep-alive frames.
pub const KEEPALIVE_COMMENT: &str = "keep-alive";

/// Stateful renderer from [`StreamChunk`] to SSE frame bytes.
#[derive(Debug)]
pub struct ChunkRenderer {
    sequence_enabled: bool,
    retry_ms: Option<u64>,
    sent_first: AtomicBool,
}

impl ChunkRenderer {
    /// Create a renderer; `retry_ms` is emitted on the first frame only.
    pub fn new(sequence_enabled: bool, retry_ms: Option<u64>) -> Self {
        Self {
            sequence_enabled,
            retry_ms,
            sent_first: AtomicBool::new(false),
        }
    }

    /// Render one chunk as a complete SSE frame.
    pub fn render(&self, chunk: &StreamChunk) -> Vec<u8> {
        let mut buf = Vec::with_capacity(chunk.data.len() + 64);
        self.render_into(chunk, &mut buf);
        buf
    }

    /// Render one chunk into an existing buffer.
    pub fn render_into(&self, chunk: &StreamChunk, buf: &mut Vec<u8>) {
        let id = self
            .sequence_enabled
            .then(|| chunk.sequence_num.to_string());
        let retry = if self.sent_first.swap(true, Ordering::Relaxed) {
            None
        } else {
            self.retry_ms
        };

        if chunk.is_partial() || chunk.compressed {
            let envelope = ChunkEnvelope::from_chunk(chunk).to_json();
            Framer::encode_into(&chunk.event_type, &envelope, id.as_deref(), retry, buf);
            return;
        }
        match std::str::from_utf8(&chunk.data) {
            Ok(text) => {
                Framer::encode_into(&chunk.event_type, text, id.as_deref(), retry, buf);
            }
            Err(_) => {
                // Binary payloads cannot ride a text protocol raw.
                let envelope = ChunkEnvelope::from_chunk(chunk).to_json();
                Framer::encode_into(&chunk.event_type, &envelope, id.as_deref(), retry, buf);
            }
        }
    }
}

/// Turn a chunk queue into a stream of SSE frame bytes.
///
/// When `keepalive` is non-zero and no chunk arrives within it, a comment
/// frame is emitted so idle connections keep producing bytes for the peer's
/// heartbeat detector. The stream ends when the chunk queue closes.
pub fn sse_byte_stream(
    receiver: mpsc::Receiver<StreamChunk>,
    renderer: ChunkRenderer,
    keepalive: Duration,
) -> impl Stream<Item = Vec<u8>> + Send {
    unfold(
        (receiver, renderer, keepalive),
        |(mut receiver, renderer, keepalive)| async move {
            if keepalive.is_zero() {
                return receiver
                    .recv()
                    .await
                    .map(|chunk| (renderer.render(&chunk), (receiver, renderer, keepalive)));
            }
            match timeout(keepalive, receiver.recv()).await {
                Ok(Some(chunk)) => {
                    Some((renderer.render(&chunk), (receiver, renderer, keepalive)))
                }
                Ok(None) => None,
                Err(_) => Some((
                    Framer::encode_comment(KEEPALIVE_COMMENT),
                    (receiver, renderer, keepalive),
                )),
            }
        },
    )
}
