//! Receive-side pipeline: bytes to typed events.
//!
//! Feeds raw response-body bytes through the SSE decoder, maps frames to
//! chunks (unwrapping the JSON envelope when present), reassembles chunk
//! groups, restores ordering when configured, and finally decompresses,
//! unbatches, and decodes into domain events. The pipeline is a synchronous
//! state machine; the connection manager drives it from its reader task.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::core::config::{BatchFormat, CompressionKind, StreamConfig};
use crate::core::error::Error;
use crate::core::event::{EventCodec, SequencedEvent};
use crate::engine::batcher::{decode_batch, BATCH_EVENT_TYPE};
use crate::engine::compressor::decompress;
use crate::engine::sequencer::Resequencer;
use crate::wire::chunker::{
    AssembledEvent, ChunkEnvelope, Chunker, Reassembler, ReassemblyOutcome, StreamChunk,
};
use crate::wire::framer::{SseDecoder, SseFrame};

/// Everything one `feed` call produced.
#[derive(Debug)]
pub struct PipelineOutput<E> {
    /// Events now deliverable, in delivery order.
    pub events: Vec<SequencedEvent<E>>,
    /// Per-event and protocol errors the input exposed.
    pub errors: Vec<Error>,
}

impl<E> Default for PipelineOutput<E> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<E> PipelineOutput<E> {
    fn merge(&mut self, mut other: PipelineOutput<E>) {
        self.events.append(&mut other.events);
        self.errors.append(&mut other.errors);
    }
}

/// Byte-stream to typed-event pipeline for one connection.
pub struct ReceivePipeline<E> {
    decoder: SseDecoder,
    reassembler: Reassembler,
    resequencer: Option<Resequencer<AssembledEvent>>,
    codec: Arc<dyn EventCodec<E>>,
    batch_format: BatchFormat,
    max_field_len: usize,
    last_event_id: Option<String>,
    retry_hint_ms: Option<u64>,
}

impl<E: Send + 'static> ReceivePipeline<E> {
    /// Assemble a pipeline from the stream configuration and codec.
    pub fn new(config: &StreamConfig, codec: Arc<dyn EventCodec<E>>) -> Self {
        let resequencer = (config.sequence_enabled && config.ordering_required)
            .then(|| Resequencer::new(config.out_of_order_buffer));
        Self {
            decoder: SseDecoder::new(config.max_field_len),
            reassembler: Reassembler::new(
                config.reassembly_memory_limit(),
                config.reassembly_timeout(),
            ),
            resequencer,
            codec,
            batch_format: config.batch_format,
            max_field_len: config.max_field_len,
            last_event_id: None,
            retry_hint_ms: None,
        }
    }

    /// Discard any partial frame from a dead connection.
    ///
    /// Called on reconnect: the new response body starts at a frame
    /// boundary, so leftover bytes from the old connection must not bleed
    /// into it. Reassembly and ordering state survive; the peer resumes
    /// from `Last-Event-ID`.
    pub fn reset_framing(&mut self) {
        self.decoder = SseDecoder::new(self.max_field_len);
    }

    /// The most recent `id:` observed, for `Last-Event-ID` replay.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// The most recent `retry:` hint from the peer.
    pub fn retry_hint(&self) -> Option<Duration> {
        self.retry_hint_ms.map(Duration::from_millis)
    }

    /// Feed response-body bytes.
    pub fn feed(&mut self, bytes: &[u8]) -> PipelineOutput<E> {
        let mut output = PipelineOutput::default();
        let frames = match self.decoder.feed(bytes) {
            Ok(frames) => frames,
            Err(err) => {
                output.errors.push(err.into());
                return output;
            }
        };
        for frame in frames {
            let from_frame = self.process_frame(frame);
            output.merge(from_frame);
        }
        output
    }

    /// Flush pipeline state when the stream ends.
    pub fn finish(&mut self) -> PipelineOutput<E> {
        let mut output = PipelineOutput::default();
        match self.decoder.finish() {
            Ok(Some(frame)) => output.merge(self.process_frame(frame)),
            Ok(None) => {}
            Err(err) => output.errors.push(err.into()),
        }
        if let Some(resequencer) = self.resequencer.as_mut() {
            let (units, errors) = resequencer.flush();
            output.errors.extend(errors.into_iter().map(Error::from));
            for unit in units {
                let decoded = Self::decode_unit(
                    &*self.codec,
                    self.batch_format,
                    unit.sequence_num,
                    unit.event,
                );
                output.merge(decoded);
            }
        }
        output
    }

    /// Drop chunk groups that outlived the reassembly window.
    pub fn purge_expired(&mut self) -> Vec<Error> {
        self.reassembler.purge_expired()
    }

    /// Bytes currently buffered awaiting reassembly.
    pub fn buffered_bytes(&self) -> usize {
        self.reassembler.buffered_bytes()
    }

    fn process_frame(&mut self, frame: SseFrame) -> PipelineOutput<E> {
        let mut output = PipelineOutput::default();

        if let Some(id) = &frame.id {
            self.last_event_id = Some(id.clone());
        }
        if let Some(retry) = frame.retry {
            self.retry_hint_ms = Some(retry);
        }

        let sequence_num = frame
            .id
            .as_deref()
            .and_then(|id| id.parse::<u64>().ok())
            .unwrap_or(0);
        let event_type = frame.event_type_or_default().to_owned();

        let chunk = match ChunkEnvelope::from_json(&frame.data) {
            Some(envelope) => match envelope.payload() {
                Ok(data) => StreamChunk {
                    data,
                    event_type,
                    event_id: envelope.event_id.clone(),
                    sequence_num,
                    compressed: envelope.compression.is_some(),
                    compression: envelope.compression.unwrap_or(CompressionKind::None),
                    chunk_index: envelope.chunk_index,
                    total_chunks: envelope.total_chunks,
                    timestamp: chrono::Utc::now(),
                },
                Err(err) => {
                    output.errors.push(err.into());
                    return output;
                }
            },
            None => StreamChunk {
                data: frame.data.into_bytes(),
                event_type,
                event_id: Chunker::next_event_id(),
                sequence_num,
                compressed: false,
                compression: CompressionKind::None,
                chunk_index: 0,
                total_chunks: 1,
                timestamp: chrono::Utc::now(),
            },
        };

        match self.reassembler.insert(chunk) {
            Ok(ReassemblyOutcome::Incomplete) => {}
            Ok(ReassemblyOutcome::Complete(assembled)) => {
                output.merge(self.process_assembled(assembled));
            }
            Err(err) => output.errors.push(err),
        }
        output
    }

    fn process_assembled(&mut self, assembled: AssembledEvent) -> PipelineOutput<E> {
        let mut output = PipelineOutput::default();
        match self.resequencer.as_mut() {
            Some(resequencer) => {
                let seq = assembled.sequence_num;
                let (units, errors) = resequencer.offer(SequencedEvent::new(seq, assembled));
                output.errors.extend(errors.into_iter().map(Error::from));
                for unit in units {
                    let decoded = Self::decode_unit(
                        &*self.codec,
                        self.batch_format,
                        unit.sequence_num,
                        unit.event,
                    );
                    output.merge(decoded);
                }
            }
            None => {
                let seq = assembled.sequence_num;
                output.merge(Self::decode_unit(
                    &*self.codec,
                    self.batch_format,
                    seq,
                    assembled,
                ));
            }
        }
        output
    }

    /// Decompress, unbatch, and decode one assembled unit.
    fn decode_unit(
        codec: &dyn EventCodec<E>,
        batch_format: BatchFormat,
        sequence_num: u64,
        assembled: AssembledEvent,
    ) -> PipelineOutput<E> {
        let mut output = PipelineOutput::default();

        let data = if assembled.compressed {
            match decompress(&assembled.data, assembled.compression) {
                Ok(data) => data,
                Err(err) => {
                    output.errors.push(err);
                    return output;
                }
            }
        } else {
            assembled.data
        };

        if assembled.event_type == BATCH_EVENT_TYPE {
            match decode_batch(&data, batch_format) {
                Ok(items) => {
                    debug!(count = items.len(), sequence_num, "unbatching received chunk");
                    for item in items {
                        match codec.decode(&item.event_type, &item.payload) {
                            Ok(event) => {
                                output.events.push(SequencedEvent::new(sequence_num, event));
                            }
                            Err(err) => output.errors.push(err.into()),
                        }
                    }
                }
                Err(err) => output.errors.push(err),
            }
            return output;
        }

        match codec.decode(&assembled.event_type, &data) {
            Ok(event) => output.events.push(SequencedEvent::new(sequence_num, event)),
            Err(err) => output.errors.push(err.into()),
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{JsonCodec, RawEvent};
    use crate::engine::batcher::{encode_batch, BatchItem};
    use crate::wire::framer::Framer;
    use serde_json::json;

    fn pipeline(config: &StreamConfig) -> ReceivePipeline<RawEvent> {
        ReceivePipeline::new(config, Arc::new(JsonCodec))
    }

    fn event_json(payload: &str) -> String {
        serde_json::to_string(&RawEvent::new("hello", json!({ "payload": payload }))).unwrap()
    }

    #[test]
    fn plain_frame_decodes_to_event() {
        let config = StreamConfig::default();
        let mut p = pipeline(&config);
        let frame = Framer::encode("hello", &event_json("world"), Some("1"), None);
        let output = p.feed(&frame);
        assert!(output.errors.is_empty());
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].sequence_num, 1);
        assert_eq!(output.events[0].event.event_type, "hello");
        assert_eq!(p.last_event_id(), Some("1"));
    }

    #[test]
    fn chunked_frames_reassemble_into_one_event() {
        let config = StreamConfig::default();
        let mut p = pipeline(&config);
        let payload = event_json("chunked");
        let bytes = payload.as_bytes();
        let mid = bytes.len() / 2;
        let parts = [&bytes[..mid], &bytes[mid..]];

        for (index, part) in parts.iter().enumerate() {
            let chunk = StreamChunk {
                data: part.to_vec(),
                event_type: "hello".into(),
                event_id: "group-1".into(),
                sequence_num: 1,
                compressed: false,
                compression: CompressionKind::None,
                chunk_index: index as u32,
                total_chunks: 2,
                timestamp: chrono::Utc::now(),
            };
            let envelope = ChunkEnvelope::from_chunk(&chunk).to_json();
            let frame = Framer::encode("hello", &envelope, Some("1"), None);
            let output = p.feed(&frame);
            assert!(output.errors.is_empty());
            if index == 0 {
                assert!(output.events.is_empty());
            } else {
                assert_eq!(output.events.len(), 1);
                assert_eq!(output.events[0].event.payload, json!({ "payload": "chunked" }));
            }
        }
    }

    #[test]
    fn out_of_order_frames_are_resequenced() {
        let config = StreamConfig::default().with_ordering(8);
        let mut p = pipeline(&config);
        let mut delivered = Vec::new();
        for seq in [3u64, 1, 2] {
            let frame = Framer::encode(
                "hello",
                &event_json(&seq.to_string()),
                Some(&seq.to_string()),
                None,
            );
            delivered.extend(p.feed(&frame).events);
        }
        let seqs: Vec<u64> = delivered.iter().map(|e| e.sequence_num).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn batch_frames_unbatch_into_constituents() {
        let config = StreamConfig::default();
        let mut p = pipeline(&config);
        let items = vec![
            BatchItem {
                event_type: "hello".into(),
                payload: event_json("a").into_bytes(),
            },
            BatchItem {
                event_type: "hello".into(),
                payload: event_json("b").into_bytes(),
            },
        ];
        let payload = encode_batch(&items, BatchFormat::JsonArray).unwrap();
        let frame = Framer::encode(
            BATCH_EVENT_TYPE,
            std::str::from_utf8(&payload).unwrap(),
            Some("1"),
            None,
        );
        let output = p.feed(&frame);
        assert!(output.errors.is_empty());
        assert_eq!(output.events.len(), 2);
    }

    #[test]
    fn undecodable_event_becomes_error_not_delivery() {
        let config = StreamConfig::default();
        let mut p = pipeline(&config);
        let frame = Framer::encode("hello", "not json", Some("1"), None);
        let output = p.feed(&frame);
        assert!(output.events.is_empty());
        assert_eq!(output.errors.len(), 1);
    }

    #[test]
    fn retry_hint_is_surfaced() {
        let config = StreamConfig::default();
        let mut p = pipeline(&config);
        let frame = Framer::encode("hello", &event_json("x"), None, Some(1500));
        p.feed(&frame);
        assert_eq!(p.retry_hint(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn finish_flushes_buffered_out_of_order_events() {
        let config = StreamConfig::default().with_ordering(8);
        let mut p = pipeline(&config);
        let frame = Framer::encode("hello", &event_json("late"), Some("5"), None);
        assert!(p.feed(&frame).events.is_empty());

        let output = p.finish();
        assert_eq!(output.events.len(), 1);
        assert_eq!(output.events[0].sequence_num, 5);
        // The flush reports the 1..=4 gap.
        assert_eq!(output.errors.len(), 1);
    }
}
