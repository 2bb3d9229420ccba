//! Chunking and reassembly of oversized event payloads.
//!
//! Payloads larger than `max_chunk_size` are split into ordered
//! [`StreamChunk`]s sharing one `event_id`. On the wire each chunk of a
//! multi-chunk event travels as a JSON envelope with a base64 payload and a
//! CRC32 checksum; consumers that do not understand chunking still see a
//! well-formed SSE frame. The [`Reassembler`] buffers groups per event id in
//! a hash-partitioned table, completes them in index order, expires stale
//! groups, and enforces a hard memory bound by evicting the oldest group.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::config::CompressionKind;
use crate::core::error::{Error, ParseError};
use crate::wire::buffer_pool::BufferPool;

/// The unit the engine emits and consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    /// Payload bytes, possibly compressed.
    pub data: Vec<u8>,
    /// Type tag copied from the source event (`"batch"` for batched frames).
    pub event_type: String,
    /// Application id, shared by all chunks of one logical event.
    pub event_id: String,
    /// Engine-assigned sequence number; gaps allowed.
    pub sequence_num: u64,
    /// Whether `data` is compressed.
    pub compressed: bool,
    /// Algorithm used when `compressed` is set.
    pub compression: CompressionKind,
    /// 0-based position of this chunk within its group.
    pub chunk_index: u32,
    /// Number of chunks in the group; 1 means unchunked.
    pub total_chunks: u32,
    /// When the chunk was produced.
    pub timestamp: DateTime<Utc>,
}

impl StreamChunk {
    /// Whether this chunk is part of a multi-chunk group.
    pub fn is_partial(&self) -> bool {
        self.total_chunks > 1
    }
}

/// JSON envelope carried as the SSE payload of a multi-chunk event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEnvelope {
    /// 0-based chunk position.
    pub chunk_index: u32,
    /// Total chunks in the group.
    pub total_chunks: u32,
    /// Shared group identifier.
    pub event_id: String,
    /// Base64 of the raw chunk bytes.
    pub payload_b64: String,
    /// CRC32 of the raw chunk bytes; zero disables verification.
    #[serde(default)]
    pub checksum: u32,
    /// Algorithm the payload is compressed with, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionKind>,
}

impl ChunkEnvelope {
    /// Build the envelope for one chunk.
    pub fn from_chunk(chunk: &StreamChunk) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            event_id: chunk.event_id.clone(),
            payload_b64: BASE64.encode(&chunk.data),
            checksum: crc32fast::hash(&chunk.data),
            compression: chunk.compressed.then_some(chunk.compression),
        }
    }

    /// Render the envelope as its JSON wire form.
    pub fn to_json(&self) -> String {
        // Serialization of a struct of plain fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Try to read a payload as an envelope.
    ///
    /// `None` means the payload is not envelope-shaped at all (a plain event
    /// payload); consumers that opted out of chunking fall through here.
    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }

    /// Recover and verify the raw chunk bytes.
    pub fn payload(&self) -> Result<Vec<u8>, ParseError> {
        if self.total_chunks == 0 || self.chunk_index >= self.total_chunks {
            return Err(ParseError::InvalidEnvelope(format!(
                "chunk index {} out of range for {} chunks",
                self.chunk_index, self.total_chunks
            )));
        }
        let data = BASE64
            .decode(&self.payload_b64)
            .map_err(|e| ParseError::InvalidEnvelope(format!("bad payload encoding: {e}")))?;
        if self.checksum != 0 && crc32fast::hash(&data) != self.checksum {
            return Err(ParseError::InvalidEnvelope(format!(
                "checksum mismatch for event {}",
                self.event_id
            )));
        }
        Ok(data)
    }

    /// Parse an envelope from its JSON wire form and recover the raw bytes,
    /// verifying the checksum when one is present.
    pub fn parse(json: &str) -> Result<(Self, Vec<u8>), ParseError> {
        let envelope =
            Self::from_json(json).ok_or_else(|| ParseError::InvalidEnvelope("not an envelope".into()))?;
        let data = envelope.payload()?;
        Ok((envelope, data))
    }
}

/// Splits serialized payloads into chunk groups.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chunk_size: usize,
}

impl Chunker {
    /// Create a chunker with the given split threshold.
    pub fn new(max_chunk_size: usize) -> Self {
        Self { max_chunk_size }
    }

    /// Mint a group identifier unique within any rolling reassembly window.
    pub fn next_event_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Split a payload into its chunk group.
    ///
    /// Payloads up to the threshold produce exactly one chunk that takes
    /// ownership of the buffer; larger payloads are copied into per-chunk
    /// buffers and the source buffer is recycled through the pool.
    pub fn split(
        &self,
        payload: Vec<u8>,
        event_type: &str,
        event_id: String,
        sequence_num: u64,
        compressed: bool,
        compression: CompressionKind,
        pool: &BufferPool,
    ) -> Vec<StreamChunk> {
        let now = Utc::now();
        if payload.len() <= self.max_chunk_size {
            return vec![StreamChunk {
                data: payload,
                event_type: event_type.to_owned(),
                event_id,
                sequence_num,
                compressed,
                compression,
                chunk_index: 0,
                total_chunks: 1,
                timestamp: now,
            }];
        }

        let total = payload.len().div_ceil(self.max_chunk_size) as u32;
        let mut chunks = Vec::with_capacity(total as usize);
        for (index, slice) in payload.chunks(self.max_chunk_size).enumerate() {
            chunks.push(StreamChunk {
                data: slice.to_vec(),
                event_type: event_type.to_owned(),
                event_id: event_id.clone(),
                sequence_num,
                compressed,
                compression,
                chunk_index: index as u32,
                total_chunks: total,
                timestamp: now,
            });
        }
        pool.put(payload);
        chunks
    }
}

/// A fully reassembled logical event.
#[derive(Debug, Clone)]
pub struct AssembledEvent {
    /// Group identifier.
    pub event_id: String,
    /// Type tag of the source event.
    pub event_type: String,
    /// Sequence number carried by the group.
    pub sequence_num: u64,
    /// Concatenated payload in chunk order.
    pub data: Vec<u8>,
    /// Whether the payload still needs decompression.
    pub compressed: bool,
    /// Algorithm for decompression.
    pub compression: CompressionKind,
}

/// Result of offering one chunk to the reassembler.
#[derive(Debug)]
pub enum ReassemblyOutcome {
    /// The group is still missing chunks.
    Incomplete,
    /// The final chunk arrived; here is the whole event.
    Complete(AssembledEvent),
}

struct ChunkGroup {
    slots: Vec<Option<Vec<u8>>>,
    received: u32,
    bytes: usize,
    first_seen: Instant,
    event_type: String,
    sequence_num: u64,
    compressed: bool,
    compression: CompressionKind,
}

impl ChunkGroup {
    fn new(total: u32, chunk: &StreamChunk) -> Self {
        Self {
            slots: (0..total).map(|_| None).collect(),
            received: 0,
            bytes: 0,
            first_seen: Instant::now(),
            event_type: chunk.event_type.clone(),
            sequence_num: chunk.sequence_num,
            compressed: chunk.compressed,
            compression: chunk.compression,
        }
    }
}

/// Receive-side chunk reassembly table.
///
/// Groups are keyed by `event_id` in a `DashMap`, whose internal sharding
/// keeps concurrent readers from contending on one lock. Total buffered
/// bytes are bounded; exceeding the bound evicts the oldest group.
pub struct Reassembler {
    groups: DashMap<String, ChunkGroup>,
    buffered_bytes: AtomicUsize,
    memory_limit: usize,
    timeout: Duration,
}

impl Reassembler {
    /// Create a reassembler with the given memory bound and group timeout.
    pub fn new(memory_limit: usize, timeout: Duration) -> Self {
        Self {
            groups: DashMap::new(),
            buffered_bytes: AtomicUsize::new(0),
            memory_limit,
            timeout,
        }
    }

    /// Offer one chunk.
    ///
    /// Unchunked events (`total_chunks == 1`) complete immediately without
    /// touching the table. Protocol violations (repeated or out-of-range
    /// indices, disagreeing totals) drop the whole group.
    pub fn insert(&self, chunk: StreamChunk) -> Result<ReassemblyOutcome, Error> {
        if chunk.total_chunks == 0 || chunk.chunk_index >= chunk.total_chunks {
            return Err(Error::Processing(format!(
                "chunk index {} out of range for {} chunks (event {})",
                chunk.chunk_index, chunk.total_chunks, chunk.event_id
            )));
        }
        if chunk.total_chunks == 1 {
            return Ok(ReassemblyOutcome::Complete(AssembledEvent {
                event_id: chunk.event_id,
                event_type: chunk.event_type,
                sequence_num: chunk.sequence_num,
                data: chunk.data,
                compressed: chunk.compressed,
                compression: chunk.compression,
            }));
        }

        let event_id = chunk.event_id.clone();
        let completed = {
            let mut group = self
                .groups
                .entry(event_id.clone())
                .or_insert_with(|| ChunkGroup::new(chunk.total_chunks, &chunk));

            if group.slots.len() != chunk.total_chunks as usize {
                drop(group);
                self.drop_group(&event_id);
                return Err(Error::Processing(format!(
                    "conflicting chunk totals for event {event_id}"
                )));
            }
            let slot = &mut group.slots[chunk.chunk_index as usize];
            if slot.is_some() {
                drop(group);
                self.drop_group(&event_id);
                return Err(Error::Processing(format!(
                    "repeated chunk index {} for event {event_id}",
                    chunk.chunk_index
                )));
            }
            let len = chunk.data.len();
            *slot = Some(chunk.data);
            group.received += 1;
            group.bytes += len;
            self.buffered_bytes.fetch_add(len, Ordering::Relaxed);
            group.received == group.slots.len() as u32
        };

        if completed {
            if let Some((_, group)) = self.groups.remove(&event_id) {
                self.buffered_bytes.fetch_sub(group.bytes, Ordering::Relaxed);
                let mut data = Vec::with_capacity(group.bytes);
                for slot in group.slots {
                    // All slots are filled; received just reached total.
                    if let Some(part) = slot {
                        data.extend_from_slice(&part);
                    }
                }
                debug!(event_id = %event_id, bytes = data.len(), "chunk group reassembled");
                return Ok(ReassemblyOutcome::Complete(AssembledEvent {
                    event_id,
                    event_type: group.event_type,
                    sequence_num: group.sequence_num,
                    data,
                    compressed: group.compressed,
                    compression: group.compression,
                }));
            }
        }

        self.enforce_memory_limit();
        Ok(ReassemblyOutcome::Incomplete)
    }

    /// Drop groups whose first chunk is older than the timeout, returning one
    /// error per dropped group.
    pub fn purge_expired(&self) -> Vec<Error> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| now.duration_since(entry.value().first_seen) > self.timeout)
            .map(|entry| entry.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|event_id| {
                self.groups.remove(&event_id).map(|(_, group)| {
                    self.buffered_bytes.fetch_sub(group.bytes, Ordering::Relaxed);
                    warn!(
                        event_id = %event_id,
                        received = group.received,
                        expected = group.slots.len(),
                        "dropping incomplete chunk group after timeout"
                    );
                    Error::ChunkTimeout {
                        event_id,
                        received: group.received,
                        expected: group.slots.len() as u32,
                    }
                })
            })
            .collect()
    }

    /// Bytes currently buffered across all incomplete groups.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    /// Number of incomplete groups in the window.
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }

    fn drop_group(&self, event_id: &str) {
        if let Some((_, group)) = self.groups.remove(event_id) {
            self.buffered_bytes.fetch_sub(group.bytes, Ordering::Relaxed);
        }
    }

    fn enforce_memory_limit(&self) {
        while self.buffered_bytes.load(Ordering::Relaxed) > self.memory_limit {
            let oldest = self
                .groups
                .iter()
                .min_by_key(|entry| entry.value().first_seen)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(event_id) => {
                    warn!(event_id = %event_id, "reassembly window over budget, evicting oldest group");
                    self.drop_group(&event_id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(event_id: &str, index: u32, total: u32, data: &[u8]) -> StreamChunk {
        StreamChunk {
            data: data.to_vec(),
            event_type: "test".into(),
            event_id: event_id.into(),
            sequence_num: 1,
            compressed: false,
            compression: CompressionKind::None,
            chunk_index: index,
            total_chunks: total,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn split_below_threshold_is_single_chunk() {
        let chunker = Chunker::new(4);
        let pool = BufferPool::default();
        let chunks = chunker.split(
            b"abcd".to_vec(),
            "test",
            "ev".into(),
            1,
            false,
            CompressionKind::None,
            &pool,
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].data, b"abcd");
    }

    #[test]
    fn split_ten_bytes_by_four_yields_three_chunks() {
        let chunker = Chunker::new(4);
        let pool = BufferPool::default();
        let chunks = chunker.split(
            b"abcdefghij".to_vec(),
            "test",
            "ev".into(),
            1,
            false,
            CompressionKind::None,
            &pool,
        );
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data, b"abcd");
        assert_eq!(chunks[1].data, b"efgh");
        assert_eq!(chunks[2].data, b"ij");
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as u32);
            assert_eq!(c.total_chunks, 3);
            assert_eq!(c.event_id, "ev");
        }
    }

    #[test]
    fn split_boundary_is_exact() {
        let chunker = Chunker::new(4);
        let pool = BufferPool::default();
        let exact = chunker.split(
            vec![0u8; 4],
            "t",
            "a".into(),
            1,
            false,
            CompressionKind::None,
            &pool,
        );
        assert_eq!(exact.len(), 1);

        let over = chunker.split(
            vec![0u8; 5],
            "t",
            "b".into(),
            2,
            false,
            CompressionKind::None,
            &pool,
        );
        assert_eq!(over.len(), 2);
        assert_eq!(over[0].data.len(), 4);
        assert_eq!(over[1].data.len(), 1);
    }

    #[test]
    fn envelope_round_trips_with_checksum() {
        let c = chunk("ev-1", 1, 3, b"payload");
        let envelope = ChunkEnvelope::from_chunk(&c);
        let (parsed, data) = ChunkEnvelope::parse(&envelope.to_json()).unwrap();
        assert_eq!(parsed.event_id, "ev-1");
        assert_eq!(parsed.chunk_index, 1);
        assert_eq!(parsed.total_chunks, 3);
        assert_eq!(data, b"payload");
    }

    #[test]
    fn envelope_checksum_mismatch_is_rejected() {
        let c = chunk("ev-1", 0, 2, b"payload");
        let mut envelope = ChunkEnvelope::from_chunk(&c);
        envelope.checksum ^= 1;
        assert!(ChunkEnvelope::parse(&envelope.to_json()).is_err());
    }

    #[test]
    fn reassembles_out_of_order_chunks() {
        let r = Reassembler::new(1024, Duration::from_secs(1));
        assert!(matches!(
            r.insert(chunk("ev", 2, 3, b"ij")).unwrap(),
            ReassemblyOutcome::Incomplete
        ));
        assert!(matches!(
            r.insert(chunk("ev", 0, 3, b"abcd")).unwrap(),
            ReassemblyOutcome::Incomplete
        ));
        match r.insert(chunk("ev", 1, 3, b"efgh")).unwrap() {
            ReassemblyOutcome::Complete(event) => {
                assert_eq!(event.data, b"abcdefghij");
                assert_eq!(event.event_id, "ev");
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(r.buffered_bytes(), 0);
        assert_eq!(r.pending_groups(), 0);
    }

    #[test]
    fn single_chunk_completes_without_buffering() {
        let r = Reassembler::new(1024, Duration::from_secs(1));
        match r.insert(chunk("solo", 0, 1, b"x")).unwrap() {
            ReassemblyOutcome::Complete(event) => assert_eq!(event.data, b"x"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(r.pending_groups(), 0);
    }

    #[test]
    fn repeated_index_drops_the_group() {
        let r = Reassembler::new(1024, Duration::from_secs(1));
        r.insert(chunk("ev", 0, 2, b"a")).unwrap();
        assert!(r.insert(chunk("ev", 0, 2, b"a")).is_err());
        assert_eq!(r.pending_groups(), 0);
        assert_eq!(r.buffered_bytes(), 0);
    }

    #[test]
    fn expired_groups_are_purged_with_errors() {
        let r = Reassembler::new(1024, Duration::from_millis(0));
        r.insert(chunk("stale", 0, 2, b"a")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let errors = r.purge_expired();
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            Error::ChunkTimeout { event_id, received: 1, expected: 2 } if event_id == "stale"
        ));
        assert_eq!(r.pending_groups(), 0);
    }

    #[test]
    fn memory_pressure_evicts_oldest_group() {
        let r = Reassembler::new(8, Duration::from_secs(10));
        r.insert(chunk("old", 0, 2, &[0u8; 6])).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        r.insert(chunk("new", 0, 2, &[0u8; 6])).unwrap();
        // Budget of 8 bytes cannot hold both 6-byte groups.
        assert_eq!(r.pending_groups(), 1);
        assert!(r.buffered_bytes() <= 8);
        match r.insert(chunk("new", 1, 2, &[0u8; 6])).unwrap() {
            ReassemblyOutcome::Complete(event) => assert_eq!(event.event_id, "new"),
            other => panic!("survivor should complete, got {other:?}"),
        }
    }
}
