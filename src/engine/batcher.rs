//! Event batching stage.
//!
//! Accumulates serialized events until the batch size is reached or the
//! oldest entry exceeds the batch timeout, then hands the whole batch off as
//! one payload tagged `"batch"`. Workers trigger size-based handoff inline;
//! the engine's flush ticker collects aged partial batches.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::core::config::BatchFormat;
use crate::core::error::{Error, ParseError};

/// Event type tag carried by batched chunks.
pub const BATCH_EVENT_TYPE: &str = "batch";

/// One serialized event inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchItem {
    /// Original event type tag.
    pub event_type: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchEntry {
    event_type: String,
    payload_b64: String,
}

/// A batch handed off for emission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyBatch {
    /// The batched events, in push order.
    pub items: Vec<BatchItem>,
    /// Sequence number of the newest event in the batch; the emitted chunk
    /// carries it.
    pub last_seq: u64,
}

#[derive(Debug, Default)]
struct PendingBatch {
    items: Vec<BatchItem>,
    started_at: Option<Instant>,
    last_seq: u64,
}

impl PendingBatch {
    fn take(&mut self) -> ReadyBatch {
        self.started_at = None;
        ReadyBatch {
            items: std::mem::take(&mut self.items),
            last_seq: self.last_seq,
        }
    }
}

/// Size- and age-triggered batcher.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    batch_timeout: Duration,
    max_batch_size: usize,
    pending: Mutex<PendingBatch>,
}

impl Batcher {
    /// Create a batcher with the given thresholds.
    pub fn new(batch_size: usize, batch_timeout: Duration, max_batch_size: usize) -> Self {
        Self {
            batch_size,
            batch_timeout,
            max_batch_size,
            pending: Mutex::new(PendingBatch::default()),
        }
    }

    /// Add one event; returns a full batch when the size threshold is hit.
    pub fn push(&self, item: BatchItem, seq: u64) -> Option<ReadyBatch> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if pending.items.is_empty() {
            pending.started_at = Some(Instant::now());
        }
        pending.items.push(item);
        pending.last_seq = seq;
        if pending.items.len() >= self.batch_size.min(self.max_batch_size) {
            return Some(pending.take());
        }
        None
    }

    /// Take the pending batch if it has exceeded the batch timeout.
    pub fn take_expired(&self) -> Option<ReadyBatch> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let expired = pending
            .started_at
            .is_some_and(|started| started.elapsed() >= self.batch_timeout);
        if expired && !pending.items.is_empty() {
            return Some(pending.take());
        }
        None
    }

    /// Take whatever is pending, regardless of age. Used on drain.
    pub fn flush(&self) -> Option<ReadyBatch> {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if pending.items.is_empty() {
            return None;
        }
        Some(pending.take())
    }

    /// Events currently held.
    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .items
            .len()
    }

    /// Whether no events are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a batch into its wire payload.
pub fn encode_batch(items: &[BatchItem], format: BatchFormat) -> Result<Vec<u8>, Error> {
    match format {
        BatchFormat::JsonArray => {
            let entries: Vec<BatchEntry> = items
                .iter()
                .map(|item| BatchEntry {
                    event_type: item.event_type.clone(),
                    payload_b64: BASE64.encode(&item.payload),
                })
                .collect();
            serde_json::to_vec(&entries).map_err(|e| Error::Processing(e.to_string()))
        }
        BatchFormat::LengthPrefixed => {
            let mut out = Vec::new();
            for item in items {
                let type_bytes = item.event_type.as_bytes();
                out.extend_from_slice(&(type_bytes.len() as u32).to_be_bytes());
                out.extend_from_slice(type_bytes);
                out.extend_from_slice(&(item.payload.len() as u32).to_be_bytes());
                out.extend_from_slice(&item.payload);
            }
            Ok(out)
        }
    }
}

/// Decode a batch payload back into its constituent events.
pub fn decode_batch(data: &[u8], format: BatchFormat) -> Result<Vec<BatchItem>, Error> {
    match format {
        BatchFormat::JsonArray => {
            let entries: Vec<BatchEntry> = serde_json::from_slice(data)
                .map_err(|e| ParseError::InvalidEnvelope(format!("bad batch payload: {e}")))?;
            entries
                .into_iter()
                .map(|entry| {
                    let payload = BASE64.decode(&entry.payload_b64).map_err(|e| {
                        Error::Parse(ParseError::InvalidEnvelope(format!(
                            "bad batch entry encoding: {e}"
                        )))
                    })?;
                    Ok(BatchItem {
                        event_type: entry.event_type,
                        payload,
                    })
                })
                .collect()
        }
        BatchFormat::LengthPrefixed => {
            let mut items = Vec::new();
            let mut rest = data;
            while !rest.is_empty() {
                let (event_type, after_type) = read_record(rest)?;
                let event_type = String::from_utf8(event_type)
                    .map_err(|_| Error::Parse(ParseError::InvalidUtf8))?;
                let (payload, after_payload) = read_record(after_type)?;
                items.push(BatchItem {
                    event_type,
                    payload,
                });
                rest = after_payload;
            }
            Ok(items)
        }
    }
}

fn read_record(data: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    if data.len() < 4 {
        return Err(Error::Parse(ParseError::InvalidEnvelope(
            "truncated batch record length".into(),
        )));
    }
    let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rest = &data[4..];
    if rest.len() < len {
        return Err(Error::Parse(ParseError::InvalidEnvelope(
            "truncated batch record".into(),
        )));
    }
    Ok((rest[..len].to_vec(), &rest[len..]))
}
