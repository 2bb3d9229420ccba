//! Optional payload compression stage.
//!
//! Payloads at or above the configured threshold are compressed with gzip or
//! deflate at the configured level; anything smaller passes through
//! untouched, as does any payload compression failed to shrink. The stage
//! keeps original-versus-compressed byte totals so the engine can report a
//! compression ratio.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use crate::core::config::CompressionKind;
use crate::core::error::Error;
use crate::wire::buffer_pool::BufferPool;

/// Original and compressed byte totals seen by the stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionTelemetry {
    /// Bytes entering the stage (only payloads that were compressed).
    pub original_bytes: u64,
    /// Bytes leaving the stage for those payloads.
    pub compressed_bytes: u64,
}

impl CompressionTelemetry {
    /// Compressed-to-original ratio; `None` before any compression happened.
    pub fn ratio(&self) -> Option<f64> {
        if self.original_bytes == 0 {
            return None;
        }
        Some(self.compressed_bytes as f64 / self.original_bytes as f64)
    }
}

/// Threshold-gated compressor.
#[derive(Debug)]
pub struct Compressor {
    kind: CompressionKind,
    level: u32,
    min_size: usize,
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

impl Compressor {
    /// Create a compressor for the given algorithm, level, and threshold.
    pub fn new(kind: CompressionKind, level: u32, min_size: usize) -> Self {
        Self {
            kind,
            level,
            min_size,
            original_bytes: AtomicU64::new(0),
            compressed_bytes: AtomicU64::new(0),
        }
    }

    /// Algorithm this stage applies.
    pub fn kind(&self) -> CompressionKind {
        self.kind
    }

    /// Compress a payload if it clears the threshold.
    ///
    /// `Ok(None)` means pass-through: the payload is below the threshold, the
    /// algorithm is `None`, or compression failed to make it smaller. Errors
    /// mean the compressor itself failed; the caller falls back to the
    /// uncompressed payload and reports the failure.
    pub fn try_compress(
        &self,
        payload: &[u8],
        pool: &BufferPool,
    ) -> Result<Option<Vec<u8>>, Error> {
        if self.kind == CompressionKind::None || payload.len() < self.min_size {
            return Ok(None);
        }

        let out = pool.get();
        let compressed = match self.kind {
            CompressionKind::Gzip => {
                let mut encoder = GzEncoder::new(out, Compression::new(self.level));
                encoder
                    .write_all(payload)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))?
            }
            CompressionKind::Deflate => {
                let mut encoder = DeflateEncoder::new(out, Compression::new(self.level));
                encoder
                    .write_all(payload)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| Error::Compression(e.to_string()))?
            }
            CompressionKind::None => unreachable!("guarded above"),
        };

        if compressed.len() >= payload.len() {
            pool.put(compressed);
            return Ok(None);
        }

        self.original_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(compressed.len() as u64, Ordering::Relaxed);
        Ok(Some(compressed))
    }

    /// Byte totals for ratio telemetry.
    pub fn telemetry(&self) -> CompressionTelemetry {
        CompressionTelemetry {
            original_bytes: self.original_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Decompress a payload with the named algorithm.
///
/// The receive side calls this keyed off the chunk's compression marker, so
/// it does not depend on a configured [`Compressor`].
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(3));
    match kind {
        CompressionKind::None => out.extend_from_slice(data),
        CompressionKind::Gzip => {
            GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }
        CompressionKind::Deflate => {
            DeflateDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Compression(e.to_string()))?;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible_payload() -> Vec<u8> {
        b"abcdefgh".repeat(128)
    }

    #[test]
    fn below_threshold_passes_through() {
        let compressor = Compressor::new(CompressionKind::Gzip, 6, 1024);
        let pool = BufferPool::default();
        let result = compressor.try_compress(b"small", &pool).unwrap();
        assert!(result.is_none());
        assert_eq!(compressor.telemetry().original_bytes, 0);
    }

    #[test]
    fn gzip_round_trips_and_shrinks() {
        let compressor = Compressor::new(CompressionKind::Gzip, 6, 16);
        let pool = BufferPool::default();
        let payload = compressible_payload();
        let compressed = compressor.try_compress(&payload, &pool).unwrap().unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(decompress(&compressed, CompressionKind::Gzip).unwrap(), payload);

        let telemetry = compressor.telemetry();
        assert_eq!(telemetry.original_bytes, payload.len() as u64);
        assert!(telemetry.ratio().unwrap() < 1.0);
    }

    #[test]
    fn deflate_round_trips() {
        let compressor = Compressor::new(CompressionKind::Deflate, 9, 16);
        let pool = BufferPool::default();
        let payload = compressible_payload();
        let compressed = compressor.try_compress(&payload, &pool).unwrap().unwrap();
        assert_eq!(
            decompress(&compressed, CompressionKind::Deflate).unwrap(),
            payload
        );
    }

    #[test]
    fn incompressible_payload_passes_through() {
        let compressor = Compressor::new(CompressionKind::Gzip, 6, 4);
        let pool = BufferPool::default();
        // Short random-ish bytes grow under gzip framing overhead.
        let payload: Vec<u8> = (0u16..32).map(|i| (i * 37 % 251) as u8).collect();
        assert!(compressor.try_compress(&payload, &pool).unwrap().is_none());
    }

    #[test]
    fn decompress_none_is_identity() {
        assert_eq!(decompress(b"as-is", CompressionKind::None).unwrap(), b"as-is");
    }

    #[test]
    fn corrupt_input_fails_decompression() {
        assert!(decompress(b"not gzip", CompressionKind::Gzip).is_err());
    }
}
