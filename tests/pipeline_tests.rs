//! Integration tests for the send-side pipeline contracts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowstream::prelude::*;
use serde_json::json;
use tokio_stream::StreamExt;

/// Event type whose codec passes payload bytes through untouched, so chunk
/// boundaries can be asserted byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ByteEvent {
    data: Vec<u8>,
}

impl StreamEvent for ByteEvent {
    fn event_type(&self) -> &str {
        "raw"
    }
}

struct PassthroughCodec;

impl EventCodec<ByteEvent> for PassthroughCodec {
    fn encode(
        &self,
        event: &ByteEvent,
    ) -> std::result::Result<Vec<u8>, flowstream::core::error::CodecError> {
        Ok(event.data.clone())
    }

    fn decode(
        &self,
        _event_type: &str,
        data: &[u8],
    ) -> std::result::Result<ByteEvent, flowstream::core::error::CodecError> {
        Ok(ByteEvent {
            data: data.to_vec(),
        })
    }
}

#[tokio::test]
async fn simple_round_trip_delivers_one_chunk() {
    let engine = StreamEngine::new(StreamConfig::default(), Arc::new(JsonCodec)).unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    engine
        .send_event(RawEvent::new("hello", json!({"payload": "world"})))
        .await
        .unwrap();

    let chunk = chunks.next().await.unwrap();
    assert_eq!(chunk.event_type, "hello");
    assert_eq!(chunk.total_chunks, 1);
    assert!(!chunk.compressed);
    let event: RawEvent = serde_json::from_slice(&chunk.data).unwrap();
    assert_eq!(event.payload, json!({"payload": "world"}));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn ten_bytes_over_four_byte_chunks_split_exactly() {
    let config = StreamConfig {
        max_chunk_size: 4,
        ..StreamConfig::default()
    };
    let engine = StreamEngine::new(config, Arc::new(PassthroughCodec)).unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    engine
        .send_event(ByteEvent {
            data: b"abcdefghij".to_vec(),
        })
        .await
        .unwrap();

    let mut collected = Vec::new();
    for _ in 0..3 {
        collected.push(chunks.next().await.unwrap());
    }

    assert_eq!(collected[0].data, b"abcd");
    assert_eq!(collected[1].data, b"efgh");
    assert_eq!(collected[2].data, b"ij");
    for (index, chunk) in collected.iter().enumerate() {
        assert_eq!(chunk.chunk_index, index as u32);
        assert_eq!(chunk.total_chunks, 3);
        assert_eq!(chunk.event_id, collected[0].event_id);
    }

    engine.close().await.unwrap();
}

#[tokio::test]
async fn stalled_consumer_surfaces_backpressure_within_the_bound() {
    // One token, a one-slot output queue, and a payload that splits into
    // several chunks: the first event's worker parks on the full queue
    // holding the only token, so the second send times out at the flow
    // controller.
    let config = StreamConfig {
        max_concurrent_events: 1,
        chunk_buffer_size: 1,
        max_chunk_size: 4,
        backpressure_timeout: Duration::from_millis(50),
        worker_count: 1,
        ..StreamConfig::default()
    };
    let engine = StreamEngine::new(config, Arc::new(PassthroughCodec)).unwrap();
    engine.start().await.unwrap();

    engine
        .send_event(ByteEvent {
            data: b"abcdefghij".to_vec(),
        })
        .await
        .unwrap();
    // Give the worker a moment to fill the output queue and park.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let started = Instant::now();
    let err = engine
        .send_event(ByteEvent {
            data: b"second".to_vec(),
        })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Backpressure { .. }));
    assert!(elapsed >= Duration::from_millis(40), "too fast: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(150), "too slow: {elapsed:?}");

    let _ = engine.close().await;
}

#[tokio::test]
async fn graceful_close_delivers_everything_then_ends_streams() {
    let engine = StreamEngine::new(StreamConfig::default(), Arc::new(JsonCodec)).unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    for i in 0..100 {
        engine
            .send_event(RawEvent::new("hello", json!({"n": i})))
            .await
            .unwrap();
    }

    let close_started = Instant::now();
    engine.close().await.unwrap();
    assert!(close_started.elapsed() < Duration::from_secs(5));

    let mut seen = 0;
    while let Some(chunk) = chunks.next().await {
        assert_eq!(chunk.event_type, "hello");
        seen += 1;
    }
    assert_eq!(seen, 100);

    // Second close returns immediately.
    let again = Instant::now();
    engine.close().await.unwrap();
    assert!(again.elapsed() < Duration::from_millis(50));
}

#[tokio::test]
async fn sequence_numbers_increase_per_accepted_event() {
    // One worker keeps emission order identical to send order; with a pool,
    // cross-event interleaving is allowed when ordering is not required.
    let config = StreamConfig {
        worker_count: 1,
        ..StreamConfig::default()
    };
    let engine = StreamEngine::new(config, Arc::new(JsonCodec)).unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    for i in 0..10 {
        let seq = engine
            .send_event(RawEvent::new("hello", json!({"n": i})))
            .await
            .unwrap();
        assert_eq!(seq, i + 1);
    }
    let mut last = 0;
    for _ in 0..10 {
        let chunk = chunks.next().await.unwrap();
        assert!(chunk.sequence_num > last);
        last = chunk.sequence_num;
    }

    engine.close().await.unwrap();
}

#[tokio::test]
async fn batching_folds_events_into_batch_chunks() {
    let config = StreamConfig {
        batch_enabled: true,
        batch_size: 5,
        batch_timeout: Duration::from_millis(20),
        max_batch_size: 16,
        ..StreamConfig::default()
    };
    let engine = StreamEngine::new(config, Arc::new(JsonCodec)).unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    for i in 0..5 {
        engine
            .send_event(RawEvent::new("hello", json!({"n": i})))
            .await
            .unwrap();
    }
    let chunk = chunks.next().await.unwrap();
    assert_eq!(chunk.event_type, "batch");

    // A partial batch goes out via the flush ticker instead of waiting for
    // the size threshold.
    engine
        .send_event(RawEvent::new("hello", json!({"n": "tail"})))
        .await
        .unwrap();
    let flushed = tokio::time::timeout(Duration::from_secs(1), chunks.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(flushed.event_type, "batch");

    engine.close().await.unwrap();
}

#[tokio::test]
async fn compression_kicks_in_above_the_threshold() {
    let config = StreamConfig {
        compression_enabled: true,
        compression: CompressionKind::Gzip,
        min_compression_size: 64,
        worker_count: 1,
        ..StreamConfig::default()
    };
    let engine = StreamEngine::new(config, Arc::new(JsonCodec)).unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    engine
        .send_event(RawEvent::new("small", json!("x")))
        .await
        .unwrap();
    engine
        .send_event(RawEvent::new("large", json!("y".repeat(4096))))
        .await
        .unwrap();

    let small = chunks.next().await.unwrap();
    assert!(!small.compressed);
    let large = chunks.next().await.unwrap();
    assert!(large.compressed);
    assert_eq!(large.compression, CompressionKind::Gzip);
    assert!((large.data.len() as u64) < 4096);

    engine.close().await.unwrap();
    let metrics = engine.metrics();
    assert!(metrics.compression.ratio().unwrap() < 1.0);
}

#[tokio::test]
async fn hooks_observe_pipeline_counters() {
    let hooks = Arc::new(InMemoryHooks::new());
    let engine = flowstream::StreamEngine::with_hooks(
        StreamConfig::default(),
        Arc::new(JsonCodec),
        hooks.clone(),
    )
    .unwrap();
    let mut chunks = engine.chunks().unwrap();
    engine.start().await.unwrap();

    for i in 0..3 {
        engine
            .send_event(RawEvent::new("hello", json!({"n": i})))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        chunks.next().await.unwrap();
    }
    engine.close().await.unwrap();

    assert_eq!(hooks.counter("engine.events_sent"), 3);
    assert_eq!(hooks.counter("engine.chunks_emitted"), 3);
}
