//! The streaming engine: pipeline coordinator and its stages.
//!
//! [`StreamEngine`] owns the worker pool, the bounded input and output
//! queues, and the optional batching and compression stages. Accepted events
//! flow through flow control, serialization, batching, compression, and
//! chunking before landing on the output queue the consumer drains; errors
//! affecting single events surface on a separate error stream without
//! stopping the pipeline.

pub mod batcher;
pub mod compressor;
pub mod flow_control;
pub mod receive;
pub mod sequencer;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::core::config::{CompressionKind, StreamConfig};
use crate::core::error::{DropReason, Error, ErrorKind};
use crate::core::event::{EventCodec, StreamEvent};
use crate::engine::batcher::{encode_batch, BatchItem, Batcher, ReadyBatch, BATCH_EVENT_TYPE};
use crate::engine::compressor::{CompressionTelemetry, Compressor};
use crate::engine::flow_control::{FlowController, FlowPermit, FlowSnapshot};
use crate::engine::receive::ReceivePipeline;
use crate::engine::sequencer::SequenceAssigner;
use crate::engine::stats::{
    ErrorHistory, EventStatsRegistry, EventTypeSnapshot, ThroughputRates, ThroughputTracker,
};
use crate::observability::{HealthProbe, Hooks, NoopHooks};
use crate::wire::buffer_pool::{BufferPool, PoolStats};
use crate::wire::chunker::{Chunker, StreamChunk};
use crate::wire::render::{sse_byte_stream, ChunkRenderer};

/// Engine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, not yet started.
    New,
    /// Accepting and processing events.
    Running,
    /// Close in progress; no new events, in-flight work finishing.
    Draining,
    /// Fully shut down.
    Closed,
}

/// How many errors the engine remembers for its health probe.
const ERROR_HISTORY_CAPACITY: usize = 64;

/// Capacity of the error stream before coalescing kicks in.
const ERROR_CHANNEL_CAPACITY: usize = 256;

/// EWMA smoothing factor for throughput rates.
const THROUGHPUT_ALPHA: f64 = 0.2;

struct WorkItem<E> {
    event: E,
    seq: u64,
    permit: FlowPermit,
}

/// Error stream with non-blocking emission.
///
/// When nobody drains the stream (or it falls behind), errors fold into
/// per-kind counters instead of blocking the pipeline.
struct ErrorSink {
    tx: RwLock<Option<mpsc::Sender<Error>>>,
    coalesced: Mutex<HashMap<ErrorKind, u64>>,
    history: ErrorHistory,
    hooks: Hooks,
}

impl ErrorSink {
    fn new(tx: mpsc::Sender<Error>, hooks: Hooks) -> Self {
        Self {
            tx: RwLock::new(Some(tx)),
            coalesced: Mutex::new(HashMap::new()),
            history: ErrorHistory::new(ERROR_HISTORY_CAPACITY),
            hooks,
        }
    }

    fn emit(&self, error: Error) {
        self.history.push(&error);
        self.hooks.counter_inc("engine.errors", 1);
        let sender = {
            let guard = self
                .tx
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone()
        };
        let undeliverable = match sender {
            Some(tx) => match tx.try_send(error) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(err))
                | Err(mpsc::error::TrySendError::Closed(err)) => Some(err),
            },
            None => Some(error),
        };
        if let Some(err) = undeliverable {
            let mut coalesced = self
                .coalesced
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *coalesced.entry(err.kind()).or_insert(0) += 1;
        }
    }

    fn close(&self) {
        self.tx
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }

    fn coalesced_counts(&self) -> Vec<(ErrorKind, u64)> {
        self.coalesced
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(&kind, &count)| (kind, count))
            .collect()
    }
}

/// State shared between the engine handle and its worker tasks.
struct PipelineShared<E> {
    config: StreamConfig,
    codec: Arc<dyn EventCodec<E>>,
    hooks: Hooks,
    flow: FlowController,
    chunker: Chunker,
    compressor: Compressor,
    batcher: Option<Batcher>,
    pool: BufferPool,
    chunk_tx: RwLock<Option<mpsc::Sender<StreamChunk>>>,
    /// Serializes chunk emission across workers when ordering is required,
    /// so chunks of different events never interleave on the output.
    emit_lock: Option<AsyncMutex<()>>,
    errors: ErrorSink,
    stats: EventStatsRegistry,
    throughput: ThroughputTracker,
    events_sent: AtomicU64,
    chunks_emitted: AtomicU64,
    bytes_emitted: AtomicU64,
    last_activity_ms: AtomicI64,
    shutdown: watch::Receiver<bool>,
}

impl<E> PipelineShared<E> {
    fn touch_activity(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn last_activity(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        (ms != 0).then(|| Utc.timestamp_millis_opt(ms).single())?
    }
}

/// Read-only aggregate the engine exposes through `metrics`.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Current lifecycle state.
    pub state: EngineState,
    /// Events accepted by `send_event`.
    pub events_sent: u64,
    /// Flow-control counters.
    pub flow: FlowSnapshot,
    /// Chunks placed on the output queue.
    pub chunks_emitted: u64,
    /// Payload bytes placed on the output queue.
    pub bytes_emitted: u64,
    /// Smoothed throughput rates.
    pub throughput: ThroughputRates,
    /// Compression byte totals.
    pub compression: CompressionTelemetry,
    /// Buffer pool activity.
    pub buffer_pool: PoolStats,
    /// Errors folded away because the error stream was not drained.
    pub coalesced_errors: Vec<(ErrorKind, u64)>,
    /// Per-event-type counters.
    pub event_types: Vec<(String, EventTypeSnapshot)>,
}

#[derive(Default)]
struct EngineTasks {
    /// Exit when the input queue drains.
    workers: Vec<JoinHandle<()>>,
    /// Exit on the shutdown signal.
    tickers: Vec<JoinHandle<()>>,
}

/// The pipeline coordinator.
pub struct StreamEngine<E: StreamEvent> {
    shared: Arc<PipelineShared<E>>,
    state: Mutex<EngineState>,
    assigner: SequenceAssigner,
    input_tx: RwLock<Option<mpsc::Sender<WorkItem<E>>>>,
    input_rx: Mutex<Option<mpsc::Receiver<WorkItem<E>>>>,
    chunk_rx: Mutex<Option<mpsc::Receiver<StreamChunk>>>,
    error_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: AsyncMutex<EngineTasks>,
}

impl<E: StreamEvent> StreamEngine<E> {
    /// Build an engine from a validated configuration and codec.
    pub fn new(config: StreamConfig, codec: Arc<dyn EventCodec<E>>) -> Result<Self, Error> {
        Self::with_hooks(config, codec, Arc::new(NoopHooks))
    }

    /// Build an engine reporting telemetry through the given hooks.
    pub fn with_hooks(
        config: StreamConfig,
        codec: Arc<dyn EventCodec<E>>,
        hooks: Hooks,
    ) -> Result<Self, Error> {
        config.validate()?;

        let (input_tx, input_rx) = mpsc::channel(config.event_buffer_size);
        let (chunk_tx, chunk_rx) = mpsc::channel(config.chunk_buffer_size);
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let compressor_kind = if config.compression_enabled {
            config.compression
        } else {
            CompressionKind::None
        };
        let batcher = config.batch_enabled.then(|| {
            Batcher::new(config.batch_size, config.batch_timeout, config.max_batch_size)
        });

        let shared = Arc::new(PipelineShared {
            chunker: Chunker::new(config.max_chunk_size),
            compressor: Compressor::new(
                compressor_kind,
                config.compression_level,
                config.min_compression_size,
            ),
            batcher,
            pool: BufferPool::default(),
            flow: FlowController::new(config.max_concurrent_events, config.backpressure_timeout),
            chunk_tx: RwLock::new(Some(chunk_tx)),
            emit_lock: config.ordering_required.then(|| AsyncMutex::new(())),
            errors: ErrorSink::new(error_tx, Arc::clone(&hooks)),
            stats: EventStatsRegistry::new(),
            throughput: ThroughputTracker::new(THROUGHPUT_ALPHA),
            events_sent: AtomicU64::new(0),
            chunks_emitted: AtomicU64::new(0),
            bytes_emitted: AtomicU64::new(0),
            last_activity_ms: AtomicI64::new(0),
            shutdown: shutdown_rx,
            codec,
            hooks,
            config,
        });

        Ok(Self {
            shared,
            state: Mutex::new(EngineState::New),
            assigner: SequenceAssigner::new(),
            input_tx: RwLock::new(Some(input_tx)),
            input_rx: Mutex::new(Some(input_rx)),
            chunk_rx: Mutex::new(Some(chunk_rx)),
            error_rx: Mutex::new(Some(error_rx)),
            shutdown_tx,
            tasks: AsyncMutex::new(EngineTasks::default()),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start the worker pool, flush ticker, and metrics aggregator.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match *state {
                EngineState::New => *state = EngineState::Running,
                EngineState::Running | EngineState::Draining => return Err(Error::AlreadyStarted),
                EngineState::Closed => return Err(Error::Closed),
            }
        }

        let input_rx = self
            .input_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(Error::AlreadyStarted)?;
        let input_rx = Arc::new(AsyncMutex::new(input_rx));

        let mut tasks = self.tasks.lock().await;
        for worker_id in 0..self.shared.config.worker_count {
            let shared = Arc::clone(&self.shared);
            let input_rx = Arc::clone(&input_rx);
            let shutdown = self.shared.shutdown.clone();
            tasks.workers.push(tokio::spawn(async move {
                worker_loop(shared, input_rx, shutdown, worker_id).await;
            }));
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        tasks.tickers.push(tokio::spawn(async move {
            flush_loop(shared, shutdown).await;
        }));

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        tasks.tickers.push(tokio::spawn(async move {
            aggregator_loop(shared, shutdown).await;
        }));

        info!(
            workers = self.shared.config.worker_count,
            batching = self.shared.config.batch_enabled,
            compression = ?self.shared.config.compression,
            "stream engine started"
        );
        Ok(())
    }

    /// Submit one event into the pipeline.
    ///
    /// Waits at most `backpressure_timeout` across flow-control admission and
    /// the input queue, then fails with [`Error::Backpressure`]. Returns the
    /// assigned sequence number (0 when sequencing is disabled).
    pub async fn send_event(&self, event: E) -> Result<u64, Error> {
        if event.event_type().is_empty() {
            return Err(Error::Validation("event type must not be empty".into()));
        }
        match self.state() {
            EngineState::New => return Err(Error::NotStarted),
            EngineState::Draining | EngineState::Closed => return Err(Error::Closed),
            EngineState::Running => {}
        }

        let started = Instant::now();
        let permit = self.shared.flow.acquire().await?;
        let seq = if self.shared.config.sequence_enabled {
            self.assigner.next()
        } else {
            0
        };

        let sender = {
            let guard = self
                .input_tx
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.clone().ok_or(Error::Closed)?
        };
        let remaining = self
            .shared
            .config
            .backpressure_timeout
            .saturating_sub(started.elapsed());
        let item = WorkItem { event, seq, permit };
        match timeout(remaining, sender.send(item)).await {
            Ok(Ok(())) => {
                self.shared.events_sent.fetch_add(1, Ordering::Relaxed);
                self.shared.hooks.counter_inc("engine.events_sent", 1);
                Ok(seq)
            }
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => Err(Error::Backpressure {
                timeout: self.shared.config.backpressure_timeout,
            }),
        }
    }

    /// Take the chunk stream. Finite once the engine closes; can be taken
    /// exactly once per engine.
    pub fn chunks(&self) -> Result<ReceiverStream<StreamChunk>, Error> {
        self.chunk_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| Error::Validation("chunk stream already taken".into()))
    }

    /// Take the chunk stream rendered as SSE frame bytes, with idle
    /// keep-alive comments per the configured interval.
    pub fn sse_frames(
        &self,
    ) -> Result<impl futures::Stream<Item = Vec<u8>> + Send + 'static, Error> {
        let receiver = self
            .chunk_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::Validation("chunk stream already taken".into()))?;
        let renderer = ChunkRenderer::new(
            self.shared.config.sequence_enabled,
            self.shared.config.retry_ms,
        );
        Ok(sse_byte_stream(
            receiver,
            renderer,
            self.shared.config.keepalive_interval,
        ))
    }

    /// Take the error stream. Can be taken exactly once per engine.
    pub fn errors(&self) -> Result<ReceiverStream<Error>, Error> {
        self.error_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| Error::Validation("error stream already taken".into()))
    }

    /// Build a receive pipeline matching this engine's configuration.
    pub fn receive_pipeline(&self) -> ReceivePipeline<E> {
        ReceivePipeline::new(&self.shared.config, Arc::clone(&self.shared.codec))
    }

    /// Cheap read-only metrics snapshot.
    pub fn metrics(&self) -> EngineMetrics {
        EngineMetrics {
            state: self.state(),
            events_sent: self.shared.events_sent.load(Ordering::Relaxed),
            flow: self.shared.flow.snapshot(),
            chunks_emitted: self.shared.chunks_emitted.load(Ordering::Relaxed),
            bytes_emitted: self.shared.bytes_emitted.load(Ordering::Relaxed),
            throughput: self.shared.throughput.rates(),
            compression: self.shared.compressor.telemetry(),
            buffer_pool: self.shared.pool.stats(),
            coalesced_errors: self.shared.errors.coalesced_counts(),
            event_types: self.shared.stats.snapshot(),
        }
    }

    /// Liveness report for external health checks.
    pub fn health(&self) -> HealthProbe {
        HealthProbe {
            healthy: self.state() == EngineState::Running,
            last_error: self.shared.errors.history.last_message(),
            last_activity: self.shared.last_activity(),
        }
    }

    /// Gracefully shut down: stop intake, drain in-flight work, flush the
    /// batcher, and close the output streams.
    ///
    /// Bounded by `drain_timeout`; on expiry the engine force-closes and
    /// reports [`Error::DrainTimeout`]. Idempotent: later calls return
    /// immediately.
    pub async fn close(&self) -> Result<(), Error> {
        let never_ran = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            match *state {
                EngineState::Closed | EngineState::Draining => return Ok(()),
                EngineState::New => {
                    *state = EngineState::Closed;
                    true
                }
                EngineState::Running => {
                    *state = EngineState::Draining;
                    false
                }
            }
        };
        if never_ran {
            // Nothing is in flight; just end the streams.
            self.input_tx
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            self.shared
                .chunk_tx
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            self.shared.errors.close();
            self.shared.flow.close();
            return Ok(());
        }
        info!("stream engine draining");

        // Stop accepting new events; workers drain what is queued.
        {
            let mut guard = self
                .input_tx
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take();
        }

        let deadline = Instant::now() + self.shared.config.drain_timeout;
        let EngineTasks { workers, tickers } = {
            let mut tasks = self.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };

        let mut drained = true;
        let mut stragglers = Vec::new();
        for handle in workers {
            if !drained {
                stragglers.push(handle);
                continue;
            }
            let budget = deadline.saturating_duration_since(Instant::now());
            if timeout(budget, handle).await.is_err() {
                drained = false;
            }
        }
        // Stop tickers and any worker still blocked on a full output queue.
        let _ = self.shutdown_tx.send(true);
        for handle in stragglers.into_iter().chain(tickers) {
            let _ = timeout(Duration::from_millis(100), handle).await;
        }

        // Emit whatever the batcher still holds.
        if let Some(batcher) = &self.shared.batcher {
            if let Some(ready) = batcher.flush() {
                emit_batch(&self.shared, ready).await;
            }
        }

        // Closing the senders ends the chunk and error streams once workers
        // are gone; closing the flow controller wakes blocked producers.
        {
            let mut guard = self
                .shared
                .chunk_tx
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take();
        }
        self.shared.errors.close();
        self.shared.flow.close();

        {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *state = EngineState::Closed;
        }

        if drained {
            info!("stream engine closed");
            Ok(())
        } else {
            error!("stream engine close exceeded drain timeout; force-closed");
            Err(Error::DrainTimeout(self.shared.config.drain_timeout))
        }
    }
}

impl<E: StreamEvent> Drop for StreamEngine<E> {
    fn drop(&mut self) {
        // Stops workers and tickers if the engine is dropped without close.
        let _ = self.shutdown_tx.send(true);
    }
}

async fn worker_loop<E: StreamEvent>(
    shared: Arc<PipelineShared<E>>,
    input: Arc<AsyncMutex<mpsc::Receiver<WorkItem<E>>>>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    debug!(worker_id, "pipeline worker started");
    loop {
        let item = {
            let mut rx = input.lock().await;
            tokio::select! {
                item = rx.recv() => item,
                _ = shutdown.changed() => None,
            }
        };
        let Some(item) = item else {
            break;
        };
        process_item(&shared, item).await;
    }
    debug!(worker_id, "pipeline worker stopped");
}

async fn process_item<E: StreamEvent>(shared: &PipelineShared<E>, item: WorkItem<E>) {
    let span = shared.hooks.span_start("engine.process_event");
    let event_type = item.event.event_type().to_owned();

    let payload = match shared.codec.encode(&item.event) {
        Ok(payload) => payload,
        Err(err) => {
            shared.stats.record_error(&event_type);
            shared
                .errors
                .emit(Error::Processing(format!("serialization failed: {err}")));
            shared.flow.record_dropped();
            shared.hooks.span_end(span);
            return;
        }
    };
    shared.stats.record(&event_type, payload.len());

    let delivered = match &shared.batcher {
        Some(batcher) => {
            let batch_item = BatchItem {
                event_type,
                payload,
            };
            match batcher.push(batch_item, item.seq) {
                Some(ready) => emit_batch(shared, ready).await,
                // Buffered; the flush ticker or a later push emits it.
                None => true,
            }
        }
        None => emit_payload(shared, &event_type, payload, item.seq).await,
    };

    if delivered {
        shared.flow.record_processed();
    }
    shared.hooks.span_end(span);
    // The permit drops here, returning the flow-control token.
    drop(item.permit);
}

/// Encode and emit one ready batch. Returns whether it reached the queue.
async fn emit_batch<E>(shared: &PipelineShared<E>, ready: ReadyBatch) -> bool {
    let count = ready.items.len();
    match encode_batch(&ready.items, shared.config.batch_format) {
        Ok(payload) => {
            debug!(events = count, "emitting batch chunk");
            emit_payload(shared, BATCH_EVENT_TYPE, payload, ready.last_seq).await
        }
        Err(err) => {
            shared.errors.emit(err);
            false
        }
    }
}

/// Compress, chunk, and enqueue one serialized payload.
async fn emit_payload<E>(
    shared: &PipelineShared<E>,
    event_type: &str,
    payload: Vec<u8>,
    seq: u64,
) -> bool {
    let (data, compressed) = if shared.config.compression_enabled {
        match shared.compressor.try_compress(&payload, &shared.pool) {
            Ok(Some(compressed)) => {
                shared.pool.put(payload);
                (compressed, true)
            }
            Ok(None) => (payload, false),
            Err(err) => {
                // Fall back to the uncompressed payload.
                shared.errors.emit(err);
                (payload, false)
            }
        }
    } else {
        (payload, false)
    };
    let compression = if compressed {
        shared.config.compression
    } else {
        CompressionKind::None
    };

    let event_id = Chunker::next_event_id();
    let chunks = shared.chunker.split(
        data,
        event_type,
        event_id,
        seq,
        compressed,
        compression,
        &shared.pool,
    );

    match enqueue_event_chunks(shared, chunks).await {
        Ok((count, bytes)) => {
            shared.chunks_emitted.fetch_add(count, Ordering::Relaxed);
            shared.bytes_emitted.fetch_add(bytes, Ordering::Relaxed);
            shared.hooks.counter_inc("engine.chunks_emitted", count);
            shared.touch_activity();
            true
        }
        Err(err) => {
            shared.flow.record_dropped();
            shared.hooks.counter_inc("engine.events_dropped", 1);
            shared.errors.emit(err);
            false
        }
    }
}

/// Enqueue one event's chunk group, returning `(chunks, bytes)` emitted.
///
/// Groups that fit the queue are reserved all-or-nothing, so a drop never
/// leaves a partial chunk set on the output; only a group larger than the
/// whole queue trickles out slot by slot. With ordering required, the emit
/// lock keeps groups from different workers contiguous.
async fn enqueue_event_chunks<E>(
    shared: &PipelineShared<E>,
    chunks: Vec<StreamChunk>,
) -> Result<(u64, u64), Error> {
    let sender = {
        let guard = shared
            .chunk_tx
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.clone()
    };
    let Some(sender) = sender else {
        return Err(Error::EventDropped {
            reason: DropReason::Shutdown,
        });
    };

    let _guard = match &shared.emit_lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let count = chunks.len();
    let bytes: u64 = chunks.iter().map(|c| c.data.len() as u64).sum();

    if count <= shared.config.chunk_buffer_size {
        let mut shutdown = shared.shutdown.clone();
        let permits = tokio::select! {
            result = timeout(shared.config.backpressure_timeout, sender.reserve_many(count)) => {
                match result {
                    Ok(Ok(permits)) => permits,
                    Ok(Err(_)) => {
                        return Err(Error::EventDropped {
                            reason: DropReason::Shutdown,
                        })
                    }
                    Err(_) => {
                        warn!("output queue full past backpressure timeout, dropping event");
                        return Err(Error::EventDropped {
                            reason: DropReason::ConsumerBackpressure,
                        });
                    }
                }
            }
            _ = shutdown.changed() => {
                return Err(Error::EventDropped {
                    reason: DropReason::Shutdown,
                })
            }
        };
        for (permit, chunk) in permits.zip(chunks) {
            permit.send(chunk);
        }
    } else {
        for chunk in chunks {
            enqueue_chunk(shared, &sender, chunk).await?;
        }
    }
    Ok((count as u64, bytes))
}

async fn enqueue_chunk<E>(
    shared: &PipelineShared<E>,
    sender: &mpsc::Sender<StreamChunk>,
    chunk: StreamChunk,
) -> Result<(), Error> {
    let mut shutdown = shared.shutdown.clone();
    tokio::select! {
        result = timeout(shared.config.backpressure_timeout, sender.send(chunk)) => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::EventDropped {
                    reason: DropReason::Shutdown,
                }),
                Err(_) => {
                    warn!("output queue full past backpressure timeout, dropping event");
                    Err(Error::EventDropped {
                        reason: DropReason::ConsumerBackpressure,
                    })
                }
            }
        }
        _ = shutdown.changed() => Err(Error::EventDropped {
            reason: DropReason::Shutdown,
        }),
    }
}

/// Wakes the batcher so aged partial batches go out within their timeout.
async fn flush_loop<E>(shared: Arc<PipelineShared<E>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(batcher) = &shared.batcher {
                    if let Some(ready) = batcher.take_expired() {
                        emit_batch(&shared, ready).await;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Folds cumulative counters into throughput rates and pushes gauges.
async fn aggregator_loop<E>(shared: Arc<PipelineShared<E>>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.throughput.tick(
                    shared.events_sent.load(Ordering::Relaxed),
                    shared.bytes_emitted.load(Ordering::Relaxed),
                );
                let rates = shared.throughput.rates();
                shared.hooks.gauge_set("engine.events_per_sec", rates.events_per_sec);
                shared.hooks.gauge_set("engine.bytes_per_sec", rates.bytes_per_sec);
                let flow = shared.flow.snapshot();
                shared.hooks.gauge_set(
                    "engine.current_concurrent",
                    flow.current_concurrent as f64,
                );
                shared.hooks.gauge_set(
                    "engine.backpressure_events",
                    flow.backpressure_events as f64,
                );
                shared.hooks.gauge_set(
                    "engine.events_processed",
                    flow.events_processed as f64,
                );
                shared.hooks.gauge_set("engine.events_dropped", flow.events_dropped as f64);
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{JsonCodec, RawEvent};
    use serde_json::json;
    use tokio_stream::StreamExt;

    fn engine(config: StreamConfig) -> StreamEngine<RawEvent> {
        StreamEngine::new(config, Arc::new(JsonCodec)).unwrap()
    }

    fn hello(payload: &str) -> RawEvent {
        RawEvent::new("hello", json!({ "payload": payload }))
    }

    #[tokio::test]
    async fn send_before_start_is_rejected() {
        let engine = engine(StreamConfig::default());
        let err = engine.send_event(hello("x")).await.unwrap_err();
        assert!(matches!(err, Error::NotStarted));
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let engine = engine(StreamConfig::default());
        engine.start().await.unwrap();
        assert!(matches!(
            engine.start().await.unwrap_err(),
            Error::AlreadyStarted
        ));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn start_after_close_is_rejected() {
        let engine = engine(StreamConfig::default());
        engine.start().await.unwrap();
        engine.close().await.unwrap();
        assert!(matches!(engine.start().await.unwrap_err(), Error::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = engine(StreamConfig::default());
        engine.start().await.unwrap();
        engine.close().await.unwrap();
        engine.close().await.unwrap();
        assert_eq!(engine.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let engine = engine(StreamConfig::default());
        engine.start().await.unwrap();
        engine.close().await.unwrap();
        assert!(matches!(
            engine.send_event(hello("x")).await.unwrap_err(),
            Error::Closed
        ));
    }

    #[tokio::test]
    async fn empty_event_type_fails_validation() {
        let engine = engine(StreamConfig::default());
        engine.start().await.unwrap();
        let err = engine
            .send_event(RawEvent::new("", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn chunk_stream_can_only_be_taken_once() {
        let engine = engine(StreamConfig::default());
        let _stream = engine.chunks().unwrap();
        assert!(engine.chunks().is_err());
    }

    #[tokio::test]
    async fn single_event_round_trips_through_pipeline() {
        let engine = engine(StreamConfig::default());
        let mut chunks = engine.chunks().unwrap();
        engine.start().await.unwrap();

        let seq = engine.send_event(hello("world")).await.unwrap();
        assert_eq!(seq, 1);

        let chunk = chunks.next().await.unwrap();
        assert_eq!(chunk.event_type, "hello");
        assert_eq!(chunk.total_chunks, 1);
        assert_eq!(chunk.sequence_num, 1);
        let decoded: RawEvent = serde_json::from_slice(&chunk.data).unwrap();
        assert_eq!(decoded.payload, json!({ "payload": "world" }));

        engine.close().await.unwrap();
        assert!(chunks.next().await.is_none());
    }

    #[tokio::test]
    async fn oversized_payload_is_chunked_in_order() {
        let config = StreamConfig {
            max_chunk_size: 16,
            sequence_enabled: true,
            ..StreamConfig::default()
        };
        let engine = engine(config);
        let mut chunks = engine.chunks().unwrap();
        engine.start().await.unwrap();

        engine
            .send_event(hello(&"x".repeat(64)))
            .await
            .unwrap();

        let first = chunks.next().await.unwrap();
        let total = first.total_chunks;
        assert!(total > 1);
        let mut collected = vec![first];
        for _ in 1..total {
            collected.push(chunks.next().await.unwrap());
        }
        for (i, chunk) in collected.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.event_id, collected[0].event_id);
        }
        engine.close().await.unwrap();
    }

    #[tokio::test]
    async fn serialization_failure_surfaces_on_error_stream() {
        #[derive(Clone)]
        struct Unserializable;
        impl StreamEvent for Unserializable {
            fn event_type(&self) -> &str {
                "broken"
            }
        }
        struct FailingCodec;
        impl EventCodec<Unserializable> for FailingCodec {
            fn encode(&self, _: &Unserializable) -> Result<Vec<u8>, crate::core::error::CodecError> {
                Err(crate::core::error::CodecError::Encode("boom".into()))
            }
            fn decode(
                &self,
                event_type: &str,
                _: &[u8],
            ) -> Result<Unserializable, crate::core::error::CodecError> {
                Err(crate::core::error::CodecError::Decode {
                    event_type: event_type.into(),
                    reason: "boom".into(),
                })
            }
        }

        let engine: StreamEngine<Unserializable> =
            StreamEngine::new(StreamConfig::default(), Arc::new(FailingCodec)).unwrap();
        let mut errors = engine.errors().unwrap();
        engine.start().await.unwrap();
        engine.send_event(Unserializable).await.unwrap();

        let err = errors.next().await.unwrap();
        assert_eq!(err.kind(), ErrorKind::Processing);

        engine.close().await.unwrap();
        let metrics = engine.metrics();
        assert_eq!(metrics.flow.events_dropped, 1);
        assert_eq!(metrics.flow.current_concurrent, 0);
    }

    #[tokio::test]
    async fn metrics_reflect_processed_events() {
        let engine = engine(StreamConfig::default());
        let mut chunks = engine.chunks().unwrap();
        engine.start().await.unwrap();

        for i in 0..5 {
            engine.send_event(hello(&i.to_string())).await.unwrap();
        }
        for _ in 0..5 {
            chunks.next().await.unwrap();
        }
        engine.close().await.unwrap();

        let metrics = engine.metrics();
        assert_eq!(metrics.events_sent, 5);
        assert_eq!(metrics.chunks_emitted, 5);
        assert_eq!(metrics.flow.events_processed, 5);
        assert_eq!(metrics.flow.current_concurrent, 0);
        let (event_type, stats) = &metrics.event_types[0];
        assert_eq!(event_type, "hello");
        assert_eq!(stats.count, 5);
    }
}
