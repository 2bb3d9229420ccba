//! Receive-side connection management.
//!
//! [`ConnectionManager`] owns one SSE connection: it opens the stream
//! through the transport seam, drives the receive pipeline from the
//! response body, watches for heartbeat silence, and walks the reconnect
//! state machine with jittered exponential backoff, replaying
//! `Last-Event-ID` on every new attempt.

pub mod backoff;
pub mod stats;
pub mod transport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::connection::backoff::Backoff;
use crate::connection::stats::{
    ConnectionEvent, ConnectionEventDetail, ConnectionEventKind, ConnectionHistory,
    ConnectionStats, ConnectionStatsSnapshot,
};
use crate::connection::transport::{SseBody, SseRequest, SseTransport, LAST_EVENT_ID_HEADER};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{ConnectionConfig, StreamConfig};
use crate::core::error::{ConnectionError, Error};
use crate::core::event::{EventCodec, SequencedEvent, StreamEvent};
use crate::engine::receive::ReceivePipeline;
use crate::observability::{HealthProbe, Hooks, NoopHooks};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The stream is live.
    Connected,
    /// Waiting out backoff before the next attempt.
    Reconnecting,
    /// Terminally closed, by the caller or by attempt exhaustion.
    Closed,
}

/// Lifecycle callbacks for one connection.
///
/// All methods default to no-ops. Callbacks run on the connection's driver
/// task and must not block.
pub trait ConnectionHook: Send + Sync {
    /// The first connection attempt succeeded.
    fn on_established(&self, _connection_id: &str) {}

    /// The connection is terminally closed.
    fn on_closed(&self, _connection_id: &str) {}

    /// An error occurred on the connection.
    fn on_error(&self, _connection_id: &str, _error: &Error) {}

    /// A reconnect attempt finished.
    fn on_reconnect(&self, _attempt: u32, _success: bool) {}
}

/// Capacity of the typed event queue toward the consumer.
const EVENT_QUEUE_CAPACITY: usize = 256;

/// Capacity of the connection error queue.
const ERROR_QUEUE_CAPACITY: usize = 64;

/// Granularity at which waits observe cancellation.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct ConnInner<E> {
    config: ConnectionConfig,
    stream_config: StreamConfig,
    codec: Arc<dyn EventCodec<E>>,
    transport: Arc<dyn SseTransport>,
    clock: RwLock<Arc<dyn Clock>>,
    hooks: RwLock<Vec<Arc<dyn ConnectionHook>>>,
    obs: RwLock<Hooks>,
    state: RwLock<ConnectionState>,
    stats: ConnectionStats,
    history: ConnectionHistory,
    last_event_id: RwLock<Option<String>>,
    last_error: RwLock<Option<String>>,
    closed_notified: AtomicBool,
    events_tx: mpsc::Sender<SequencedEvent<E>>,
    errors_tx: mpsc::Sender<Error>,
}

impl<E> ConnInner<E> {
    fn hooks(&self) -> Vec<Arc<dyn ConnectionHook>> {
        self.hooks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(
            &self
                .clock
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn obs(&self) -> Hooks {
        Arc::clone(
            &self
                .obs
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *state != next {
            debug!(connection_id = %self.stats.id, from = ?*state, to = ?next, "connection state change");
            *state = next;
        }
    }

    fn state(&self) -> ConnectionState {
        *self
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Record and surface an error without ever blocking the driver.
    fn emit_error(&self, error: Error) {
        self.stats.record_error();
        self.obs().counter_inc("connection.errors", 1);
        {
            let mut last = self
                .last_error
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            *last = Some(error.to_string());
        }
        for hook in self.hooks() {
            hook.on_error(&self.stats.id, &error);
        }
        let _ = self.errors_tx.try_send(error);
    }

    fn notify_closed(&self) {
        if !self.closed_notified.swap(true, Ordering::SeqCst) {
            for hook in self.hooks() {
                hook.on_closed(&self.stats.id);
            }
        }
    }

    fn build_request(&self) -> SseRequest {
        let mut request = SseRequest::new(&self.config.url);
        for (name, value) in &self.config.headers {
            request = request.with_header(name, value);
        }
        let last_id = self
            .last_event_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(id) = last_id {
            request = request.with_header(LAST_EVENT_ID_HEADER, id);
        }
        request
    }
}

/// Manager for one receive-side SSE connection.
pub struct ConnectionManager<E: StreamEvent> {
    inner: Arc<ConnInner<E>>,
    events_rx: Mutex<Option<mpsc::Receiver<SequencedEvent<E>>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<Error>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<E: StreamEvent> ConnectionManager<E> {
    /// Create a manager for the given endpoint and pipeline configuration.
    pub fn new(
        config: ConnectionConfig,
        stream_config: StreamConfig,
        codec: Arc<dyn EventCodec<E>>,
        transport: Arc<dyn SseTransport>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let remote = Some(config.url.clone());
        let inner = Arc::new(ConnInner {
            config,
            stream_config,
            codec,
            transport,
            clock: RwLock::new(Arc::new(SystemClock)),
            hooks: RwLock::new(Vec::new()),
            obs: RwLock::new(Arc::new(NoopHooks)),
            state: RwLock::new(ConnectionState::Disconnected),
            stats: ConnectionStats::new(remote),
            history: ConnectionHistory::new(128),
            last_event_id: RwLock::new(None),
            last_error: RwLock::new(None),
            closed_notified: AtomicBool::new(false),
            events_tx,
            errors_tx,
        });
        Self {
            inner,
            events_rx: Mutex::new(Some(events_rx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            shutdown_tx,
            shutdown_rx,
            task: AsyncMutex::new(None),
        }
    }

    /// Register a lifecycle hook.
    pub fn add_hook(&self, hook: Arc<dyn ConnectionHook>) {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(hook);
    }

    /// Substitute the time source.
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self
            .inner
            .clock
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = clock;
    }

    /// Wire observability hooks.
    pub fn set_observability(&self, obs: Hooks) {
        *self
            .inner
            .obs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = obs;
    }

    /// Start the connection driver.
    pub async fn connect(&self) -> Result<(), Error> {
        match self.inner.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Closed => return Err(Error::Closed),
            _ => return Err(Error::AlreadyStarted),
        }
        self.inner.set_state(ConnectionState::Connecting);

        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            run_connection(inner, shutdown).await;
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    /// Typed events decoded from the stream. Can be taken exactly once.
    pub fn events(&self) -> Result<ReceiverStream<SequencedEvent<E>>, Error> {
        self.events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| Error::Validation("event stream already taken".into()))
    }

    /// Connection errors. Can be taken exactly once.
    pub fn errors(&self) -> Result<ReceiverStream<Error>, Error> {
        self.errors_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .map(ReceiverStream::new)
            .ok_or_else(|| Error::Validation("error stream already taken".into()))
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Lifecycle history, oldest first.
    pub fn history(&self) -> Vec<ConnectionEvent> {
        self.inner.history.recent()
    }

    /// The id that would be replayed as `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> Option<String> {
        self.inner
            .last_event_id
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Liveness report.
    pub fn health(&self) -> HealthProbe {
        HealthProbe {
            healthy: self.state() == ConnectionState::Connected,
            last_error: self
                .inner
                .last_error
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
            last_activity: self.inner.stats.last_activity(),
        }
    }

    /// Terminally close the connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.state() == ConnectionState::Closed {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = timeout(Duration::from_secs(1), handle).await;
        }
        self.inner.set_state(ConnectionState::Closed);
        self.inner.notify_closed();
        info!(connection_id = %self.inner.stats.id, "connection closed");
    }
}

impl<E: StreamEvent> Drop for ConnectionManager<E> {
    fn drop(&mut self) {
        // Stops the driver task if the manager is dropped without close.
        let _ = self.shutdown_tx.send(true);
    }
}

enum ReadOutcome {
    /// The peer ended the stream cleanly.
    Eof,
    /// A read failed or the heartbeat watchdog fired.
    Failed,
    /// Local shutdown.
    Shutdown,
}

async fn run_connection<E: StreamEvent>(
    inner: Arc<ConnInner<E>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pipeline = ReceivePipeline::new(&inner.stream_config, Arc::clone(&inner.codec));
    let mut backoff = Backoff::new(inner.config.reconnect.clone());
    let mut reconnecting = false;

    loop {
        if *shutdown.borrow() {
            break;
        }
        inner.set_state(ConnectionState::Connecting);
        let attempt = backoff.attempt().max(1);
        let attempt_started = Instant::now();
        let request = inner.build_request();

        match inner.transport.open(request).await {
            Ok(response) => {
                let latency = attempt_started.elapsed();
                inner.set_state(ConnectionState::Connected);
                inner.stats.touch();
                inner.obs().counter_inc("connection.established", 1);
                if reconnecting {
                    inner.stats.record_reconnect();
                    inner.history.push(
                        &inner.stats.id,
                        ConnectionEventKind::Reconnected,
                        ConnectionEventDetail::Attempt {
                            attempt,
                            latency,
                            success: true,
                        },
                    );
                    for hook in inner.hooks() {
                        hook.on_reconnect(attempt, true);
                    }
                } else {
                    inner.history.push(
                        &inner.stats.id,
                        ConnectionEventKind::Established,
                        ConnectionEventDetail::Attempt {
                            attempt,
                            latency,
                            success: true,
                        },
                    );
                    for hook in inner.hooks() {
                        hook.on_established(&inner.stats.id);
                    }
                }
                backoff.reset();
                pipeline.reset_framing();

                let outcome =
                    read_stream(&inner, &mut pipeline, response.body, &mut shutdown).await;
                match outcome {
                    ReadOutcome::Shutdown => break,
                    ReadOutcome::Eof | ReadOutcome::Failed => {
                        inner.set_state(ConnectionState::Reconnecting);
                        reconnecting = true;
                    }
                }
            }
            Err(err) => {
                let latency = attempt_started.elapsed();
                warn!(connection_id = %inner.stats.id, attempt, error = %err, "connection attempt failed");
                inner.history.push(
                    &inner.stats.id,
                    ConnectionEventKind::Failed,
                    ConnectionEventDetail::Attempt {
                        attempt,
                        latency,
                        success: false,
                    },
                );
                if reconnecting {
                    for hook in inner.hooks() {
                        hook.on_reconnect(attempt, false);
                    }
                }
                inner.emit_error(err.into());
                inner.set_state(ConnectionState::Reconnecting);
                reconnecting = true;
            }
        }

        if *shutdown.borrow() {
            break;
        }
        if let Some(hint) = pipeline.retry_hint() {
            backoff.set_initial_hint(hint);
        }
        match backoff.next_delay() {
            Some(delay) => {
                debug!(connection_id = %inner.stats.id, ?delay, "backing off before reconnect");
                let clock = inner.clock();
                if sleep_cancellable(&*clock, delay, &mut shutdown).await {
                    break;
                }
            }
            None => {
                let error = Error::Connection(ConnectionError::AttemptsExhausted {
                    attempts: backoff.attempt(),
                });
                inner.emit_error(error);
                inner.set_state(ConnectionState::Closed);
                inner.notify_closed();
                break;
            }
        }
    }

    // Flush whatever the pipeline still buffers before the queues close.
    let output = pipeline.finish();
    for event in output.events {
        inner.stats.record_events_in(1);
        let _ = inner.events_tx.try_send(event);
    }
    for error in output.errors {
        inner.emit_error(error);
    }
    if inner.state() != ConnectionState::Closed {
        inner.set_state(ConnectionState::Closed);
        inner.notify_closed();
    }
}

async fn read_stream<E: StreamEvent>(
    inner: &ConnInner<E>,
    pipeline: &mut ReceivePipeline<E>,
    mut body: Box<dyn SseBody>,
    shutdown: &mut watch::Receiver<bool>,
) -> ReadOutcome {
    let heartbeat = inner.config.heartbeat_timeout;
    loop {
        let next = tokio::select! {
            next = timeout(heartbeat, body.next_bytes()) => next,
            _ = shutdown.changed() => return ReadOutcome::Shutdown,
        };
        match next {
            Err(_silent) => {
                // No bytes at all within the window, not even a comment ping.
                inner.history.push(
                    &inner.stats.id,
                    ConnectionEventKind::Timeout,
                    ConnectionEventDetail::Idle(heartbeat),
                );
                inner.emit_error(ConnectionError::HeartbeatTimeout(heartbeat).into());
                return ReadOutcome::Failed;
            }
            Ok(None) => {
                inner.history.push(
                    &inner.stats.id,
                    ConnectionEventKind::Disconnected,
                    ConnectionEventDetail::None,
                );
                return ReadOutcome::Eof;
            }
            Ok(Some(Err(err))) => {
                inner.history.push(
                    &inner.stats.id,
                    ConnectionEventKind::Disconnected,
                    ConnectionEventDetail::Error(err.to_string()),
                );
                inner.emit_error(err.into());
                return ReadOutcome::Failed;
            }
            Ok(Some(Ok(bytes))) => {
                inner.stats.record_bytes_in(bytes.len() as u64);
                inner.obs().counter_inc("connection.bytes_in", bytes.len() as u64);

                let output = pipeline.feed(&bytes);
                if let Some(id) = pipeline.last_event_id() {
                    let mut last = inner
                        .last_event_id
                        .write()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    *last = Some(id.to_owned());
                }
                for error in output.errors {
                    inner.emit_error(error);
                }
                for error in pipeline.purge_expired() {
                    inner.emit_error(error);
                }
                for event in output.events {
                    inner.stats.record_events_in(1);
                    inner.obs().counter_inc("connection.events_in", 1);
                    tokio::select! {
                        sent = inner.events_tx.send(event) => {
                            if sent.is_err() {
                                // Consumer went away; nothing left to deliver to.
                                return ReadOutcome::Shutdown;
                            }
                        }
                        _ = shutdown.changed() => return ReadOutcome::Shutdown,
                    }
                }
            }
        }
    }
}

/// Sleep in slices so cancellation is observed within the poll interval.
async fn sleep_cancellable(
    clock: &dyn Clock,
    total: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let mut remaining = total;
    while !remaining.is_zero() {
        let slice = remaining.min(CANCEL_POLL_INTERVAL);
        tokio::select! {
            () = clock.sleep(slice) => {}
            _ = shutdown.changed() => return true,
        }
        remaining = remaining.saturating_sub(slice);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::transport::{MockConnection, MockRead, MockTransport};
    use crate::core::config::ReconnectPolicy;
    use crate::core::event::{JsonCodec, RawEvent};
    use crate::wire::framer::Framer;
    use serde_json::json;
    use tokio_stream::StreamExt;

    #[derive(Default)]
    struct RecordingHook {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingHook {
        fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }

        fn record(&self, call: String) {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(call);
        }
    }

    impl ConnectionHook for RecordingHook {
        fn on_established(&self, _id: &str) {
            self.record("established".into());
        }
        fn on_closed(&self, _id: &str) {
            self.record("closed".into());
        }
        fn on_error(&self, _id: &str, error: &Error) {
            self.record(format!("error:{}", error.kind()));
        }
        fn on_reconnect(&self, attempt: u32, success: bool) {
            self.record(format!("reconnect:{attempt}:{success}"));
        }
    }

    fn frame(payload: &str, id: u64) -> Vec<u8> {
        let event = RawEvent::new("hello", json!({ "payload": payload }));
        let data = serde_json::to_string(&event).unwrap();
        Framer::encode("hello", &data, Some(&id.to_string()), None)
    }

    fn fast_policy(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy::FixedInterval {
            delay: Duration::from_millis(10),
            max_attempts,
        }
    }

    fn manager(
        transport: Arc<MockTransport>,
        policy: ReconnectPolicy,
        hook: Arc<RecordingHook>,
    ) -> ConnectionManager<RawEvent> {
        let config = ConnectionConfig::new("http://example/stream")
            .with_heartbeat_timeout(Duration::from_millis(200))
            .with_reconnect_policy(policy);
        let manager =
            ConnectionManager::new(config, StreamConfig::default(), Arc::new(JsonCodec), transport);
        manager.add_hook(hook);
        manager
    }

    #[tokio::test]
    async fn connects_and_delivers_events() {
        let transport = MockTransport::new([MockConnection::Stream(vec![
            MockRead::Data(frame("one", 1)),
            MockRead::Data(frame("two", 2)),
        ])]);
        let hook = Arc::new(RecordingHook::default());
        let manager = manager(Arc::clone(&transport), ReconnectPolicy::None, Arc::clone(&hook));
        let mut events = manager.events().unwrap();

        manager.connect().await.unwrap();
        let first = events.next().await.unwrap();
        assert_eq!(first.sequence_num, 1);
        let second = events.next().await.unwrap();
        assert_eq!(second.event.payload, json!({ "payload": "two" }));

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(hook.calls().contains(&"established".to_string()));
        assert!(hook.calls().contains(&"closed".to_string()));
        assert_eq!(manager.stats().events_in, 2);
    }

    #[tokio::test]
    async fn reconnect_replays_last_event_id() {
        let transport = MockTransport::new([
            MockConnection::Stream(vec![
                MockRead::Data(frame("first", 42)),
                MockRead::Error("connection reset".into()),
            ]),
            MockConnection::Stream(vec![MockRead::Data(frame("resumed", 43))]),
        ]);
        let hook = Arc::new(RecordingHook::default());
        let manager = manager(Arc::clone(&transport), fast_policy(Some(5)), Arc::clone(&hook));
        let mut events = manager.events().unwrap();

        manager.connect().await.unwrap();
        assert_eq!(events.next().await.unwrap().sequence_num, 42);
        assert_eq!(events.next().await.unwrap().sequence_num, 43);

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].header(LAST_EVENT_ID_HEADER), None);
        assert_eq!(requests[1].header(LAST_EVENT_ID_HEADER), Some("42"));

        assert!(hook.calls().contains(&"reconnect:1:true".to_string()));
        assert_eq!(manager.stats().reconnects, 1);
        let kinds: Vec<_> = manager.history().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ConnectionEventKind::Reconnected));

        manager.close().await;
    }

    #[tokio::test]
    async fn exhausted_attempts_close_the_connection() {
        let transport = MockTransport::new([
            MockConnection::Refused("down".into()),
            MockConnection::Refused("still down".into()),
            MockConnection::Refused("dead".into()),
        ]);
        let hook = Arc::new(RecordingHook::default());
        let manager = manager(Arc::clone(&transport), fast_policy(Some(2)), Arc::clone(&hook));
        let mut errors = manager.errors().unwrap();

        manager.connect().await.unwrap();

        let mut saw_exhausted = false;
        while let Some(err) = errors.next().await {
            if matches!(
                err,
                Error::Connection(ConnectionError::AttemptsExhausted { .. })
            ) {
                saw_exhausted = true;
                break;
            }
        }
        assert!(saw_exhausted);

        // Driver settles into Closed without an explicit close().
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(hook.calls().contains(&"closed".to_string()));
    }

    #[tokio::test]
    async fn heartbeat_silence_triggers_reconnect() {
        let transport = MockTransport::new([
            MockConnection::Stream(vec![MockRead::Delay(Duration::from_secs(5))]),
            MockConnection::Stream(vec![MockRead::Data(frame("after", 1))]),
        ]);
        let hook = Arc::new(RecordingHook::default());
        let config = ConnectionConfig::new("http://example/stream")
            .with_heartbeat_timeout(Duration::from_millis(30))
            .with_reconnect_policy(fast_policy(Some(3)));
        let m: ConnectionManager<RawEvent> = ConnectionManager::new(
            config,
            StreamConfig::default(),
            Arc::new(JsonCodec),
            Arc::clone(&transport) as Arc<dyn SseTransport>,
        );
        m.add_hook(Arc::clone(&hook) as Arc<dyn ConnectionHook>);
        let mut events = m.events().unwrap();

        m.connect().await.unwrap();
        let event = events.next().await.unwrap();
        assert_eq!(event.sequence_num, 1);

        let kinds: Vec<_> = m.history().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ConnectionEventKind::Timeout));
        m.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let transport = MockTransport::new([MockConnection::Stream(vec![MockRead::Delay(
            Duration::from_secs(10),
        )])]);
        let hook = Arc::new(RecordingHook::default());
        let manager = manager(transport, ReconnectPolicy::None, Arc::clone(&hook));
        manager.connect().await.unwrap();

        manager.close().await;
        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(
            hook.calls().iter().filter(|c| *c == "closed").count(),
            1
        );
    }

    #[tokio::test]
    async fn connect_after_close_is_rejected() {
        let transport = MockTransport::new([]);
        let hook = Arc::new(RecordingHook::default());
        let manager = manager(transport, ReconnectPolicy::None, hook);
        manager.close().await;
        assert!(matches!(manager.connect().await.unwrap_err(), Error::Closed));
    }
}
