//! Backpressure control for in-flight events.
//!
//! A counting semaphore bounds how many events may be inside the pipeline
//! at once. Acquisition waits at most the configured backpressure timeout;
//! release is RAII so a token can never leak past its event, and closing
//! the controller wakes every waiter with a cancellation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::core::error::Error;

/// Counters the controller maintains for telemetry.
#[derive(Debug, Default)]
struct FlowCounters {
    current: AtomicUsize,
    backpressure_events: AtomicU64,
    events_processed: AtomicU64,
    events_dropped: AtomicU64,
}

/// Snapshot of flow-control activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSnapshot {
    /// Tokens currently held.
    pub current_concurrent: usize,
    /// Acquire attempts that timed out.
    pub backpressure_events: u64,
    /// Events that completed the pipeline.
    pub events_processed: u64,
    /// Events dropped after acquiring a token.
    pub events_dropped: u64,
}

/// A held flow-control token; dropping it releases the token.
pub struct FlowPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<FlowCounters>,
}

impl Drop for FlowPermit {
    fn drop(&mut self) {
        self.counters.current.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for FlowPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowPermit").finish_non_exhaustive()
    }
}

/// Token-semaphore flow controller.
#[derive(Debug)]
pub struct FlowController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquire_timeout: Duration,
    counters: Arc<FlowCounters>,
}

impl FlowController {
    /// Create a controller with `capacity` tokens and the given acquire bound.
    pub fn new(capacity: usize, acquire_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquire_timeout,
            counters: Arc::new(FlowCounters::default()),
        }
    }

    /// Acquire one token, waiting at most the configured timeout.
    ///
    /// Returns [`Error::Backpressure`] when the timeout expires and
    /// [`Error::Cancelled`] when the controller has been closed.
    pub async fn acquire(&self) -> Result<FlowPermit, Error> {
        self.acquire_within(self.acquire_timeout).await
    }

    /// Acquire one token with an explicit deadline.
    ///
    /// A caller-supplied deadline shorter than the configured timeout takes
    /// precedence.
    pub async fn acquire_within(&self, limit: Duration) -> Result<FlowPermit, Error> {
        let limit = limit.min(self.acquire_timeout);
        match timeout(limit, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.counters.current.fetch_add(1, Ordering::Relaxed);
                Ok(FlowPermit {
                    _permit: permit,
                    counters: Arc::clone(&self.counters),
                })
            }
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.counters
                    .backpressure_events
                    .fetch_add(1, Ordering::Relaxed);
                Err(Error::Backpressure { timeout: limit })
            }
        }
    }

    /// Acquire without waiting; `None` when no token is free.
    pub fn try_acquire(&self) -> Option<FlowPermit> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| {
                self.counters.current.fetch_add(1, Ordering::Relaxed);
                FlowPermit {
                    _permit: permit,
                    counters: Arc::clone(&self.counters),
                }
            })
    }

    /// Wake all waiters with a cancellation; held permits stay valid until
    /// dropped.
    pub fn close(&self) {
        self.semaphore.close();
    }

    /// Record an event that made it through the pipeline.
    pub fn record_processed(&self) {
        self.counters.events_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an event dropped after admission.
    pub fn record_dropped(&self) {
        self.counters.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Tokens currently held.
    pub fn outstanding(&self) -> usize {
        self.counters.current.load(Ordering::Relaxed)
    }

    /// Configured token capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current counter values.
    pub fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            current_concurrent: self.counters.current.load(Ordering::Relaxed),
            backpressure_events: self.counters.backpressure_events.load(Ordering::Relaxed),
            events_processed: self.counters.events_processed.load(Ordering::Relaxed),
            events_dropped: self.counters.events_dropped.load(Ordering::Relaxed),
        }
    }
}
