//! Per-event-type statistics, throughput tracking, and error history.
//!
//! Hot-path counters are atomics; only the min/max size bounds take a
//! short-held lock. Throughput is an exponentially weighted moving average
//! updated on a fixed tick, so a burst of sends raises the rate smoothly
//! instead of producing elapsed-time artifacts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::core::error::{Error, ErrorKind};

/// Point-in-time view of one event type's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTypeSnapshot {
    /// Events of this type accepted by the pipeline.
    pub count: u64,
    /// Sum of their serialized sizes.
    pub total_bytes: u64,
    /// Failures attributed to this type.
    pub error_count: u64,
    /// Smallest serialized size seen.
    pub min_size: Option<usize>,
    /// Largest serialized size seen.
    pub max_size: Option<usize>,
}

/// Counters for a single event type.
#[derive(Debug, Default)]
pub struct EventTypeStats {
    count: AtomicU64,
    total_bytes: AtomicU64,
    error_count: AtomicU64,
    size_bounds: Mutex<Option<(usize, usize)>>,
}

impl EventTypeStats {
    /// Record one event of the given serialized size.
    pub fn record(&self, size: usize) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
        let mut bounds = self
            .size_bounds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *bounds = Some(match *bounds {
            Some((min, max)) => (min.min(size), max.max(size)),
            None => (size, size),
        });
    }

    /// Record a failure attributed to this type.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy out the current values.
    pub fn snapshot(&self) -> EventTypeSnapshot {
        let bounds = *self
            .size_bounds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        EventTypeSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            min_size: bounds.map(|(min, _)| min),
            max_size: bounds.map(|(_, max)| max),
        }
    }
}

/// Registry of per-type statistics, sharded by event type.
#[derive(Debug, Default)]
pub struct EventStatsRegistry {
    types: DashMap<String, Arc<EventTypeStats>>,
}

impl EventStatsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one event of the given type and size.
    pub fn record(&self, event_type: &str, size: usize) {
        self.stats_for(event_type).record(size);
    }

    /// Record a failure for the given type.
    pub fn record_error(&self, event_type: &str) {
        self.stats_for(event_type).record_error();
    }

    /// Copy out every type's counters.
    pub fn snapshot(&self) -> Vec<(String, EventTypeSnapshot)> {
        self.types
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    fn stats_for(&self, event_type: &str) -> Arc<EventTypeStats> {
        if let Some(stats) = self.types.get(event_type) {
            return Arc::clone(&stats);
        }
        Arc::clone(
            &self
                .types
                .entry(event_type.to_owned())
                .or_insert_with(|| Arc::new(EventTypeStats::default())),
        )
    }
}

/// Smoothed event and byte rates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputRates {
    /// Events per second.
    pub events_per_sec: f64,
    /// Bytes per second.
    pub bytes_per_sec: f64,
}

#[derive(Debug)]
struct ThroughputState {
    last_events: u64,
    last_bytes: u64,
    last_tick: Instant,
    events_rate: f64,
    bytes_rate: f64,
}

/// EWMA throughput tracker fed from cumulative totals on a fixed tick.
#[derive(Debug)]
pub struct ThroughputTracker {
    alpha: f64,
    state: Mutex<ThroughputState>,
}

impl ThroughputTracker {
    /// Create a tracker with the given smoothing factor (0 < alpha <= 1).
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            state: Mutex::new(ThroughputState {
                last_events: 0,
                last_bytes: 0,
                last_tick: Instant::now(),
                events_rate: 0.0,
                bytes_rate: 0.0,
            }),
        }
    }

    /// Fold the latest cumulative totals into the moving averages.
    pub fn tick(&self, total_events: u64, total_bytes: u64) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let elapsed = state.last_tick.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let event_delta = total_events.saturating_sub(state.last_events) as f64;
        let byte_delta = total_bytes.saturating_sub(state.last_bytes) as f64;
        let instant_events = event_delta / elapsed;
        let instant_bytes = byte_delta / elapsed;

        state.events_rate = self.alpha * instant_events + (1.0 - self.alpha) * state.events_rate;
        state.bytes_rate = self.alpha * instant_bytes + (1.0 - self.alpha) * state.bytes_rate;
        state.last_events = total_events;
        state.last_bytes = total_bytes;
        state.last_tick = Instant::now();
    }

    /// Current smoothed rates.
    pub fn rates(&self) -> ThroughputRates {
        let state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        ThroughputRates {
            events_per_sec: state.events_rate,
            bytes_per_sec: state.bytes_rate,
        }
    }
}

/// One remembered error.
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    /// When it was recorded.
    pub at: DateTime<Utc>,
    /// Coarse classification.
    pub kind: ErrorKind,
    /// Rendered message.
    pub message: String,
}

/// Bounded ring of recent errors; single writer lock, readers copy out.
#[derive(Debug)]
pub struct ErrorHistory {
    ring: RwLock<VecDeque<ErrorRecord>>,
    capacity: usize,
}

impl ErrorHistory {
    /// Create a ring remembering at most `capacity` errors.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Remember one error, evicting the oldest when full.
    pub fn push(&self, error: &Error) {
        let mut ring = self
            .ring
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(ErrorRecord {
            at: Utc::now(),
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Copy out the remembered errors, oldest first.
    pub fn recent(&self) -> Vec<ErrorRecord> {
        self.ring
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// The most recent error message, if any.
    pub fn last_message(&self) -> Option<String> {
        self.ring
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .back()
            .map(|record| record.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_stats_track_bounds() {
        let stats = EventTypeStats::default();
        stats.record(10);
        stats.record(4);
        stats.record(7);
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.total_bytes, 21);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.min_size, Some(4));
        assert_eq!(snap.max_size, Some(10));
    }

    #[test]
    fn registry_separates_types() {
        let registry = EventStatsRegistry::new();
        registry.record("a", 5);
        registry.record("b", 9);
        registry.record_error("a");

        let mut snapshot = registry.snapshot();
        snapshot.sort_by(|(x, _), (y, _)| x.cmp(y));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].1.error_count, 1);
        assert_eq!(snapshot[1].1.total_bytes, 9);
    }

    #[test]
    fn throughput_converges_toward_rate() {
        let tracker = ThroughputTracker::new(0.5);
        std::thread::sleep(std::time::Duration::from_millis(20));
        tracker.tick(100, 1000);
        let first = tracker.rates();
        assert!(first.events_per_sec > 0.0);
        std::thread::sleep(std::time::Duration::from_millis(20));
        tracker.tick(100, 1000);
        let second = tracker.rates();
        assert!(second.events_per_sec < first.events_per_sec);
    }

    #[test]
    fn error_history_is_bounded() {
        let history = ErrorHistory::new(2);
        history.push(&Error::Cancelled);
        history.push(&Error::Closed);
        history.push(&Error::NotStarted);
        let recent = history.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, ErrorKind::Lifecycle);
        assert_eq!(history.last_message().unwrap(), "engine not started");
    }
}
