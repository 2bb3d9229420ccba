//! Observability capability surface.
//!
//! The engine reports counters, gauges, histograms, and spans through the
//! one-way [`ObservabilityHooks`] trait; implementations live outside the
//! crate. Hooks receive plain values, never a handle back into the engine.
//! [`NoopHooks`] is the default; [`InMemoryHooks`] is a trivial aggregating
//! implementation suitable for tests and single-process deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Identifier returned by `span_start` and redeemed by `span_end`.
pub type SpanId = u64;

/// One-way sink for engine telemetry.
///
/// All methods default to no-ops so implementations only override what they
/// record. Implementations must be cheap and non-blocking; they are called
/// on the per-event path.
pub trait ObservabilityHooks: Send + Sync {
    /// Add `delta` to the named counter.
    fn counter_inc(&self, _name: &str, _delta: u64) {}

    /// Set the named gauge to an absolute value.
    fn gauge_set(&self, _name: &str, _value: f64) {}

    /// Record one observation in the named histogram.
    fn histogram_observe(&self, _name: &str, _value: f64) {}

    /// Open a span; the returned id is passed back to [`span_end`].
    ///
    /// [`span_end`]: ObservabilityHooks::span_end
    fn span_start(&self, _name: &str) -> SpanId {
        0
    }

    /// Close a span opened by `span_start`.
    fn span_end(&self, _id: SpanId) {}
}

/// Hooks that discard everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ObservabilityHooks for NoopHooks {}

/// Aggregated view of one histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSummary {
    /// Number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
    /// Largest observation seen.
    pub max: f64,
}

/// In-memory hooks implementation.
///
/// Counters and gauges live in sharded maps; span durations are folded into
/// a histogram named after the span. Useful in tests and as the default
/// collector when no external metrics stack is wired up.
#[derive(Default)]
pub struct InMemoryHooks {
    counters: DashMap<String, u64>,
    gauges: DashMap<String, f64>,
    histograms: DashMap<String, HistogramSummary>,
    spans: DashMap<SpanId, (String, Instant)>,
    next_span: AtomicU64,
}

impl InMemoryHooks {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a counter, zero when never incremented.
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).map(|v| *v).unwrap_or(0)
    }

    /// Read a gauge, if it has been set.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).map(|v| *v)
    }

    /// Read a histogram summary, if any observation was recorded.
    pub fn histogram(&self, name: &str) -> Option<HistogramSummary> {
        self.histograms.get(name).map(|v| *v)
    }
}

impl ObservabilityHooks for InMemoryHooks {
    fn counter_inc(&self, name: &str, delta: u64) {
        *self.counters.entry(name.to_owned()).or_insert(0) += delta;
    }

    fn gauge_set(&self, name: &str, value: f64) {
        self.gauges.insert(name.to_owned(), value);
    }

    fn histogram_observe(&self, name: &str, value: f64) {
        let mut entry = self
            .histograms
            .entry(name.to_owned())
            .or_insert(HistogramSummary {
                count: 0,
                sum: 0.0,
                max: f64::MIN,
            });
        entry.count += 1;
        entry.sum += value;
        entry.max = entry.max.max(value);
    }

    fn span_start(&self, name: &str) -> SpanId {
        let id = self.next_span.fetch_add(1, Ordering::Relaxed) + 1;
        self.spans.insert(id, (name.to_owned(), Instant::now()));
        id
    }

    fn span_end(&self, id: SpanId) {
        if let Some((_, (name, started))) = self.spans.remove(&id) {
            let micros = started.elapsed().as_micros() as f64;
            self.histogram_observe(&format!("span.{name}.us"), micros);
        }
    }
}

/// Shared handle type the engine and connection manager carry.
pub type Hooks = Arc<dyn ObservabilityHooks>;

/// Point-in-time liveness report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    /// Whether the component considers itself operational.
    pub healthy: bool,
    /// The most recent error, if any.
    pub last_error: Option<String>,
    /// Last time the component made observable progress.
    pub last_activity: Option<DateTime<Utc>>,
}

impl HealthProbe {
    /// A healthy probe with no history.
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            last_error: None,
            last_activity: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let hooks = InMemoryHooks::new();
        hooks.counter_inc("events", 2);
        hooks.counter_inc("events", 3);
        assert_eq!(hooks.counter("events"), 5);
        assert_eq!(hooks.counter("missing"), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let hooks = InMemoryHooks::new();
        hooks.gauge_set("depth", 4.0);
        hooks.gauge_set("depth", 2.0);
        assert_eq!(hooks.gauge("depth"), Some(2.0));
    }

    #[test]
    fn spans_record_their_duration() {
        let hooks = InMemoryHooks::new();
        let span = hooks.span_start("encode");
        hooks.span_end(span);
        let summary = hooks.histogram("span.encode.us").unwrap();
        assert_eq!(summary.count, 1);
    }

    #[test]
    fn noop_hooks_do_nothing() {
        let hooks = NoopHooks;
        hooks.counter_inc("x", 1);
        assert_eq!(hooks.span_start("y"), 0);
        hooks.span_end(0);
    }
}
