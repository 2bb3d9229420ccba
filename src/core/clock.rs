//! Injectable time source.
//!
//! Reconnect backoff and heartbeat bookkeeping go through [`Clock`] so tests
//! can substitute a controllable implementation instead of sleeping for
//! real.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Capability trait for reading the clock and sleeping.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Suspend the calling task for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// The default clock, backed by the system time and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
