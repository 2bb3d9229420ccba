//! Reconnect delay schedule.
//!
//! Produces the wait before each reconnect attempt according to the
//! configured policy: exponential growth with a cap and fractional jitter,
//! a fixed interval, or no retries at all. The schedule resets whenever a
//! connection is established.

use std::time::Duration;

use crate::core::config::ReconnectPolicy;

/// Stateful delay generator for one reconnect loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    initial_override: Option<Duration>,
}

impl Backoff {
    /// Create a schedule for the given policy.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            initial_override: None,
        }
    }

    /// Attempts taken since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Replace the base delay, as requested by a peer's `retry:` hint.
    pub fn set_initial_hint(&mut self, delay: Duration) {
        self.initial_override = Some(delay);
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay before the next attempt, or `None` when attempts are
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        match &self.policy {
            ReconnectPolicy::None => None,
            ReconnectPolicy::FixedInterval {
                delay,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| self.attempt >= max) {
                    return None;
                }
                self.attempt += 1;
                Some(self.initial_override.unwrap_or(*delay))
            }
            ReconnectPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                jitter,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| self.attempt >= max) {
                    return None;
                }
                let base = self.initial_override.unwrap_or(*initial_delay);
                let grown = base.as_secs_f64() * multiplier.powi(self.attempt as i32);
                let capped = grown.min(max_delay.as_secs_f64());
                // Jitter in [1 - j, 1 + j] spreads simultaneous reconnects.
                let factor = 1.0 + jitter * (fastrand::f64() * 2.0 - 1.0);
                let jittered = (capped * factor).max(0.0);
                self.attempt += 1;
                Some(Duration::from_secs_f64(jittered))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(max_attempts: Option<u32>) -> ReconnectPolicy {
        ReconnectPolicy::ExponentialBackoff {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2.0,
            jitter: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let mut backoff = Backoff::new(exponential(None));
        let delays: Vec<u64> = (0..5)
            .map(|_| backoff.next_delay().unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn attempts_are_bounded() {
        let mut backoff = Backoff::new(exponential(Some(2)));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
    }

    #[test]
    fn reset_restarts_the_schedule() {
        let mut backoff = Backoff::new(exponential(Some(2)));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = ReconnectPolicy::ExponentialBackoff {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        };
        for _ in 0..50 {
            let mut backoff = Backoff::new(policy.clone());
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(800), "too short: {delay:?}");
            assert!(delay <= Duration::from_millis(1200), "too long: {delay:?}");
        }
    }

    #[test]
    fn retry_hint_overrides_the_base_delay() {
        let mut backoff = Backoff::new(exponential(None));
        backoff.set_initial_hint(Duration::from_millis(50));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(50));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn policy_none_never_retries() {
        let mut backoff = Backoff::new(ReconnectPolicy::None);
        assert!(backoff.next_delay().is_none());
    }
}
