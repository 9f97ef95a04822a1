//! Reconnection backoff with jitter

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Exponential backoff policy
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Interval used for the first retry and after every successful connect
    pub floor: Duration,
    /// Upper bound for the interval
    pub ceiling: Duration,
    /// Growth factor applied after each failed attempt
    pub multiplier: f64,
    /// Maximum extra delay, as a fraction of the interval
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            ceiling: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Backoff state for one tunnel session
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.floor,
            policy,
            failures: 0,
        }
    }

    /// Current base interval, before jitter
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Consecutive failures since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay to wait after a failed attempt. Grows the interval for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let delay = base + self.jitter_for(base);

        self.failures = self.failures.saturating_add(1);
        let grown = Duration::from_secs_f64(base.as_secs_f64() * self.policy.multiplier.max(1.0));
        self.current = grown.min(self.policy.ceiling).max(self.policy.floor);

        debug!(
            delay_ms = delay.as_millis() as u64,
            next_ms = self.current.as_millis() as u64,
            failures = self.failures,
            "Backoff advanced"
        );
        delay
    }

    /// Back to the floor interval (call after a successful connect)
    pub fn reset(&mut self) {
        self.current = self.policy.floor;
        self.failures = 0;
    }

    fn jitter_for(&self, base: Duration) -> Duration {
        if self.policy.jitter <= 0.0 {
            return Duration::ZERO;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.policy.jitter);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            floor: Duration::from_millis(100),
            ceiling: Duration::from_millis(1000),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_exponential_growth_capped() {
        let mut backoff = Backoff::new(policy());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000, 1000]);
        assert_eq!(backoff.current(), Duration::from_millis(1000));
        assert_eq!(backoff.failures(), 7);
    }

    #[test]
    fn test_monotonic_with_jitter() {
        let mut backoff = Backoff::new(BackoffPolicy { jitter: 0.5, ..policy() });
        let mut last = backoff.current();
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            assert!(backoff.current() >= last);
            assert!(backoff.current() <= Duration::from_millis(1000));
            last = backoff.current();
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let mut backoff = Backoff::new(BackoffPolicy { jitter: 0.25, ..policy() });
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn test_reset_to_floor() {
        let mut backoff = Backoff::new(policy());
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_millis(800));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
        assert_eq!(backoff.failures(), 0);
    }
}
