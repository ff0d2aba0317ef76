//! Exponential reconnect backoff.

use std::time::Duration;

/// Reconnect delay schedule for one endpoint.
///
/// Delays grow as `min(base * 2^attempt, cap)` and never shrink across
/// consecutive failures. After `max_attempts` consecutive failures the
/// endpoint gets one extended cool-down equal to `cap`, after which
/// the counter resets for a single fresh retry.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next attempt, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempt >= self.max_attempts {
            // Extended cool-down, then a single reset-and-retry.
            self.attempt = 0;
            return self.cap;
        }
        let factor = 1u32 << self.attempt.min(20);
        let delay = self.base.saturating_mul(factor).min(self.cap);
        self.attempt += 1;
        delay
    }

    /// Reset to the base schedule after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_delays_double_from_base() {
        let mut backoff = Backoff::new(secs(2), secs(1800), 8);
        assert_eq!(backoff.next_delay(), secs(2));
        assert_eq!(backoff.next_delay(), secs(4));
        assert_eq!(backoff.next_delay(), secs(8));
        assert_eq!(backoff.attempt(), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = Backoff::new(secs(2), secs(30), 20);
        for _ in 0..10 {
            assert!(backoff.next_delay() <= secs(30));
        }
        assert_eq!(backoff.next_delay(), secs(30));
    }

    #[test]
    fn test_delays_never_decrease_before_cooldown() {
        let mut backoff = Backoff::new(secs(2), secs(1800), 8);
        let mut last = Duration::ZERO;
        for _ in 0..8 {
            let delay = backoff.next_delay();
            assert!(delay >= last);
            last = delay;
        }
    }

    #[test]
    fn test_extended_cooldown_then_reset() {
        let mut backoff = Backoff::new(secs(2), secs(1800), 8);
        for _ in 0..8 {
            backoff.next_delay();
        }
        // Ninth consecutive failure: full-cap cool-down, counter resets.
        assert_eq!(backoff.next_delay(), secs(1800));
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), secs(2));
    }

    #[test]
    fn test_success_resets_to_base() {
        let mut backoff = Backoff::new(secs(2), secs(1800), 8);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), secs(2));
    }
}
