//! Resubscribe backoff.
//!
//! The delay after `n` consecutive failures (0-indexed) is
//! `first × factor^n`, capped at `max`. A success resets the attempt count.

use std::time::Duration;

pub const RESUBSCRIBE_FIRST_DELAY: Duration = Duration::from_millis(100);
pub const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);
pub const RESUBSCRIBE_FACTOR: u32 = 2;

#[derive(Debug, Clone)]
pub struct Backoff {
    first: Duration,
    max: Duration,
    factor: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(RESUBSCRIBE_FIRST_DELAY, RESUBSCRIBE_MAX_DELAY, RESUBSCRIBE_FACTOR)
    }
}

impl Backoff {
    pub fn new(first: Duration, max: Duration, factor: u32) -> Self {
        Self {
            first,
            max,
            factor,
            attempt: 0,
        }
    }

    /// Delay for the given number of previous consecutive failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.checked_pow(attempt);
        match multiplier.and_then(|m| self.first.checked_mul(m)) {
            Some(delay) => delay.min(self.max),
            None => self.max,
        }
    }

    /// Returns the delay to sleep after a failure and advances the attempt
    /// count.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.next_delay(), Duration::from_millis(800));
        assert_eq!(backoff.attempt(), 4);
    }

    #[test]
    fn test_capped_at_max() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(8), Duration::from_millis(25_600));
        assert_eq!(backoff.delay_for(9), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(40), Duration::from_secs(30));
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_matches_closed_form() {
        let backoff = Backoff::default();
        for n in 0..20u32 {
            let expected = Duration::from_millis(100)
                .checked_mul(2u32.saturating_pow(n))
                .unwrap_or(Duration::MAX)
                .min(Duration::from_secs(30));
            assert_eq!(backoff.delay_for(n), expected, "attempt {}", n);
        }
    }

    #[test]
    fn test_reset_after_success() {
        let mut backoff = Backoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
