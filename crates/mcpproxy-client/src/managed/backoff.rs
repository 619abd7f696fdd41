//! Exponential backoff with a cap, per spec §4.2: `1s, 2s, 4s, ..., capped
//! at 5 min`. A manual restart resets the counter.

use std::time::Duration;

const BASE: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Default)]
pub struct BackoffPolicy {
    attempt: u32,
}

impl BackoffPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay before the next retry, and bumps the internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20); // avoid overflow; CAP stops growth long before this
        let scaled = BASE.saturating_mul(1u32.checked_shl(shift).unwrap_or(u32::MAX));
        scaled.min(CAP)
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
    fn doubles_each_attempt_up_to_the_cap() {
        let mut backoff = BackoffPolicy::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn caps_at_five_minutes() {
        let mut backoff = BackoffPolicy::new();
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(5 * 60));
    }

    #[test]
    fn reset_returns_to_the_first_delay() {
        let mut backoff = BackoffPolicy::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
