//! Exponential backoff for retrying pool acquisition.
//!
//! The delay is multiplied after each attempt, capped at `max_delay`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    max_delay: Duration,
    multiplier: u32,
    current_delay: Duration,
    /// Number of delays handed out so far.
    pub attempt: u32,
}

impl Backoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_delay,
            multiplier,
            current_delay: initial_delay,
            attempt: 0,
        }
    }

    /// Returns the current delay and advances the state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay;
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay = self
            .current_delay
            .checked_mul(self.multiplier)
            .map_or(self.max_delay, |next| next.min(self.max_delay));
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_is_capped() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 2);
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        // 400 * 2 = 800, capped at 500
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.next_delay(), Duration::from_millis(500));
        assert_eq!(b.attempt, 5);
    }

    #[test]
    fn test_huge_cap_does_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(u64::MAX / 2), Duration::MAX, 4);
        assert_eq!(b.next_delay(), Duration::from_secs(u64::MAX / 2));
        assert_eq!(b.next_delay(), Duration::MAX);
        assert_eq!(b.next_delay(), Duration::MAX);
    }
}
