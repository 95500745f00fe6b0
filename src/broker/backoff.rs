//! Bounded exponential reconnect backoff.

use std::time::Duration;

/// Smallest delay ever returned.
pub const MIN_DELAY: Duration = Duration::from_millis(10);

/// Delay generator: starts at `seed`, doubles on every failure up to
/// `ceiling`, and returns to `seed` after a successful connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    seed: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// A seed below [`MIN_DELAY`] is raised to it, and a ceiling below the
    /// seed is raised to the seed.
    pub fn new(seed: Duration, ceiling: Duration) -> Self {
        let seed = seed.max(MIN_DELAY);
        Self {
            seed,
            ceiling: ceiling.max(seed),
            current: seed,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .checked_mul(2)
            .unwrap_or(self.ceiling)
            .min(self.ceiling);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.seed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10));
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 10, 10]);
    }

    #[test]
    fn test_reset_returns_to_seed() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_ceiling_below_seed() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_seed_still_waits() {
        let mut backoff = Backoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(backoff.next_delay(), MIN_DELAY);
        assert_eq!(backoff.next_delay(), MIN_DELAY);

        let mut backoff = Backoff::new(Duration::ZERO, Duration::from_secs(1));
        let delays: Vec<u64> = (0..3).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, [10, 20, 40]);
    }

    #[test]
    fn test_huge_delays_saturate() {
        let mut backoff = Backoff::new(Duration::MAX / 2 + Duration::from_secs(1), Duration::MAX);
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::MAX);
    }
}
