//! Capped exponential backoff with jitter for hub-facing retry loops.

use std::time::Duration;

use rand::Rng;

/// Retry pacing: doubles from `base` to `cap`, with ±20% jitter so a fleet
/// of sites does not synchronize its retries.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// Conventional hub-call pacing: 1 s base, 60 s cap.
    #[must_use]
    pub fn for_hub_calls() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    /// Construct with explicit bounds.
    #[must_use]
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    /// The next delay, advancing the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        jitter(delay)
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

fn jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let factor = rng.random_range(0.8..=1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(4));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        let third = backoff.next_delay();
        let fourth = backoff.next_delay();

        assert!(first >= Duration::from_millis(800) && first <= Duration::from_millis(1200));
        assert!(second >= Duration::from_millis(1600) && second <= Duration::from_millis(2400));
        assert!(third >= Duration::from_millis(3200) && third <= Duration::from_millis(4800));
        // Capped: stays within the jittered cap band.
        assert!(fourth <= Duration::from_millis(4800));
    }

    #[test]
    fn reset_returns_to_the_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(1200));
    }
}
