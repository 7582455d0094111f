//! Sweep Schedule
//!
//! Randomized delays between abandonment sweeps. Each client draws a fresh
//! delay from `[min, max]` after every sweep so that clients sharing a
//! collection do not all evict the same record at the same instant. There is
//! no coordination between clients; convergence is probabilistic.

use std::time::Duration;

use rand::Rng;

/// Bounds for the randomized sweep delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSchedule {
    min: Duration,
    max: Duration,
}

impl SweepSchedule {
    /// Delays drawn from `[min, 2 * min]`.
    #[must_use]
    pub fn new(min: Duration) -> Self {
        Self::with_bounds(min, min.saturating_mul(2))
    }

    /// Delays drawn from `[min, max]`. Bounds given out of order are swapped.
    #[must_use]
    pub fn with_bounds(min: Duration, max: Duration) -> Self {
        if max < min {
            Self { min: max, max: min }
        } else {
            Self { min, max }
        }
    }

    /// Shortest possible delay.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Longest possible delay.
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Draw the delay until the next sweep.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let min_millis = u64::try_from(self.min.as_millis()).unwrap_or(u64::MAX);
        let max_millis = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        if min_millis >= max_millis {
            return self.min;
        }

        let mut rng = rand::rng();
        Duration::from_millis(rng.random_range(min_millis..=max_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_upper_bound_is_double() {
        let schedule = SweepSchedule::new(Duration::from_secs(60));
        assert_eq!(schedule.min(), Duration::from_secs(60));
        assert_eq!(schedule.max(), Duration::from_secs(120));
    }

    #[test]
    fn delays_stay_within_bounds() {
        let schedule = SweepSchedule::new(Duration::from_secs(60));
        for _ in 0..500 {
            let delay = schedule.next_delay();
            assert!(delay >= Duration::from_secs(60), "{delay:?} below minimum");
            assert!(delay <= Duration::from_secs(120), "{delay:?} above maximum");
        }
    }

    #[test]
    fn delays_are_jittered() {
        let schedule = SweepSchedule::new(Duration::from_secs(60));
        let first = schedule.next_delay();
        let varied = (0..100).any(|_| schedule.next_delay() != first);
        assert!(varied, "100 draws all returned {first:?}");
    }

    #[test]
    fn swapped_bounds_are_normalized() {
        let schedule = SweepSchedule::with_bounds(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(schedule.min(), Duration::from_secs(1));
        assert_eq!(schedule.max(), Duration::from_secs(5));
    }

    #[test]
    fn zero_width_schedule_is_fixed() {
        let schedule = SweepSchedule::with_bounds(Duration::from_millis(10), Duration::from_millis(10));
        assert_eq!(schedule.next_delay(), Duration::from_millis(10));
    }
}
