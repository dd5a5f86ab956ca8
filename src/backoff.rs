use std::time::Duration;

use rand::{thread_rng, Rng};

use crate::config::RetryPolicy;

/// Lower and upper bound of the multiplicative jitter factor.
pub const JITTER_RANGE: std::ops::Range<f64> = 0.5..1.5;

impl RetryPolicy {
    /// Randomized delay before retrying after failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = thread_rng().gen_range(JITTER_RANGE);
        Duration::from_millis(delay_ms(attempt, self.base_delay_ms, self.max_delay_ms, factor))
    }
}

/// `clamp(floor(base * 2^(attempt-1) * factor), 0, max)`.
///
/// `factor` is the jitter draw; callers outside tests pass a value from
/// [`JITTER_RANGE`]. Huge attempt numbers saturate at `max` instead of overflowing.
pub fn delay_ms(attempt: u32, base_ms: u64, max_ms: u64, factor: f64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = (base_ms as f64 * 2f64.powi(exponent) * factor).floor();
    if raw.is_nan() || raw <= 0.0 {
        0
    } else if raw >= max_ms as f64 {
        max_ms
    } else {
        raw as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn doubles_per_attempt_without_jitter() {
        assert_eq!(delay_ms(1, 500, 8000, 1.0), 500);
        assert_eq!(delay_ms(2, 500, 8000, 1.0), 1000);
        assert_eq!(delay_ms(3, 500, 8000, 1.0), 2000);
        assert_eq!(delay_ms(5, 500, 8000, 1.0), 8000);
        assert_eq!(delay_ms(6, 500, 8000, 1.0), 8000);
    }

    #[test]
    fn jitter_bounds_are_applied() {
        assert_eq!(delay_ms(1, 500, 8000, 0.5), 250);
        assert_eq!(delay_ms(1, 500, 8000, 1.4999), 749);
    }

    #[test]
    fn zero_base_or_cap_gives_zero() {
        assert_eq!(delay_ms(3, 0, 8000, 1.2), 0);
        assert_eq!(delay_ms(3, 500, 0, 1.2), 0);
    }

    #[test]
    fn huge_attempt_saturates() {
        assert_eq!(delay_ms(u32::MAX, 500, 8000, 0.5), 8000);
    }

    #[test]
    fn policy_delay_uses_configured_cap() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 600,
        };
        for attempt in 1..10 {
            assert!(policy.delay_for(attempt) <= Duration::from_millis(600));
        }
    }

    proptest! {
        #[test]
        fn delay_stays_within_cap_and_jitter_ceiling(
            attempt in 1u32..40,
            base in 0u64..10_000,
            max in 0u64..100_000,
            factor in 0.5f64..1.5,
        ) {
            let delay = delay_ms(attempt, base, max, factor);
            prop_assert!(delay <= max);
            let ceiling = base as f64 * 2f64.powi(attempt as i32 - 1) * 1.5;
            prop_assert!(delay as f64 <= ceiling);
        }

        #[test]
        fn delay_is_non_decreasing_in_attempt_for_fixed_jitter(
            attempt in 1u32..30,
            base in 1u64..5_000,
            max in 1u64..1_000_000,
            factor in 0.5f64..1.5,
        ) {
            prop_assert!(delay_ms(attempt, base, max, factor) <= delay_ms(attempt + 1, base, max, factor));
        }

        #[test]
        fn sampled_delay_never_exceeds_cap(attempt in 1u32..20, base in 0u64..2_000, max in 0u64..20_000) {
            let policy = RetryPolicy { max_attempts: 3, base_delay_ms: base, max_delay_ms: max };
            prop_assert!(policy.delay_for(attempt).as_millis() as u64 <= max);
        }
    }
}
