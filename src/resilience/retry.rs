//! Retry backoff policy.
//!
//! Delay for attempt k is `min(base * multiplier^(k-1), cap)`, optionally
//! scaled by a uniform random factor in [0.5, 1.0]. The pre-jitter
//! sequence is non-decreasing and capped; jitter only ever shortens a
//! delay.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first. At least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base: Duration,
    /// Exponential growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay, before jitter.
    pub cap: Duration,
    /// Scale delays by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(200),
            multiplier: 2.0,
            cap: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, multiplier: f64, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            multiplier,
            cap,
            jitter: true,
        }
    }

    /// Pre-jitter delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let scaled = self.base.as_millis() as f64 * self.multiplier.powi(exp as i32);

        let capped = if scaled.is_finite() && scaled > 0.0 {
            (scaled as u128).min(self.cap.as_millis())
        } else {
            self.cap.as_millis()
        };

        Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay with jitter applied, ready to sleep on.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let d = self.delay_for(attempt);
        if !self.jitter {
            return d;
        }

        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        Duration::from_millis((d.as_millis() as f64 * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn delays_double_from_base() {
        let p = RetryPolicy::new(5, Duration::from_millis(100), 2.0, Duration::from_secs(10));

        assert_eq!(p.delay_for(1), Duration::from_millis(100));
        assert_eq!(p.delay_for(2), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(400));
        assert_eq!(p.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy::new(10, Duration::from_millis(1_000), 4.0, Duration::from_millis(2_000));

        assert_eq!(p.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(p.delay_for(7), Duration::from_millis(2_000));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let p = RetryPolicy::new(3, Duration::from_millis(1_000), 2.0, Duration::from_secs(10));

        for _ in 0..100 {
            let d = p.jittered_delay_for(1).as_millis();
            assert!(d >= 500, "jittered delay {d}ms below half the base");
            assert!(d <= 1_000, "jittered delay {d}ms above the base");
        }
    }

    #[test]
    fn jitter_disabled_returns_exact_delay() {
        let mut p = RetryPolicy::new(3, Duration::from_millis(300), 2.0, Duration::from_secs(10));
        p.jitter = false;

        assert_eq!(p.jittered_delay_for(2), Duration::from_millis(600));
    }

    proptest! {
        /// Pre-jitter backoff is non-decreasing in the attempt number and
        /// never exceeds the cap.
        #[test]
        fn backoff_sequence_monotone_and_capped(
            base_ms in 1u64..2_000,
            multiplier in 1.0f64..4.0,
            cap_ms in 1u64..60_000,
        ) {
            let p = RetryPolicy::new(
                8,
                Duration::from_millis(base_ms),
                multiplier,
                Duration::from_millis(cap_ms),
            );

            let mut prev = Duration::ZERO;
            for attempt in 1..=8u32 {
                let d = p.delay_for(attempt);
                prop_assert!(d >= prev);
                prop_assert!(d <= Duration::from_millis(cap_ms));
                prev = d;
            }
        }
    }
}
