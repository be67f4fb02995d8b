//! Backoff between failed attempts.

use courier_config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with a cap and random jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0); the delay varies by up to half of this fraction either way.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter factor.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.delay_with(retry, &mut rand::thread_rng())
    }

    /// Delay before retry number `retry`, drawing jitter from `rng`.
    pub fn delay_with<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exp = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(exp);
        let capped = if base.is_finite() {
            base.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };

        let jittered = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            capped - range / 2.0 + rng.gen_range(0.0..=range)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay_ms: 1000,
            max_delay_ms: 3_600_000,
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = policy();

        // 1s, 2s, 4s
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = policy().with_max_delay(Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = policy().with_jitter(0.5);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..1000 {
            let delay = policy.delay_with(2, &mut rng);
            assert!(delay >= Duration::from_millis(1500), "{delay:?}");
            assert!(delay <= Duration::from_millis(2500), "{delay:?}");
        }
    }

    #[test]
    fn test_zero_retry_has_no_delay() {
        assert_eq!(policy().delay_for_retry(0), Duration::ZERO);
    }

    #[test]
    fn test_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.initial_delay_ms, 1000);
        assert!((policy.multiplier - 2.0).abs() < f64::EPSILON);
    }
}
