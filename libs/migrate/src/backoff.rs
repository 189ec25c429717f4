//! Exponential backoff for transient failures.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0 for the first retry).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter > 0.0 {
            delay * jitter * rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        };

        // Should increase exponentially (with some jitter variance)
        assert!(policy.delay(0) <= Duration::from_millis(125));
        assert!(policy.delay(1) >= Duration::from_millis(150));
        assert!(policy.delay(1) <= Duration::from_millis(250));
        assert!(policy.delay(2) >= Duration::from_millis(300));
        assert!(policy.delay(2) <= Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_without_jitter_is_exact() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(50));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }
}
