//! Retry delay growth for failed flushes.

use std::time::Duration;

/// Delay before the next automatic flush after `attempt` consecutive
/// failures: `first * factor^attempt`, never above `max`.
///
/// Built from [`BackoffConfig::policy`](crate::config::BackoffConfig::policy),
/// which already clamps `first` to `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl BackoffPolicy {
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.first.as_secs_f64() * self.factor.powi(exponent);
        // overflow, infinity and NaN all saturate at the cap
        Duration::try_from_secs_f64(scaled).map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    #[test]
    fn default_config_doubles_from_one_second_up_to_five_minutes() {
        let policy = BackoffConfig::default().policy();
        let delays: Vec<u64> = (0..10).map(|n| policy.next(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 300]);
    }

    #[test]
    fn long_failure_streaks_stay_at_the_cap() {
        let policy = BackoffConfig {
            first_ms: 250,
            max_ms: 60_000,
            factor: 3.0,
        }
        .policy();
        assert_eq!(policy.next(1_000), Duration::from_secs(60));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn shrinking_factor_never_goes_negative() {
        let policy = BackoffConfig {
            first_ms: 800,
            max_ms: 10_000,
            factor: 0.5,
        }
        .policy();
        assert_eq!(policy.next(1), Duration::from_millis(400));
        assert!(policy.next(5_000) <= Duration::from_millis(800));
    }
}
