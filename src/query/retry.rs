//! Retry/backoff policy for [`super::QueryCache::fetch_query`] (spec
//! §4.9): `delay = min(initial_delay * multiplier^(attempt-1), max_delay)`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::CoreError;

type ShouldRetryFn = Arc<dyn Fn(u32, &CoreError) -> bool + Send + Sync>;

/// Governs how many times, and after how long, a failed fetch is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Option<Duration>,
    /// Overrides the default "retry until `max_attempts`" decision; the
    /// attempt count passed is 1-based and counts the failure just seen.
    pub should_retry: Option<ShouldRetryFn>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: None,
            should_retry: None,
        }
    }
}

impl RetryPolicy {
    /// Never retries; the first failure is reported immediately.
    pub fn none() -> Self {
        RetryPolicy { max_attempts: 1, ..RetryPolicy::default() }
    }

    pub fn should_retry(&self, attempt: u32, error: &CoreError) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match &self.should_retry {
            Some(f) => f(attempt, error),
            None => true,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
        let scaled = self.initial_delay.as_secs_f64() * factor.max(0.0);
        let mut delay = Duration::from_secs_f64(scaled.max(0.0));
        if let Some(max) = self.max_delay {
            if delay > max {
                delay = max;
            }
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_geometrically_and_caps_at_max() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Some(Duration::from_millis(350)),
            should_retry: None,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(4), Duration::from_millis(350));
    }

    #[test]
    fn should_retry_stops_at_max_attempts() {
        let policy = RetryPolicy::default();
        let err = CoreError::Failed("x".into());
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(2, &err));
        assert!(!policy.should_retry(3, &err));
    }

    #[test]
    fn custom_predicate_can_stop_early() {
        let policy = RetryPolicy {
            should_retry: Some(Arc::new(|attempt, _| attempt < 1)),
            ..RetryPolicy::default()
        };
        let err = CoreError::Failed("x".into());
        assert!(!policy.should_retry(1, &err));
    }
}
