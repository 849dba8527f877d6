//! Attempt and backoff policy for node execution.
//!
//! `retries` counts total attempts. Only timeout, invocation and output
//! schema failures are retried; cancellation never is.

use std::time::Duration;

use agentflow_types::config::BackoffPolicy;
use agentflow_types::flow::RuntimeConfig;
use agentflow_types::run::ErrorKind;

pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt follows attempt number `attempt` (1-based).
    pub fn should_retry(policy: &RuntimeConfig, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < policy.retries
    }

    /// Delay after attempt number `attempt` failed.
    ///
    /// - **Fixed**: always `base`.
    /// - **Exponential**: `base * factor^(attempt - 1)`, capped at `max_ms`.
    pub fn backoff_delay(strategy: &BackoffPolicy, base: Duration, attempt: u32) -> Duration {
        match strategy {
            BackoffPolicy::Fixed => base,
            BackoffPolicy::Exponential { factor, max_ms } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let millis = base.as_millis() as f64 * factor.max(1.0).powi(exponent);
                Duration::from_millis(millis.min(*max_ms as f64) as u64)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(retries: u32) -> RuntimeConfig {
        RuntimeConfig {
            retries,
            ..Default::default()
        }
    }

    #[test]
    fn test_should_retry_within_attempts() {
        let p = policy(3);
        assert!(RetryHandler::should_retry(&p, 1, ErrorKind::Timeout));
        assert!(RetryHandler::should_retry(&p, 2, ErrorKind::Invocation));
        assert!(!RetryHandler::should_retry(&p, 3, ErrorKind::Timeout));
    }

    #[test]
    fn test_single_attempt_never_retries() {
        assert!(!RetryHandler::should_retry(&policy(1), 1, ErrorKind::Invocation));
    }

    #[test]
    fn test_cancellation_not_retried() {
        assert!(!RetryHandler::should_retry(&policy(5), 1, ErrorKind::Cancelled));
    }

    #[test]
    fn test_fixed_backoff() {
        let base = Duration::from_millis(50);
        assert_eq!(RetryHandler::backoff_delay(&BackoffPolicy::Fixed, base, 1), base);
        assert_eq!(RetryHandler::backoff_delay(&BackoffPolicy::Fixed, base, 4), base);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let strategy = BackoffPolicy::Exponential {
            factor: 2.0,
            max_ms: 300,
        };
        let base = Duration::from_millis(100);
        assert_eq!(RetryHandler::backoff_delay(&strategy, base, 1), Duration::from_millis(100));
        assert_eq!(RetryHandler::backoff_delay(&strategy, base, 2), Duration::from_millis(200));
        assert_eq!(RetryHandler::backoff_delay(&strategy, base, 3), Duration::from_millis(300));
        assert_eq!(RetryHandler::backoff_delay(&strategy, base, 30), Duration::from_millis(300));
    }
}
