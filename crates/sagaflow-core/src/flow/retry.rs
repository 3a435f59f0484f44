//! Retry policy evaluation for task steps.
//!
//! Stateless: all logic lives in associated functions that take the policy
//! as a parameter. Attempts are 1-based (the first execution is attempt 1).

use std::time::Duration;

use sagaflow_types::flow::RetryPolicy;

/// Stateless retry decisions for task steps.
pub struct RetryHandler;

impl RetryHandler {
    /// Total attempts allowed. No policy means a single attempt.
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        policy.map(|p| p.max_attempts.max(1)).unwrap_or(1)
    }

    /// Whether another attempt follows a failed `attempt`.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Delay after failed `attempt`: `delay_ms * backoff_multiplier^(attempt-1)`,
    /// capped at `max_delay_ms` when set.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = policy.delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
        let capped = match policy.max_delay_ms {
            Some(max) => raw.min(max as f64),
            None => raw,
        };
        // NaN and negatives collapse to zero; `as` saturates on overflow.
        Duration::from_millis(capped.max(0.0).round() as u64)
    }
}
