//! Retry policies and the precedence rule that resolves them.

use std::time::Duration;

/// Retry policy of a task, a workflow or a single invocation.
///
/// A policy bounds how many times a failed invocation may be retried and how
/// long the scheduler should wait before the next attempt.
///
/// # Examples
///
/// ```
/// use tsuzuki_core::RetryPolicy;
/// use std::time::Duration;
///
/// // Two retries, dispatched as soon as the scheduler picks the job again
/// let policy = RetryPolicy::attempts(2);
///
/// // Fixed delay: retry 3 times with 1 second between attempts
/// let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
///
/// // Exponential backoff: retry 5 times starting at 100ms
/// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry without delay.
    Immediate {
        /// Maximum number of retry attempts
        max_retries: u32,
    },
    /// Fixed delay between retries.
    Fixed {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Delay between each retry
        delay: Duration,
    },
    /// Exponential backoff with configurable parameters.
    ExponentialBackoff {
        /// Maximum number of retry attempts
        max_retries: u32,
        /// Initial delay before first retry
        initial_delay: Duration,
        /// Maximum delay cap
        max_delay: Duration,
        /// Multiplier for each retry (e.g., 2 doubles the delay)
        multiplier: u32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
///
/// # Examples
///
/// ```
/// use tsuzuki_core::RetryPolicy;
/// use std::time::Duration;
///
/// let result = RetryPolicy::exponential_backoff(
///     3,
///     Duration::from_millis(100),
///     Duration::from_secs(10),
///     0,
/// );
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct RetryPolicyError(pub &'static str);

impl RetryPolicy {
    /// A policy that never retries.
    ///
    /// Declared on a workflow, it fails the whole job on the first task
    /// failure regardless of any task-level policy.
    pub fn none() -> Self {
        RetryPolicy::Immediate { max_retries: 0 }
    }

    /// Retries up to `max_retries` times without delay.
    pub fn attempts(max_retries: u32) -> Self {
        RetryPolicy::Immediate { max_retries }
    }

    /// Creates a fixed retry policy.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsuzuki_core::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
    /// assert_eq!(policy.max_retries(), 3);
    /// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(1)));
    /// ```
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        RetryPolicy::Fixed { max_retries, delay }
    }

    /// Creates an exponential backoff policy with `multiplier=2` and
    /// `max_delay=60s`.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsuzuki_core::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::exponential(5, Duration::from_millis(100));
    ///
    /// // Delays: 100ms, 200ms, 400ms, 800ms, 1600ms
    /// assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(100)));
    /// assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_millis(400)));
    /// ```
    pub fn exponential(max_retries: u32, initial_delay: Duration) -> Self {
        RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    /// Creates an exponential backoff policy with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`RetryPolicyError`] if:
    /// - `multiplier` is 0
    /// - `multiplier` is greater than 10
    /// - `max_delay` is less than `initial_delay`
    pub fn exponential_backoff(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        if multiplier == 0 {
            return Err(RetryPolicyError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(RetryPolicyError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError("max_delay must be >= initial_delay"));
        }
        Ok(RetryPolicy::ExponentialBackoff {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        })
    }

    /// Returns the maximum number of retries for this policy.
    pub fn max_retries(&self) -> u32 {
        match self {
            RetryPolicy::Immediate { max_retries } => *max_retries,
            RetryPolicy::Fixed { max_retries, .. } => *max_retries,
            RetryPolicy::ExponentialBackoff { max_retries, .. } => *max_retries,
        }
    }

    /// Calculates the delay before the given retry attempt (0-indexed).
    ///
    /// Returns `None` for [`RetryPolicy::Immediate`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::Immediate { .. } => None,
            RetryPolicy::Fixed { delay, .. } => Some(*delay),
            RetryPolicy::ExponentialBackoff {
                initial_delay,
                max_delay,
                multiplier,
                ..
            } => {
                let factor = u64::from(*multiplier).saturating_pow(attempt);
                let initial = u64::try_from(initial_delay.as_millis()).unwrap_or(u64::MAX);
                let cap = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
                Some(Duration::from_millis(initial.saturating_mul(factor).min(cap)))
            }
        }
    }
}

/// The retry policy in force for one invocation after precedence is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectiveRetry {
    /// Bounded by the given policy.
    Limited(RetryPolicy),
    /// No declared bound; the scheduler decides when to give up.
    Unbounded,
}

impl EffectiveRetry {
    /// Whether another attempt is allowed after `attempts` failed ones.
    ///
    /// ```
    /// use tsuzuki_core::{EffectiveRetry, RetryPolicy};
    ///
    /// let retry = EffectiveRetry::Limited(RetryPolicy::attempts(2));
    /// assert!(retry.allows_retry_after(1));
    /// assert!(retry.allows_retry_after(2));
    /// assert!(!retry.allows_retry_after(3));
    /// ```
    pub fn allows_retry_after(&self, attempts: u32) -> bool {
        match self {
            EffectiveRetry::Limited(policy) => attempts <= policy.max_retries(),
            EffectiveRetry::Unbounded => true,
        }
    }

    /// Backoff before the retry that follows `attempts` failed attempts.
    pub fn delay_after(&self, attempts: u32) -> Option<Duration> {
        match self {
            EffectiveRetry::Limited(policy) => {
                policy.delay_for_attempt(attempts.saturating_sub(1))
            }
            EffectiveRetry::Unbounded => None,
        }
    }
}

/// Resolves the retry policy of one invocation.
///
/// Precedence:
/// 1. A workflow declaring zero retries overrides everything.
/// 2. The retry override given at the call site.
/// 3. The task definition's own policy, even when larger than the workflow's.
/// 4. The workflow's policy, inherited by tasks that declare none.
/// 5. Unbounded.
///
/// ```
/// use tsuzuki_core::{resolve_retry_policy, EffectiveRetry, RetryPolicy};
///
/// let workflow = RetryPolicy::none();
/// let task = RetryPolicy::attempts(5);
/// assert_eq!(
///     resolve_retry_policy(Some(&workflow), Some(&task), None),
///     EffectiveRetry::Limited(RetryPolicy::none()),
/// );
/// assert_eq!(resolve_retry_policy(None, None, None), EffectiveRetry::Unbounded);
/// ```
pub fn resolve_retry_policy(
    workflow: Option<&RetryPolicy>,
    task: Option<&RetryPolicy>,
    invocation: Option<&RetryPolicy>,
) -> EffectiveRetry {
    if let Some(policy) = workflow.filter(|p| p.max_retries() == 0) {
        return EffectiveRetry::Limited(policy.clone());
    }
    invocation
        .or(task)
        .or(workflow)
        .cloned()
        .map_or(EffectiveRetry::Unbounded, EffectiveRetry::Limited)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_none() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_retries(), 0);
        assert_eq!(policy.delay_for_attempt(0), None);
        assert_eq!(RetryPolicy::default(), policy);
    }

    #[test]
    fn test_retry_policy_fixed() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(1));
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for_attempt(2), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_retry_policy_exponential_is_capped() {
        let policy = RetryPolicy::ExponentialBackoff {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2,
        };
        assert_eq!(
            policy.delay_for_attempt(1),
            Some(Duration::from_millis(200))
        );
        assert_eq!(policy.delay_for_attempt(10), Some(Duration::from_secs(10)));
        // saturates instead of overflowing
        assert_eq!(policy.delay_for_attempt(200), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_retry_policy_exponential_backoff_validation() {
        let ok = RetryPolicy::exponential_backoff(
            3,
            Duration::from_millis(100),
            Duration::from_secs(10),
            2,
        );
        assert!(ok.is_ok());

        let zero = RetryPolicy::exponential_backoff(
            3,
            Duration::from_millis(100),
            Duration::from_secs(10),
            0,
        );
        assert_eq!(zero.unwrap_err().0, "multiplier must be greater than 0");

        let inverted = RetryPolicy::exponential_backoff(
            3,
            Duration::from_secs(10),
            Duration::from_millis(100),
            2,
        );
        assert_eq!(
            inverted.unwrap_err().to_string(),
            "max_delay must be >= initial_delay"
        );
    }

    #[test]
    fn test_workflow_zero_overrides_task_and_invocation() {
        let workflow = RetryPolicy::none();
        let task = RetryPolicy::attempts(3);
        let call = RetryPolicy::attempts(7);
        let resolved = resolve_retry_policy(Some(&workflow), Some(&task), Some(&call));
        assert_eq!(resolved, EffectiveRetry::Limited(RetryPolicy::none()));
        assert!(!resolved.allows_retry_after(1));
    }

    #[test]
    fn test_invocation_override_wins_over_task() {
        let task = RetryPolicy::attempts(3);
        let call = RetryPolicy::attempts(1);
        assert_eq!(
            resolve_retry_policy(Some(&RetryPolicy::attempts(4)), Some(&task), Some(&call)),
            EffectiveRetry::Limited(call)
        );
    }

    #[test]
    fn test_task_policy_larger_than_workflow_is_authoritative() {
        let workflow = RetryPolicy::attempts(1);
        let task = RetryPolicy::attempts(5);
        let resolved = resolve_retry_policy(Some(&workflow), Some(&task), None);
        assert_eq!(resolved, EffectiveRetry::Limited(task));
        assert!(resolved.allows_retry_after(5));
    }

    #[test]
    fn test_task_without_policy_inherits_workflow() {
        let workflow = RetryPolicy::fixed(2, Duration::from_secs(3));
        let resolved = resolve_retry_policy(Some(&workflow), None, None);
        assert_eq!(resolved, EffectiveRetry::Limited(workflow));
        assert_eq!(resolved.delay_after(1), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_nothing_declared_is_unbounded() {
        let resolved = resolve_retry_policy(None, None, None);
        assert_eq!(resolved, EffectiveRetry::Unbounded);
        assert!(resolved.allows_retry_after(u32::MAX));
        assert_eq!(resolved.delay_after(3), None);
    }
}
