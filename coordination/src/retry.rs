//! Bounded retry with exponential backoff.
//!
//! The operation reports each failure as [`AttemptError::Retryable`] or
//! [`AttemptError::Fatal`]; the executor inspects the variant instead of
//! relying on error hierarchies.
//!
//! ```text
//! attempt 1 ─✗─ sleep(base)            ─► attempt 2
//! attempt 2 ─✗─ sleep(base·exp)        ─► attempt 3
//! attempt n ─✗─ n == max_attempts      ─► RetryFailure (no sleep)
//! any       ─✗ Fatal                   ─► RetryFailure (immediately)
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_EXPONENTIAL_BASE: f64 = 2.0;

/// Backoff policy. Read-only after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            exponential_base: DEFAULT_EXPONENTIAL_BASE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("max_attempts must be > 0")]
    ZeroAttempts,
    #[error("max_delay ({max:?}) must be >= base_delay ({base:?})")]
    MaxBelowBase { base: Duration, max: Duration },
    #[error("exponential_base must be a finite number >= 1.0, got {0}")]
    InvalidExponentialBase(f64),
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::ZeroAttempts);
        }
        if self.max_delay < self.base_delay {
            return Err(RetryPolicyError::MaxBelowBase {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(RetryPolicyError::InvalidExponentialBase(
                self.exponential_base,
            ));
        }
        Ok(())
    }

    /// Delay after the `attempt`-th failure (1-indexed):
    /// `min(base_delay * exponential_base^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Two-variant failure returned by a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError<E> {
    /// Worth another attempt.
    Retryable(E),
    /// Never worth retrying (local validation, credentials, policy).
    Fatal(E),
}

impl<E> AttemptError<E> {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Retryable(e) | Self::Fatal(e) => e,
        }
    }

    pub fn inner(&self) -> &E {
        match self {
            Self::Retryable(e) | Self::Fatal(e) => e,
        }
    }
}

/// One failed attempt, kept for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-indexed attempt number.
    pub attempt: u32,
    pub error: String,
    /// Time since the first attempt started.
    #[serde(rename = "elapsed_ms", with = "duration_millis")]
    pub elapsed: Duration,
    /// Backoff scheduled after this failure. `None` when the loop stopped here.
    #[serde(rename = "delay_ms", with = "option_duration_millis")]
    pub delay: Option<Duration>,
}

/// Successful value plus the failures that preceded it.
#[derive(Debug, Clone)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: Vec<RetryAttempt>,
}

/// Why the executor gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Fatal,
    Exhausted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Final failure with the full attempt history.
#[derive(Debug, Clone)]
pub struct RetryFailure<E> {
    pub error: E,
    pub reason: StopReason,
    pub attempts: Vec<RetryAttempt>,
}

/// Run `operation` until it succeeds, fails fatally, or `policy.max_attempts`
/// is reached.
///
/// `observer` is called with each [`RetryAttempt`] that will be followed by a
/// backoff sleep, before the sleep starts.
pub async fn run_with_retry<T, E, F, Fut, O>(
    policy: &RetryPolicy,
    mut operation: F,
    mut observer: O,
) -> Result<Retried<T>, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
    E: fmt::Display,
    O: FnMut(&RetryAttempt),
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = Vec::new();
    let mut attempt: u32 = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(Retried { value, attempts }),
            Err(err) => {
                let fatal = err.is_fatal();
                let last = fatal || attempt >= max_attempts;
                let delay = (!last).then(|| policy.delay_for_attempt(attempt));
                let record = RetryAttempt {
                    attempt,
                    error: err.inner().to_string(),
                    elapsed: started.elapsed(),
                    delay,
                };

                if last {
                    let reason = if fatal {
                        StopReason::Fatal
                    } else {
                        StopReason::Exhausted
                    };
                    tracing::debug!(attempt, %reason, error = %record.error, "giving up");
                    attempts.push(record);
                    return Err(RetryFailure {
                        error: err.into_inner(),
                        reason,
                        attempts,
                    });
                }

                observer(&record);
                attempts.push(record);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

pub(crate) mod option_duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.exponential_base, 2.0);
        policy.validate().expect("default policy should be valid");
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn invalid_policies_rejected() {
        assert_eq!(
            fast_policy(0).validate(),
            Err(RetryPolicyError::ZeroAttempts)
        );
        let policy = RetryPolicy {
            exponential_base: 0.5,
            ..RetryPolicy::default()
        };
        assert!(policy.validate().is_err());
        let policy = RetryPolicy {
            max_delay: Duration::from_millis(10),
            ..RetryPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(RetryPolicyError::MaxBelowBase { .. })
        ));
    }

    #[test]
    fn policy_deserializes_delays_as_seconds() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_attempts": 5, "base_delay": 0.5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_first_try_without_history() {
        let result = run_with_retry(
            &RetryPolicy::default(),
            |_| async { Ok::<_, AttemptError<String>>(7) },
            |_| panic!("observer must not run"),
        )
        .await
        .unwrap();
        assert_eq!(result.value, 7);
        assert!(result.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(
            &RetryPolicy::default(),
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AttemptError::Retryable(format!("503 on {attempt}")))
                    } else {
                        Ok("done")
                    }
                }
            },
            |_| {},
        )
        .await
        .unwrap();
        assert_eq!(result.value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts.len(), 2);
        assert_eq!(result.attempts[0].error, "503 on 1");
    }

    #[tokio::test(start_paused = true)]
    async fn observed_delays_follow_backoff() {
        let policy = fast_policy(4);
        let start = Instant::now();
        let mut call_times = Vec::new();
        let mut observed = Vec::new();

        let failure = run_with_retry(
            &policy,
            |_| {
                call_times.push(start.elapsed());
                async { Err::<(), _>(AttemptError::Retryable("429".to_string())) }
            },
            |record| observed.push((record.attempt, record.delay)),
        )
        .await
        .unwrap_err();

        assert_eq!(failure.reason, StopReason::Exhausted);
        assert_eq!(failure.attempts.len(), 4);
        assert_eq!(failure.attempts.last().unwrap().delay, None);
        assert_eq!(
            observed,
            vec![
                (1, Some(Duration::from_secs(1))),
                (2, Some(Duration::from_secs(2))),
                (3, Some(Duration::from_secs(4))),
            ]
        );

        let gaps: Vec<Duration> = call_times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_short_circuits() {
        let calls = AtomicU32::new(0);
        let failure = run_with_retry(
            &fast_policy(5),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(AttemptError::Fatal("unknown phase".to_string())) }
            },
            |_| panic!("fatal errors are not retried"),
        )
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.reason, StopReason::Fatal);
        assert_eq!(failure.error, "unknown phase");
        assert_eq!(failure.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_does_not_sleep() {
        let start = Instant::now();
        let _ = run_with_retry(
            &fast_policy(2),
            |_| async { Err::<(), _>(AttemptError::Retryable("x".to_string())) },
            |_| {},
        )
        .await;
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn attempt_record_serializes_millis() {
        let record = RetryAttempt {
            attempt: 2,
            error: "HTTP 503".into(),
            elapsed: Duration::from_millis(1500),
            delay: Some(Duration::from_secs(2)),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["elapsed_ms"], 1500);
        assert_eq!(json["delay_ms"], 2000);
    }
}
