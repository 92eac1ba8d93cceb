//! Rill Retry
//!
//! Failure classification and backoff for the engine. Every failure is one
//! of three kinds: fatal (no retry), bounded-retryable (retry up to the
//! attempt limit), or infinitely retryable (quota-class failures such as
//! remote rate limiting, retried forever on the same curve).
//!
//! Retry loops are cancellable: cancellation ends the current sleep and no
//! further attempt begins.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The fixed failure taxonomy. Classification is pluggable; the kinds are
/// not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
  /// Do not retry.
  Fatal,
  /// Retry up to the policy's attempt limit.
  Bounded,
  /// Retry forever. Reserved for quota-class failures.
  Infinite,
}

/// Exponential backoff curve.
#[derive(Debug, Clone, Copy)]
pub struct BackoffCurve {
  pub initial: Duration,
  pub max: Duration,
  pub multiplier: f64,
}

impl Default for BackoffCurve {
  fn default() -> Self {
    Self {
      initial: Duration::from_secs(5),
      max: Duration::from_secs(10),
      multiplier: 1.1,
    }
  }
}

impl BackoffCurve {
  /// The poll-loop default: wider intervals, no upper attempt bound.
  pub fn polling() -> Self {
    Self {
      initial: Duration::from_secs(20),
      max: Duration::from_secs(600),
      multiplier: 1.1,
    }
  }

  /// Interval for the given zero-based backoff step.
  pub fn interval(&self, step: u32) -> Duration {
    let scaled = self.initial.as_secs_f64() * self.multiplier.powi(step as i32);
    Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
  }
}

/// Retry policy: a curve plus the bounded attempt limit.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  pub curve: BackoffCurve,
  /// Attempt limit for [`FailureClass::Bounded`] failures.
  pub max_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      curve: BackoffCurve::default(),
      max_attempts: 5,
    }
  }
}

/// Why a retry loop stopped without success.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
  /// The failure was fatal; no retry was attempted.
  #[error("fatal failure")]
  Fatal(#[source] E),

  /// Bounded attempts were exhausted; carries the last failure.
  #[error("retries exhausted after {attempts} attempts")]
  Exhausted {
    attempts: u32,
    #[source]
    last: E,
  },

  /// The loop was cancelled during a sleep or between attempts.
  #[error("retry loop cancelled")]
  Cancelled,
}

/// Sleep that ends early on cancellation. Returns false when cancelled.
pub async fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
  tokio::select! {
    _ = cancel.cancelled() => false,
    _ = tokio::time::sleep(duration) => true,
  }
}

/// Drive `op` under the policy, classifying each failure with `classify`.
///
/// Fatal failures return immediately; bounded failures retry up to
/// `max_attempts`; infinite failures retry forever on the same curve. The
/// loop observes `cancel` at every sleep and before every attempt.
pub async fn retry<T, E, F, Fut, C>(
  policy: &RetryPolicy,
  cancel: &CancellationToken,
  classify: C,
  mut op: F,
) -> Result<T, RetryError<E>>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, E>>,
  C: Fn(&E) -> FailureClass,
  E: std::fmt::Display,
{
  let mut attempt: u32 = 0;
  loop {
    if cancel.is_cancelled() {
      return Err(RetryError::Cancelled);
    }

    attempt += 1;
    match op().await {
      Ok(value) => return Ok(value),
      Err(error) => match classify(&error) {
        FailureClass::Fatal => return Err(RetryError::Fatal(error)),
        FailureClass::Bounded => {
          if attempt >= policy.max_attempts {
            warn!(attempt, error = %error, "retries exhausted");
            return Err(RetryError::Exhausted {
              attempts: attempt,
              last: error,
            });
          }
          let interval = policy.curve.interval(attempt - 1);
          debug!(attempt, interval_ms = interval.as_millis() as u64, error = %error, "retrying after failure");
          if !cancellable_sleep(interval, cancel).await {
            return Err(RetryError::Cancelled);
          }
        }
        FailureClass::Infinite => {
          let interval = policy.curve.interval(attempt - 1);
          debug!(attempt, interval_ms = interval.as_millis() as u64, error = %error, "retrying quota-class failure");
          if !cancellable_sleep(interval, cancel).await {
            return Err(RetryError::Cancelled);
          }
        }
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      curve: BackoffCurve {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(2),
        multiplier: 1.1,
      },
      max_attempts,
    }
  }

  #[test]
  fn test_curve_caps_at_max() {
    let curve = BackoffCurve::default();
    assert_eq!(curve.interval(0), Duration::from_secs(5));
    assert!(curve.interval(1) > curve.interval(0));
    assert!(curve.interval(100) <= Duration::from_secs(10));
  }

  #[tokio::test]
  async fn test_fatal_stops_immediately() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let result: Result<(), _> = retry(
      &fast_policy(5),
      &CancellationToken::new(),
      |_: &String| FailureClass::Fatal,
      move || {
        let counted = counted.clone();
        async move {
          counted.fetch_add(1, Ordering::SeqCst);
          Err("boom".to_string())
        }
      },
    )
    .await;
    assert!(matches!(result, Err(RetryError::Fatal(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_bounded_exhausts_after_max_attempts() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let result: Result<(), _> = retry(
      &fast_policy(3),
      &CancellationToken::new(),
      |_: &String| FailureClass::Bounded,
      move || {
        let counted = counted.clone();
        async move {
          counted.fetch_add(1, Ordering::SeqCst);
          Err("transient".to_string())
        }
      },
    )
    .await;
    assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_succeeds_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = calls.clone();
    let result = retry(
      &fast_policy(5),
      &CancellationToken::new(),
      |_: &String| FailureClass::Bounded,
      move || {
        let counted = counted.clone();
        async move {
          if counted.fetch_add(1, Ordering::SeqCst) < 2 {
            Err("transient".to_string())
          } else {
            Ok(42)
          }
        }
      },
    )
    .await;
    assert_eq!(result.unwrap(), 42);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_cancellation_ends_sleep_and_stops() {
    let cancel = CancellationToken::new();
    let policy = RetryPolicy {
      curve: BackoffCurve {
        initial: Duration::from_secs(3600),
        max: Duration::from_secs(3600),
        multiplier: 1.0,
      },
      max_attempts: 5,
    };

    let canceller = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      canceller.cancel();
    });

    let started = std::time::Instant::now();
    let result: Result<(), _> = retry(
      &policy,
      &cancel,
      |_: &String| FailureClass::Infinite,
      || async { Err("quota".to_string()) },
    )
    .await;
    assert!(matches!(result, Err(RetryError::Cancelled)));
    // The hour-long sleep must have ended early.
    assert!(started.elapsed() < Duration::from_secs(10));
  }
}
