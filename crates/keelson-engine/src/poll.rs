// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded, cancellable polling shared by every wait site.
//!
//! Claim resize, pod termination, copy-job completion and ingress-router
//! readiness all converge through [`wait_for`]. Each probe reports an explicit
//! [`WaitState`]; the loop never runs past its attempt budget.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

/// Observed state of something being waited on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitState<T> {
    /// Nothing has started converging yet.
    Pending,
    /// Converging; the string describes the last observation.
    InProgress(String),
    /// Converged.
    Succeeded(T),
    /// Terminal failure reported by the observed resource.
    Failed(String),
    /// The attempt budget ran out before convergence.
    TimedOut,
}

impl<T> WaitState<T> {
    fn describe(&self) -> String {
        match self {
            WaitState::Pending => "pending".to_string(),
            WaitState::InProgress(detail) => format!("in progress ({detail})"),
            WaitState::Succeeded(_) => "succeeded".to_string(),
            WaitState::Failed(reason) => format!("failed ({reason})"),
            WaitState::TimedOut => "timed out".to_string(),
        }
    }
}

/// Interval and attempt budget for one wait site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second probe.
    pub interval: Duration,
    /// Maximum number of probes.
    pub max_attempts: u32,
    /// Multiplier applied to the interval after each probe (1.0 = fixed).
    pub backoff: f64,
    /// Upper bound for the grown interval.
    pub max_interval: Duration,
}

impl PollPolicy {
    /// Fixed-interval policy.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// Exponential backoff capped at `max_interval`.
    pub fn backoff(interval: Duration, max_attempts: u32, factor: f64, max_interval: Duration) -> Self {
        Self {
            interval,
            max_attempts,
            backoff: factor.max(1.0),
            max_interval,
        }
    }

    /// Sum of all sleeps the policy can perform.
    pub fn total_budget(&self) -> Duration {
        let mut total = Duration::ZERO;
        let mut delay = self.interval;
        for _ in 0..self.max_attempts {
            total += delay;
            delay = self.next_delay(delay);
        }
        total
    }

    fn next_delay(&self, current: Duration) -> Duration {
        if self.backoff <= 1.0 {
            return current;
        }
        current.mul_f64(self.backoff).min(self.max_interval)
    }
}

impl fmt::Display for PollPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempts every {}ms",
            self.max_attempts,
            self.interval.as_millis()
        )
    }
}

/// Probe `check` until it reports [`WaitState::Succeeded`].
///
/// Returns [`Error::ConvergenceTimeout`] with the last observed state when the
/// budget is exhausted, [`Error::External`] when the probe reports a failure
/// and [`Error::Cancelled`] as soon as `cancel` fires.
pub async fn wait_for<T, F, Fut>(
    operation: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<WaitState<T>>>,
{
    let mut delay = policy.interval;
    let mut last = String::from("pending");

    for attempt in 1..=policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(operation.to_string()));
        }

        let state = check().await?;
        match state {
            WaitState::Succeeded(value) => {
                debug!(operation, attempt, "Wait converged");
                return Ok(value);
            }
            WaitState::Failed(reason) => {
                return Err(Error::External(format!("{operation} failed: {reason}")));
            }
            WaitState::TimedOut => break,
            other => {
                last = other.describe();
                debug!(operation, attempt, state = %last, "Still waiting");
            }
        }

        if attempt == policy.max_attempts {
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(operation.to_string()));
            }

            _ = tokio::time::sleep(delay) => {}
        }
        delay = policy.next_delay(delay);
    }

    Err(Error::ConvergenceTimeout {
        operation: operation.to_string(),
        last_state: last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(1), attempts)
    }

    #[tokio::test]
    async fn test_wait_succeeds_after_progress() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = wait_for("resize", &quick(5), &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                Ok(if n < 2 {
                    WaitState::InProgress(format!("capacity {n}"))
                } else {
                    WaitState::Succeeded(42)
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wait_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = wait_for::<(), _, _>("resize", &quick(4), &CancellationToken::new(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(WaitState::InProgress("100Mi".to_string()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            Error::ConvergenceTimeout { operation, last_state } => {
                assert_eq!(operation, "resize");
                assert!(last_state.contains("100Mi"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_wait_failure_is_external() {
        let err = wait_for::<(), _, _>("copy job", &quick(3), &CancellationToken::new(), || async {
            Ok(WaitState::Failed("job disappeared".to_string()))
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::External(msg) if msg.contains("job disappeared")));
    }

    #[tokio::test]
    async fn test_wait_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = wait_for::<(), _, _>("pods", &quick(3), &cancel, || async {
            Ok(WaitState::Pending)
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy::backoff(Duration::from_secs(1), 4, 2.0, Duration::from_secs(3));
        // 1 + 2 + 3 + 3
        assert_eq!(policy.total_budget(), Duration::from_secs(9));
    }
}
