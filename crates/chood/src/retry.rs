//! Bounded exponential-backoff retry.
//!
//! Every error is transient to this primitive; classification is the
//! caller's job. No jitter. Cancellation during a backoff wait returns
//! promptly with the cancellation as the last error.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Retry parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// Successful outcome carrying the number of attempts used.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Failed outcome after exhaustion or cancellation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("all {attempts} attempts failed: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
        }
    }
}

/// Call `op` until it succeeds or the policy is exhausted.
pub async fn retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    policy: &RetryPolicy,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = policy.initial_backoff;
    let mut last_err: Option<E> = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: attempt - 1,
            });
        }

        match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) => last_err = Some(e),
        }

        if attempt < policy.max_attempts {
            let wait = backoff.min(policy.max_backoff);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                () = tokio::time::sleep(wait) => {}
            }
            backoff = backoff.saturating_mul(policy.multiplier);
        }
    }

    match last_err {
        Some(last) => Err(RetryError::Exhausted {
            attempts: policy.max_attempts.max(1),
            last,
        }),
        // Unreachable with max_attempts >= 1; kept for totality.
        None => Err(RetryError::Cancelled { attempts: 0 }),
    }
}
