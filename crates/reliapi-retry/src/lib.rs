//! Retry engine with an error-class policy matrix.
//!
//! Each upstream failure is classified as one of `429`, `5xx`, `net`, or
//! `timeout`; the matrix maps the class to a policy (attempt count,
//! backoff shape, base and max delay). Errors that match no class are not
//! retried. An upstream `Retry-After` header, in either integer-seconds or
//! HTTP-date form, overrides the computed backoff up to the policy's
//! `max`.
//!
//! A hard ceiling of [`MAX_TOTAL_ATTEMPTS`] cumulative attempts guards
//! against a misconfigured matrix.

mod backoff;
mod matrix;
pub mod retry_after;

pub use backoff::Backoff;
pub use matrix::{ErrorClass, RetryMatrix, RetryPolicy, UnknownErrorClass};

use std::future::Future;

/// Ceiling on cumulative attempts across all error classes.
pub const MAX_TOTAL_ATTEMPTS: u32 = 10;

/// Implemented by error types the engine can classify.
pub trait RetryableError {
    /// The error class, or `None` when the error must not be retried.
    fn error_class(&self) -> Option<ErrorClass>;

    /// Delay requested by the upstream via `Retry-After`, if any.
    fn retry_after(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Drives an operation through the retry matrix.
#[derive(Debug, Clone, Default)]
pub struct RetryEngine {
    matrix: RetryMatrix,
}

impl RetryEngine {
    pub fn new(matrix: RetryMatrix) -> Self {
        Self { matrix }
    }

    pub fn matrix(&self) -> &RetryMatrix {
        &self.matrix
    }

    /// Runs `op`, retrying per the matrix, and returns the final outcome
    /// together with the number of retries performed.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> (Result<T, E>, u32)
    where
        E: RetryableError,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(value) => return (Ok(value), attempt - 1),
                Err(err) => {
                    let Some(class) = err.error_class() else {
                        return (Err(err), attempt - 1);
                    };
                    let Some(policy) = self.matrix.policy(class) else {
                        return (Err(err), attempt - 1);
                    };
                    if attempt >= policy.attempts || attempt >= MAX_TOTAL_ATTEMPTS {
                        return (Err(err), attempt - 1);
                    }
                    let delay = policy.delay(attempt, err.retry_after());
                    tracing::debug!(
                        class = class.as_str(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying upstream call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
