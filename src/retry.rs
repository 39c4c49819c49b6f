//! Bounded retry with a fixed backoff.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::TransferError;

/// Retry policy: a fixed number of attempts separated by a fixed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: crate::constants::CHUNK_RETRY_ATTEMPTS,
            backoff: crate::constants::CHUNK_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The last error is returned.
    ///
    /// # Errors
    ///
    /// Returns the final error from `op`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, TransferError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(what, attempt, error = %e, "Attempt failed, retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
