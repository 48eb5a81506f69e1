// Copyright (c) James Kassemi, SC, US. All rights reserved.
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Constant-interval retry policy for async operations.
///
/// Waits respect the cancellation token; a cancelled wait abandons the
/// retry loop and returns the last error.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// Runs `op` until it succeeds, the attempts run out, or the token is
    /// cancelled mid-wait.
    pub async fn retry_async<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(val) => return Ok(val),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || cancel.is_cancelled() {
                        return Err(err);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(err),
                        _ = sleep(self.interval) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}
