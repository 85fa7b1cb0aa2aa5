//! Bounded retry for transient storage failures

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::StoreError;

/// Exponential backoff settings for storage transactions
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// Only [`StoreError::is_transient`] failures are retried. Each attempt is
    /// a complete transaction, so retrying never double-applies a write.
    pub async fn run<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        let mut delay = self.base_delay;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!(
                        op = op_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Transient storage failure, retrying..."
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_delay);
                }
                Err(e) => {
                    if e.is_transient() {
                        error!(op = op_name, attempt, error = %e, "Storage failure after max attempts");
                    }
                    return Err(e);
                }
            }
        }
    }
}
