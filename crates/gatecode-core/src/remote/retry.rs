//! Retry policy for remote writes
//!
//! One policy object shared by every remote write. Each call to
//! [`RetryPolicy::run`] gets a fresh budget; retries of independent writes
//! never compound.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::RemoteResult;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Factor applied to the delay after each retry
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    /// 3 retries, waiting 500ms, 1.5s and 4.5s
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 3,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(self.multiplier.saturating_pow(retry))
    }

    /// Run `op` until it succeeds or the retry budget is spent
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> RemoteResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RemoteResult<T>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if retry < self.max_retries => {
                    let delay = self.delay_for(retry);
                    debug!(
                        "{} failed ({}), retry {}/{} in {:?}",
                        label,
                        e,
                        retry + 1,
                        self.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    warn!("{} failed after {} attempt(s): {}", label, retry + 1, e);
                    return Err(e);
                }
            }
        }
    }
}
