//! Bounded retry with exponential backoff for gateway calls

use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use crate::{Error, Result};

/// How often and how patiently to retry a gateway call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    /// Upper bound for the doubled delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. Exhaustion yields [`Error::ConnectivityExhausted`].
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        let mut delay = self.initial_delay;

        loop {
            attempts += 1;

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempts >= max_attempts {
                        error!("{} failed after {} attempts: {}", label, attempts, e);
                        return Err(Error::ConnectivityExhausted {
                            attempts,
                            message: e.to_string(),
                        });
                    }

                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        label, attempts, max_attempts, e, delay
                    );

                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
            }
        }
    }
}
