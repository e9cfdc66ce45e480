//! Bounded retries with exponential backoff.

use crate::config::RouterConfig;
use crate::error::{Result, RoutingError};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn directory(config: &RouterConfig) -> Self {
        Self {
            max_retries: config.directory_retry_count,
            initial_backoff: config.retry_backoff,
            max_backoff: config.max_retry_backoff,
        }
    }

    pub fn message(config: &RouterConfig) -> Self {
        Self {
            max_retries: config.message_retry_count,
            ..Self::directory(config)
        }
    }
}

fn is_retryable(err: &RoutingError) -> bool {
    !matches!(
        err,
        RoutingError::QueueClosed | RoutingError::MissingKeyMaterial | RoutingError::InvalidConfig(_)
    )
}

/// Runs `operation` until it succeeds or `1 + max_retries` attempts have failed.
pub async fn attempt<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_backoff;
    let mut remaining = policy.max_retries;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if remaining > 0 && is_retryable(&err) => {
                remaining -= 1;
                debug!("Attempt failed: {}; {} retries left", err, remaining);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(policy.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}
