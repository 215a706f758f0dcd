//! Retry with exponential backoff for transient partner failures.
//!
//! Retries happen inside a single breaker execution, so a call that
//! eventually succeeds counts as one success for the breaker.

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use jetlink_core::IntegrationError;

use crate::config::duration_str;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: usize,

    #[serde(with = "duration_str")]
    pub min_delay: Duration,

    #[serde(with = "duration_str")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            min_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries)
    }
}

/// Run `operation`, retrying only errors that [`IntegrationError::is_transient`].
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    service: &str,
    operation: F,
) -> Result<T, IntegrationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IntegrationError>>,
{
    operation
        .retry(policy.backoff())
        .when(|e: &IntegrationError| e.is_transient())
        .notify(|e: &IntegrationError, delay: Duration| {
            tracing::debug!(service = %service, error = %e, delay = ?delay, "Retrying transient failure");
        })
        .await
}
