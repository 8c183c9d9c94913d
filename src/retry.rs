//! Bounded retry with exponential backoff for upstream calls

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::debug;

use crate::config::RetryConfig;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether retries are enabled
    pub enabled: bool,
    /// Maximum attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff
    pub initial_backoff: Duration,
    /// Maximum backoff
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f32,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            multiplier: config.multiplier,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff.max(self.initial_backoff))
            .with_factor(self.multiplier.max(1.0))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

/// Execute `f`, retrying errors accepted by `retryable` with backoff.
///
/// At most `policy.max_attempts` calls are made; the last error is returned
/// once they are used up or as soon as a non-retryable error occurs.
pub async fn with_retry<F, Fut, T, E, R>(
    policy: &RetryPolicy,
    operation: &str,
    mut f: F,
    retryable: R,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: FnMut(&E) -> bool,
{
    if !policy.enabled || policy.max_attempts <= 1 {
        return f().await;
    }

    f.retry(policy.backoff())
        .sleep(tokio::time::sleep)
        .when(retryable)
        .notify(|e: &E, delay: Duration| {
            debug!(
                operation = operation,
                delay_ms = delay.as_millis(),
                error = %e,
                "Retrying after backoff"
            );
        })
        .await
}
