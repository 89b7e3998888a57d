// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use scale_ingest::RetryConfig;
//! use std::time::Duration;
//!
//! // Live subscriptions: 2s, 4s, 8s, 16s, 16s then give up
//! let subscription = RetryConfig::subscription();
//! assert_eq!(subscription.max_retries, 5);
//! assert_eq!(subscription.delay_for_attempt(1), Duration::from_secs(2));
//! assert_eq!(subscription.delay_for_attempt(5), Duration::from_secs(16));
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, 3);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::subscription()`] - Bounded ladder for live channels
/// - [`RetryConfig::query()`] - Quick retry for individual queries
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::subscription()
    }
}

impl RetryConfig {
    /// Bounded retry for live subscriptions.
    /// Five retries at 2s, 4s, 8s, 16s, 16s; exhaustion needs a manual refresh.
    #[must_use]
    pub fn subscription() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            factor: 2.0,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    /// 3 attempts with fast backoff - if it fails, let caller handle it.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based):
    /// `min(initial × factor^(attempt-1), max)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Whether another retry is allowed after `retries_so_far` retries.
    #[must_use]
    pub fn allows_retry(&self, retries_so_far: usize) -> bool {
        retries_so_far < self.max_retries
    }
}

/// Run `operation` until it succeeds or the retry budget is spent.
///
/// `max_retries` counts total attempts here, matching query semantics:
/// `query()` makes at most three calls.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if attempts >= config.max_retries {
                    return Err(err);
                }

                let delay = config.delay_for_attempt(attempts);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_retries, err, delay
                );

                sleep(delay).await;
            }
        }
    }
}
