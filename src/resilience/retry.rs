// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Used in two places:
//! - opening the local store, where [`retry`] loops in-process
//! - scheduling resubmission of failed actions, where [`RetryConfig::delay_for`]
//!   computes when an action becomes eligible again
//!
//! # Example
//!
//! ```
//! use offline_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let backoff = RetryConfig {
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(1),
//!     factor: 2.0,
//!     max_retries: Some(5),
//! };
//! assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
//! assert_eq!(backoff.delay_for(3), Duration::from_millis(800));
//! assert_eq!(backoff.delay_for(10), Duration::from_secs(1));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Attempts before giving up (None = never give up)
    pub max_retries: Option<usize>,
}

impl RetryConfig {
    /// Fast-fail retry for opening the local store.
    /// Attempts 5 times with exponential backoff, failing after ~3 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    /// Delay after `attempts` prior failures: `min(initial * factor^attempts, max)`.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.factor.powi(exponent);
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.max(0.0) as u64)
        }
    }
}

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
    let mut attempts: u32 = 0;

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

                if let Some(max) = config.max_retries {
                    if attempts as usize >= max {
                        return Err(err);
                    }
                }

                let delay = config.delay_for(attempts - 1);
                warn!(
                    "Operation '{}' failed (attempt {}): {}. Retrying in {:?}...",
                    operation_name, attempts, err, delay
                );
                sleep(delay).await;
            }
        }
    }
}
