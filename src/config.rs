// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the engine.
//!
//! # Example
//!
//! ```
//! use offline_sync::EngineConfig;
//!
//! // Minimal config (in-memory store, default retry policy)
//! let config = EngineConfig::default();
//! assert_eq!(config.max_attempts, 5);
//!
//! // Persistent store with a tighter retry budget
//! let config = EngineConfig {
//!     store_path: Some("./offline.db".into()),
//!     max_attempts: 3,
//!     base_delay_ms: 500,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;
use std::time::Duration;

use crate::resilience::retry::RetryConfig;

/// Configuration for the engine.
///
/// All fields have defaults. Set `store_path` for anything that must survive
/// a restart.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// SQLite file for cached content and pending actions (None = in-memory)
    #[serde(default)]
    pub store_path: Option<String>,

    /// Failed submissions before an action moves to `Failed`
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff: `min(base_delay * 2^attempts, max_delay)`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-submission timeout; a timeout counts as a retryable failure
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    /// Pending-action quota (None = unbounded)
    #[serde(default)]
    pub max_pending_actions: Option<u64>,

    /// Store file size quota in bytes (None = unbounded)
    #[serde(default)]
    pub max_store_bytes: Option<u64>,

    /// Start a sync cycle as soon as an action is enqueued while online
    #[serde(default = "default_sync_on_enqueue")]
    pub sync_on_enqueue: bool,

    /// Maintenance tick of the run loop (picks up actions whose backoff elapsed)
    #[serde(default = "default_retry_poll_ms")]
    pub retry_poll_ms: u64,

    /// Connectivity assumed at startup, until the host reports otherwise
    #[serde(default = "default_start_online")]
    pub start_online: bool,
}

fn default_max_attempts() -> u32 { 5 }
fn default_base_delay_ms() -> u64 { 1_000 }
fn default_max_delay_ms() -> u64 { 300_000 } // 5 minutes
fn default_submit_timeout_ms() -> u64 { 30_000 }
fn default_sync_on_enqueue() -> bool { true }
fn default_retry_poll_ms() -> u64 { 1_000 }
fn default_start_online() -> bool { true }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            max_pending_actions: None,
            max_store_bytes: None,
            sync_on_enqueue: default_sync_on_enqueue(),
            retry_poll_ms: default_retry_poll_ms(),
            start_online: default_start_online(),
        }
    }
}

impl EngineConfig {
    /// Backoff policy for action resubmission.
    #[must_use]
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            factor: 2.0,
            max_retries: Some(self.max_attempts as usize),
        }
    }

    #[must_use]
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    #[must_use]
    pub fn retry_poll_interval(&self) -> Duration {
        // A zero interval would make the run loop spin
        Duration::from_millis(self.retry_poll_ms.max(1))
    }
}
