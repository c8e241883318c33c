// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! The [`SyncEngine`] is the one handle the host application holds. It ties
//! together:
//! - the durable store (SQLite file, or in-memory)
//! - the content cache (read path)
//! - the pending action log (write path)
//! - the sync processor (single-flight drain to the remote service)
//! - the status channel (live pending/failed/syncing snapshots)
//!
//! There is no global state: construct one engine and pass it (usually as an
//! `Arc<SyncEngine>`) to every consumer.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Recovering → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use offline_sync::{EngineConfig, EngineState, RemoteError, RemoteService, SyncEngine};
//! use async_trait::async_trait;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use uuid::Uuid;
//!
//! struct Backend;
//!
//! #[async_trait]
//! impl RemoteService for Backend {
//!     async fn submit(&self, _kind: &str, _payload: &Value, _key: Uuid) -> Result<(), RemoteError> {
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = EngineConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let mut engine = SyncEngine::new(config, rx, Arc::new(Backend));
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await.expect("Start failed");
//! engine.enqueue_action("bookmark.add", json!({"verse": "John 3:16"})).await.unwrap();
//! # }
//! ```

mod types;
mod api;
mod lifecycle;

pub use types::{EngineState, HealthCheck};

use std::sync::Arc;
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use crate::actions::ActionLog;
use crate::config::EngineConfig;
use crate::content::ContentCache;
use crate::error::SyncError;
use crate::remote::RemoteService;
use crate::status::{StatusChannel, Subscription, SyncSnapshot};
use crate::storage::sqlite::SqliteStore;
use crate::sync::SyncProcessor;

/// Offline-first engine handle.
///
/// # Thread Safety
///
/// After [`start()`](Self::start) every method takes `&self`; wrap the engine
/// in an `Arc` to share it between tasks.
pub struct SyncEngine {
    /// Configuration (runtime knobs can be updated via the watch channel)
    /// Uses RwLock for interior mutability so run() can take &self
    pub(super) config: RwLock<EngineConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<EngineConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) remote: Arc<dyn RemoteService>,

    /// Exists from construction so observers can subscribe before start
    pub(super) status: Arc<StatusChannel>,

    /// Direct SQLite handle for checkpoints and size reporting
    pub(super) sqlite: Option<Arc<SqliteStore>>,

    pub(super) content: Option<ContentCache>,
    pub(super) log: Option<Arc<ActionLog>>,
    pub(super) processor: Option<Arc<SyncProcessor>>,
}

impl SyncEngine {
    /// Create a new engine.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to open the store and transition to `Ready`.
    pub fn new(
        config: EngineConfig,
        config_rx: watch::Receiver<EngineConfig>,
        remote: Arc<dyn RemoteService>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            remote,
            status: Arc::new(StatusChannel::new()),
            sqlite: None,
            content: None,
            log: None,
            processor: None,
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is ready to accept requests.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Current sync status.
    #[must_use]
    pub fn sync_status(&self) -> SyncSnapshot {
        self.status.snapshot()
    }

    /// Observe sync status. `listener` is called immediately with the current
    /// snapshot, then on every change until the [`Subscription`] is dropped.
    ///
    /// Listeners run synchronously on the thread that changed the status.
    /// They may call the synchronous engine API (for example
    /// [`set_online`](Self::set_online)) but should not block.
    pub fn subscribe_sync_status<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        self.status.subscribe(listener)
    }

    /// Watch receiver over the same snapshots, for async consumers.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<SyncSnapshot> {
        self.status.receiver()
    }

    /// Perform a health check from cached state plus one log scan.
    pub async fn health_check(&self) -> Result<HealthCheck, SyncError> {
        let state = self.state();
        let counts = self.log()?.counts().await?;
        let store_bytes = self.sqlite.as_ref().and_then(|s| s.file_size_bytes().ok());
        if let Some(bytes) = store_bytes {
            crate::metrics::set_store_bytes(bytes);
        }

        Ok(HealthCheck {
            state,
            online: self.is_online(),
            syncing: self.status.snapshot().is_syncing,
            queued_actions: counts.queued,
            in_flight_actions: counts.in_flight,
            failed_actions: counts.failed,
            corrupt_actions: counts.corrupt,
            store_bytes,
        })
    }

    pub(super) fn content(&self) -> Result<&ContentCache, SyncError> {
        self.content.as_ref().ok_or_else(|| SyncError::NotStarted(self.state()))
    }

    pub(super) fn log(&self) -> Result<&Arc<ActionLog>, SyncError> {
        self.log.as_ref().ok_or_else(|| SyncError::NotStarted(self.state()))
    }

    pub(super) fn processor(&self) -> Result<&Arc<SyncProcessor>, SyncError> {
        self.processor.as_ref().ok_or_else(|| SyncError::NotStarted(self.state()))
    }
}
