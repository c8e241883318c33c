// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Offline Sync
//!
//! An offline-first content cache and background synchronization engine for
//! thin clients over a remote data service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Host application                        │
//! │  • cache_content / get_content (read path)                  │
//! │  • enqueue_action / requeue_failed (write path)             │
//! │  • trigger_sync / set_online / subscribe_sync_status        │
//! └─────────────────────────────────────────────────────────────┘
//!            │                    │                     ▲
//!            ▼                    ▼                     │ snapshots
//! ┌────────────────────┐ ┌──────────────────────┐ ┌─────────────┐
//! │   Content Cache    │ │  Pending Action Log  │─│   Status    │
//! │  kind:id[:variant] │ │  FIFO, durable,      │ │   Channel   │
//! │  upsert, no expiry │ │  Queued/InFlight/... │ └─────────────┘
//! └────────────────────┘ └──────────────────────┘        ▲
//!            │                    │    ▲                  │
//!            │                    │    │ mark_*           │
//!            │                    │ ┌──────────────────────┐
//!            │                    │ │    Sync Processor    │──► RemoteService
//!            │                    │ │  single-flight, FIFO │    (idempotency key
//!            │                    │ │  backoff, ordering   │     = action id)
//!            ▼                    ▼ └──────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Durable Store                          │
//! │  SQLite (WAL, synchronous=FULL) or in-memory                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use offline_sync::{ContentKind, EngineConfig, RemoteError, RemoteService, SyncEngine};
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
//!         // POST to the real service, sending the key as the idempotency header
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EngineConfig {
//!         store_path: Some("./offline.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let mut engine = SyncEngine::new(config, rx, Arc::new(Backend));
//!     engine.start().await.expect("Failed to start");
//!
//!     // Keep reading while offline
//!     engine
//!         .cache_content(ContentKind::Chapter, "john-3", Some("kjv"), json!({"verses": []}))
//!         .await
//!         .expect("Failed to cache");
//!
//!     // Keep acting while offline: durable before this returns
//!     engine.set_online(false).unwrap();
//!     engine.enqueue_action("progress.complete", json!({"room": 4})).await.unwrap();
//!
//!     // Back online: the queue drains in order
//!     engine.set_online(true).unwrap();
//!     engine.trigger_sync().await.unwrap();
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`SyncEngine`] handle tying all components together
//! - [`storage`]: Durable store contract and backends (SQLite, memory)
//! - [`content`]: Content cache
//! - [`actions`]: Pending action log
//! - [`sync`]: Single-flight sync processor
//! - [`status`]: Status observer channel
//! - [`resilience`]: Exponential backoff

pub mod config;
pub mod storage;
pub mod content;
pub mod actions;
pub mod remote;
pub mod sync;
pub mod status;
pub mod resilience;
pub mod coordinator;
pub mod error;
pub mod metrics;
mod time;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::EngineConfig;
pub use coordinator::{SyncEngine, EngineState, HealthCheck};
pub use content::{CacheEntry, CacheKey, ContentCache, ContentKind};
pub use actions::{ActionLog, ActionStatus, CorruptAction, FailureOutcome, LogCounts, PendingAction};
pub use remote::{RemoteError, RemoteService};
pub use sync::{CycleReport, SyncProcessor, TriggerOutcome};
pub use status::{StatusChannel, Subscription, SyncSnapshot};
pub use storage::traits::{DurableStore, StorageError, Table};
pub use storage::memory::InMemoryStore;
pub use storage::sqlite::SqliteStore;
pub use error::SyncError;
pub use resilience::retry::RetryConfig;
