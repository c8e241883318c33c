// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Host-facing API: content cache, action log, sync control.
//!
//! Everything here is a thin, instrumented pass-through to the component
//! that owns the behavior. Nothing in this module submits to the remote
//! service; only the sync processor does.

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::actions::{CorruptAction, PendingAction};
use crate::content::{CacheEntry, CacheKey, ContentKind};
use crate::error::SyncError;
use crate::sync::TriggerOutcome;

use super::SyncEngine;

impl SyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // API: Content cache (read path)
    // ═══════════════════════════════════════════════════════════════════════════

    /// Cache a fetched payload under `(kind, id, variant)`. Overwrites any
    /// previous entry for the same key.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use offline_sync::{SyncEngine, ContentKind};
    /// # use serde_json::json;
    /// # async fn example(engine: &SyncEngine) {
    /// engine
    ///     .cache_content(ContentKind::Chapter, "john-3", Some("kjv"), json!({"verses": []}))
    ///     .await
    ///     .expect("cache failed");
    /// # }
    /// ```
    pub async fn cache_content(
        &self,
        kind: ContentKind,
        id: &str,
        variant: Option<&str>,
        payload: Value,
    ) -> Result<CacheEntry, SyncError> {
        let mut key = CacheKey::new(kind, id);
        if let Some(variant) = variant {
            key = key.with_variant(variant);
        }
        Ok(self.content()?.cache(&key, payload).await?)
    }

    /// `None` means "not cached yet"; it is not an error.
    pub async fn get_content(&self, key: &CacheKey) -> Result<Option<CacheEntry>, SyncError> {
        Ok(self.content()?.get(key).await?)
    }

    /// Existence check without decoding the payload.
    pub async fn has_content(&self, key: &CacheKey) -> Result<bool, SyncError> {
        Ok(self.content()?.has(key).await?)
    }

    /// Everything of `kind` available offline.
    pub async fn list_content(&self, kind: &ContentKind) -> Result<Vec<CacheEntry>, SyncError> {
        Ok(self.content()?.list_by_kind(kind).await?)
    }

    /// Caller-driven eviction. The engine never ages entries out on its own.
    pub async fn delete_content(&self, key: &CacheKey) -> Result<(), SyncError> {
        Ok(self.content()?.delete(key).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Pending actions (write path)
    // ═══════════════════════════════════════════════════════════════════════════

    /// Record a user intent. The action is durable when this returns.
    ///
    /// If online and `sync_on_enqueue` is set, a sync cycle is scheduled in
    /// the background (or folded into the running one).
    pub async fn enqueue_action(&self, kind: &str, payload: Value) -> Result<Uuid, SyncError> {
        self.enqueue_action_for(kind, None, payload).await
    }

    /// Like [`enqueue_action`](Self::enqueue_action), scoped to `resource`:
    /// actions sharing a resource reach the remote service in enqueue order
    /// even across failures.
    #[tracing::instrument(skip(self, payload))]
    pub async fn enqueue_action_for(
        &self,
        kind: &str,
        resource: Option<&str>,
        payload: Value,
    ) -> Result<Uuid, SyncError> {
        self.ensure_accepting()?;
        let action_id = self.log()?.enqueue_for(kind, resource, payload).await?;

        let processor = self.processor()?;
        if self.config.read().sync_on_enqueue && processor.is_online() {
            processor.request_cycle();
        }
        Ok(action_id)
    }

    /// Every action not yet confirmed, in submission order.
    pub async fn list_pending_actions(&self) -> Result<Vec<PendingAction>, SyncError> {
        Ok(self.log()?.list_pending().await?)
    }

    /// Actions waiting for a manual retry or discard.
    pub async fn list_failed_actions(&self) -> Result<Vec<PendingAction>, SyncError> {
        Ok(self.log()?.list_failed().await?)
    }

    /// Move a `Failed` action back to `Queued` with a fresh attempt budget.
    #[tracing::instrument(skip(self))]
    pub async fn requeue_failed(&self, action_id: Uuid) -> Result<PendingAction, SyncError> {
        self.ensure_accepting()?;
        let action = self.log()?.requeue(action_id).await?;

        let processor = self.processor()?;
        if self.config.read().sync_on_enqueue && processor.is_online() {
            processor.request_cycle();
        }
        Ok(action)
    }

    /// Drop a `Failed` action for good.
    #[tracing::instrument(skip(self))]
    pub async fn discard_failed(&self, action_id: Uuid) -> Result<PendingAction, SyncError> {
        Ok(self.log()?.discard(action_id).await?)
    }

    /// Action rows that could not be decoded. They are kept out of the queue
    /// so the rest of it keeps draining.
    pub async fn list_corrupt_actions(&self) -> Result<Vec<CorruptAction>, SyncError> {
        Ok(self.log()?.list_corrupt().await?)
    }

    /// Delete a quarantined row by its storage key. Returns `false` if `key`
    /// is missing or holds a readable action.
    #[tracing::instrument(skip(self))]
    pub async fn discard_corrupt_action(&self, key: &str) -> Result<bool, SyncError> {
        Ok(self.log()?.discard_corrupt(key).await?)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // API: Sync control
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run a sync cycle now ("sync now" button). If a cycle is already
    /// running this joins it instead of starting a second one.
    pub async fn trigger_sync(&self) -> Result<TriggerOutcome, SyncError> {
        self.ensure_accepting()?;
        self.processor()?.trigger().await
    }

    /// Feed the host's connectivity signal. Going online schedules a cycle.
    pub fn set_online(&self, online: bool) -> Result<(), SyncError> {
        debug!(online, "Connectivity signal");
        self.processor()?.set_online(online);
        Ok(())
    }

    /// Last connectivity reported by the host (the configured default before
    /// start).
    #[must_use]
    pub fn is_online(&self) -> bool {
        match self.processor {
            Some(ref processor) => processor.is_online(),
            None => self.config.read().start_online,
        }
    }

    fn ensure_accepting(&self) -> Result<(), SyncError> {
        match self.state() {
            super::EngineState::ShuttingDown => Err(SyncError::ShuttingDown),
            _ => Ok(()),
        }
    }
}
