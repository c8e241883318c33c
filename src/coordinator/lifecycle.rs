// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: start, run loop, shutdown.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::actions::ActionLog;
use crate::content::ContentCache;
use crate::error::SyncError;
use crate::metrics::PhaseTimer;
use crate::storage::memory::InMemoryStore;
use crate::storage::sqlite::SqliteStore;
use crate::storage::traits::DurableStore;
use crate::sync::{SyncProcessor, TriggerOutcome};
use crate::time::now_millis;

use super::{EngineState, SyncEngine};

impl SyncEngine {
    /// Start the engine.
    ///
    /// Startup flow:
    /// 1. Open the durable store (SQLite with startup retry, or in-memory)
    /// 2. Open the action log: interrupted `InFlight` actions go back to
    ///    `Queued`, counts are published to the status channel
    /// 3. Build the sync processor with the configured connectivity
    /// 4. Ready! If online with queued actions, a first cycle is scheduled
    #[tracing::instrument(skip(self), fields(persistent = tracing::field::Empty))]
    pub async fn start(&mut self) -> Result<(), SyncError> {
        if self.state() != EngineState::Created {
            debug!(state = %self.state(), "Engine already started");
            return Ok(());
        }
        let startup_start = std::time::Instant::now();
        info!("Starting offline sync engine...");
        let _ = self.state.send(EngineState::Recovering);
        crate::metrics::set_engine_state("Recovering");

        let config = self.config.read().clone();

        // ========== PHASE 1: Durable store ==========
        let store: Arc<dyn DurableStore> = {
            let _timer = PhaseTimer::new("store_open");
            match config.store_path {
                Some(ref path) => {
                    let sqlite = match SqliteStore::with_max_bytes(path, config.max_store_bytes).await {
                        Ok(store) => Arc::new(store),
                        Err(e) => {
                            let _ = self.state.send(EngineState::Created);
                            crate::metrics::record_storage_error("store", "open", e.kind());
                            return Err(e.into());
                        }
                    };
                    tracing::Span::current().record("persistent", true);
                    self.sqlite = Some(sqlite.clone());
                    sqlite
                }
                None => {
                    warn!("No store path configured - pending actions will not survive a restart!");
                    tracing::Span::current().record("persistent", false);
                    let memory = match config.max_store_bytes {
                        Some(max) => InMemoryStore::with_max_bytes(usize::try_from(max).unwrap_or(usize::MAX)),
                        None => InMemoryStore::new(),
                    };
                    Arc::new(memory)
                }
            }
        };

        // ========== PHASE 2: Recover action log ==========
        let log = {
            let _timer = PhaseTimer::new("log_recovery");
            match ActionLog::open(
                store.clone(),
                self.status.clone(),
                config.backoff(),
                config.max_attempts,
                config.max_pending_actions,
            )
            .await
            {
                Ok(log) => Arc::new(log),
                Err(e) => {
                    let _ = self.state.send(EngineState::Created);
                    crate::metrics::record_storage_error("actions", "recover", e.kind());
                    return Err(e.into());
                }
            }
        };

        // ========== PHASE 3: Processor ==========
        let processor = Arc::new(SyncProcessor::new(
            log.clone(),
            self.remote.clone(),
            self.status.clone(),
            config.submit_timeout(),
            config.start_online,
        ));

        self.content = Some(ContentCache::new(store));
        self.log = Some(log);
        self.processor = Some(processor.clone());

        let _ = self.state.send(EngineState::Ready);
        crate::metrics::set_engine_state("Ready");
        crate::metrics::record_startup_phase("total", startup_start.elapsed());

        let snapshot = self.status.snapshot();
        info!(
            pending = snapshot.pending_count,
            failed = snapshot.failed_count,
            online = processor.is_online(),
            "Engine ready"
        );

        if processor.is_online() && snapshot.pending_count > 0 {
            processor.request_cycle();
        }
        Ok(())
    }

    /// Perform one maintenance tick (for manual control instead of run loop).
    ///
    /// Runs a sync cycle if online and at least one queued action is past its
    /// backoff. Returns `None` when there was nothing to do.
    pub async fn tick(&self) -> Result<Option<TriggerOutcome>, SyncError> {
        let processor = self.processor()?;
        if !processor.is_online() || processor.is_running() || processor.is_shutting_down() {
            return Ok(None);
        }

        let now = now_millis();
        let due = self.log()?.list_pending().await?.iter().any(|a| a.is_due(now));
        if !due {
            return Ok(None);
        }
        debug!("Queued actions due, running sync cycle");
        processor.trigger().await.map(Some)
    }

    /// Run the maintenance loop until [`shutdown()`](Self::shutdown).
    ///
    /// Applies runtime config updates and retries actions whose backoff
    /// elapsed.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        if !self.is_ready() {
            warn!(state = %self.state(), "run() called before start()");
            return;
        }
        let _ = self.state.send(EngineState::Running);
        crate::metrics::set_engine_state("Running");
        info!("Offline sync engine running");

        let mut config_rx = self.config_rx.lock().await;
        let mut state_rx = self.state_rx.clone();
        let mut poll_interval = tokio::time::interval(self.config.read().retry_poll_interval());
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    let interval = new_config.retry_poll_interval();
                    if interval != poll_interval.period() {
                        poll_interval = tokio::time::interval(interval);
                        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    info!(
                        sync_on_enqueue = new_config.sync_on_enqueue,
                        retry_poll_ms = new_config.retry_poll_ms,
                        "Config updated"
                    );
                    *self.config.write() = new_config;
                }

                _ = poll_interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Maintenance tick failed");
                    }
                }

                Ok(()) = state_rx.changed() => {
                    if *state_rx.borrow_and_update() == EngineState::ShuttingDown {
                        break;
                    }
                }
            }
        }
        debug!("Run loop exited");
    }

    /// Initiate graceful shutdown.
    ///
    /// The submission in progress is allowed to complete; the next action is
    /// not started. The store is checkpointed and closed.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.state() == EngineState::ShuttingDown {
            return;
        }
        let shutdown_start = std::time::Instant::now();
        info!("Initiating offline sync engine shutdown...");
        let _ = self.state.send(EngineState::ShuttingDown);
        crate::metrics::set_engine_state("ShuttingDown");

        if let Some(ref processor) = self.processor {
            processor.shutdown().await;
        }

        if let Some(ref sqlite) = self.sqlite {
            if let Err(e) = sqlite.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint store on shutdown");
            }
            if let Ok(bytes) = sqlite.file_size_bytes() {
                crate::metrics::set_store_bytes(bytes);
            }
            sqlite.close().await;
        }

        let snapshot = self.status.snapshot();
        crate::metrics::record_startup_phase("shutdown", shutdown_start.elapsed());
        info!(
            pending = snapshot.pending_count,
            failed = snapshot.failed_count,
            "Offline sync engine shutdown complete"
        );
    }
}
