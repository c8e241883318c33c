// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pending action log: the offline write path.
//!
//! Every mutating user intent is appended here before anything touches the
//! network. The log is the single source of truth for "is a sync needed".
//!
//! # State machine
//!
//! ```text
//!            enqueue
//!               │
//!               ▼
//!   ┌────────► Queued ◄──────────── requeue ─────┐
//!   │           │                                │
//!   │     mark_in_flight                         │
//!   │           ▼                                │
//!   │       InFlight ── mark_succeeded ──► (deleted)
//!   │           │                                │
//!   └─ retry ───┤ mark_failed / mark_rejected    │
//!               ▼                                │
//!            Failed ─────────────────────────────┘
//!               │
//!            discard ──► (deleted)
//! ```
//!
//! Every failure increments `attempts` exactly once. FIFO order is the
//! creation sequence (`seq`), assigned at enqueue.
//!
//! Rows that no longer decode are quarantined: they stay out of the queue
//! and the counts, are listed by [`ActionLog::list_corrupt`], and can be
//! removed with [`ActionLog::discard_corrupt`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::resilience::retry::RetryConfig;
use crate::status::StatusChannel;
use crate::storage::traits::{DurableStore, StorageError, Table};
use crate::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionStatus {
    /// Waiting for the next eligible sync cycle
    Queued,
    /// Submitted to the remote service, result not yet recorded
    InFlight,
    /// Out of automatic retries; needs a requeue or discard
    Failed,
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "Queued"),
            Self::InFlight => write!(f, "InFlight"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A durable user intent awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// Idempotency token presented to the remote service; never changes
    pub action_id: Uuid,
    /// Creation sequence, defines FIFO order
    pub seq: u64,
    pub kind: String,
    /// Ordering scope: actions sharing a resource never overtake each other
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    pub payload: Value,
    /// Epoch millis
    pub created_at: i64,
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub status: ActionStatus,
    /// Backoff: not eligible before this epoch-millis instant
    #[serde(default)]
    pub next_attempt_at: Option<i64>,
}

impl PendingAction {
    /// Queued and past its backoff.
    #[must_use]
    pub fn is_due(&self, now: i64) -> bool {
        self.status == ActionStatus::Queued && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// An action row that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptAction {
    /// Storage key of the row (the action id, if it was ever valid)
    pub key: String,
    pub reason: String,
}

/// Per-status totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogCounts {
    pub queued: usize,
    pub in_flight: usize,
    pub failed: usize,
    /// Quarantined rows, not part of the other totals
    pub corrupt: usize,
}

impl LogCounts {
    fn from_actions(actions: &[PendingAction]) -> Self {
        actions.iter().fold(Self::default(), |mut counts, action| {
            match action.status {
                ActionStatus::Queued => counts.queued += 1,
                ActionStatus::InFlight => counts.in_flight += 1,
                ActionStatus::Failed => counts.failed += 1,
            }
            counts
        })
    }

    /// Not yet confirmed and still moving.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queued + self.in_flight
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.queued + self.in_flight + self.failed
    }
}

/// One pass over the actions table.
struct Scan {
    /// FIFO order
    actions: Vec<PendingAction>,
    corrupt: Vec<CorruptAction>,
}

impl Scan {
    fn counts(&self) -> LogCounts {
        LogCounts {
            corrupt: self.corrupt.len(),
            ..LogCounts::from_actions(&self.actions)
        }
    }

    fn rows(&self) -> usize {
        self.actions.len() + self.corrupt.len()
    }
}

/// Result of recording a failed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Queued`; eligible again at `retry_at` (epoch millis)
    Retrying { attempts: u32, retry_at: i64 },
    /// Moved to `Failed`
    Failed { attempts: u32 },
}

pub struct ActionLog {
    store: Arc<dyn DurableStore>,
    status: Arc<StatusChannel>,
    backoff: RetryConfig,
    max_attempts: u32,
    max_pending: Option<u64>,
    next_seq: AtomicU64,
    /// Serializes read-modify-write cycles on records
    write_lock: Mutex<()>,
}

impl ActionLog {
    /// Open the log over `store`, recovering state left by a previous run.
    ///
    /// Actions found `InFlight` were interrupted mid-submission; they return
    /// to `Queued` without an attempt increment. Resubmission is safe because
    /// the remote deduplicates on the action id.
    pub async fn open(
        store: Arc<dyn DurableStore>,
        status: Arc<StatusChannel>,
        backoff: RetryConfig,
        max_attempts: u32,
        max_pending: Option<u64>,
    ) -> Result<Self, StorageError> {
        let log = Self {
            store,
            status,
            backoff,
            max_attempts: max_attempts.max(1),
            max_pending,
            next_seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };

        let scan = log.scan().await?;
        let next_seq = scan.actions.iter().map(|a| a.seq + 1).max().unwrap_or(0);
        log.next_seq.store(next_seq, Ordering::Release);
        for corrupt in &scan.corrupt {
            crate::metrics::record_storage_error("actions", "decode", "corruption");
            warn!(key = %corrupt.key, reason = %corrupt.reason, "Corrupt action record quarantined");
        }

        let recovered = log.recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "Interrupted in-flight actions returned to queue");
        }

        let counts = log.counts().await?;
        if counts.total() > 0 {
            info!(
                queued = counts.queued,
                failed = counts.failed,
                corrupt = counts.corrupt,
                "Action log has entries from previous run"
            );
        }
        log.publish(counts);
        Ok(log)
    }

    /// Return every `InFlight` action to `Queued` without an attempt increment.
    ///
    /// Only valid when no submission is running: at open, and at the start of
    /// a sync flight.
    pub async fn recover_in_flight(&self) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut recovered = 0usize;
        for mut action in self.load_all().await? {
            if action.status != ActionStatus::InFlight {
                continue;
            }
            action.status = ActionStatus::Queued;
            self.save(&action).await?;
            debug!(action_id = %action.action_id, kind = %action.kind, "In-flight action requeued");
            recovered += 1;
        }
        if recovered > 0 {
            self.refresh().await?;
        }
        Ok(recovered)
    }

    /// Append a new intent. Returns once it is durable.
    pub async fn enqueue(&self, kind: &str, payload: Value) -> Result<Uuid, StorageError> {
        self.enqueue_for(kind, None, payload).await
    }

    /// Append a new intent scoped to `resource`. Actions sharing a resource
    /// are submitted strictly in enqueue order.
    pub async fn enqueue_for(
        &self,
        kind: &str,
        resource: Option<&str>,
        payload: Value,
    ) -> Result<Uuid, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut scan = self.scan().await?;

        if let Some(max) = self.max_pending {
            if scan.rows() as u64 >= max {
                crate::metrics::record_storage_error("actions", "enqueue", "quota");
                return Err(StorageError::QuotaExceeded(format!(
                    "Action log full: {} actions (max {})",
                    scan.rows(),
                    max
                )));
            }
        }

        let action = PendingAction {
            action_id: Uuid::new_v4(),
            seq: self.next_seq.fetch_add(1, Ordering::AcqRel),
            kind: kind.to_string(),
            resource: resource.map(str::to_string),
            payload,
            created_at: now_millis(),
            attempts: 0,
            last_error: None,
            status: ActionStatus::Queued,
            next_attempt_at: None,
        };
        self.save(&action).await?;

        debug!(
            action_id = %action.action_id,
            kind = %action.kind,
            seq = action.seq,
            "Action enqueued"
        );
        crate::metrics::record_action_enqueued(kind);

        let id = action.action_id;
        scan.actions.push(action);
        self.publish(scan.counts());
        Ok(id)
    }

    /// Every action in the log, in FIFO order.
    pub async fn list_pending(&self) -> Result<Vec<PendingAction>, StorageError> {
        self.load_all().await
    }

    /// Actions parked in `Failed`, in FIFO order.
    pub async fn list_failed(&self) -> Result<Vec<PendingAction>, StorageError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|a| a.status == ActionStatus::Failed)
            .collect())
    }

    pub async fn get(&self, action_id: Uuid) -> Result<Option<PendingAction>, StorageError> {
        let key = action_id.to_string();
        match self.store.get(Table::Actions, &key).await? {
            Some(bytes) => Ok(Some(Self::decode(&key, &bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn counts(&self) -> Result<LogCounts, StorageError> {
        Ok(self.scan().await?.counts())
    }

    /// Rows that could not be decoded, ordered by key.
    pub async fn list_corrupt(&self) -> Result<Vec<CorruptAction>, StorageError> {
        Ok(self.scan().await?.corrupt)
    }

    /// Delete the undecodable row stored under `key`.
    ///
    /// Returns `false` when there is no such row, or when it decodes: valid
    /// actions leave the log only through [`discard`](Self::discard) or a
    /// confirmed submission.
    pub async fn discard_corrupt(&self, key: &str) -> Result<bool, StorageError> {
        let _guard = self.write_lock.lock().await;
        let Some(bytes) = self.store.get(Table::Actions, key).await? else {
            return Ok(false);
        };
        if serde_json::from_slice::<PendingAction>(&bytes).is_ok() {
            debug!(key, "Record decodes, not discarding it as corrupt");
            return Ok(false);
        }
        self.store.delete(Table::Actions, key).await?;

        warn!(key, "Corrupt action record discarded");
        crate::metrics::record_action_transition("discarded_corrupt");
        self.refresh().await?;
        Ok(true)
    }

    /// `Queued → InFlight`.
    pub async fn mark_in_flight(&self, action_id: Uuid) -> Result<PendingAction, SyncError> {
        self.transition(action_id, ActionStatus::Queued, |action| {
            action.status = ActionStatus::InFlight;
        })
        .await
    }

    /// `InFlight → deleted`: the remote confirmed the action.
    pub async fn mark_succeeded(&self, action_id: Uuid) -> Result<(), SyncError> {
        let _guard = self.write_lock.lock().await;
        let action = self.require(action_id, ActionStatus::InFlight).await?;
        self.store.delete(Table::Actions, &action_id.to_string()).await?;

        debug!(action_id = %action_id, kind = %action.kind, attempts = action.attempts, "Action synced");
        crate::metrics::record_action_transition("succeeded");
        self.refresh().await?;
        Ok(())
    }

    /// Record a retryable failure: attempts + 1, back to `Queued` with backoff,
    /// or `Failed` once `max_attempts` is reached.
    pub async fn mark_failed(&self, action_id: Uuid, error: &str) -> Result<FailureOutcome, SyncError> {
        self.record_failure(action_id, error, false).await
    }

    /// Record a permanent rejection: attempts + 1 and straight to `Failed`.
    pub async fn mark_rejected(&self, action_id: Uuid, error: &str) -> Result<FailureOutcome, SyncError> {
        self.record_failure(action_id, error, true).await
    }

    /// `Failed → Queued` with attempts reset to 0.
    pub async fn requeue(&self, action_id: Uuid) -> Result<PendingAction, SyncError> {
        let action = self
            .transition(action_id, ActionStatus::Failed, |action| {
                action.status = ActionStatus::Queued;
                action.attempts = 0;
                action.next_attempt_at = None;
            })
            .await?;
        info!(action_id = %action_id, kind = %action.kind, "Failed action requeued");
        crate::metrics::record_action_transition("requeued");
        Ok(action)
    }

    /// Drop a `Failed` action for good.
    pub async fn discard(&self, action_id: Uuid) -> Result<PendingAction, SyncError> {
        let _guard = self.write_lock.lock().await;
        let action = self.require(action_id, ActionStatus::Failed).await?;
        self.store.delete(Table::Actions, &action_id.to_string()).await?;

        info!(
            action_id = %action_id,
            kind = %action.kind,
            last_error = ?action.last_error,
            "Failed action discarded"
        );
        crate::metrics::record_action_transition("discarded");
        self.refresh().await?;
        Ok(action)
    }

    async fn record_failure(
        &self,
        action_id: Uuid,
        error: &str,
        permanent: bool,
    ) -> Result<FailureOutcome, SyncError> {
        let _guard = self.write_lock.lock().await;
        let mut action = self.require(action_id, ActionStatus::InFlight).await?;

        // Backoff exponent is the attempt count before this failure
        let delay = self.backoff.delay_for(action.attempts);
        action.attempts = action.attempts.saturating_add(1);
        action.last_error = Some(error.to_string());

        let outcome = if permanent || action.attempts >= self.max_attempts {
            action.status = ActionStatus::Failed;
            action.next_attempt_at = None;
            FailureOutcome::Failed { attempts: action.attempts }
        } else {
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let retry_at = now_millis().saturating_add(delay_ms);
            action.status = ActionStatus::Queued;
            action.next_attempt_at = Some(retry_at);
            FailureOutcome::Retrying { attempts: action.attempts, retry_at }
        };
        self.save(&action).await?;

        match outcome {
            FailureOutcome::Failed { attempts } => {
                warn!(
                    action_id = %action_id,
                    kind = %action.kind,
                    attempts,
                    permanent,
                    error,
                    "Action failed, parked for manual remediation"
                );
                crate::metrics::record_action_transition("failed");
            }
            FailureOutcome::Retrying { attempts, .. } => {
                debug!(
                    action_id = %action_id,
                    kind = %action.kind,
                    attempts,
                    retry_in = ?delay,
                    error,
                    "Action will be retried"
                );
                crate::metrics::record_action_transition("retrying");
            }
        }

        self.refresh().await?;
        Ok(outcome)
    }

    async fn transition(
        &self,
        action_id: Uuid,
        expected: ActionStatus,
        apply: impl FnOnce(&mut PendingAction),
    ) -> Result<PendingAction, SyncError> {
        let _guard = self.write_lock.lock().await;
        let mut action = self.require(action_id, expected).await?;
        apply(&mut action);
        self.save(&action).await?;
        self.refresh().await?;
        Ok(action)
    }

    async fn require(&self, action_id: Uuid, expected: ActionStatus) -> Result<PendingAction, SyncError> {
        let action = self
            .get(action_id)
            .await?
            .ok_or(SyncError::UnknownAction(action_id))?;
        if action.status != expected {
            return Err(SyncError::InvalidTransition {
                action_id,
                status: action.status,
                expected,
            });
        }
        Ok(action)
    }

    async fn save(&self, action: &PendingAction) -> Result<(), StorageError> {
        let key = action.action_id.to_string();
        let bytes = serde_json::to_vec(action).map_err(|e| {
            StorageError::Backend(format!("Failed to encode action {}: {}", key, e))
        })?;
        self.store.put(Table::Actions, &key, &bytes).await.map_err(|e| {
            crate::metrics::record_storage_error("actions", "put", e.kind());
            e
        })
    }

    async fn load_all(&self) -> Result<Vec<PendingAction>, StorageError> {
        Ok(self.scan().await?.actions)
    }

    /// Read every row, setting undecodable ones aside.
    async fn scan(&self) -> Result<Scan, StorageError> {
        let mut scan = Scan { actions: Vec::new(), corrupt: Vec::new() };
        for (key, bytes) in self.store.get_all(Table::Actions).await? {
            match serde_json::from_slice::<PendingAction>(&bytes) {
                Ok(action) => scan.actions.push(action),
                Err(e) => scan.corrupt.push(CorruptAction { key, reason: e.to_string() }),
            }
        }
        scan.actions.sort_by_key(|a| a.seq);
        Ok(scan)
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<PendingAction, StorageError> {
        serde_json::from_slice(bytes).map_err(|e| {
            crate::metrics::record_storage_error("actions", "decode", "corruption");
            StorageError::Corruption {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Recompute counts and publish them to the status channel.
    pub(crate) async fn refresh(&self) -> Result<(), StorageError> {
        let counts = self.scan().await?.counts();
        self.publish(counts);
        Ok(())
    }

    fn publish(&self, counts: LogCounts) {
        crate::metrics::set_action_counts(&counts);
        self.status.set_counts(counts.pending(), counts.failed);
    }
}
