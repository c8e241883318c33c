// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-flight sync processor.
//!
//! Drains `Queued` actions against the [`RemoteService`] in FIFO order, one
//! flight at a time. A trigger that arrives while a flight is running does
//! not start a second one: it asks the running flight for exactly one more
//! cycle and waits for the flight to finish.
//!
//! ```text
//! trigger ──► idle? ──yes──► run cycle ──► rerun requested? ──yes──┐
//!               │                 ▲                                │
//!               no                └────────────────────────────────┘
//!               │                              │ no
//!               ▼                              ▼
//!       set rerun, wait ◄───────────────── release flight
//! ```
//!
//! Within a cycle, an action that is not confirmed blocks later actions of
//! the same resource so they cannot overtake it. Other resources keep going.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::actions::{ActionLog, ActionStatus, FailureOutcome, PendingAction};
use crate::error::SyncError;
use crate::remote::{RemoteError, RemoteService};
use crate::status::StatusChannel;
use crate::time::now_millis;

/// Totals for one trigger (the cycle plus any coalesced follow-ups).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Actions handed to the remote service
    pub submitted: usize,
    pub succeeded: usize,
    /// Retryable failures rescheduled with backoff
    pub retried: usize,
    /// Retryable failures that used the last attempt and moved to `Failed`
    pub exhausted: usize,
    /// Permanent rejections moved to `Failed`
    pub rejected: usize,
    /// Held back behind an unconfirmed action of the same resource
    pub deferred: usize,
    /// Still inside their backoff window
    pub backing_off: usize,
    /// The processor was offline, nothing was submitted
    pub skipped_offline: bool,
    /// Stopped early by shutdown or lost connectivity
    pub interrupted: bool,
}

impl CycleReport {
    fn absorb(&mut self, other: CycleReport) {
        self.submitted += other.submitted;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.exhausted += other.exhausted;
        self.rejected += other.rejected;
        self.deferred += other.deferred;
        self.backing_off += other.backing_off;
        self.skipped_offline |= other.skipped_offline;
        self.interrupted |= other.interrupted;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// This trigger ran the flight
    Ran(CycleReport),
    /// A flight was already running; this trigger was folded into it and
    /// returned once it finished
    Coalesced,
}

#[derive(Default)]
struct Flight {
    running: bool,
    rerun: bool,
}

pub struct SyncProcessor {
    log: Arc<ActionLog>,
    remote: Arc<dyn RemoteService>,
    status: Arc<StatusChannel>,
    submit_timeout: Duration,
    online: AtomicBool,
    shutting_down: AtomicBool,
    flight: Mutex<Flight>,
    /// Mirrors `flight.running` for waiters; only written under the `flight` lock
    running_tx: watch::Sender<bool>,
    /// Runtime the processor was built on; background cycles are spawned here
    /// so connectivity callbacks may arrive on any thread
    runtime: Option<Handle>,
}

impl SyncProcessor {
    pub fn new(
        log: Arc<ActionLog>,
        remote: Arc<dyn RemoteService>,
        status: Arc<StatusChannel>,
        submit_timeout: Duration,
        online: bool,
    ) -> Self {
        let (running_tx, _rx) = watch::channel(false);
        crate::metrics::set_online(online);
        Self {
            log,
            remote,
            status,
            submit_timeout,
            online: AtomicBool::new(online),
            shutting_down: AtomicBool::new(false),
            flight: Mutex::new(Flight::default()),
            running_tx,
            runtime: Handle::try_current().ok(),
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// A flight is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.running_tx.borrow()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Feed the host's connectivity signal. Going online starts a cycle.
    pub fn set_online(self: &Arc<Self>, online: bool) {
        let was_online = self.online.swap(online, Ordering::AcqRel);
        if was_online == online {
            return;
        }
        crate::metrics::set_online(online);
        if online {
            info!("Connectivity restored, scheduling sync");
            self.request_cycle();
        } else {
            info!("Connectivity lost, sync paused");
        }
    }

    /// Fire-and-forget trigger: folds into a running flight, otherwise spawns
    /// one on the runtime the processor was built on.
    ///
    /// Safe to call from any thread, including from inside a status listener.
    pub fn request_cycle(self: &Arc<Self>) {
        if self.is_shutting_down() {
            return;
        }
        {
            let mut flight = self.flight.lock();
            if flight.running {
                flight.rerun = true;
                crate::metrics::record_cycle_coalesced();
                return;
            }
        }

        let Some(runtime) = self.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            warn!("No Tokio runtime available, sync deferred to the next poll");
            return;
        };
        let processor = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = processor.trigger().await {
                warn!(error = %e, "Background sync cycle failed");
            }
        });
    }

    /// Run a flight, or join the running one.
    ///
    /// Storage failures abort the flight and are returned unchanged. Remote
    /// failures never are: they are recorded on the action.
    #[tracing::instrument(skip(self))]
    pub async fn trigger(&self) -> Result<TriggerOutcome, SyncError> {
        if self.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }

        let mut running_rx = {
            let mut flight = self.flight.lock();
            if flight.running {
                flight.rerun = true;
                Some(self.running_tx.subscribe())
            } else {
                flight.running = true;
                self.running_tx.send_replace(true);
                None
            }
        };

        if let Some(rx) = running_rx.as_mut() {
            debug!("Sync already running, coalescing trigger");
            crate::metrics::record_cycle_coalesced();
            // Sender lives as long as self, so this only errors if we are torn down
            let _ = rx.wait_for(|running| !*running).await;
            return Ok(TriggerOutcome::Coalesced);
        }

        let mut guard = FlightGuard { processor: self, armed: true };
        let started = Instant::now();

        let recovered = self.log.recover_in_flight().await?;
        if recovered > 0 {
            warn!(recovered, "Orphaned in-flight actions returned to queue");
        }

        let mut report = CycleReport::default();
        loop {
            report.absorb(self.run_cycle().await?);
            self.log.refresh().await?;
            if !self.take_rerun() {
                break;
            }
            debug!("Running coalesced follow-up cycle");
        }
        guard.armed = false;

        crate::metrics::record_cycle(started.elapsed(), report.submitted);
        if report.submitted > 0 {
            info!(
                submitted = report.submitted,
                succeeded = report.succeeded,
                retried = report.retried,
                failed = report.exhausted + report.rejected,
                duration_ms = started.elapsed().as_millis() as u64,
                "Sync cycle complete"
            );
        }
        Ok(TriggerOutcome::Ran(report))
    }

    /// Stop after the current submission and wait for the flight to end.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut rx = self.running_tx.subscribe();
        if *rx.borrow() {
            info!("Waiting for running sync cycle to finish");
        }
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// Consume a pending rerun request, or release the flight if there is none.
    ///
    /// `is_syncing = false` goes out while the flight is still held but the
    /// `flight` lock is not, so listeners may call back into the processor.
    /// A trigger that lands during that broadcast is picked up by the re-check.
    fn take_rerun(&self) -> bool {
        if self.consume_rerun(&mut self.flight.lock()) {
            return true;
        }
        self.status.set_syncing(false);

        let mut flight = self.flight.lock();
        if self.consume_rerun(&mut flight) {
            return true;
        }
        self.release(&mut flight);
        false
    }

    fn consume_rerun(&self, flight: &mut Flight) -> bool {
        if flight.rerun && !self.is_shutting_down() {
            flight.rerun = false;
            return true;
        }
        false
    }

    /// Callers publish `is_syncing = false` first, outside the lock.
    fn release(&self, flight: &mut Flight) {
        flight.running = false;
        flight.rerun = false;
        self.running_tx.send_replace(false);
    }

    async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let mut report = CycleReport::default();
        if !self.is_online() {
            debug!("Offline, skipping sync cycle");
            report.skipped_offline = true;
            return Ok(report);
        }

        let actions = self.log.list_pending().await?;
        let now = now_millis();
        let mut blocked: HashSet<String> = HashSet::new();

        for action in actions {
            if action.status == ActionStatus::Queued
                && action.resource.as_ref().is_some_and(|r| blocked.contains(r))
            {
                report.deferred += 1;
                continue;
            }
            if !action.is_due(now) {
                if action.status == ActionStatus::Queued {
                    report.backing_off += 1;
                }
                Self::block(&mut blocked, &action);
                continue;
            }
            if self.is_shutting_down() || !self.is_online() {
                debug!(action_id = %action.action_id, "Sync cycle interrupted");
                report.interrupted = true;
                break;
            }

            if report.submitted == 0 {
                self.status.set_syncing(true);
            }
            report.submitted += 1;

            if !self.submit(&action, &mut report).await? {
                Self::block(&mut blocked, &action);
            }
        }

        Ok(report)
    }

    /// Submit one action and record the result. Returns whether it was confirmed.
    async fn submit(&self, action: &PendingAction, report: &mut CycleReport) -> Result<bool, SyncError> {
        let id = action.action_id;
        self.log.mark_in_flight(id).await?;

        let started = Instant::now();
        let (result, timed_out) = match tokio::time::timeout(
            self.submit_timeout,
            self.remote.submit(&action.kind, &action.payload, id),
        )
        .await
        {
            Ok(result) => (result, false),
            Err(_) => (
                Err(RemoteError::Retryable(format!(
                    "Submission timed out after {:?}",
                    self.submit_timeout
                ))),
                true,
            ),
        };
        crate::metrics::record_submission_latency(started.elapsed());

        match result {
            Ok(()) => {
                self.log.mark_succeeded(id).await?;
                crate::metrics::record_submission(&action.kind, "success");
                report.succeeded += 1;
                Ok(true)
            }
            Err(RemoteError::Retryable(error)) => {
                let outcome = if timed_out { "timeout" } else { "retryable" };
                crate::metrics::record_submission(&action.kind, outcome);
                match self.log.mark_failed(id, &error).await? {
                    FailureOutcome::Retrying { .. } => report.retried += 1,
                    FailureOutcome::Failed { .. } => report.exhausted += 1,
                }
                Ok(false)
            }
            Err(RemoteError::Permanent(error)) => {
                crate::metrics::record_submission(&action.kind, "permanent");
                self.log.mark_rejected(id, &error).await?;
                report.rejected += 1;
                Ok(false)
            }
        }
    }

    fn block(blocked: &mut HashSet<String>, action: &PendingAction) {
        if let Some(resource) = &action.resource {
            blocked.insert(resource.clone());
        }
    }
}

/// RAII guard releasing the flight when a cycle aborts with an error.
struct FlightGuard<'a> {
    processor: &'a SyncProcessor,
    armed: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.processor.status.set_syncing(false);
            let mut flight = self.processor.flight.lock();
            self.processor.release(&mut flight);
        }
    }
}
