// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for installing a recorder/exporter.
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size histograms
//!
//! # Labels
//! - `component`: content, actions, store
//! - `operation`: get, put, delete, decode, enqueue
//! - `outcome`: success, retryable, permanent, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::actions::LogCounts;
use crate::status::SyncSnapshot;

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a storage failure by category (backend, corruption, quota)
pub fn record_storage_error(component: &str, operation: &str, kind: &str) {
    counter!(
        "offline_sync_storage_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Set on-disk size of the local store
pub fn set_store_bytes(bytes: u64) {
    gauge!("offline_sync_store_bytes").set(bytes as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONTENT CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a content cache operation (get hit/miss, put, delete)
pub fn record_content_operation(operation: &str, status: &str) {
    counter!(
        "offline_sync_content_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record size of a cached payload
pub fn record_content_bytes(bytes: usize) {
    histogram!("offline_sync_content_bytes").record(bytes as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ACTION LOG
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_action_enqueued(kind: &str) {
    counter!(
        "offline_sync_actions_enqueued_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record a lifecycle transition (succeeded, retrying, failed, requeued, discarded)
pub fn record_action_transition(transition: &str) {
    counter!(
        "offline_sync_action_transitions_total",
        "transition" => transition.to_string()
    )
    .increment(1);
}

/// Set per-status action gauges
pub fn set_action_counts(counts: &LogCounts) {
    gauge!("offline_sync_actions", "status" => "queued").set(counts.queued as f64);
    gauge!("offline_sync_actions", "status" => "in_flight").set(counts.in_flight as f64);
    gauge!("offline_sync_actions", "status" => "failed").set(counts.failed as f64);
    gauge!("offline_sync_actions", "status" => "corrupt").set(counts.corrupt as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC PROCESSOR
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of one remote submission
pub fn record_submission(kind: &str, outcome: &str) {
    counter!(
        "offline_sync_submissions_total",
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record remote submission latency
pub fn record_submission_latency(duration: Duration) {
    histogram!("offline_sync_submission_seconds").record(duration.as_secs_f64());
}

/// Record a completed sync cycle
pub fn record_cycle(duration: Duration, submitted: usize) {
    counter!("offline_sync_cycles_total").increment(1);
    histogram!("offline_sync_cycle_seconds").record(duration.as_secs_f64());
    histogram!("offline_sync_cycle_submitted").record(submitted as f64);
}

/// Record a trigger folded into an already running cycle
pub fn record_cycle_coalesced() {
    counter!("offline_sync_cycles_coalesced_total").increment(1);
}

pub fn set_online(online: bool) {
    gauge!("offline_sync_online").set(if online { 1.0 } else { 0.0 });
}

/// Mirror the published status snapshot
pub fn set_sync_snapshot(snapshot: &SyncSnapshot) {
    gauge!("offline_sync_pending").set(snapshot.pending_count as f64);
    gauge!("offline_sync_failed").set(snapshot.failed_count as f64);
    gauge!("offline_sync_syncing").set(if snapshot.is_syncing { 1.0 } else { 0.0 });
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "offline_sync_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records a startup phase on drop
pub struct PhaseTimer {
    phase: &'static str,
    start: Instant,
}

impl PhaseTimer {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            start: Instant::now(),
        }
    }
}

impl Drop for PhaseTimer {
    fn drop(&mut self) {
        record_startup_phase(self.phase, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_counters_reach_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_action_enqueued("note.create");
            record_action_enqueued("note.create");
            record_submission("note.create", "success");
            record_storage_error("content", "put", "quota");
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let counter = |name: &str| -> u64 {
            snapshot
                .iter()
                .filter(|(key, _, _, _)| key.key().name() == name)
                .map(|(_, _, _, value)| match value {
                    DebugValue::Counter(v) => *v,
                    _ => 0,
                })
                .sum()
        };
        assert_eq!(counter("offline_sync_actions_enqueued_total"), 2);
        assert_eq!(counter("offline_sync_submissions_total"), 1);
        assert_eq!(counter("offline_sync_storage_errors_total"), 1);
    }

    #[test]
    fn test_gauges_without_recorder() {
        // No recorder installed: calls are no-ops and must not panic
        set_action_counts(&LogCounts { queued: 2, in_flight: 1, failed: 0, corrupt: 1 });
        set_sync_snapshot(&SyncSnapshot::default());
        set_online(true);
        set_store_bytes(4096);
        record_cycle(Duration::from_millis(12), 3);
        record_cycle_coalesced();
    }

    #[test]
    fn test_phase_timer() {
        {
            let _timer = PhaseTimer::new("open_store");
            std::thread::sleep(Duration::from_micros(10));
        }
        set_engine_state("Ready");
    }
}
