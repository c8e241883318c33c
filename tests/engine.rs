//! End-to-end tests for the offline sync engine.
//!
//! Drives a real [`SyncEngine`] (in-memory or SQLite-backed) against a
//! scripted remote service that records every submission.
//!
//! Run with: `cargo test --test engine`

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use offline_sync::{
    ActionStatus, CacheKey, ContentKind, EngineConfig, EngineState, RemoteError, RemoteService,
    StorageError, SyncEngine, SyncError, SyncSnapshot, TriggerOutcome,
};

// =============================================================================
// Scripted remote
// =============================================================================

/// Remote service double: answers from a per-kind script (default success)
/// and records `(kind, idempotency_key)` for every call.
#[derive(Default)]
struct ScriptedRemote {
    responses: Mutex<HashMap<String, Vec<Result<(), RemoteError>>>>,
    always_fail: Mutex<HashMap<String, RemoteError>>,
    submissions: Mutex<Vec<(String, Uuid)>>,
    delay: Option<Duration>,
}

impl ScriptedRemote {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self { delay: Some(delay), ..Default::default() })
    }

    fn fail_next(&self, kind: &str, error: RemoteError) {
        self.responses.lock().entry(kind.to_string()).or_default().push(Err(error));
    }

    fn fail_always(&self, kind: &str, error: RemoteError) {
        self.always_fail.lock().insert(kind.to_string(), error);
    }

    fn kinds(&self) -> Vec<String> {
        self.submissions.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    fn keys(&self) -> Vec<Uuid> {
        self.submissions.lock().iter().map(|(_, k)| *k).collect()
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    async fn submit(&self, kind: &str, _payload: &Value, key: Uuid) -> Result<(), RemoteError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.submissions.lock().push((kind.to_string(), key));

        if let Some(error) = self.always_fail.lock().get(kind) {
            return Err(error.clone());
        }
        match self.responses.lock().get_mut(kind) {
            Some(script) if !script.is_empty() => script.remove(0),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Manual sync only, long backoff so a failed action stays out of later cycles.
fn test_config() -> EngineConfig {
    EngineConfig {
        sync_on_enqueue: false,
        base_delay_ms: 60_000,
        max_delay_ms: 600_000,
        max_attempts: 3,
        submit_timeout_ms: 5_000,
        ..Default::default()
    }
}

async fn start_engine(config: EngineConfig, remote: Arc<ScriptedRemote>) -> SyncEngine {
    let (_tx, rx) = watch::channel(config.clone());
    let mut engine = SyncEngine::new(config, rx, remote);
    engine.start().await.expect("engine start");
    engine
}

async fn wait_for_status(engine: &SyncEngine, predicate: impl Fn(&SyncSnapshot) -> bool) {
    let mut rx = engine.status_receiver();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| predicate(s)))
        .await
        .expect("status condition not reached in time")
        .expect("status channel closed");
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_transitions_to_ready() {
    let engine = start_engine(test_config(), ScriptedRemote::new()).await;
    assert_eq!(engine.state(), EngineState::Ready);
    assert!(engine.is_ready());

    let health = engine.health_check().await.unwrap();
    assert!(health.healthy());
    assert!(health.store_bytes.is_none());
}

#[tokio::test]
async fn test_shutdown_rejects_new_work() {
    let engine = start_engine(test_config(), ScriptedRemote::new()).await;
    engine.shutdown().await;

    assert_eq!(engine.state(), EngineState::ShuttingDown);
    assert!(matches!(engine.enqueue_action("a", json!({})).await, Err(SyncError::ShuttingDown)));
    assert!(matches!(engine.trigger_sync().await, Err(SyncError::ShuttingDown)));
}

// =============================================================================
// Content cache
// =============================================================================

#[tokio::test]
async fn test_cache_twice_keeps_last_write() {
    let engine = start_engine(test_config(), ScriptedRemote::new()).await;

    engine.cache_content(ContentKind::Chapter, "john-3", Some("kjv"), json!({"v": 1})).await.unwrap();
    engine.cache_content(ContentKind::Chapter, "john-3", Some("kjv"), json!({"v": 2})).await.unwrap();

    let key = CacheKey::new(ContentKind::Chapter, "john-3").with_variant("kjv");
    let entries = engine.list_content(&ContentKind::Chapter).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, json!({"v": 2}));
    assert_eq!(engine.get_content(&key).await.unwrap().unwrap().payload, json!({"v": 2}));
}

#[tokio::test]
async fn test_cache_miss_is_not_an_error() {
    let engine = start_engine(test_config(), ScriptedRemote::new()).await;
    let key = CacheKey::new(ContentKind::Room, "7");

    assert!(engine.get_content(&key).await.unwrap().is_none());
    assert!(!engine.has_content(&key).await.unwrap());

    engine.cache_content(ContentKind::Room, "7", None, json!({"title": "Gate"})).await.unwrap();
    assert!(engine.has_content(&key).await.unwrap());

    engine.delete_content(&key).await.unwrap();
    assert!(!engine.has_content(&key).await.unwrap());
}

#[tokio::test]
async fn test_list_content_filters_by_kind() {
    let engine = start_engine(test_config(), ScriptedRemote::new()).await;
    engine.cache_content(ContentKind::Floor, "1", None, json!({})).await.unwrap();
    engine.cache_content(ContentKind::Floor, "2", None, json!({})).await.unwrap();
    engine.cache_content(ContentKind::Room, "1", None, json!({})).await.unwrap();
    engine.cache_content(ContentKind::Chapter, "gen-1", Some("web"), json!({})).await.unwrap();
    engine.cache_content(ContentKind::Chapter, "gen-1", Some("kjv"), json!({})).await.unwrap();

    assert_eq!(engine.list_content(&ContentKind::Floor).await.unwrap().len(), 2);
    assert_eq!(engine.list_content(&ContentKind::Room).await.unwrap().len(), 1);
    assert_eq!(engine.list_content(&ContentKind::Chapter).await.unwrap().len(), 2);
    assert!(engine.list_content(&ContentKind::Course).await.unwrap().is_empty());
}

// =============================================================================
// Action log ordering and durability
// =============================================================================

#[tokio::test]
async fn test_fifo_order_preserved_through_sync() {
    let remote = ScriptedRemote::new();
    let engine = start_engine(test_config(), remote.clone()).await;

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(engine.enqueue_action(&format!("k{}", i), json!({"n": i})).await.unwrap());
    }
    let listed: Vec<Uuid> = engine.list_pending_actions().await.unwrap().iter().map(|a| a.action_id).collect();
    assert_eq!(listed, ids);

    let TriggerOutcome::Ran(report) = engine.trigger_sync().await.unwrap() else {
        panic!("expected this trigger to run the cycle");
    };
    assert_eq!(report.succeeded, 10);
    assert_eq!(remote.keys(), ids);
    assert!(engine.sync_status().is_synced());
}

#[tokio::test]
async fn test_enqueue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db").to_string_lossy().to_string();
    let config = EngineConfig {
        store_path: Some(path),
        start_online: false,
        ..test_config()
    };

    let ids = {
        let engine = start_engine(config.clone(), ScriptedRemote::new()).await;
        let mut ids = Vec::new();
        for kind in ["a", "b", "c"] {
            ids.push(engine.enqueue_action(kind, json!({"kind": kind})).await.unwrap());
        }
        engine.shutdown().await;
        ids
    };

    let engine = start_engine(config, ScriptedRemote::new()).await;
    let pending = engine.list_pending_actions().await.unwrap();
    let recovered: Vec<Uuid> = pending.iter().map(|a| a.action_id).collect();
    assert_eq!(recovered, ids);
    assert!(pending.iter().all(|a| a.status == ActionStatus::Queued && a.attempts == 0));
    assert_eq!(engine.sync_status().pending_count, 3);

    let health = engine.health_check().await.unwrap();
    assert!(health.store_bytes.unwrap_or(0) > 0);
}

#[tokio::test]
async fn test_enqueue_without_clean_shutdown_is_durable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crash.db").to_string_lossy().to_string();
    let config = EngineConfig {
        store_path: Some(path),
        start_online: false,
        ..test_config()
    };

    let id = {
        let engine = start_engine(config.clone(), ScriptedRemote::new()).await;
        engine.enqueue_action("note.create", json!({"text": "hi"})).await.unwrap()
        // dropped without shutdown
    };

    let engine = start_engine(config, ScriptedRemote::new()).await;
    let pending = engine.list_pending_actions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_id, id);
    assert_eq!(pending[0].payload, json!({"text": "hi"}));
}

#[tokio::test]
async fn test_pending_quota() {
    let config = EngineConfig { max_pending_actions: Some(2), ..test_config() };
    let engine = start_engine(config, ScriptedRemote::new()).await;

    engine.enqueue_action("a", json!({})).await.unwrap();
    engine.enqueue_action("b", json!({})).await.unwrap();
    let err = engine.enqueue_action("c", json!({})).await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(StorageError::QuotaExceeded(_))));
    assert_eq!(engine.sync_status().pending_count, 2);
}

// =============================================================================
// Sync processor
// =============================================================================

#[tokio::test]
async fn test_concurrent_triggers_single_flight() {
    let remote = ScriptedRemote::slow(Duration::from_millis(20));
    let engine = start_engine(test_config(), remote.clone()).await;
    for i in 0..4 {
        engine.enqueue_action("progress", json!({"step": i})).await.unwrap();
    }

    let (first, second) = tokio::join!(engine.trigger_sync(), engine.trigger_sync());
    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(outcomes.iter().filter(|o| matches!(o, TriggerOutcome::Ran(_))).count(), 1);
    assert!(outcomes.contains(&TriggerOutcome::Coalesced));

    let keys = remote.keys();
    let unique: HashSet<Uuid> = keys.iter().copied().collect();
    assert_eq!(keys.len(), 4);
    assert_eq!(unique.len(), 4);
}

#[tokio::test]
async fn test_retryable_failures_reach_failed_at_max_attempts() {
    let remote = ScriptedRemote::new();
    remote.fail_always("flaky", RemoteError::Retryable("connection reset".into()));
    let config = EngineConfig { base_delay_ms: 1, max_delay_ms: 2, max_attempts: 3, ..test_config() };
    let engine = start_engine(config, remote.clone()).await;
    let id = engine.enqueue_action("flaky", json!({})).await.unwrap();

    for n in 1..=3u32 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.trigger_sync().await.unwrap();

        let action = engine.list_pending_actions().await.unwrap().into_iter().find(|a| a.action_id == id).unwrap();
        assert_eq!(action.attempts, n);
        if n < 3 {
            assert_eq!(action.status, ActionStatus::Queued);
        } else {
            assert_eq!(action.status, ActionStatus::Failed);
        }
    }

    // Failed is never retried silently
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.trigger_sync().await.unwrap();
    assert_eq!(remote.keys().len(), 3);
    assert_eq!(engine.sync_status().failed_count, 1);
    assert_eq!(engine.sync_status().pending_count, 0);
}

#[tokio::test]
async fn test_permanent_rejection_then_requeue() {
    let remote = ScriptedRemote::new();
    remote.fail_next("post.create", RemoteError::from_status(422, "title required"));
    let engine = start_engine(test_config(), remote.clone()).await;
    let id = engine.enqueue_action("post.create", json!({"title": ""})).await.unwrap();

    engine.trigger_sync().await.unwrap();
    let failed = engine.list_failed_actions().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 1);
    assert!(failed[0].last_error.as_deref().unwrap_or("").contains("422"));

    let requeued = engine.requeue_failed(id).await.unwrap();
    assert_eq!(requeued.status, ActionStatus::Queued);
    assert_eq!(requeued.attempts, 0);

    engine.trigger_sync().await.unwrap();
    assert!(engine.list_pending_actions().await.unwrap().is_empty());
    assert_eq!(remote.keys(), vec![id, id]);
}

#[tokio::test]
async fn test_discard_failed_action() {
    let remote = ScriptedRemote::new();
    remote.fail_next("bad", RemoteError::Permanent("nope".into()));
    let engine = start_engine(test_config(), remote).await;
    let id = engine.enqueue_action("bad", json!({})).await.unwrap();

    assert!(matches!(
        engine.discard_failed(id).await,
        Err(SyncError::InvalidTransition { status: ActionStatus::Queued, .. })
    ));

    engine.trigger_sync().await.unwrap();
    let discarded = engine.discard_failed(id).await.unwrap();
    assert_eq!(discarded.action_id, id);
    assert!(engine.list_failed_actions().await.unwrap().is_empty());
    assert!(matches!(engine.requeue_failed(id).await, Err(SyncError::UnknownAction(u)) if u == id));
}

#[tokio::test]
async fn test_partial_failure_isolation() {
    let remote = ScriptedRemote::new();
    remote.fail_next("a", RemoteError::Retryable("503".into()));
    let engine = start_engine(test_config(), remote.clone()).await;
    let a = engine.enqueue_action("a", json!({})).await.unwrap();
    engine.enqueue_action("b", json!({})).await.unwrap();
    engine.enqueue_action("c", json!({})).await.unwrap();

    engine.trigger_sync().await.unwrap();

    let remaining = engine.list_pending_actions().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].action_id, a);
    assert_eq!(remaining[0].status, ActionStatus::Queued);
    assert_eq!(remote.kinds(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_same_resource_ordering_across_failures() {
    let remote = ScriptedRemote::new();
    remote.fail_next("progress.start", RemoteError::Retryable("timeout".into()));
    let config = EngineConfig { base_delay_ms: 1, max_delay_ms: 2, ..test_config() };
    let engine = start_engine(config, remote.clone()).await;

    engine.enqueue_action_for("progress.start", Some("room:3"), json!({})).await.unwrap();
    engine.enqueue_action_for("progress.complete", Some("room:3"), json!({})).await.unwrap();

    engine.trigger_sync().await.unwrap();
    assert_eq!(remote.kinds(), vec!["progress.start"]);

    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.trigger_sync().await.unwrap();
    assert_eq!(remote.kinds(), vec!["progress.start", "progress.start", "progress.complete"]);
}

#[tokio::test]
async fn test_offline_scenario_then_reconnect() {
    let remote = ScriptedRemote::new();
    remote.fail_next("b", RemoteError::Retryable("network unreachable".into()));
    let config = EngineConfig { start_online: false, ..test_config() };
    let engine = start_engine(config, remote.clone()).await;

    engine.enqueue_action("a", json!({})).await.unwrap();
    let b = engine.enqueue_action("b", json!({})).await.unwrap();
    engine.enqueue_action("c", json!({})).await.unwrap();

    let snapshot = engine.sync_status();
    assert_eq!(snapshot.pending_count, 3);
    assert!(!snapshot.is_syncing);

    // Offline trigger submits nothing
    let TriggerOutcome::Ran(report) = engine.trigger_sync().await.unwrap() else {
        panic!("no other flight can be running while offline");
    };
    assert!(report.skipped_offline);
    assert!(remote.keys().is_empty());

    engine.set_online(true).unwrap();
    engine.trigger_sync().await.unwrap();
    wait_for_status(&engine, |s| !s.is_syncing && s.pending_count == 1).await;

    assert_eq!(remote.kinds(), vec!["a", "b", "c"]);
    let pending = engine.list_pending_actions().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_id, b);
    assert_eq!(pending[0].attempts, 1);
}

#[tokio::test]
async fn test_enqueue_triggers_background_sync_when_online() {
    let remote = ScriptedRemote::new();
    let config = EngineConfig { sync_on_enqueue: true, ..test_config() };
    let engine = start_engine(config, remote.clone()).await;

    engine.enqueue_action("bookmark.add", json!({"verse": "Ps 23:1"})).await.unwrap();
    wait_for_status(&engine, |s| s.pending_count == 0 && !s.is_syncing).await;
    assert_eq!(remote.kinds(), vec!["bookmark.add"]);
}

#[tokio::test]
async fn test_enqueue_while_offline_does_not_sync() {
    let remote = ScriptedRemote::new();
    let config = EngineConfig { sync_on_enqueue: true, start_online: false, ..test_config() };
    let engine = start_engine(config, remote.clone()).await;

    engine.enqueue_action("a", json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(remote.keys().is_empty());
    assert!(!engine.is_online());

    engine.set_online(true).unwrap();
    wait_for_status(&engine, |s| s.pending_count == 0 && !s.is_syncing).await;
    assert_eq!(remote.kinds(), vec!["a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connectivity_signal_from_host_thread() {
    let remote = ScriptedRemote::new();
    let config = EngineConfig { start_online: false, ..test_config() };
    let engine = Arc::new(start_engine(config, remote.clone()).await);
    engine.enqueue_action("a", json!({})).await.unwrap();

    let host = engine.clone();
    std::thread::spawn(move || host.set_online(true))
        .join()
        .expect("connectivity callback panicked")
        .unwrap();

    wait_for_status(&engine, |s| s.is_synced()).await;
    assert_eq!(remote.kinds(), vec!["a"]);
}

// =============================================================================
// Status observers
// =============================================================================

#[tokio::test]
async fn test_subscriber_mid_cycle_sees_syncing() {
    let remote = ScriptedRemote::slow(Duration::from_millis(50));
    let engine = Arc::new(start_engine(test_config(), remote).await);
    for kind in ["a", "b", "c"] {
        engine.enqueue_action(kind, json!({})).await.unwrap();
    }

    let runner = engine.clone();
    let cycle = tokio::spawn(async move { runner.trigger_sync().await });
    wait_for_status(&engine, |s| s.is_syncing).await;

    let seen: Arc<Mutex<Vec<SyncSnapshot>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = engine.subscribe_sync_status(move |s| sink.lock().push(*s));
    {
        let first = seen.lock()[0];
        assert!(first.is_syncing);
        assert!(first.pending_count > 0);
    }

    cycle.await.unwrap().unwrap();
    let last = *seen.lock().last().unwrap();
    assert!(last.is_synced());
    subscription.unsubscribe();
}

#[tokio::test]
async fn test_listener_can_drive_engine_when_sync_settles() {
    let remote = ScriptedRemote::new();
    let engine = Arc::new(start_engine(test_config(), remote.clone()).await);
    engine.enqueue_action("a", json!({})).await.unwrap();

    let weak = Arc::downgrade(&engine);
    let reentered = Arc::new(Mutex::new(0usize));
    let count = reentered.clone();
    let _subscription = engine.subscribe_sync_status(move |s| {
        if s.is_synced() {
            if let Some(engine) = weak.upgrade() {
                let mut count = count.lock();
                if *count == 0 {
                    *count += 1;
                    engine.set_online(false).unwrap();
                    engine.set_online(true).unwrap();
                }
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(5), engine.trigger_sync())
        .await
        .expect("sync deadlocked")
        .unwrap();
    assert_eq!(*reentered.lock(), 1);
    assert_eq!(remote.kinds(), vec!["a"]);

    // Publishing keeps working afterwards
    engine.enqueue_action("b", json!({})).await.unwrap();
    assert_eq!(engine.sync_status().pending_count, 1);
}

#[tokio::test]
async fn test_every_log_mutation_is_broadcast() {
    let engine = start_engine(test_config(), ScriptedRemote::new()).await;
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = engine.subscribe_sync_status(move |s| sink.lock().push(s.pending_count));

    engine.enqueue_action("a", json!({})).await.unwrap();
    engine.enqueue_action("b", json!({})).await.unwrap();
    engine.trigger_sync().await.unwrap();

    let seen = seen.lock();
    assert_eq!(seen.first(), Some(&0));
    assert!(seen.contains(&1));
    assert!(seen.contains(&2));
    assert_eq!(seen.last(), Some(&0));
}

// =============================================================================
// Run loop
// =============================================================================

#[tokio::test]
async fn test_run_loop_retries_after_backoff() {
    let remote = ScriptedRemote::new();
    remote.fail_next("a", RemoteError::Retryable("503".into()));
    let config = EngineConfig { base_delay_ms: 5, max_delay_ms: 10, retry_poll_ms: 5, ..test_config() };
    let engine = Arc::new(start_engine(config, remote.clone()).await);
    engine.enqueue_action("a", json!({})).await.unwrap();

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run().await });

    wait_for_status(&engine, |s| s.pending_count == 0 && !s.is_syncing).await;
    assert_eq!(remote.kinds(), vec!["a", "a"]);

    engine.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_run_loop_applies_config_updates() {
    let config = test_config();
    let (tx, rx) = watch::channel(config.clone());
    let remote = ScriptedRemote::new();
    let mut engine = SyncEngine::new(config.clone(), rx, remote.clone());
    engine.start().await.unwrap();
    let engine = Arc::new(engine);

    let runner = engine.clone();
    let run = tokio::spawn(async move { runner.run().await });

    let mut state_rx = engine.state_receiver();
    tokio::time::timeout(Duration::from_secs(5), state_rx.wait_for(|s| *s == EngineState::Running))
        .await
        .unwrap()
        .unwrap();

    tx.send(EngineConfig { sync_on_enqueue: true, ..config }).unwrap();
    // Give the loop a moment to pick up the change
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.enqueue_action("a", json!({})).await.unwrap();
    wait_for_status(&engine, |s| s.pending_count == 0 && !s.is_syncing).await;
    assert_eq!(remote.kinds(), vec!["a"]);

    engine.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
}
