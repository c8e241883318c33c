// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic offline-sync usage example.
//!
//! Demonstrates:
//! 1. Opening a SQLite-backed engine
//! 2. Caching fetched content and reading it back
//! 3. Recording actions while offline
//! 4. Reconnecting and draining the queue (with one flaky and one invalid action)
//! 5. Remediating a failed action
//! 6. Displaying metrics and clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use offline_sync::{
    CacheKey, ContentKind, EngineConfig, EngineState, RemoteError, RemoteService, SyncEngine,
    TriggerOutcome,
};
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

/// Pretend backend: first `progress.*` submission times out, `post.delete` is invalid.
#[derive(Default)]
struct DemoBackend {
    progress_calls: AtomicU32,
}

#[async_trait]
impl RemoteService for DemoBackend {
    async fn submit(&self, kind: &str, payload: &Value, key: Uuid) -> Result<(), RemoteError> {
        println!("   │  → POST {} {} (Idempotency-Key: {})", kind, payload, key);
        if kind.starts_with("progress.") && self.progress_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(RemoteError::from_status(503, "upstream unavailable"));
        }
        if kind == "post.delete" {
            return Err(RemoteError::from_status(404, "post not found"));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install metrics recorder (captures all metrics for export)
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "offline_sync=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           offline-sync: Basic Usage Example                   ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let dir = tempfile::tempdir()?;
    let db_path = dir.path().join("offline.db");

    let config = EngineConfig {
        store_path: Some(db_path.to_string_lossy().into_owned()),
        // Retry quickly for the demo
        base_delay_ms: 50,
        max_delay_ms: 500,
        max_attempts: 3,
        // Drive sync explicitly below
        sync_on_enqueue: false,
        ..Default::default()
    };

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let backend = Arc::new(DemoBackend::default());
    let mut engine = SyncEngine::new(config, config_rx, backend);

    println!("📦 Starting engine at {}", db_path.display());
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Ready);
    println!("   ✅ Engine ready! State: {}", engine.state());

    let _subscription = engine.subscribe_sync_status(|s| {
        println!(
            "   │  ◆ status: pending={} failed={} syncing={}",
            s.pending_count, s.failed_count, s.is_syncing
        );
    });

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Cache content for offline reading
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Caching content...");
    engine
        .cache_content(ContentKind::Chapter, "john-3", Some("kjv"), json!({"verses": 36}))
        .await?;
    engine
        .cache_content(ContentKind::Chapter, "john-3", Some("web"), json!({"verses": 36}))
        .await?;
    engine
        .cache_content(ContentKind::Floor, "1", None, json!({"rooms": [1, 2, 3]}))
        .await?;

    let key = CacheKey::new(ContentKind::Chapter, "john-3").with_variant("kjv");
    if let Some(entry) = engine.get_content(&key).await? {
        println!("   └─ {} → {} (cached {})", entry.key, entry.payload, entry.age_display());
    }
    let chapters = engine.list_content(&ContentKind::Chapter).await?;
    println!("   └─ {} chapter(s) available offline", chapters.len());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Act while offline
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n✈️  Going offline and recording actions...");
    engine.set_online(false)?;
    engine.enqueue_action_for("progress.start", Some("room:4"), json!({"room": 4})).await?;
    engine.enqueue_action_for("progress.complete", Some("room:4"), json!({"room": 4})).await?;
    let doomed = engine.enqueue_action("post.delete", json!({"post": 99})).await?;
    engine.enqueue_action("note.create", json!({"text": "hello"})).await?;

    if let TriggerOutcome::Ran(report) = engine.trigger_sync().await? {
        println!("   └─ Sync while offline: skipped={}", report.skipped_offline);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Reconnect and drain
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📶 Back online, draining queue...");
    engine.set_online(true)?;
    for round in 1..=3 {
        if let TriggerOutcome::Ran(report) = engine.trigger_sync().await? {
            println!(
                "   └─ Round {}: submitted={} ok={} retried={} rejected={} deferred={}",
                round, report.submitted, report.succeeded, report.retried, report.rejected, report.deferred
            );
        }
        if engine.sync_status().pending_count == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Remediate failures
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩹 Failed actions:");
    for action in engine.list_failed_actions().await? {
        println!(
            "   └─ {} ({}) attempts={} error={}",
            action.kind,
            action.action_id,
            action.attempts,
            action.last_error.as_deref().unwrap_or("-")
        );
    }
    engine.discard_failed(doomed).await?;
    println!("   └─ Discarded {}", doomed);

    let health = engine.health_check().await?;
    println!("\n🩺 Health: healthy={} {:?}", health.healthy(), health);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Dump raw metrics and shut down
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    println!("\n🛑 Shutting down...");
    engine.shutdown().await;
    println!("   ✅ Shutdown complete! State: {}", engine.state());

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics grouped by type
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                histograms.push((name, label_str, count, sum));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, sum) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
