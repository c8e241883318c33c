// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Status observer channel.
//!
//! Fans out [`SyncSnapshot`]s to any number of UI surfaces. Two ways to
//! observe:
//! - [`StatusChannel::subscribe`]: callback invoked immediately with the
//!   current snapshot, then synchronously on every change, in subscription order
//! - [`StatusChannel::receiver`]: a `tokio::sync::watch` receiver for async
//!   consumers
//!
//! Snapshots are pushed only when a field actually changes.

use std::sync::{Arc, Weak};
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

/// Aggregate sync status, derived from the action log and the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncSnapshot {
    /// Actions not yet confirmed by the remote service (queued or in flight)
    pub pending_count: usize,
    /// Actions parked in `Failed`, waiting for a retry or discard decision
    pub failed_count: usize,
    /// A sync cycle is currently submitting actions
    pub is_syncing: bool,
}

impl SyncSnapshot {
    /// Nothing left to send and nothing in progress.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.pending_count == 0 && !self.is_syncing
    }
}

type Listener = Arc<dyn Fn(&SyncSnapshot) + Send + Sync>;

struct Inner {
    snapshot: SyncSnapshot,
    listeners: Vec<(u64, Listener)>,
    next_id: u64,
}

pub struct StatusChannel {
    inner: Mutex<Inner>,
    /// Serializes broadcasts so listeners see snapshots in mutation order.
    /// Reentrant so a listener may subscribe from inside its callback.
    emit: ReentrantMutex<()>,
    tx: watch::Sender<SyncSnapshot>,
}

impl StatusChannel {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncSnapshot::default());
        Self {
            inner: Mutex::new(Inner {
                snapshot: SyncSnapshot::default(),
                listeners: Vec::new(),
                next_id: 0,
            }),
            emit: ReentrantMutex::new(()),
            tx,
        }
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.lock().snapshot
    }

    /// Register `listener`. It is called right away with the current snapshot.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or [`Subscription::unsubscribe`] is called.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&SyncSnapshot) + Send + Sync + 'static,
    {
        let _emit = self.emit.lock();
        let listener: Listener = Arc::new(listener);
        let (id, snapshot) = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.listeners.push((id, listener.clone()));
            (id, inner.snapshot)
        };
        trace!(listener = id, ?snapshot, "Status listener subscribed");
        listener(&snapshot);

        Subscription {
            id: Some(id),
            channel: Arc::downgrade(self),
        }
    }

    /// Watch receiver for async consumers.
    #[must_use]
    pub fn receiver(&self) -> watch::Receiver<SyncSnapshot> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    fn remove(&self, id: u64) {
        let _emit = self.emit.lock();
        self.inner.lock().listeners.retain(|(listener_id, _)| *listener_id != id);
        trace!(listener = id, "Status listener unsubscribed");
    }

    /// Publish new log counts.
    pub(crate) fn set_counts(&self, pending_count: usize, failed_count: usize) {
        self.update(|s| {
            s.pending_count = pending_count;
            s.failed_count = failed_count;
        });
    }

    /// Publish the processor's syncing flag.
    pub(crate) fn set_syncing(&self, is_syncing: bool) {
        self.update(|s| s.is_syncing = is_syncing);
    }

    fn update(&self, apply: impl FnOnce(&mut SyncSnapshot)) {
        let _emit = self.emit.lock();
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock();
            let mut next = inner.snapshot;
            apply(&mut next);
            if next == inner.snapshot {
                return;
            }
            inner.snapshot = next;
            let listeners: Vec<Listener> = inner.listeners.iter().map(|(_, l)| l.clone()).collect();
            (next, listeners)
        };

        crate::metrics::set_sync_snapshot(&snapshot);
        self.tx.send_replace(snapshot);
        for listener in listeners {
            listener(&snapshot);
        }
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`StatusChannel::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    id: Option<u64>,
    channel: Weak<StatusChannel>,
}

impl Subscription {
    /// Stop receiving snapshots.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    /// Keep the listener registered for the lifetime of the channel.
    pub fn detach(mut self) {
        self.id = None;
    }

    fn release(&mut self) {
        if let (Some(id), Some(channel)) = (self.id.take(), self.channel.upgrade()) {
            channel.remove(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
