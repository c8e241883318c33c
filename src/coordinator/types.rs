// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine coordinator.

use serde::Serialize;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check the current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Opening the store and recovering the action log
    Recovering,
    /// Ready to accept calls
    Ready,
    /// Maintenance loop running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Recovering => write!(f, "Recovering"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Point-in-time view of the engine, for diagnostics screens and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    pub online: bool,
    pub syncing: bool,
    pub queued_actions: usize,
    pub in_flight_actions: usize,
    pub failed_actions: usize,
    /// Undecodable action rows set aside at load
    pub corrupt_actions: usize,
    /// Database file size (None for the in-memory store)
    pub store_bytes: Option<u64>,
}

impl HealthCheck {
    /// Started, nothing is stuck in `Failed` and no record is quarantined.
    #[must_use]
    pub fn healthy(&self) -> bool {
        matches!(self.state, EngineState::Ready | EngineState::Running)
            && self.failed_actions == 0
            && self.corrupt_actions == 0
    }
}
