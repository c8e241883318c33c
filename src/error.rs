// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine-level errors.
//!
//! Storage failures are carried through unchanged in [`SyncError::Storage`].
//! Remote failures never appear here: they are classified once by the sync
//! processor and recorded on the action itself.

use thiserror::Error;
use uuid::Uuid;

use crate::actions::ActionStatus;
use crate::coordinator::EngineState;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Action {0} is not in the log")]
    UnknownAction(Uuid),

    #[error("Action {action_id} is {status}, expected {expected}")]
    InvalidTransition {
        action_id: Uuid,
        status: ActionStatus,
        expected: ActionStatus,
    },

    #[error("Engine is not started (state: {0})")]
    NotStarted(EngineState),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl SyncError {
    /// The underlying storage failure, if any.
    #[must_use]
    pub fn as_storage(&self) -> Option<&StorageError> {
        match self {
            Self::Storage(e) => Some(e),
            _ => None,
        }
    }
}
