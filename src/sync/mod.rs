// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background synchronization of the pending action log.

pub mod processor;

pub use processor::{CycleReport, SyncProcessor, TriggerOutcome};
