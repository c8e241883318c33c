// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store backends.
//!
//! - [`sqlite::SqliteStore`]: file-backed, survives restarts
//! - [`memory::InMemoryStore`]: process-local, for ephemeral engines and tests

pub mod traits;
pub mod memory;
pub mod sqlite;
