// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable store contract shared by the in-memory and SQLite backends.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record for '{key}': {reason}")]
    Corruption {
        key: String,
        reason: String,
    },
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
}

impl StorageError {
    /// Short label used for metrics and log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend(_) => "backend",
            Self::Corruption { .. } => "corruption",
            Self::QuotaExceeded(_) => "quota",
        }
    }
}

/// Logical tables held by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Cached content blobs keyed by canonical cache key.
    Content,
    /// Pending actions keyed by action id.
    Actions,
}

impl Table {
    /// Physical table name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Content => "content_cache",
            Self::Actions => "pending_actions",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Key/value persistence. Every operation is atomic per key.
///
/// This is the only layer that touches the local persistence medium; the
/// content cache and the action log are pure logic over it.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    /// Upsert. Returns once the value is durable.
    async fn put(&self, table: Table, key: &str, value: &[u8]) -> Result<(), StorageError>;
    /// Deleting an absent key is not an error.
    async fn delete(&self, table: Table, key: &str) -> Result<(), StorageError>;
    /// All `(key, value)` pairs in the table, ordered by key.
    async fn get_all(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

    async fn exists(&self, table: Table, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(table, key).await?.is_some())
    }

    /// Pairs whose key starts with `prefix`.
    /// Default implementation filters [`get_all`](Self::get_all).
    async fn get_all_with_prefix(
        &self,
        table: Table,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .get_all(table)
            .await?
            .into_iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .collect())
    }
}
