// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use super::traits::{DurableStore, StorageError, Table};

/// Process-local store. Nothing survives a restart; used for ephemeral
/// engines and tests.
pub struct InMemoryStore {
    content: DashMap<String, Vec<u8>>,
    actions: DashMap<String, Vec<u8>>,
    /// Sum of value lengths across both tables
    bytes: AtomicUsize,
    /// Optional byte quota (None = unbounded)
    max_bytes: Option<usize>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            content: DashMap::new(),
            actions: DashMap::new(),
            bytes: AtomicUsize::new(0),
            max_bytes: None,
        }
    }

    /// Store that rejects writes once `max_bytes` of values are held.
    #[must_use]
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            max_bytes: Some(max_bytes),
            ..Self::new()
        }
    }

    fn table(&self, table: Table) -> &DashMap<String, Vec<u8>> {
        match table {
            Table::Content => &self.content,
            Table::Actions => &self.actions,
        }
    }

    /// Get current item count in a table
    #[must_use]
    pub fn len(&self, table: Table) -> usize {
        self.table(table).len()
    }

    /// Check if both tables are empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.actions.is_empty()
    }

    /// Bytes currently held
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    fn release_bytes(&self, len: usize) {
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| Some(held.saturating_sub(len)));
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.table(table).get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, table: Table, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let map = self.table(table);
        if let Some(max) = self.max_bytes {
            let old_len = map.get(key).map_or(0, |v| v.len());
            let projected = self
                .bytes
                .load(Ordering::Acquire)
                .saturating_add(value.len())
                .saturating_sub(old_len);
            if projected > max {
                return Err(StorageError::QuotaExceeded(format!(
                    "{} bytes would exceed limit of {}",
                    projected, max
                )));
            }
        }
        self.bytes.fetch_add(value.len(), Ordering::AcqRel);
        if let Some(old) = map.insert(key.to_string(), value.to_vec()) {
            self.release_bytes(old.len());
        }
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StorageError> {
        if let Some((_, old)) = self.table(table).remove(key) {
            self.release_bytes(old.len());
        }
        Ok(())
    }

    async fn get_all(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut rows: Vec<(String, Vec<u8>)> = self
            .table(table)
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(rows)
    }

    async fn exists(&self, table: Table, key: &str) -> Result<bool, StorageError> {
        Ok(self.table(table).contains_key(key))
    }
}
