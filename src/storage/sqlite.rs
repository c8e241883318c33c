// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite backend for the durable store.
//!
//! Each logical table maps to one physical table of the same shape:
//! ```sql
//! CREATE TABLE content_cache (
//!   key TEXT PRIMARY KEY,
//!   value BLOB NOT NULL,
//!   updated_at INTEGER NOT NULL   -- epoch millis of the last write
//! )
//! ```
//!
//! The database runs in WAL journal mode with `synchronous = FULL`, so a
//! write that returned `Ok` survives a process crash or power loss.
//!
//! Error mapping:
//! - `SQLITE_FULL` (including a `max_page_count` quota) → [`StorageError::QuotaExceeded`]
//! - `SQLITE_CORRUPT` / `SQLITE_NOTADB` → [`StorageError::Corruption`]
//! - everything else → [`StorageError::Backend`]

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use sqlx::Row;
use std::borrow::Cow;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{DurableStore, StorageError, Table};
use crate::resilience::retry::{retry, RetryConfig};
use crate::time::now_millis;

const PAGE_SIZE: u32 = 4096;

const SQLITE_CORRUPT: i32 = 11;
const SQLITE_FULL: i32 = 13;
const SQLITE_NOTADB: i32 = 26;

pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (or create) a store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::with_max_bytes(path, None).await
    }

    /// Open a store whose database file may not grow beyond `max_bytes`.
    pub async fn with_max_bytes(
        path: impl AsRef<Path>,
        max_bytes: Option<u64>,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().to_string();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::Backend(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let mut options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .page_size(PAGE_SIZE)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5));
        if let Some(max) = max_bytes {
            let pages = (max / u64::from(PAGE_SIZE)).max(1);
            options = options.pragma("max_page_count", Cow::<'static, str>::Owned(pages.to_string()));
        }

        info!(path = %path_str, ?max_bytes, "Opening durable store");

        let pool = retry("sqlite_open", &RetryConfig::startup(), || {
            let options = options.clone();
            async move {
                SqlitePoolOptions::new()
                    .max_connections(4)
                    .acquire_timeout(Duration::from_secs(10))
                    .connect_with(options)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            }
        })
        .await?;

        let store = Self { pool, path: path_str };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for table in [Table::Content, Table::Actions] {
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL,
                    updated_at INTEGER NOT NULL
                )",
                table.name()
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(e, table.name()))?;
        }
        Ok(())
    }

    /// Path to the database file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get the database file size in bytes.
    pub fn file_size_bytes(&self) -> std::io::Result<u64> {
        std::fs::metadata(&self.path).map(|m| m.len())
    }

    /// Run a WAL checkpoint to fold the journal back into the main file.
    pub async fn checkpoint(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, &self.path))?;
        debug!(path = %self.path, "Store checkpoint completed");
        Ok(())
    }

    /// Close the pool, waiting for connections to finish.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn decode_rows(
        table: Table,
        rows: Vec<sqlx::sqlite::SqliteRow>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(|e| StorageError::Corruption {
                    key: table.name().to_string(),
                    reason: format!("unreadable key column: {}", e),
                })?;
                let value: Vec<u8> = row.try_get("value").map_err(|e| StorageError::Corruption {
                    key: key.clone(),
                    reason: format!("unreadable value column: {}", e),
                })?;
                Ok((key, value))
            })
            .collect()
    }
}

/// Classify an sqlx error by its SQLite primary result code.
fn map_sqlx_error(err: sqlx::Error, key: &str) -> StorageError {
    let code = err
        .as_database_error()
        .and_then(|db| db.code())
        .and_then(|code| code.parse::<i32>().ok())
        // Extended codes carry the primary code in the low byte
        .map(|code| code & 0xff);

    match code {
        Some(SQLITE_FULL) => StorageError::QuotaExceeded(err.to_string()),
        Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB) => StorageError::Corruption {
            key: key.to_string(),
            reason: err.to_string(),
        },
        _ => StorageError::Backend(err.to_string()),
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let sql = format!("SELECT value FROM {} WHERE key = ?", table.name());
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, key))?;

        match row {
            Some(row) => {
                let value: Vec<u8> = row.try_get("value").map_err(|e| StorageError::Corruption {
                    key: key.to_string(),
                    reason: format!("unreadable value column: {}", e),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, table: Table, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let sql = format!(
            "INSERT INTO {} (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            table.name()
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(value)
            .bind(now_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, key))?;
        Ok(())
    }

    async fn delete(&self, table: Table, key: &str) -> Result<(), StorageError> {
        let sql = format!("DELETE FROM {} WHERE key = ?", table.name());
        sqlx::query(&sql)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, key))?;
        Ok(())
    }

    async fn get_all(&self, table: Table) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let sql = format!("SELECT key, value FROM {} ORDER BY key", table.name());
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, table.name()))?;
        Self::decode_rows(table, rows)
    }

    async fn exists(&self, table: Table, key: &str) -> Result<bool, StorageError> {
        let sql = format!("SELECT 1 FROM {} WHERE key = ? LIMIT 1", table.name());
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, key))?;
        Ok(row.is_some())
    }

    async fn get_all_with_prefix(
        &self,
        table: Table,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        // substr() instead of LIKE so '%' and '_' in keys need no escaping
        let sql = format!(
            "SELECT key, value FROM {} WHERE substr(key, 1, ?) = ? ORDER BY key",
            table.name()
        );
        let rows = sqlx::query(&sql)
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(e, prefix))?;
        Self::decode_rows(table, rows)
    }
}
