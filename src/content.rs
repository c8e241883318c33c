// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content cache: the offline read path.
//!
//! Content is addressed by a [`CacheKey`] `(kind, id, variant)`. Keys are
//! flattened to a canonical string (`kind:id[:variant]`, with `%` and `:`
//! percent-escaped inside components) and that string alone defines equality.
//!
//! The cache never fetches. A miss is `Ok(None)`; populating on miss is up to
//! the caller, which owns the network fetch.
//!
//! # Example
//!
//! ```
//! use offline_sync::{CacheKey, ContentKind};
//!
//! let key = CacheKey::new(ContentKind::Chapter, "John:3").with_variant("KJV");
//! assert_eq!(key.canonical(), "chapter:John%3A3:KJV");
//! assert_eq!(CacheKey::parse("chapter:John%3A3:KJV").unwrap(), key);
//! ```

use std::sync::Arc;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::traits::{DurableStore, StorageError, Table};
use crate::time::now_millis;

/// Kind of cached content.
#[derive(Debug, Clone)]
pub enum ContentKind {
    Chapter,
    Floor,
    Room,
    Course,
    Post,
    Other(String),
}

impl ContentKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Chapter => "chapter",
            Self::Floor => "floor",
            Self::Room => "room",
            Self::Course => "course",
            Self::Post => "post",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for ContentKind {
    fn from(kind: &str) -> Self {
        match kind {
            "chapter" => Self::Chapter,
            "floor" => Self::Floor,
            "room" => Self::Room,
            "course" => Self::Course,
            "post" => Self::Post,
            other => Self::Other(other.to_string()),
        }
    }
}

impl PartialEq for ContentKind {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for ContentKind {}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite identity of a cached item.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub kind: ContentKind,
    /// Domain identifier, e.g. book and chapter number
    pub id: String,
    /// Optional qualifier, e.g. translation
    pub variant: Option<String>,
}

fn escape(component: &str) -> String {
    component.replace('%', "%25").replace(':', "%3A")
}

fn unescape(component: &str) -> Result<String, String> {
    let mut out = String::with_capacity(component.len());
    let mut rest = component;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3).ok_or("truncated escape")?;
        match code {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            other => return Err(format!("unknown escape %{}", other)),
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Ok(out)
}

impl CacheKey {
    pub fn new(kind: ContentKind, id: impl Into<String>) -> Self {
        Self { kind, id: id.into(), variant: None }
    }

    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Canonical string form. Two keys are equal iff their canonical forms are.
    #[must_use]
    pub fn canonical(&self) -> String {
        let mut key = format!("{}:{}", escape(self.kind.as_str()), escape(&self.id));
        if let Some(ref variant) = self.variant {
            key.push(':');
            key.push_str(&escape(variant));
        }
        key
    }

    /// Store prefix shared by every key of `kind`.
    #[must_use]
    pub fn kind_prefix(kind: &ContentKind) -> String {
        format!("{}:", escape(kind.as_str()))
    }

    /// Inverse of [`canonical`](Self::canonical).
    pub fn parse(canonical: &str) -> Result<Self, StorageError> {
        let corrupt = |reason: String| StorageError::Corruption {
            key: canonical.to_string(),
            reason,
        };
        let parts: Vec<&str> = canonical.split(':').collect();
        let (kind, id, variant) = match parts.as_slice() {
            [kind, id] => (*kind, *id, None),
            [kind, id, variant] => (*kind, *id, Some(*variant)),
            _ => return Err(corrupt(format!("expected 2 or 3 components, got {}", parts.len()))),
        };
        Ok(Self {
            kind: ContentKind::from(unescape(kind).map_err(corrupt)?.as_str()),
            id: unescape(id).map_err(corrupt)?,
            variant: variant.map(unescape).transpose().map_err(corrupt)?,
        })
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for CacheKey {}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CacheKey::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub payload: Value,
    /// Epoch millis of the write
    pub cached_at: i64,
}

/// On-disk shape; the key lives in the store key.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    payload: Value,
    cached_at: i64,
}

impl CacheEntry {
    pub fn age_minutes(&self) -> i64 {
        (now_millis() - self.cached_at) / 60_000
    }

    /// Human readable age for "available offline" indicators.
    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew (negative age)
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

/// Read path over the durable store's content table.
pub struct ContentCache {
    store: Arc<dyn DurableStore>,
}

impl ContentCache {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Upsert `payload` under `key`. Last completed write wins.
    pub async fn cache(&self, key: &CacheKey, payload: Value) -> Result<CacheEntry, StorageError> {
        let canonical = key.canonical();
        let stored = StoredEntry { payload, cached_at: now_millis() };
        let bytes = serde_json::to_vec(&stored).map_err(|e| StorageError::Backend(format!(
            "Failed to encode cache entry {}: {}",
            canonical, e
        )))?;

        if let Err(e) = self.store.put(Table::Content, &canonical, &bytes).await {
            warn!(key = %canonical, error = %e, "Failed to cache content");
            crate::metrics::record_storage_error("content", "put", e.kind());
            return Err(e);
        }

        debug!(key = %canonical, bytes = bytes.len(), "Content cached");
        crate::metrics::record_content_operation("put", "success");
        crate::metrics::record_content_bytes(bytes.len());

        Ok(CacheEntry {
            key: key.clone(),
            payload: stored.payload,
            cached_at: stored.cached_at,
        })
    }

    /// Cached entry for `key`, or `None` when not yet cached.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, StorageError> {
        let canonical = key.canonical();
        match self.store.get(Table::Content, &canonical).await? {
            Some(bytes) => {
                crate::metrics::record_content_operation("get", "hit");
                Ok(Some(Self::decode(key.clone(), &canonical, &bytes)?))
            }
            None => {
                crate::metrics::record_content_operation("get", "miss");
                Ok(None)
            }
        }
    }

    /// Existence check without decoding the payload.
    pub async fn has(&self, key: &CacheKey) -> Result<bool, StorageError> {
        self.store.exists(Table::Content, &key.canonical()).await
    }

    /// Every cached entry of `kind`, ordered by canonical key.
    pub async fn list_by_kind(&self, kind: &ContentKind) -> Result<Vec<CacheEntry>, StorageError> {
        let rows = self
            .store
            .get_all_with_prefix(Table::Content, &CacheKey::kind_prefix(kind))
            .await?;

        rows.into_iter()
            .map(|(canonical, bytes)| {
                let key = CacheKey::parse(&canonical)?;
                Self::decode(key, &canonical, &bytes)
            })
            .collect()
    }

    /// Number of cached entries of `kind`.
    pub async fn count_by_kind(&self, kind: &ContentKind) -> Result<usize, StorageError> {
        Ok(self
            .store
            .get_all_with_prefix(Table::Content, &CacheKey::kind_prefix(kind))
            .await?
            .len())
    }

    /// Remove an entry. Eviction is always a caller decision.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), StorageError> {
        let canonical = key.canonical();
        self.store.delete(Table::Content, &canonical).await?;
        debug!(key = %canonical, "Content evicted");
        crate::metrics::record_content_operation("delete", "success");
        Ok(())
    }

    fn decode(key: CacheKey, canonical: &str, bytes: &[u8]) -> Result<CacheEntry, StorageError> {
        let stored: StoredEntry = serde_json::from_slice(bytes).map_err(|e| {
            crate::metrics::record_storage_error("content", "decode", "corruption");
            StorageError::Corruption {
                key: canonical.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(CacheEntry {
            key,
            payload: stored.payload,
            cached_at: stored.cached_at,
        })
    }
}
