// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote service boundary.
//!
//! The engine never talks to the network itself. The host application hands
//! it an already-authenticated [`RemoteService`]; the sync processor is the
//! only caller.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Outcome of a rejected submission, classified once at the boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network drop, timeout, rate limit or server-side fault. Retried with backoff.
    #[error("Retryable remote error: {0}")]
    Retryable(String),
    /// The service rejected the action as invalid. Never retried automatically.
    #[error("Permanent remote error: {0}")]
    Permanent(String),
}

impl RemoteError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Classify an HTTP-style status code.
    ///
    /// Only 4xx other than 408 and 429 is a semantic rejection. Anything else
    /// handed in as a failure (5xx, or a stray 1xx/2xx/3xx from a proxy or
    /// captive portal) is treated as transient.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            408 | 429 => Self::Retryable(format!("Status {}: {}", status, truncated)),
            400..=499 => Self::Permanent(format!("Status {}: {}", status, truncated)),
            _ => Self::Retryable(format!("Status {}: {}", status, truncated)),
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Authenticated remote-call capability supplied by the host application.
///
/// Implementations must treat `idempotency_key` as the dedup token: a
/// resubmission with the same key is the same logical action.
#[async_trait]
pub trait RemoteService: Send + Sync {
    async fn submit(&self, kind: &str, payload: &Value, idempotency_key: Uuid) -> Result<(), RemoteError>;
}
