//! Append-only audit trail of security-relevant decisions.
//!
//! Logging is best-effort by contract: a storage failure while appending
//! must never block or fail the operation being audited, so every error is
//! swallowed here and surfaced only as a warning.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use local_store::KeyValueStore;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Storage key holding the serialized log.
pub const SECURITY_LOG_KEY: &str = "securityLog";

/// Default number of retained entries.
pub const DEFAULT_CAPACITY: usize = 100;

/// Security-relevant event kinds recorded in the trail.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AuthGranted,
    AuthDenied,
    AuthCancelled,
    SignApproved,
    SignRejected,
    RateLimitHit,
}

/// One appended record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
    pub event: AuditKind,
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Bounded log persisted as a whole-document snapshot after each append.
pub struct AuditLog {
    store: Arc<dyn KeyValueStore>,
    capacity: usize,
}

impl AuditLog {
    pub fn new(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        Self { store, capacity }
    }

    /// Append an entry, truncating the log to its last `capacity` entries.
    pub async fn append(&self, event: AuditKind, origin: &str, details: Option<String>) {
        let mut entries = self.read_all().await;
        entries.push(AuditEntry {
            timestamp: now_ms(),
            event,
            origin: origin.to_string(),
            details,
        });
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            entries.drain(..excess);
        }

        let encoded = match serde_json::to_string(&entries) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("failed to encode security log: {err}");
                return;
            }
        };
        if let Err(err) = self.store.set(SECURITY_LOG_KEY, &encoded).await {
            warn!("failed to persist security log: {err}");
        }
    }

    /// All retained entries in append order; empty on any underlying failure.
    pub async fn read_all(&self) -> Vec<AuditEntry> {
        match self.store.get(SECURITY_LOG_KEY).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("discarding unreadable security log: {err}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to read security log: {err}");
                Vec::new()
            }
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
