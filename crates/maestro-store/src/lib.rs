//! Pluggable key-value persistence for orchestrator state.
//!
//! Back-ends are out of the core's hands: the orchestrator consumes only the
//! [`KvStore`] trait. [`MemoryBackend`] is the reference implementation used
//! by tests and single-process deployments; it honours per-key TTLs with
//! lazy expiry.

pub mod keys;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt value at {key}: {message}")]
    Corrupt { key: String, message: String },
}

/// Key-value interface for persisted orchestrator state.
///
/// Plain keys hold JSON values with an optional TTL; set keys hold string
/// membership used for the per-partition memory indexes.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Store a value, replacing any existing one. `ttl` of `None` means the
    /// key does not expire.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Fetch a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Whether a live (non-expired) value exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Add a member to a set key.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove a member from a set key. Returns whether it was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// All members of a set key.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// In-memory [`KvStore`] with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Entry>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry now instead of waiting for lazy expiry.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let swept = before - entries.len();
        if swept > 0 {
            tracing::debug!(swept, "expired keys swept");
        }
        swept
    }

    /// Number of live keys (plain and set).
    pub async fn len(&self) -> usize {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let sets = self.sets.read().await;
        entries.values().filter(|e| !e.is_expired(now)).count() + sets.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryBackend {
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| StoreError::Backend(format!("invalid ttl: {e}")))?,
            ),
            None => None,
        };
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                None => return Ok(None),
                Some(_) => {}
            }
        }
        // Expired: drop it on the way out.
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut sets = self.sets.write().await;
        sets.entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut sets = self.sets.write().await;
        match sets.get_mut(key) {
            Some(members) => {
                let removed = members.remove(member);
                if members.is_empty() {
                    sets.remove(key);
                }
                Ok(removed)
            }
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let sets = self.sets.read().await;
        let mut members: Vec<String> = sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }
}
