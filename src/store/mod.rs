//! Key-value store abstraction shared by the token revocation/refresh
//! store and the RBAC cache.
//!
//! The production deployment points this at a networked store with
//! `SETEX`-style semantics. [`MemoryStore`] provides the same contract
//! in-process for tests and local runs. Callers treat any store failure
//! as fail-closed: a lookup that cannot complete is never interpreted
//! as "not revoked" or "still valid".

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

/// Store access error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or timed out.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store returned data that could not be interpreted.
    #[error("malformed store entry for key {0}")]
    Malformed(String),
}

/// Minimal key-value contract with per-key TTL.
///
/// Patterns passed to [`scan`](KeyValueStore::scan) use a single `*`
/// wildcard, matching the scan syntax of the production store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`.
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Fetch the value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Whether `key` exists and has not expired.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List live keys matching `pattern` (`prefix*`, `*suffix` or
    /// `prefix*suffix`).
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Entry {
    fn live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// In-process [`KeyValueStore`] with TTL expiry.
///
/// Expired entries are dropped lazily on read and during scans.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Match `key` against a pattern containing at most one `*` wildcard.
fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            key.len() >= prefix.len().saturating_add(suffix.len())
                && key.starts_with(prefix)
                && key.ends_with(suffix)
        }
        None => pattern == key,
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| StoreError::Malformed(format!("{key}: bad ttl: {e}")))?;
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.entries.write().await;
        entries.insert(key.to_owned(), Entry { value, expires_at });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| e.live(now)))
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.live(now));
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
