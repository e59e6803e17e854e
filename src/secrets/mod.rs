//! Multi-backend secrets facade with an encrypted in-process cache.
//!
//! Lookups go cache → primary backend → fallbacks in order. Transient
//! backend failures are retried with bounded exponential backoff;
//! malformed responses count as a miss for that backend so fallback
//! can proceed. Cache entries are sealed with a process-local
//! ephemeral key and expire after a TTL, so plaintext secrets never
//! sit in long-lived process memory.

pub mod backend;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crypto::{CryptoEngine, CryptoError, EncryptedPayload};
use backend::{BackendError, SecretBackend};

/// Facade failure modes.
#[derive(Debug, Error)]
pub enum SecretsError {
    /// Primary and all fallback backends were exhausted.
    #[error("secret {0} not found")]
    NotFound(String),
    /// The facade was constructed with an empty backend list.
    #[error("no secret backends configured")]
    NoBackends,
    /// A mutation failed on the primary backend.
    #[error("backend {backend}: {source}")]
    Backend {
        /// Backend that rejected the operation.
        backend: String,
        /// Underlying backend error.
        #[source]
        source: BackendError,
    },
    /// Cache sealing or opening failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// A secret value whose `Debug` output is always redacted.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    /// Wrap a plaintext secret.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the plaintext. Call sites should be the final consumer.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts per backend, including the first.
    pub attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

struct CachedSecret {
    sealed: EncryptedPayload,
    backend: String,
    fetched_at: DateTime<Utc>,
    ttl: chrono::Duration,
}

impl CachedSecret {
    fn live(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) < self.ttl
    }
}

/// Backend-agnostic secrets access with fallback and caching.
pub struct SecretsFacade {
    backends: Vec<Arc<dyn SecretBackend>>,
    cache: RwLock<HashMap<String, CachedSecret>>,
    cache_crypto: CryptoEngine,
    cache_ttl: chrono::Duration,
    retry: RetryPolicy,
}

impl SecretsFacade {
    /// Build a facade. The first backend is primary; the rest are
    /// fallbacks tried in order.
    pub fn new(
        backends: Vec<Arc<dyn SecretBackend>>,
        cache_ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backends,
            cache: RwLock::new(HashMap::new()),
            cache_crypto: CryptoEngine::ephemeral(),
            cache_ttl: chrono::Duration::from_std(cache_ttl)
                .unwrap_or_else(|_| chrono::Duration::minutes(5)),
            retry,
        }
    }

    /// Fetch a secret, serving from the encrypted cache when allowed.
    pub async fn get_secret(&self, id: &str, use_cache: bool) -> Result<Secret, SecretsError> {
        if self.backends.is_empty() {
            return Err(SecretsError::NoBackends);
        }
        if use_cache {
            if let Some(secret) = self.cache_lookup(id).await? {
                debug!(secret_id = id, "secret served from cache");
                return Ok(secret);
            }
        }

        for (index, backend) in self.backends.iter().enumerate() {
            match self.get_with_retry(backend.as_ref(), id).await {
                Ok(value) => {
                    if index > 0 {
                        warn!(
                            secret_id = id,
                            backend = backend.name(),
                            "secret served from fallback backend"
                        );
                    }
                    self.cache_insert(id, backend.name(), &value).await?;
                    return Ok(Secret::new(value));
                }
                Err(BackendError::NotFound(_)) => {
                    debug!(secret_id = id, backend = backend.name(), "secret not in backend");
                }
                Err(BackendError::Malformed(reason)) => {
                    // Malformed data is a miss for this backend only.
                    warn!(
                        secret_id = id,
                        backend = backend.name(),
                        %reason,
                        "malformed backend response, treating as miss"
                    );
                }
                Err(e) => {
                    warn!(
                        secret_id = id,
                        backend = backend.name(),
                        error = %e,
                        "backend failed after retries, trying next"
                    );
                }
            }
        }
        Err(SecretsError::NotFound(id.to_owned()))
    }

    /// Create a secret on the primary backend.
    pub async fn create_secret(&self, id: &str, value: &str) -> Result<(), SecretsError> {
        let primary = self.primary()?;
        primary
            .create(id, value)
            .await
            .map_err(|source| SecretsError::Backend {
                backend: primary.name().to_owned(),
                source,
            })?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Update a secret on the primary backend and invalidate the cache.
    pub async fn update_secret(&self, id: &str, value: &str) -> Result<(), SecretsError> {
        let primary = self.primary()?;
        primary
            .update(id, value)
            .await
            .map_err(|source| SecretsError::Backend {
                backend: primary.name().to_owned(),
                source,
            })?;
        self.invalidate(id).await;
        Ok(())
    }

    /// Delete a secret (soft where the backend supports recovery).
    pub async fn delete_secret(&self, id: &str) -> Result<(), SecretsError> {
        let primary = self.primary()?;
        primary
            .delete(id)
            .await
            .map_err(|source| SecretsError::Backend {
                backend: primary.name().to_owned(),
                source,
            })?;
        self.invalidate(id).await;
        Ok(())
    }

    /// List secret ids from the first backend that answers.
    pub async fn list_secrets(&self, prefix: Option<&str>) -> Result<Vec<String>, SecretsError> {
        let mut last: Option<(String, BackendError)> = None;
        for backend in &self.backends {
            match backend.list(prefix).await {
                Ok(ids) => return Ok(ids),
                Err(e) => {
                    warn!(backend = backend.name(), error = %e, "list failed, trying next");
                    last = Some((backend.name().to_owned(), e));
                }
            }
        }
        match last {
            Some((backend, source)) => Err(SecretsError::Backend { backend, source }),
            None => Err(SecretsError::NoBackends),
        }
    }

    /// Drop a single cache entry.
    pub async fn invalidate(&self, id: &str) {
        self.cache.write().await.remove(id);
    }

    /// Drop every cache entry.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }

    fn primary(&self) -> Result<&Arc<dyn SecretBackend>, SecretsError> {
        self.backends.first().ok_or(SecretsError::NoBackends)
    }

    async fn get_with_retry(
        &self,
        backend: &dyn SecretBackend,
        id: &str,
    ) -> Result<String, BackendError> {
        let mut delay = self.retry.base_delay;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match backend.get(id).await {
                // Only transient failures are worth retrying.
                Err(BackendError::Unavailable(reason)) if attempt < self.retry.attempts => {
                    debug!(
                        backend = backend.name(),
                        attempt,
                        %reason,
                        "transient backend failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    async fn cache_lookup(&self, id: &str) -> Result<Option<Secret>, SecretsError> {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        match cache.get(id) {
            Some(entry) if entry.live(now) => {
                let plaintext = self.cache_crypto.decrypt(&entry.sealed)?;
                let value = String::from_utf8(plaintext)
                    .map_err(|e| CryptoError::InvalidPayload(e.to_string()))?;
                Ok(Some(Secret::new(value)))
            }
            Some(_) => {
                cache.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cache_insert(&self, id: &str, backend: &str, value: &str) -> Result<(), SecretsError> {
        let sealed = self
            .cache_crypto
            .encrypt(value.as_bytes(), "secrets-cache")?;
        let mut cache = self.cache.write().await;
        cache.insert(
            id.to_owned(),
            CachedSecret {
                sealed,
                backend: backend.to_owned(),
                fetched_at: Utc::now(),
                ttl: self.cache_ttl,
            },
        );
        Ok(())
    }

    /// Which backend a cached secret came from, if cached.
    pub async fn cached_source(&self, id: &str) -> Option<String> {
        let cache = self.cache.read().await;
        cache.get(id).map(|e| e.backend.clone())
    }
}
