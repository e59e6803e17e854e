//! Key material management: context-key derivation, versioning, rotation.
//!
//! Context keys are never stored. Each is derived on demand from the
//! master key with PBKDF2-SHA256 over (deployment salt, context, key
//! version), then cached per (context, version). Rotation advances the
//! version; prior versions stay derivable for a grace window so
//! in-flight payloads still decrypt, after which their cache entries
//! and nonce ledgers are evicted.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;

use super::CryptoError;

/// AEAD nonce width in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Derived key width in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Nonce ledger entries kept per key version before the ledger resets.
const NONCE_LEDGER_CAP: usize = 1 << 20;

/// Report returned by [`KeyRing::rotate`].
#[derive(Debug, Clone)]
pub struct RotationReport {
    /// Contexts whose key version was advanced.
    pub rotated: Vec<String>,
    /// The version now current for every rotated context.
    pub new_versions: HashMap<String, u32>,
    /// How long prior-version keys remain derivable.
    pub grace: Duration,
}

#[derive(Default)]
struct RingState {
    /// Current key version per context. Contexts start at version 1.
    versions: HashMap<String, u32>,
    /// When each superseded (context, version) was rotated out.
    retired: HashMap<(String, u32), DateTime<Utc>>,
    /// Derivation cache. Entries outside the grace window are evicted.
    derived: HashMap<(String, u32), [u8; KEY_LEN]>,
    /// Nonces observed per (context, version). Reuse is a hard failure.
    nonces: HashMap<(String, u32), HashSet<[u8; NONCE_LEN]>>,
}

/// Master-key holder and per-context key derivation state.
///
/// A single mutex guards all derivation state; every operation inside
/// the lock is sub-millisecond except a first-time derivation, which
/// pays the configured PBKDF2 cost once per (context, version).
pub struct KeyRing {
    master_key: Vec<u8>,
    deployment_salt: Vec<u8>,
    iterations: u32,
    grace: Duration,
    state: Mutex<RingState>,
}

impl KeyRing {
    /// Create a ring over the given master key and deployment salt.
    ///
    /// `iterations` is the PBKDF2 work factor (floor 100,000);
    /// `grace` bounds how long rotated-out versions stay derivable.
    pub fn new(master_key: Vec<u8>, deployment_salt: Vec<u8>, iterations: u32, grace: Duration) -> Self {
        Self {
            master_key,
            deployment_salt,
            iterations: iterations.max(100_000),
            grace,
            state: Mutex::new(RingState::default()),
        }
    }

    /// Create a ring with a random master key, for process-local use
    /// where the key intentionally never leaves memory.
    pub fn ephemeral(grace: Duration) -> Self {
        use rand::RngCore;
        let mut master = vec![0_u8; KEY_LEN];
        let mut salt = vec![0_u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut master);
        rand::rngs::OsRng.fill_bytes(&mut salt);
        // Ephemeral keys protect reproducible cache entries only, so the
        // work factor stays at the floor.
        Self::new(master, salt, 100_000, grace)
    }

    /// The version currently used to encrypt under `context`.
    pub fn current_version(&self, context: &str) -> u32 {
        let state = self.lock();
        state.versions.get(context).copied().unwrap_or(1)
    }

    /// The rotation grace window.
    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Derive (or fetch from cache) the key for (`context`, `version`).
    ///
    /// Fails with [`CryptoError::KeyUnavailable`] when `version` is
    /// ahead of the current version or was rotated out longer ago than
    /// the grace window permits.
    pub fn key_for(&self, context: &str, version: u32) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut state = self.lock();
        let current = state.versions.get(context).copied().unwrap_or(1);
        if version > current {
            return Err(CryptoError::KeyUnavailable {
                context: context.to_owned(),
                version,
            });
        }
        if version < current {
            let retired_at = state.retired.get(&(context.to_owned(), version)).copied();
            let expired = match retired_at {
                Some(at) => Utc::now().signed_duration_since(at) > self.grace,
                // No retirement record means the version predates this
                // process; treat it as outside the grace window.
                None => true,
            };
            if expired {
                state.derived.remove(&(context.to_owned(), version));
                state.nonces.remove(&(context.to_owned(), version));
                return Err(CryptoError::KeyUnavailable {
                    context: context.to_owned(),
                    version,
                });
            }
        }
        let cache_key = (context.to_owned(), version);
        if let Some(key) = state.derived.get(&cache_key) {
            return Ok(*key);
        }
        let key = self.derive(context, version);
        state.derived.insert(cache_key, key);
        Ok(key)
    }

    /// Record a nonce for (`context`, `version`).
    ///
    /// Returns [`CryptoError::NonceReuse`] if the nonce was already used
    /// under that key version. The ledger is capped; at capacity it is
    /// reset and a warning emitted, bounding the detection window
    /// rather than memory.
    pub fn record_nonce(
        &self,
        context: &str,
        version: u32,
        nonce: [u8; NONCE_LEN],
    ) -> Result<(), CryptoError> {
        let mut state = self.lock();
        let ledger = state
            .nonces
            .entry((context.to_owned(), version))
            .or_default();
        if ledger.len() >= NONCE_LEDGER_CAP {
            tracing::warn!(context, version, "nonce ledger at capacity, resetting");
            ledger.clear();
        }
        if !ledger.insert(nonce) {
            return Err(CryptoError::NonceReuse {
                context: context.to_owned(),
                version,
            });
        }
        Ok(())
    }

    /// Advance the key version for `context`, or for every context the
    /// ring has seen when `context` is `None`.
    ///
    /// Encrypt/decrypt calls racing a rotation observe either the old
    /// or the new version, never a partial update; the state mutex is
    /// held for the whole version swap.
    pub fn rotate(&self, context: Option<&str>) -> RotationReport {
        let now = Utc::now();
        let mut state = self.lock();
        let targets: Vec<String> = match context {
            Some(c) => vec![c.to_owned()],
            None => state.versions.keys().cloned().collect(),
        };
        let mut new_versions = HashMap::new();
        for ctx in &targets {
            let current = state.versions.get(ctx).copied().unwrap_or(1);
            let next = current.saturating_add(1);
            state.versions.insert(ctx.clone(), next);
            state.retired.insert((ctx.clone(), current), now);
            new_versions.insert(ctx.clone(), next);
        }
        // Evict cache entries and ledgers for versions beyond grace.
        let grace = self.grace;
        let expired: Vec<(String, u32)> = state
            .retired
            .iter()
            .filter(|(_, at)| now.signed_duration_since(**at) > grace)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            state.derived.remove(&key);
            state.nonces.remove(&key);
            state.retired.remove(&key);
        }
        tracing::info!(contexts = targets.len(), "key rotation complete");
        RotationReport {
            rotated: targets,
            new_versions,
            grace: self.grace,
        }
    }

    /// Mark a context as in use so that a blanket rotation covers it.
    pub fn touch(&self, context: &str) {
        let mut state = self.lock();
        if !state.versions.contains_key(context) {
            state.versions.insert(context.to_owned(), 1);
        }
    }

    fn derive(&self, context: &str, version: u32) -> [u8; KEY_LEN] {
        let mut salt = self.deployment_salt.clone();
        salt.extend_from_slice(context.as_bytes());
        salt.extend_from_slice(&version.to_be_bytes());
        let mut key = [0_u8; KEY_LEN];
        pbkdf2_hmac::<Sha256>(&self.master_key, &salt, self.iterations, &mut key);
        key
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RingState> {
        // A poisoned lock means a panic mid-derivation; the state is
        // reproducible from the master key, so continuing is sound.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
