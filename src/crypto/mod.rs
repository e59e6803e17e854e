//! Authenticated encryption with versioned context keys.
//!
//! [`CryptoEngine`] wraps AES-256-GCM over keys derived by a
//! [`KeyRing`]. Every payload binds associated data (context, key
//! version, algorithm, timestamp) into the authentication tag, so a
//! ciphertext cannot be replayed under a different context or version.
//! Tag verification failures surface as [`CryptoError::AuthenticationFailed`]
//! and never yield partial plaintext.

pub mod hybrid;
pub mod keys;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use keys::{KeyRing, RotationReport, KEY_LEN, NONCE_LEN};

/// AEAD algorithm identifier recorded in every payload.
pub const AEAD_ALGORITHM: &str = "AES-256-GCM";

/// Cryptographic failure modes.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Authentication tag mismatch: the payload was tampered with, the
    /// associated data does not match, or the wrong key was derived.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// The requested key version cannot be served.
    #[error("key unavailable for context {context} version {version}")]
    KeyUnavailable {
        /// Derivation context of the missing key.
        context: String,
        /// Requested key version.
        version: u32,
    },
    /// A nonce was observed twice under the same key version.
    #[error("nonce reuse detected for context {context} version {version}")]
    NonceReuse {
        /// Derivation context under which the collision occurred.
        context: String,
        /// Key version under which the collision occurred.
        version: u32,
    },
    /// The payload could not be parsed or its fields are inconsistent.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    /// An asymmetric (RSA) operation failed.
    #[error("asymmetric operation failed: {0}")]
    Asymmetric(String),
}

/// A sealed AEAD payload together with everything needed to decrypt it
/// after key rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// Base64 ciphertext including the GCM tag.
    pub ciphertext: String,
    /// Base64 96-bit nonce.
    pub nonce: String,
    /// Derivation context the payload was sealed under.
    pub context: String,
    /// Key version the payload was sealed under.
    pub key_version: u32,
    /// AEAD algorithm identifier.
    pub algorithm: String,
    /// Associated data bound into the authentication tag.
    pub aad: String,
    /// When the payload was sealed.
    pub timestamp: DateTime<Utc>,
}

/// AEAD engine over context-derived, versioned keys.
pub struct CryptoEngine {
    ring: KeyRing,
}

impl CryptoEngine {
    /// Build an engine over the given key ring.
    pub fn new(ring: KeyRing) -> Self {
        Self { ring }
    }

    /// Build an engine over a random, process-local master key.
    pub fn ephemeral() -> Self {
        Self::new(KeyRing::ephemeral(chrono::Duration::days(7)))
    }

    /// Access the underlying ring (rotation, version queries).
    pub fn ring(&self) -> &KeyRing {
        &self.ring
    }

    /// Seal `plaintext` under the current key for `context`.
    pub fn encrypt(&self, plaintext: &[u8], context: &str) -> Result<EncryptedPayload, CryptoError> {
        self.ring.touch(context);
        let version = self.ring.current_version(context);
        let key = self.ring.key_for(context, version)?;

        let mut nonce = [0_u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        self.ring.record_nonce(context, version, nonce)?;

        let timestamp = Utc::now();
        let aad = canonical_aad(context, version, AEAD_ALGORITHM, timestamp);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        Ok(EncryptedPayload {
            ciphertext: B64.encode(ciphertext),
            nonce: B64.encode(nonce),
            context: context.to_owned(),
            key_version: version,
            algorithm: AEAD_ALGORITHM.to_owned(),
            aad,
            timestamp,
        })
    }

    /// Open a payload, re-deriving the key for its stated version.
    ///
    /// The stored associated data must match the canonical form of the
    /// payload's own fields; any mismatch or tag failure is
    /// [`CryptoError::AuthenticationFailed`].
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        if payload.algorithm != AEAD_ALGORITHM {
            return Err(CryptoError::InvalidPayload(format!(
                "unsupported algorithm {}",
                payload.algorithm
            )));
        }
        let expected_aad = canonical_aad(
            &payload.context,
            payload.key_version,
            &payload.algorithm,
            payload.timestamp,
        );
        if payload.aad != expected_aad {
            return Err(CryptoError::AuthenticationFailed);
        }

        let key = self.ring.key_for(&payload.context, payload.key_version)?;
        let nonce = B64
            .decode(&payload.nonce)
            .map_err(|e| CryptoError::InvalidPayload(format!("nonce: {e}")))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidPayload("nonce length".to_owned()));
        }
        let ciphertext = B64
            .decode(&payload.ciphertext)
            .map_err(|e| CryptoError::InvalidPayload(format!("ciphertext: {e}")))?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: ciphertext.as_slice(),
                    aad: payload.aad.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Advance the key version for one context, or all known contexts.
    pub fn rotate_keys(&self, context: Option<&str>) -> RotationReport {
        self.ring.rotate(context)
    }
}

fn canonical_aad(context: &str, version: u32, algorithm: &str, at: DateTime<Utc>) -> String {
    format!(
        "{context}|v{version}|{algorithm}|{}",
        at.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CryptoEngine {
        CryptoEngine::new(KeyRing::new(
            b"unit-test-master".to_vec(),
            b"unit-test-salt".to_vec(),
            100_000,
            chrono::Duration::days(7),
        ))
    }

    #[test]
    fn round_trip() {
        let engine = engine();
        let sealed = engine.encrypt(b"attack at dawn", "orders").expect("encrypt");
        let opened = engine.decrypt(&sealed).expect("decrypt");
        assert_eq!(opened, b"attack at dawn");
    }

    #[test]
    fn repeated_encryption_differs() {
        let engine = engine();
        let a = engine.encrypt(b"same plaintext", "orders").expect("encrypt a");
        let b = engine.encrypt(b"same plaintext", "orders").expect("encrypt b");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let engine = engine();
        let mut sealed = engine.encrypt(b"payload", "orders").expect("encrypt");
        let mut raw = B64.decode(&sealed.ciphertext).expect("decode");
        raw[0] ^= 0x01;
        sealed.ciphertext = B64.encode(raw);
        assert!(matches!(
            engine.decrypt(&sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn rewritten_context_fails_authentication() {
        let engine = engine();
        let mut sealed = engine.encrypt(b"payload", "orders").expect("encrypt");
        sealed.context = "reports".to_owned();
        assert!(matches!(
            engine.decrypt(&sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn tampered_aad_fails_authentication() {
        let engine = engine();
        let mut sealed = engine.encrypt(b"payload", "orders").expect("encrypt");
        sealed.aad.push('x');
        assert!(matches!(
            engine.decrypt(&sealed),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn decrypts_after_rotation_within_grace() {
        let engine = engine();
        let sealed = engine.encrypt(b"old data", "orders").expect("encrypt");
        let report = engine.rotate_keys(Some("orders"));
        assert_eq!(report.new_versions.get("orders"), Some(&2));
        let opened = engine.decrypt(&sealed).expect("decrypt old version");
        assert_eq!(opened, b"old data");

        // New payloads seal under the new version.
        let fresh = engine.encrypt(b"new data", "orders").expect("encrypt v2");
        assert_eq!(fresh.key_version, 2);

        // Rotating again with no new data keeps old payloads readable.
        engine.rotate_keys(Some("orders"));
        assert_eq!(engine.decrypt(&sealed).expect("still readable"), b"old data");
        assert_eq!(engine.decrypt(&fresh).expect("v2 readable"), b"new data");
    }

    #[test]
    fn unsupported_algorithm_is_rejected() {
        let engine = engine();
        let mut sealed = engine.encrypt(b"payload", "orders").expect("encrypt");
        sealed.algorithm = "AES-128-CBC".to_owned();
        assert!(matches!(
            engine.decrypt(&sealed),
            Err(CryptoError::InvalidPayload(_))
        ));
    }
}
