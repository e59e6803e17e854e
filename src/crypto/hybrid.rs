//! Hybrid asymmetric encryption.
//!
//! Bulk data is sealed with a single-use AES-256-GCM data key; only
//! that data key is encrypted with the recipient's RSA public key
//! (OAEP, SHA-256). Used when encrypting for a remote private-key
//! holder rather than for local context-derived access.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::{CryptoError, AEAD_ALGORITHM, KEY_LEN, NONCE_LEN};

/// A hybrid-encrypted payload: AEAD ciphertext plus the RSA-wrapped
/// data key needed to open it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridPayload {
    /// Base64 RSA-OAEP ciphertext of the single-use data key.
    pub wrapped_key: String,
    /// Base64 AEAD ciphertext of the payload.
    pub ciphertext: String,
    /// Base64 96-bit AEAD nonce.
    pub nonce: String,
    /// Symmetric algorithm identifier.
    pub algorithm: String,
}

/// Encrypt `plaintext` for the holder of the private key matching
/// `recipient`.
pub fn encrypt_asymmetric(
    plaintext: &[u8],
    recipient: &RsaPublicKey,
) -> Result<HybridPayload, CryptoError> {
    let mut rng = rand::rngs::OsRng;

    let mut data_key = [0_u8; KEY_LEN];
    rng.fill_bytes(&mut data_key);
    let mut nonce = [0_u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let wrapped_key = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &data_key)
        .map_err(|e| CryptoError::Asymmetric(e.to_string()))?;

    Ok(HybridPayload {
        wrapped_key: B64.encode(wrapped_key),
        ciphertext: B64.encode(ciphertext),
        nonce: B64.encode(nonce),
        algorithm: AEAD_ALGORITHM.to_owned(),
    })
}

/// Decrypt a [`HybridPayload`] with the recipient's private key.
pub fn decrypt_asymmetric(
    payload: &HybridPayload,
    recipient: &RsaPrivateKey,
) -> Result<Vec<u8>, CryptoError> {
    let wrapped = B64
        .decode(&payload.wrapped_key)
        .map_err(|e| CryptoError::InvalidPayload(format!("wrapped key: {e}")))?;
    let data_key = recipient
        .decrypt(Oaep::new::<Sha256>(), &wrapped)
        .map_err(|_| CryptoError::AuthenticationFailed)?;
    if data_key.len() != KEY_LEN {
        return Err(CryptoError::InvalidPayload("data key length".to_owned()));
    }

    let nonce = B64
        .decode(&payload.nonce)
        .map_err(|e| CryptoError::InvalidPayload(format!("nonce: {e}")))?;
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidPayload("nonce length".to_owned()));
    }
    let ciphertext = B64
        .decode(&payload.ciphertext)
        .map_err(|e| CryptoError::InvalidPayload(format!("ciphertext: {e}")))?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&data_key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| CryptoError::AuthenticationFailed)
}
