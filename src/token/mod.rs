//! Token lifecycle: issue, verify, refresh, revoke.
//!
//! Tokens are RS256-signed, three-segment base64url documents. Each
//! issued pair shares custom claims; the refresh token references the
//! access token's jti and lives in the refresh store under
//! `refresh_token:{subject}:{jti}` until used up or revoked. Revoked
//! jtis sit in the blacklist (`blacklist:{jti}`) until their natural
//! expiry.
//!
//! Revocation and refresh-store lookups fail closed: if the store
//! cannot answer inside the request timeout, the token is treated as
//! revoked. Signature failures are never retried.

pub mod claims;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{KeyValueStore, StoreError};
use claims::{validate_custom_claims, TokenClaims, TokenType};

/// Token operation failure modes.
///
/// Callers facing end users must collapse these into a uniform denial;
/// the distinction exists for audit events and internal logs.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The token's expiry has passed.
    #[error("token expired")]
    Expired,
    /// The token is valid but of the wrong declared type.
    #[error("token type mismatch")]
    TypeMismatch,
    /// The token was revoked, never issued, or the store could not
    /// confirm otherwise.
    #[error("token revoked")]
    Revoked,
    /// The token could not be parsed or its signature is invalid.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// The refresh chain hit its maximum use count.
    #[error("refresh limit exceeded")]
    RefreshLimitExceeded,
    /// A custom claim collides with a reserved claim name.
    #[error("claim name {0} is reserved")]
    ReservedClaim(String),
    /// The backing store failed during a non-verification operation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Signing key material could not be prepared.
    #[error("key material error: {0}")]
    Key(String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// `iss` claim stamped into and required of every token.
    pub issuer: String,
    /// `aud` claim stamped into and required of every token.
    pub audience: String,
    /// Access token lifetime.
    pub access_ttl: Duration,
    /// Refresh token lifetime.
    pub refresh_ttl: Duration,
    /// Refresh uses permitted before the chain is revoked.
    pub max_refresh_count: u32,
    /// Request-scoped timeout for revocation/refresh store lookups.
    pub store_timeout: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "straylight".to_owned(),
            audience: "straylight-api".to_owned(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            max_refresh_count: 5,
            store_timeout: Duration::from_secs(2),
        }
    }
}

/// An issued access/refresh pair.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    /// Signed access token.
    pub access_token: String,
    /// Signed refresh token.
    pub refresh_token: String,
    /// Seconds until the access token expires.
    pub expires_in: u64,
}

/// JWKS document served to relying parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    /// Public keys currently valid for verification.
    pub keys: Vec<Jwk>,
}

/// A single JWKS entry for an RSA signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwk {
    /// Key type (`RSA`).
    pub kty: String,
    /// Intended use (`sig`).
    #[serde(rename = "use")]
    pub use_: String,
    /// Signing algorithm (`RS256`).
    pub alg: String,
    /// Key id matching the token header.
    pub kid: String,
    /// Base64url modulus.
    pub n: String,
    /// Base64url public exponent.
    pub e: String,
}

/// Refresh-token record persisted in the refresh store.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RefreshRecord {
    subject: String,
    jti: String,
    access_jti: String,
    refresh_count: u32,
    custom: HashMap<String, serde_json::Value>,
    expires_at: i64,
}

/// Issues, verifies, refreshes and revokes signed tokens.
pub struct TokenService {
    config: TokenConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key: RsaPublicKey,
    kid: String,
    store: Arc<dyn KeyValueStore>,
}

impl TokenService {
    /// Create a service with a freshly generated RSA-2048 signing key.
    pub fn new(config: TokenConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, TokenError> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048)
            .map_err(|e| TokenError::Key(e.to_string()))?;
        Self::with_key(config, store, private)
    }

    /// Create a service over externally supplied key material.
    pub fn with_key(
        config: TokenConfig,
        store: Arc<dyn KeyValueStore>,
        private: RsaPrivateKey,
    ) -> Result<Self, TokenError> {
        let public = RsaPublicKey::from(&private);
        let private_pem = private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let public_pem = public
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| TokenError::Key(e.to_string()))?;
        Ok(Self {
            config,
            encoding_key,
            decoding_key,
            public_key: public,
            kid: Uuid::new_v4().to_string(),
            store,
        })
    }

    /// Issue an access/refresh pair for `subject` carrying `custom`
    /// claims.
    pub async fn issue(
        &self,
        subject: &str,
        custom: HashMap<String, serde_json::Value>,
    ) -> Result<TokenPair, TokenError> {
        validate_custom_claims(&custom)?;

        let now = Utc::now().timestamp();
        let access_exp = now.saturating_add(i64::try_from(self.config.access_ttl.as_secs()).unwrap_or(i64::MAX));
        let refresh_exp = now.saturating_add(i64::try_from(self.config.refresh_ttl.as_secs()).unwrap_or(i64::MAX));
        let access_jti = Uuid::new_v4().to_string();
        let refresh_jti = Uuid::new_v4().to_string();

        let access_claims = TokenClaims {
            sub: subject.to_owned(),
            iat: now,
            nbf: now,
            exp: access_exp,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            jti: access_jti.clone(),
            typ: TokenType::Access,
            refresh_count: None,
            access_jti: None,
            custom: custom.clone(),
        };
        let refresh_claims = TokenClaims {
            sub: subject.to_owned(),
            iat: now,
            nbf: now,
            exp: refresh_exp,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            jti: refresh_jti.clone(),
            typ: TokenType::Refresh,
            refresh_count: Some(0),
            access_jti: Some(access_jti.clone()),
            custom: custom.clone(),
        };

        let access_token = self.sign(&access_claims)?;
        let refresh_token = self.sign(&refresh_claims)?;

        let record = RefreshRecord {
            subject: subject.to_owned(),
            jti: refresh_jti.clone(),
            access_jti,
            refresh_count: 0,
            custom,
            expires_at: refresh_exp,
        };
        let record_json = serde_json::to_string(&record)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        self.store
            .set_ex(
                &refresh_key(subject, &refresh_jti),
                record_json,
                self.config.refresh_ttl,
            )
            .await?;

        info!(subject, "token pair issued");
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_ttl.as_secs(),
        })
    }

    /// Verify a token of the expected type and return its claims.
    pub async fn verify(
        &self,
        token: &str,
        expected: TokenType,
    ) -> Result<TokenClaims, TokenError> {
        let claims = self.decode(token, true)?;

        if claims.typ != expected {
            return Err(TokenError::TypeMismatch);
        }

        // Blacklist lookups fail closed: an unanswerable store cannot
        // vouch that the token is still good.
        let blacklisted = self
            .store_lookup(self.store.exists(&blacklist_key(&claims.jti)))
            .await?;
        if blacklisted {
            return Err(TokenError::Revoked);
        }

        if claims.typ == TokenType::Refresh {
            // A structurally valid refresh token must still exist in the
            // refresh store; pruned or never-issued tokens are rejected.
            let live = self
                .store_lookup(self.store.exists(&refresh_key(&claims.sub, &claims.jti)))
                .await?;
            if !live {
                return Err(TokenError::Revoked);
            }
        }

        Ok(claims)
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// The stored refresh count increments on every use; exceeding the
    /// configured maximum revokes the chain instead of issuing.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, TokenError> {
        let claims = self.verify(refresh_token, TokenType::Refresh).await?;
        let key = refresh_key(&claims.sub, &claims.jti);

        let record_json = self
            .store_lookup(self.store.get(&key))
            .await?
            .ok_or(TokenError::Revoked)?;
        let mut record: RefreshRecord = serde_json::from_str(&record_json)
            .map_err(|_| TokenError::Revoked)?;

        if record.refresh_count >= self.config.max_refresh_count {
            warn!(
                subject = %record.subject,
                count = record.refresh_count,
                "refresh limit exceeded, revoking chain"
            );
            self.blacklist(&record.jti, record.expires_at).await?;
            self.store.delete(&key).await?;
            return Err(TokenError::RefreshLimitExceeded);
        }

        let now = Utc::now().timestamp();
        let access_exp = now.saturating_add(i64::try_from(self.config.access_ttl.as_secs()).unwrap_or(i64::MAX));
        let access_jti = Uuid::new_v4().to_string();
        let access_claims = TokenClaims {
            sub: record.subject.clone(),
            iat: now,
            nbf: now,
            exp: access_exp,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            jti: access_jti.clone(),
            typ: TokenType::Access,
            refresh_count: None,
            access_jti: None,
            custom: record.custom.clone(),
        };
        let access_token = self.sign(&access_claims)?;

        record.refresh_count = record.refresh_count.saturating_add(1);
        record.access_jti = access_jti;
        let remaining = remaining_ttl(record.expires_at);
        let record_json = serde_json::to_string(&record)
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        self.store.set_ex(&key, record_json, remaining).await?;

        debug!(subject = %record.subject, count = record.refresh_count, "token refreshed");
        Ok(TokenPair {
            access_token,
            refresh_token: refresh_token.to_owned(),
            expires_in: self.config.access_ttl.as_secs(),
        })
    }

    /// Revoke a token, expired or not.
    ///
    /// The jti joins the blacklist for the token's remaining lifetime
    /// (a floor of one second keeps already-expired revocations
    /// observable for audit completeness). Refresh tokens are also
    /// removed from the refresh store.
    pub async fn revoke(&self, token: &str) -> Result<bool, TokenError> {
        // Expiry is deliberately not validated: expired tokens can
        // still be explicitly revoked.
        let claims = self.decode(token, false)?;

        self.blacklist(&claims.jti, claims.exp).await?;
        if claims.typ == TokenType::Refresh {
            self.store
                .delete(&refresh_key(&claims.sub, &claims.jti))
                .await?;
        }
        info!(subject = %claims.sub, typ = %claims.typ, "token revoked");
        Ok(true)
    }

    /// Revoke every refresh token owned by `subject`. Returns how many
    /// were revoked.
    pub async fn revoke_all(&self, subject: &str) -> Result<usize, TokenError> {
        let keys = self
            .store
            .scan(&format!("refresh_token:{subject}:*"))
            .await?;
        let mut revoked: usize = 0;
        for key in keys {
            if let Some(record_json) = self.store.get(&key).await? {
                if let Ok(record) = serde_json::from_str::<RefreshRecord>(&record_json) {
                    self.blacklist(&record.jti, record.expires_at).await?;
                }
            }
            if self.store.delete(&key).await? {
                revoked = revoked.saturating_add(1);
            }
        }
        info!(subject, revoked, "revoked all refresh tokens");
        Ok(revoked)
    }

    /// JWKS document for the current signing key.
    pub fn jwks(&self) -> Jwks {
        Jwks {
            keys: vec![Jwk {
                kty: "RSA".to_owned(),
                use_: "sig".to_owned(),
                alg: "RS256".to_owned(),
                kid: self.kid.clone(),
                n: URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be()),
                e: URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be()),
            }],
        }
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| TokenError::Malformed(e.to_string()))
    }

    fn decode(&self, token: &str, validate_exp: bool) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);
        validation.validate_exp = validate_exp;
        validation.validate_nbf = true;
        validation.leeway = 0;

        match jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key, &validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(TokenError::Expired),
                kind => Err(TokenError::Malformed(format!("{kind:?}"))),
            },
        }
    }

    async fn blacklist(&self, jti: &str, expires_at: i64) -> Result<(), TokenError> {
        let ttl = remaining_ttl(expires_at);
        self.store
            .set_ex(&blacklist_key(jti), expires_at.to_string(), ttl)
            .await?;
        Ok(())
    }

    /// Run a revocation-critical store lookup under the request
    /// timeout, mapping both timeouts and store failures to
    /// [`TokenError::Revoked`].
    async fn store_lookup<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, TokenError> {
        match tokio::time::timeout(self.config.store_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(error = %e, "revocation store failed, failing closed");
                Err(TokenError::Revoked)
            }
            Err(_) => {
                warn!("revocation store lookup timed out, failing closed");
                Err(TokenError::Revoked)
            }
        }
    }
}

fn blacklist_key(jti: &str) -> String {
    format!("blacklist:{jti}")
}

fn refresh_key(subject: &str, jti: &str) -> String {
    format!("refresh_token:{subject}:{jti}")
}

fn remaining_ttl(expires_at: i64) -> Duration {
    let now = Utc::now().timestamp();
    let remaining = expires_at.saturating_sub(now).max(1);
    Duration::from_secs(u64::try_from(remaining).unwrap_or(1))
}
