//! Token claim sets.
//!
//! Claims follow the three-segment signed token layout: reserved
//! registered claims plus a flattened extension map for caller-supplied
//! custom claims. Custom claims are validated against the reserved-name
//! denylist at insertion time, never silently overwritten.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::TokenError;

/// Claim names callers may not supply as custom claims.
pub const RESERVED_CLAIMS: &[&str] = &[
    "sub",
    "iat",
    "nbf",
    "exp",
    "iss",
    "aud",
    "jti",
    "typ",
    "refresh_count",
    "access_jti",
];

/// Declared token type, embedded in the `typ` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    /// Short-lived token presented on every request.
    Access,
    /// Long-lived token exchanged for new access tokens.
    Refresh,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenType::Access => f.write_str("access"),
            TokenType::Refresh => f.write_str("refresh"),
        }
    }
}

/// Full claim set carried by both token types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject the token was issued to.
    pub sub: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Not-before, seconds since the epoch.
    pub nbf: i64,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issuer.
    pub iss: String,
    /// Audience.
    pub aud: String,
    /// Unique token id used for revocation tracking.
    pub jti: String,
    /// Declared token type.
    pub typ: TokenType,
    /// Times this refresh token has been used (refresh tokens only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_count: Option<u32>,
    /// jti of the access token issued alongside (refresh tokens only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_jti: Option<String>,
    /// Caller-supplied custom claims, validated against
    /// [`RESERVED_CLAIMS`].
    #[serde(flatten)]
    pub custom: HashMap<String, serde_json::Value>,
}

/// Reject custom claims that collide with reserved claim names.
pub fn validate_custom_claims(
    custom: &HashMap<String, serde_json::Value>,
) -> Result<(), TokenError> {
    for name in custom.keys() {
        if RESERVED_CLAIMS.contains(&name.as_str()) {
            return Err(TokenError::ReservedClaim(name.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_claim_is_rejected() {
        let mut custom = HashMap::new();
        custom.insert("exp".to_owned(), serde_json::json!(0));
        assert!(matches!(
            validate_custom_claims(&custom),
            Err(TokenError::ReservedClaim(name)) if name == "exp"
        ));
    }

    #[test]
    fn ordinary_claims_pass() {
        let mut custom = HashMap::new();
        custom.insert("tenant".to_owned(), serde_json::json!("acme"));
        custom.insert("plan".to_owned(), serde_json::json!("pro"));
        assert!(validate_custom_claims(&custom).is_ok());
    }

    #[test]
    fn custom_claims_round_trip_through_flatten() {
        let mut custom = HashMap::new();
        custom.insert("tenant".to_owned(), serde_json::json!("acme"));
        let claims = TokenClaims {
            sub: "u1".to_owned(),
            iat: 1,
            nbf: 1,
            exp: 100,
            iss: "straylight".to_owned(),
            aud: "api".to_owned(),
            jti: "j1".to_owned(),
            typ: TokenType::Access,
            refresh_count: None,
            access_jti: None,
            custom,
        };
        let json = serde_json::to_value(&claims).expect("serialize");
        assert_eq!(json["tenant"], "acme");
        assert_eq!(json["typ"], "access");
        let back: TokenClaims = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back.custom.get("tenant"), Some(&serde_json::json!("acme")));
    }
}
