#![allow(missing_docs)]
// End-to-end tests across the security components.
//
// Exercises the full flows a relying service would drive: token
// lifecycle with revocation, role-based checks, input rejection,
// secrets fallback with caching, and crypto rotation, plus the
// composed gateway path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use straylight::audit::{AuditConfig, AuditPipeline, AuditQueryFilter};
use straylight::authz::AuthorizationEngine;
use straylight::crypto::CryptoEngine;
use straylight::gateway::{Gateway, GatewayField, GatewayRequest};
use straylight::guard::{InputGuard, InputType, ValidationOptions};
use straylight::secrets::backend::{BackendError, EnvBackend, SecretBackend};
use straylight::secrets::{RetryPolicy, SecretsFacade};
use straylight::store::MemoryStore;
use straylight::token::claims::TokenType;
use straylight::token::{TokenConfig, TokenError, TokenService};

// ── Test fixtures ──

fn token_service() -> TokenService {
    TokenService::new(TokenConfig::default(), Arc::new(MemoryStore::new()))
        .expect("token service")
}

fn perms(names: &[&str]) -> HashSet<String> {
    names.iter().map(|p| (*p).to_owned()).collect()
}

/// Backend whose reads always fail as transiently unavailable.
struct DownBackend {
    calls: AtomicU32,
}

#[async_trait]
impl SecretBackend for DownBackend {
    fn name(&self) -> &str {
        "down"
    }

    async fn get(&self, _id: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BackendError::Unavailable("connection refused".to_owned()))
    }

    async fn create(&self, _id: &str, _value: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("connection refused".to_owned()))
    }

    async fn update(&self, _id: &str, _value: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("connection refused".to_owned()))
    }

    async fn delete(&self, _id: &str) -> Result<(), BackendError> {
        Err(BackendError::Unavailable("connection refused".to_owned()))
    }

    async fn list(&self, _prefix: Option<&str>) -> Result<Vec<String>, BackendError> {
        Err(BackendError::Unavailable("connection refused".to_owned()))
    }
}

// ── Token lifecycle ──

#[tokio::test]
async fn issued_token_carries_claims_and_dies_on_revocation() {
    let service = token_service();
    let mut custom = HashMap::new();
    custom.insert("tenant".to_owned(), serde_json::json!("acme"));

    let pair = service.issue("u1", custom).await.expect("issue");

    let claims = service
        .verify(&pair.access_token, TokenType::Access)
        .await
        .expect("verify");
    assert_eq!(claims.sub, "u1");
    assert_eq!(claims.custom.get("tenant"), Some(&serde_json::json!("acme")));

    service.revoke(&pair.access_token).await.expect("revoke");
    let err = service
        .verify(&pair.access_token, TokenType::Access)
        .await
        .expect_err("revoked");
    assert!(matches!(err, TokenError::Revoked));
}

#[tokio::test]
async fn refresh_chain_is_revoked_after_the_limit() {
    let config = TokenConfig {
        max_refresh_count: 2,
        ..TokenConfig::default()
    };
    let service = TokenService::new(config, Arc::new(MemoryStore::new())).expect("service");
    let pair = service.issue("u1", HashMap::new()).await.expect("issue");

    service.refresh(&pair.refresh_token).await.expect("refresh 1");
    service.refresh(&pair.refresh_token).await.expect("refresh 2");

    let err = service
        .refresh(&pair.refresh_token)
        .await
        .expect_err("limit");
    assert!(matches!(err, TokenError::RefreshLimitExceeded));

    // The chain is dead from here on.
    assert!(service.refresh(&pair.refresh_token).await.is_err());
}

// ── Authorization ──

#[tokio::test]
async fn editor_role_grants_exactly_its_permissions() {
    let authz = AuthorizationEngine::new(Arc::new(MemoryStore::new()));
    authz
        .create_role("editor", "Edits configuration", perms(&["config:write"]), vec![])
        .await
        .expect("create role");
    authz
        .create_user("u2", "molly", "molly@straylight.test")
        .await
        .expect("create user");
    authz.assign_role("u2", "editor").await.expect("assign");

    assert!(authz.check("u2", "config:write", None, None).await);
    assert!(!authz.check("u2", "config:delete", None, None).await);
}

// ── Input validation ──

#[test]
fn sql_injection_is_rejected_with_the_original_value() {
    let guard = InputGuard::new();
    let outcome = guard.validate("' OR 1=1 --", InputType::Sql, &ValidationOptions::default());
    assert!(!outcome.ok);
    assert_eq!(outcome.sanitized, "' OR 1=1 --");
    assert_eq!(
        outcome.error.as_deref(),
        Some("Potential SQL injection detected")
    );
}

// ── Secrets fallback and caching ──

#[tokio::test]
async fn fallback_backend_serves_and_result_is_cached() {
    let down = Arc::new(DownBackend {
        calls: AtomicU32::new(0),
    });
    let mut vars = BTreeMap::new();
    vars.insert("SL_DB_PASSWORD".to_owned(), "hunter2".to_owned());
    let env = Arc::new(EnvBackend::from_map("SL_", vars));

    let facade = SecretsFacade::new(
        vec![down.clone(), env],
        Duration::from_secs(60),
        RetryPolicy {
            attempts: 2,
            base_delay: Duration::from_millis(1),
        },
    );

    let secret = facade.get_secret("db/password", true).await.expect("get");
    assert_eq!(secret.expose(), "hunter2");
    let first_round_calls = down.calls.load(Ordering::SeqCst);
    assert!(first_round_calls >= 1);

    // Within the TTL the value comes from the cache: no backend I/O.
    let cached = facade.get_secret("db/password", true).await.expect("cached");
    assert_eq!(cached.expose(), "hunter2");
    assert_eq!(down.calls.load(Ordering::SeqCst), first_round_calls);
}

// ── Crypto rotation ──

#[test]
fn rotation_preserves_old_payloads_within_the_grace_window() {
    let engine = CryptoEngine::ephemeral();
    let payload = engine
        .encrypt(b"the sky above the port", "user-data")
        .expect("encrypt");

    let report = engine.rotate_keys(Some("user-data"));
    assert!(report.new_versions.contains_key("user-data"));

    // Old payload still decrypts; new payloads use the new version.
    let plaintext = engine.decrypt(&payload).expect("decrypt old");
    assert_eq!(plaintext, b"the sky above the port");

    let fresh = engine.encrypt(b"again", "user-data").expect("encrypt new");
    assert!(fresh.key_version > payload.key_version);
    assert_eq!(engine.decrypt(&fresh).expect("decrypt new"), b"again");

    // Rotating with nothing new changes no decryption outcome.
    engine.rotate_keys(None);
    assert_eq!(engine.decrypt(&payload).expect("still valid"), b"the sky above the port");
}

// ── Composed gateway flow ──

#[tokio::test]
async fn gateway_flow_denies_then_allows_and_audits_both() {
    let store = Arc::new(MemoryStore::new());
    let tokens = Arc::new(
        TokenService::new(TokenConfig::default(), store.clone()).expect("token service"),
    );
    let authz = Arc::new(AuthorizationEngine::new(store));
    let audit = Arc::new(AuditPipeline::new(
        AuditConfig::default(),
        vec![],
        b"e2e-test-key".to_vec(),
    ));
    let gateway = Gateway::new(
        tokens.clone(),
        authz.clone(),
        audit.clone(),
        ValidationOptions::default(),
    );

    authz
        .create_user("u3", "armitage", "armitage@straylight.test")
        .await
        .expect("create user");
    authz.assign_role("u3", "viewer").await.expect("assign");
    let pair = tokens.issue("u3", HashMap::new()).await.expect("issue");

    let request = |permission: &str| GatewayRequest {
        token: pair.access_token.clone(),
        permission: permission.to_owned(),
        resource: None,
        fields: vec![GatewayField::new("name", "case", InputType::String)],
        source_addr: None,
        session_id: Some("sess-1".to_owned()),
        correlation_id: None,
    };

    // Viewer cannot write config.
    assert!(gateway
        .handle(request("config:write"), |_ctx| async { Ok(()) })
        .await
        .is_err());

    // Viewer can read it.
    let who = gateway
        .handle(request("config:read"), |ctx| async move {
            Ok(ctx.claims.sub)
        })
        .await
        .expect("allowed");
    assert_eq!(who, "u3");

    audit.flush().await.expect("flush");
    let denied = audit
        .query_events(&AuditQueryFilter {
            event_type: Some("authorization_denied".to_owned()),
            ..Default::default()
        })
        .await;
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].session_id.as_deref(), Some("sess-1"));

    let granted = audit
        .query_events(&AuditQueryFilter {
            event_type: Some("authorization_granted".to_owned()),
            ..Default::default()
        })
        .await;
    assert_eq!(granted.len(), 1);
}
