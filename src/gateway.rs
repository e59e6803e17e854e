//! Per-request composition of the security components.
//!
//! Each inbound request flows through input validation, token
//! verification, and the permission check before the handler runs,
//! and every decision (allow or deny) is emitted to the audit
//! pipeline before the caller sees a response. Callers receive a
//! uniform [`GatewayError::AccessDenied`] for any authentication or
//! authorization failure; the internal cause (expired vs. revoked
//! vs. missing permission) is only distinguished in audit events.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditPipeline, AuditResult, AuditSeverity};
use crate::authz::policy::AccessContext;
use crate::authz::AuthorizationEngine;
use crate::guard::{FieldError, InputGuard, InputType, ValidationOptions};
use crate::token::claims::{TokenClaims, TokenType};
use crate::token::TokenService;

/// Caller-visible request outcome.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Uniform denial for any authentication or authorization failure.
    #[error("access denied")]
    AccessDenied,
    /// One or more fields failed validation.
    #[error("invalid input: {0:?}")]
    InvalidInput(Vec<FieldError>),
    /// The handler itself failed.
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

/// One inbound field with its declared type.
#[derive(Debug, Clone)]
pub struct GatewayField {
    /// Field name.
    pub name: String,
    /// Raw untrusted value.
    pub value: String,
    /// Declared type to validate against.
    pub declared: InputType,
}

impl GatewayField {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, value: impl Into<String>, declared: InputType) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            declared,
        }
    }
}

/// An inbound request before any trust decisions.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
    /// Bearer access token.
    pub token: String,
    /// Permission the handler requires.
    pub permission: String,
    /// Resource acted on, if the permission targets one.
    pub resource: Option<String>,
    /// Untrusted fields to validate.
    pub fields: Vec<GatewayField>,
    /// Caller source address.
    pub source_addr: Option<IpAddr>,
    /// Caller session id.
    pub session_id: Option<String>,
    /// Correlation id; generated when absent.
    pub correlation_id: Option<Uuid>,
}

/// Validated request state handed to the handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Verified access-token claims.
    pub claims: TokenClaims,
    /// Sanitized field values by name.
    pub fields: HashMap<String, String>,
    /// Correlation id for this request.
    pub correlation_id: Uuid,
}

/// Orchestrates guard, token, authorization, and audit for a request.
pub struct Gateway {
    tokens: Arc<TokenService>,
    authz: Arc<AuthorizationEngine>,
    audit: Arc<AuditPipeline>,
    guard: InputGuard,
    validation: ValidationOptions,
}

impl Gateway {
    /// Compose a gateway over shared component handles.
    pub fn new(
        tokens: Arc<TokenService>,
        authz: Arc<AuthorizationEngine>,
        audit: Arc<AuditPipeline>,
        validation: ValidationOptions,
    ) -> Self {
        Self {
            tokens,
            authz,
            audit,
            guard: InputGuard::new(),
            validation,
        }
    }

    /// Run one request through the full pipeline.
    ///
    /// Order: validate fields, verify the access token, check the
    /// permission (and resource policy), then run the handler. Every
    /// exit path emits an audit event first.
    pub async fn handle<T, F, Fut>(
        &self,
        request: GatewayRequest,
        handler: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let correlation_id = request.correlation_id.unwrap_or_else(Uuid::new_v4);

        let field_refs: Vec<(&str, &str, InputType)> = request
            .fields
            .iter()
            .map(|f| (f.name.as_str(), f.value.as_str(), f.declared))
            .collect();
        let sanitized = match self.guard.validate_fields(&field_refs, &self.validation) {
            Ok(values) => values.into_iter().collect::<HashMap<_, _>>(),
            Err(errors) => {
                let detail = errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.reason))
                    .collect::<Vec<_>>()
                    .join("; ");
                self.emit(
                    &request,
                    correlation_id,
                    AuditEvent::new(
                        AuditEventType::ValidationRejected,
                        AuditSeverity::Medium,
                        "anonymous",
                        AuditResult::Denied,
                    )
                    .with_error(detail),
                )
                .await;
                return Err(GatewayError::InvalidInput(errors));
            }
        };

        let claims = match self.tokens.verify(&request.token, TokenType::Access).await {
            Ok(claims) => claims,
            Err(e) => {
                warn!(error = %e, "token verification failed");
                self.emit(
                    &request,
                    correlation_id,
                    AuditEvent::new(
                        AuditEventType::AuthenticationFailure,
                        AuditSeverity::High,
                        "anonymous",
                        AuditResult::Denied,
                    )
                    .with_error(e.to_string()),
                )
                .await;
                return Err(GatewayError::AccessDenied);
            }
        };

        let ctx = AccessContext {
            source_ip: request.source_addr,
            at: None,
        };
        let allowed = self
            .authz
            .check(
                &claims.sub,
                &request.permission,
                request.resource.as_deref(),
                Some(&ctx),
            )
            .await;
        if !allowed {
            self.emit(
                &request,
                correlation_id,
                AuditEvent::new(
                    AuditEventType::AuthorizationDenied,
                    AuditSeverity::High,
                    claims.sub.clone(),
                    AuditResult::Denied,
                )
                .with_action(request.permission.clone())
                .with_error(format!("permission {} not granted", request.permission)),
            )
            .await;
            return Err(GatewayError::AccessDenied);
        }

        let subject = claims.sub.clone();
        let context = RequestContext {
            claims,
            fields: sanitized,
            correlation_id,
        };
        match handler(context).await {
            Ok(value) => {
                info!(subject = %subject, permission = %request.permission, "request allowed");
                self.emit(
                    &request,
                    correlation_id,
                    AuditEvent::new(
                        AuditEventType::AuthorizationGranted,
                        AuditSeverity::Info,
                        subject,
                        AuditResult::Success,
                    )
                    .with_action(request.permission.clone()),
                )
                .await;
                Ok(value)
            }
            Err(e) => {
                self.emit(
                    &request,
                    correlation_id,
                    AuditEvent::new(
                        AuditEventType::AuthorizationGranted,
                        AuditSeverity::Medium,
                        subject,
                        AuditResult::Error,
                    )
                    .with_action(request.permission.clone())
                    .with_error(e.to_string()),
                )
                .await;
                Err(GatewayError::Internal(e))
            }
        }
    }

    async fn emit(&self, request: &GatewayRequest, correlation_id: Uuid, event: AuditEvent) {
        let mut event = event.with_correlation(correlation_id);
        if let Some(resource) = &request.resource {
            event = event.with_resource(resource.clone());
        }
        if let Some(session) = &request.session_id {
            event = event.with_session(session.clone());
        }
        if let Some(addr) = request.source_addr {
            event = event.with_source_addr(addr.to_string());
        }
        if let Err(e) = self.audit.log_event(event).await {
            warn!(error = %e, "failed to record audit event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditQueryFilter};
    use crate::store::MemoryStore;

    async fn components() -> (Arc<TokenService>, Arc<AuthorizationEngine>, Arc<AuditPipeline>) {
        let store = Arc::new(MemoryStore::new());
        let tokens = Arc::new(
            TokenService::new(Default::default(), store.clone()).expect("token service"),
        );
        let authz = Arc::new(AuthorizationEngine::new(store));
        let audit = Arc::new(AuditPipeline::new(
            AuditConfig::default(),
            vec![],
            b"gateway-test".to_vec(),
        ));
        (tokens, authz, audit)
    }

    fn request(token: &str, permission: &str, fields: Vec<GatewayField>) -> GatewayRequest {
        GatewayRequest {
            token: token.to_owned(),
            permission: permission.to_owned(),
            resource: None,
            fields,
            source_addr: None,
            session_id: None,
            correlation_id: None,
        }
    }

    async fn seed_user(authz: &AuthorizationEngine, id: &str) {
        authz
            .create_user(id, &format!("{id}-name"), &format!("{id}@straylight.test"))
            .await
            .expect("create user");
        authz.assign_role(id, "viewer").await.expect("assign role");
    }

    #[tokio::test]
    async fn allowed_request_runs_handler_and_audits_success() {
        let (tokens, authz, audit) = components().await;
        seed_user(&authz, "u1").await;
        let pair = tokens
            .issue("u1", HashMap::new())
            .await
            .expect("issue");
        let gateway = Gateway::new(tokens, authz, audit.clone(), ValidationOptions::default());

        let result = gateway
            .handle(request(&pair.access_token, "config:read", vec![]), |ctx| async move {
                Ok(format!("hello {}", ctx.claims.sub))
            })
            .await
            .expect("allowed");
        assert_eq!(result, "hello u1");

        audit.flush().await.expect("flush");
        let granted = audit
            .query_events(&AuditQueryFilter {
                event_type: Some("authorization_granted".to_owned()),
                ..Default::default()
            })
            .await;
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].actor, "u1");
    }

    #[tokio::test]
    async fn bad_token_yields_uniform_denial_with_internal_audit_detail() {
        let (tokens, authz, audit) = components().await;
        let gateway = Gateway::new(tokens, authz, audit.clone(), ValidationOptions::default());

        let err = gateway
            .handle(request("not-a-token", "config:read", vec![]), |_ctx| async {
                Ok(())
            })
            .await
            .expect_err("denied");
        assert!(matches!(err, GatewayError::AccessDenied));

        audit.flush().await.expect("flush");
        let failures = audit
            .query_events(&AuditQueryFilter {
                event_type: Some("authentication_failure".to_owned()),
                ..Default::default()
            })
            .await;
        assert_eq!(failures.len(), 1);
        // Internal detail is captured, never returned to the caller.
        assert!(failures[0].error.is_some());
    }

    #[tokio::test]
    async fn missing_permission_yields_uniform_denial() {
        let (tokens, authz, audit) = components().await;
        seed_user(&authz, "u2").await;
        let pair = tokens
            .issue("u2", HashMap::new())
            .await
            .expect("issue");
        let gateway = Gateway::new(tokens, authz, audit.clone(), ValidationOptions::default());

        let err = gateway
            .handle(
                request(&pair.access_token, "config:delete", vec![]),
                |_ctx| async { Ok(()) },
            )
            .await
            .expect_err("denied");
        assert!(matches!(err, GatewayError::AccessDenied));

        audit.flush().await.expect("flush");
        let denied = audit
            .query_events(&AuditQueryFilter {
                event_type: Some("authorization_denied".to_owned()),
                ..Default::default()
            })
            .await;
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].action.as_deref(), Some("config:delete"));
    }

    #[tokio::test]
    async fn invalid_fields_are_aggregated_before_any_trust_decision() {
        let (tokens, authz, audit) = components().await;
        let gateway = Gateway::new(tokens, authz, audit.clone(), ValidationOptions::default());

        let fields = vec![
            GatewayField::new("age", "abc", InputType::Integer),
            GatewayField::new("email", "nope", InputType::Email),
        ];
        let err = gateway
            .handle(request("irrelevant", "config:read", fields), |_ctx| async {
                Ok(())
            })
            .await
            .expect_err("rejected");
        let GatewayError::InvalidInput(errors) = err else {
            panic!("expected InvalidInput");
        };
        assert_eq!(errors.len(), 2);

        audit.flush().await.expect("flush");
        let rejected = audit
            .query_events(&AuditQueryFilter {
                event_type: Some("validation_rejected".to_owned()),
                ..Default::default()
            })
            .await;
        assert_eq!(rejected.len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_is_internal_not_denial() {
        let (tokens, authz, audit) = components().await;
        seed_user(&authz, "u3").await;
        let pair = tokens
            .issue("u3", HashMap::new())
            .await
            .expect("issue");
        let gateway = Gateway::new(tokens, authz, audit, ValidationOptions::default());

        let err = gateway
            .handle(
                request(&pair.access_token, "config:read", vec![]),
                |_ctx| async { Err::<(), _>(anyhow::anyhow!("backend down")) },
            )
            .await
            .expect_err("internal");
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[tokio::test]
    async fn sanitized_fields_reach_the_handler() {
        let (tokens, authz, audit) = components().await;
        seed_user(&authz, "u4").await;
        let pair = tokens
            .issue("u4", HashMap::new())
            .await
            .expect("issue");
        let gateway = Gateway::new(tokens, authz, audit, ValidationOptions::default());

        let fields = vec![GatewayField::new(
            "note",
            "hi <script>alert(1)</script>there",
            InputType::String,
        )];
        let note = gateway
            .handle(request(&pair.access_token, "config:read", fields), |ctx| async move {
                Ok(ctx.fields.get("note").cloned().unwrap_or_default())
            })
            .await
            .expect("allowed");
        assert!(!note.contains("<script>"));
        assert!(note.contains("hi"));
    }
}
