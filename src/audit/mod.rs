//! Structured security-event pipeline.
//!
//! Events are stamped with an id and a keyed integrity hash, pushed
//! onto a bounded queue, and drained by a single background consumer
//! into batches (size- or interval-triggered). Each batch is delivered
//! to every sink independently; a sink failure is recorded and never
//! blocks the others. When the queue is full, [`AuditPipeline::log_event`]
//! falls back to synchronous delivery; a security event is never
//! silently dropped.

pub mod sinks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use sinks::{
    ArchiveSink, AuditQueryFilter, AuditSink, FsObjectStore, JsonlFileSink, ObjectStore,
    SearchSink, SinkError,
};

/// Pipeline failure modes.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The pipeline was shut down and can no longer accept events.
    #[error("audit pipeline is closed")]
    Closed,
}

/// Event severity, ordered lowest to highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    /// Routine observability.
    Info,
    /// Low-impact anomaly.
    Low,
    /// Notable security decision.
    Medium,
    /// Denials and privileged mutations; archived durably.
    High,
    /// Incidents; archived durably with retry.
    Critical,
}

/// Security event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A token verification succeeded.
    AuthenticationSuccess,
    /// A token verification failed (expired/revoked/malformed).
    AuthenticationFailure,
    /// A permission check passed.
    AuthorizationGranted,
    /// A permission or policy check denied.
    AuthorizationDenied,
    /// A token pair was issued.
    TokenIssued,
    /// A refresh token was exchanged.
    TokenRefreshed,
    /// A token was revoked.
    TokenRevoked,
    /// A secret was read through the facade.
    SecretAccess,
    /// A secret was created, updated, or deleted.
    SecretMutation,
    /// A key rotation ran.
    KeyRotation,
    /// Input validation rejected a request.
    ValidationRejected,
    /// A role or role assignment changed.
    RoleChange,
    /// A user record changed.
    UserChange,
    /// The pipeline failed to deliver to a sink after retries.
    PipelineFailure,
}

impl AuditEventType {
    /// Snake-case name, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::AuthenticationSuccess => "authentication_success",
            AuditEventType::AuthenticationFailure => "authentication_failure",
            AuditEventType::AuthorizationGranted => "authorization_granted",
            AuditEventType::AuthorizationDenied => "authorization_denied",
            AuditEventType::TokenIssued => "token_issued",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::TokenRevoked => "token_revoked",
            AuditEventType::SecretAccess => "secret_access",
            AuditEventType::SecretMutation => "secret_mutation",
            AuditEventType::KeyRotation => "key_rotation",
            AuditEventType::ValidationRejected => "validation_rejected",
            AuditEventType::RoleChange => "role_change",
            AuditEventType::UserChange => "user_change",
            AuditEventType::PipelineFailure => "pipeline_failure",
        }
    }
}

/// Outcome recorded on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    /// The operation succeeded.
    Success,
    /// The operation was denied.
    Denied,
    /// The operation failed with an error.
    Error,
}

/// An immutable security event.
///
/// Once sealed (id + integrity hash assigned) an event is never
/// updated in place; the hash is verified, not recomputed, on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event id.
    pub id: Uuid,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event_type: AuditEventType,
    /// How serious it is.
    pub severity: AuditSeverity,
    /// Who did it (subject id, or `"anonymous"`).
    pub actor: String,
    /// Session identifier, if the caller has one.
    pub session_id: Option<String>,
    /// Caller source address.
    pub source_addr: Option<String>,
    /// Resource acted on.
    pub resource: Option<String>,
    /// Action attempted.
    pub action: Option<String>,
    /// Outcome.
    pub result: AuditResult,
    /// Internal error detail (never exposed to end callers).
    pub error: Option<String>,
    /// Free-form structured context.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Keyed digest over (id, timestamp, event type, actor).
    pub integrity: String,
    /// Correlates events from one request.
    pub correlation_id: Option<Uuid>,
}

impl AuditEvent {
    /// Create an unsealed event. The pipeline seals it before queueing.
    pub fn new(
        event_type: AuditEventType,
        severity: AuditSeverity,
        actor: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            severity,
            actor: actor.into(),
            session_id: None,
            source_addr: None,
            resource: None,
            action: None,
            result,
            error: None,
            metadata: HashMap::new(),
            integrity: String::new(),
            correlation_id: None,
        }
    }

    /// Set the resource acted on.
    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Set the action attempted.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Record internal error detail.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Set the caller session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the caller source address.
    pub fn with_source_addr(mut self, addr: impl Into<String>) -> Self {
        self.source_addr = Some(addr.into());
        self
    }

    /// Set the request correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Stamp the integrity hash. Called once by the pipeline.
    pub fn seal(&mut self, key: &[u8]) {
        self.integrity = self.compute_integrity(key);
    }

    /// Verify the integrity hash against `key`.
    pub fn verify_integrity(&self, key: &[u8]) -> bool {
        !self.integrity.is_empty() && self.integrity == self.compute_integrity(key)
    }

    fn compute_integrity(&self, key: &[u8]) -> String {
        // HMAC accepts any key length; this cannot fail.
        let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(key) else {
            return String::new();
        };
        mac.update(self.id.to_string().as_bytes());
        mac.update(b"|");
        mac.update(
            self.timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true)
                .as_bytes(),
        );
        mac.update(b"|");
        mac.update(self.event_type.as_str().as_bytes());
        mac.update(b"|");
        mac.update(self.actor.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Pipeline tuning knobs.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    /// Bounded queue capacity before synchronous fallback.
    pub queue_capacity: usize,
    /// Events per batch before an early flush.
    pub batch_size: usize,
    /// Time-based flush interval.
    pub flush_interval: Duration,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            batch_size: 64,
            flush_interval: Duration::from_secs(5),
        }
    }
}

enum PipelineMsg {
    Event(AuditEvent),
    Flush(oneshot::Sender<()>),
}

/// Asynchronous batching pipeline over a set of [`AuditSink`]s.
pub struct AuditPipeline {
    tx: mpsc::Sender<PipelineMsg>,
    sinks: Arc<Vec<Arc<dyn AuditSink>>>,
    search: Arc<SearchSink>,
    hmac_key: Vec<u8>,
    consumer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AuditPipeline {
    /// Start a pipeline. `extra_sinks` join the always-present search
    /// sink; `hmac_key` seals event integrity hashes.
    pub fn new(config: AuditConfig, extra_sinks: Vec<Arc<dyn AuditSink>>, hmac_key: Vec<u8>) -> Self {
        let search = Arc::new(SearchSink::new(hmac_key.clone()));
        let mut all: Vec<Arc<dyn AuditSink>> = vec![search.clone()];
        all.extend(extra_sinks);
        let sinks = Arc::new(all);

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let consumer = tokio::spawn(consume(
            rx,
            sinks.clone(),
            hmac_key.clone(),
            config.batch_size.max(1),
            config.flush_interval,
        ));

        Self {
            tx,
            sinks,
            search,
            hmac_key,
            consumer: std::sync::Mutex::new(Some(consumer)),
        }
    }

    /// Seal and enqueue an event.
    ///
    /// If the queue is full the event is delivered synchronously on
    /// the caller's task instead of being dropped.
    pub async fn log_event(&self, mut event: AuditEvent) -> Result<(), AuditError> {
        event.seal(&self.hmac_key);
        match self.tx.try_send(PipelineMsg::Event(event)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(PipelineMsg::Event(event))) => {
                warn!("audit queue full, delivering synchronously");
                let mut failures = deliver_batch(&self.sinks, &[event]).await;
                if !failures.is_empty() {
                    for failure in &mut failures {
                        failure.seal(&self.hmac_key);
                    }
                    // The queue is full, so failure events take the
                    // same synchronous path as the event itself. An
                    // all-failure batch produces no further failures.
                    deliver_batch(&self.sinks, &failures).await;
                }
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AuditError::Closed),
        }
    }

    /// Drain everything queued so far and deliver it. Deterministic
    /// barrier for tests and shutdown paths.
    pub async fn flush(&self) -> Result<(), AuditError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PipelineMsg::Flush(ack_tx))
            .await
            .map_err(|_| AuditError::Closed)?;
        ack_rx.await.map_err(|_| AuditError::Closed)
    }

    /// Query delivered events from the search sink.
    pub async fn query_events(&self, filter: &AuditQueryFilter) -> Vec<AuditEvent> {
        self.search.query(filter).await
    }

    /// Stop the consumer after draining the queue.
    pub async fn shutdown(&self) {
        let _ = self.flush().await;
        let handle = {
            let mut guard = match self.consumer.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn consume(
    mut rx: mpsc::Receiver<PipelineMsg>,
    sinks: Arc<Vec<Arc<dyn AuditSink>>>,
    hmac_key: Vec<u8>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<AuditEvent> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(PipelineMsg::Event(event)) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        drain(&sinks, &mut batch, &hmac_key).await;
                    }
                }
                Some(PipelineMsg::Flush(ack)) => {
                    // Pull everything already queued before acking so
                    // flush() is a true barrier.
                    while let Ok(msg) = rx.try_recv() {
                        match msg {
                            PipelineMsg::Event(event) => batch.push(event),
                            PipelineMsg::Flush(extra_ack) => {
                                let _ = extra_ack.send(());
                            }
                        }
                    }
                    drain(&sinks, &mut batch, &hmac_key).await;
                    let _ = ack.send(());
                }
                None => {
                    drain(&sinks, &mut batch, &hmac_key).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    drain(&sinks, &mut batch, &hmac_key).await;
                }
            }
        }
    }
    debug!("audit consumer stopped");
}

async fn drain(sinks: &[Arc<dyn AuditSink>], batch: &mut Vec<AuditEvent>, hmac_key: &[u8]) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let mut failures = deliver_batch(sinks, &events).await;
    for failure in &mut failures {
        failure.seal(hmac_key);
    }
    // Failure events ride the next batch; they never recurse into new
    // failure events (see deliver_batch).
    batch.extend(failures);
}

/// Deliver one batch to every sink independently. Returns pipeline
/// self-failure events for sinks that failed on a batch containing
/// non-failure events.
async fn deliver_batch(sinks: &[Arc<dyn AuditSink>], batch: &[AuditEvent]) -> Vec<AuditEvent> {
    let mut failures = Vec::new();
    let reportable = batch
        .iter()
        .any(|e| e.event_type != AuditEventType::PipelineFailure);
    for sink in sinks {
        if let Err(e) = sink.deliver(batch).await {
            error!(sink = sink.name(), error = %e, "audit sink delivery failed");
            if reportable {
                failures.push(
                    AuditEvent::new(
                        AuditEventType::PipelineFailure,
                        AuditSeverity::Critical,
                        "audit-pipeline",
                        AuditResult::Error,
                    )
                    .with_error(e.to_string())
                    .with_metadata("sink", serde_json::json!(sink.name())),
                );
            }
        }
    }
    failures
}
