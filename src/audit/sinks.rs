//! Audit delivery sinks.
//!
//! Three sinks ship with the pipeline: a JSON-lines file sink with
//! daily rotation (gzip on rotation), a durable object-storage archive
//! for high-severity events, and an in-memory search sink backing
//! `query_events`. Each sink delivers independently; one sink's
//! failure never blocks another.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{AuditEvent, AuditSeverity};

/// Sink delivery failure.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Filesystem failure in a local sink.
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    /// Event could not be serialized.
    #[error("sink serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// The archive store rejected the object after all retries.
    #[error("archive store failed for {key}: {reason}")]
    Archive {
        /// Object key that failed.
        key: String,
        /// Last failure reason.
        reason: String,
    },
}

/// A destination for audit event batches.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Stable sink name for logs and self-failure events.
    fn name(&self) -> &str;

    /// Deliver a batch. Implementations filter internally (for
    /// example, the archive sink ignores low-severity events).
    async fn deliver(&self, batch: &[AuditEvent]) -> Result<(), SinkError>;
}

// ── JSON-lines file sink ────────────────────────────────────────

struct FileState {
    date: NaiveDate,
    file: std::fs::File,
    path: PathBuf,
}

/// Appends events as JSON lines to `{dir}/{prefix}.{yyyy-mm-dd}.jsonl`,
/// rotating daily and gzip-compressing the finished file.
pub struct JsonlFileSink {
    dir: PathBuf,
    prefix: String,
    state: Mutex<Option<FileState>>,
}

impl JsonlFileSink {
    /// Create a sink writing under `dir`.
    pub fn new(dir: impl AsRef<Path>, prefix: impl Into<String>) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
            state: Mutex::new(None),
        })
    }

    fn file_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}.{}.jsonl", self.prefix, date.format("%Y-%m-%d")))
    }

    fn write_lines(&self, lines: &[String], today: NaiveDate) -> Result<(), SinkError> {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let rotate_from = match guard.as_ref() {
            Some(state) if state.date != today => Some(state.path.clone()),
            _ => None,
        };
        if let Some(old_path) = rotate_from {
            *guard = None;
            if let Err(e) = gzip_file(&old_path) {
                warn!(path = %old_path.display(), error = %e, "audit log rotation failed");
            }
        }

        if guard.is_none() {
            let path = self.file_path(today);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            *guard = Some(FileState {
                date: today,
                file,
                path,
            });
        }

        if let Some(state) = guard.as_mut() {
            for line in lines {
                writeln!(state.file, "{line}")?;
            }
            state.file.flush()?;
        }
        Ok(())
    }
}

/// Compress `path` to `{path}.gz` and remove the original.
fn gzip_file(path: &Path) -> std::io::Result<()> {
    let contents = std::fs::read(path)?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let file = std::fs::File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    std::fs::remove_file(path)
}

#[async_trait]
impl AuditSink for JsonlFileSink {
    fn name(&self) -> &str {
        "jsonl-file"
    }

    async fn deliver(&self, batch: &[AuditEvent]) -> Result<(), SinkError> {
        let mut lines = Vec::with_capacity(batch.len());
        for event in batch {
            lines.push(serde_json::to_string(event)?);
        }
        self.write_lines(&lines, Utc::now().date_naive())
    }
}

// ── Archive sink ────────────────────────────────────────────────

/// Durable object storage behind the archive sink.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object at `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), String>;
}

/// Filesystem-backed [`ObjectStore`] used locally and in tests.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store objects as files under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), String> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        std::fs::write(&path, bytes).map_err(|e| e.to_string())
    }
}

/// Archives CRITICAL/HIGH events to object storage, one compressed
/// JSON object per event under
/// `{prefix}/{yyyy}/{mm}/{dd}/{event-type}/{event-id}.json.gz`.
pub struct ArchiveSink {
    store: std::sync::Arc<dyn ObjectStore>,
    prefix: String,
    max_attempts: u32,
    base_backoff: Duration,
}

impl ArchiveSink {
    /// Create an archive sink over `store`.
    pub fn new(
        store: std::sync::Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        max_attempts: u32,
        base_backoff: Duration,
    ) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    fn object_key(&self, event: &AuditEvent) -> String {
        let at: DateTime<Utc> = event.timestamp;
        format!(
            "{}/{:04}/{:02}/{:02}/{}/{}.json.gz",
            self.prefix,
            at.year(),
            at.month(),
            at.day(),
            event.event_type.as_str(),
            event.id
        )
    }

    async fn archive_one(&self, event: &AuditEvent) -> Result<(), SinkError> {
        let key = self.object_key(event);
        let json = serde_json::to_vec(event)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        let compressed = encoder.finish()?;

        let mut delay = self.base_backoff;
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            match self.store.put(&key, compressed.clone()).await {
                Ok(()) => return Ok(()),
                Err(reason) if attempt < self.max_attempts => {
                    debug!(%key, attempt, %reason, "archive put failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(reason) => {
                    return Err(SinkError::Archive { key, reason });
                }
            }
        }
    }
}

#[async_trait]
impl AuditSink for ArchiveSink {
    fn name(&self) -> &str {
        "archive"
    }

    async fn deliver(&self, batch: &[AuditEvent]) -> Result<(), SinkError> {
        let mut first_error = None;
        for event in batch {
            if event.severity < AuditSeverity::High {
                continue;
            }
            if let Err(e) = self.archive_one(event).await {
                warn!(event_id = %event.id, error = %e, "event archival failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ── Search sink ─────────────────────────────────────────────────

/// Filters accepted by [`SearchSink::query`]. All present fields must
/// match (field equality), and the time range is inclusive.
#[derive(Debug, Clone, Default)]
pub struct AuditQueryFilter {
    /// Earliest timestamp to include.
    pub from: Option<DateTime<Utc>>,
    /// Latest timestamp to include.
    pub to: Option<DateTime<Utc>>,
    /// Exact event type.
    pub event_type: Option<String>,
    /// Exact actor id.
    pub actor: Option<String>,
    /// Minimum severity.
    pub min_severity: Option<AuditSeverity>,
    /// Exact resource.
    pub resource: Option<String>,
    /// Exact correlation id.
    pub correlation_id: Option<uuid::Uuid>,
}

/// Queryable in-memory log-search backend.
///
/// Integrity hashes are verified on read with the key the pipeline
/// sealed events with; events failing verification are excluded and
/// logged.
pub struct SearchSink {
    events: RwLock<Vec<AuditEvent>>,
    hmac_key: Vec<u8>,
}

impl SearchSink {
    /// Create a search sink verifying with `hmac_key`.
    pub fn new(hmac_key: Vec<u8>) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            hmac_key,
        }
    }

    /// Query stored events with time-range + field-equality filters.
    pub async fn query(&self, filter: &AuditQueryFilter) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|event| {
                if !event.verify_integrity(&self.hmac_key) {
                    warn!(event_id = %event.id, "integrity check failed, excluding from results");
                    return false;
                }
                filter.from.is_none_or(|from| event.timestamp >= from)
                    && filter.to.is_none_or(|to| event.timestamp <= to)
                    && filter
                        .event_type
                        .as_deref()
                        .is_none_or(|t| event.event_type.as_str() == t)
                    && filter
                        .actor
                        .as_deref()
                        .is_none_or(|a| event.actor == a)
                    && filter
                        .min_severity
                        .is_none_or(|s| event.severity >= s)
                    && filter
                        .resource
                        .as_deref()
                        .is_none_or(|r| event.resource.as_deref() == Some(r))
                    && filter
                        .correlation_id
                        .is_none_or(|c| event.correlation_id == Some(c))
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AuditSink for SearchSink {
    fn name(&self) -> &str {
        "search"
    }

    async fn deliver(&self, batch: &[AuditEvent]) -> Result<(), SinkError> {
        let mut events = self.events.write().await;
        events.extend(batch.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEventType, AuditResult};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn sealed_event(key: &[u8], severity: AuditSeverity) -> AuditEvent {
        let mut event = AuditEvent::new(
            AuditEventType::AuthenticationFailure,
            severity,
            "u1",
            AuditResult::Denied,
        );
        event.seal(key);
        event
    }

    #[tokio::test]
    async fn jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = JsonlFileSink::new(dir.path(), "audit").expect("sink");
        let key = b"test-key".to_vec();
        let batch = vec![sealed_event(&key, AuditSeverity::Info), sealed_event(&key, AuditSeverity::High)];
        sink.deliver(&batch).await.expect("deliver");

        let path = sink.file_path(Utc::now().date_naive());
        let contents = std::fs::read_to_string(path).expect("read log");
        let lines: Vec<&str> = contents.trim().lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            serde_json::from_str::<serde_json::Value>(line).expect("valid json line");
        }
    }

    #[tokio::test]
    async fn archive_sink_stores_only_high_severity() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FsObjectStore::new(dir.path()));
        let sink = ArchiveSink::new(store, "audit", 3, Duration::from_millis(1));
        let key = b"test-key".to_vec();

        let low = sealed_event(&key, AuditSeverity::Info);
        let high = sealed_event(&key, AuditSeverity::Critical);
        sink.deliver(&[low.clone(), high.clone()]).await.expect("deliver");

        let mut archived = Vec::new();
        collect_files(dir.path(), &mut archived);
        assert_eq!(archived.len(), 1);
        let name = archived[0].to_string_lossy().to_string();
        assert!(name.contains(&high.id.to_string()));
        assert!(name.ends_with(".json.gz"));
        assert!(name.contains("authentication_failure"));
    }

    fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) {
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    collect_files(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
    }

    /// Store that fails a fixed number of times before accepting.
    struct FlakyStore {
        failures: AtomicU32,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn put(&self, _key: &str, _bytes: Vec<u8>) -> Result<(), String> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err("transient".to_owned());
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn archive_retries_with_backoff() {
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(2),
        });
        let sink = ArchiveSink::new(store, "audit", 3, Duration::from_millis(1));
        let key = b"test-key".to_vec();
        sink.deliver(&[sealed_event(&key, AuditSeverity::Critical)])
            .await
            .expect("third attempt succeeds");
    }

    #[tokio::test]
    async fn archive_exhaustion_surfaces_error() {
        let store = Arc::new(FlakyStore {
            failures: AtomicU32::new(10),
        });
        let sink = ArchiveSink::new(store, "audit", 2, Duration::from_millis(1));
        let key = b"test-key".to_vec();
        let err = sink
            .deliver(&[sealed_event(&key, AuditSeverity::Critical)])
            .await
            .expect_err("retries exhausted");
        assert!(matches!(err, SinkError::Archive { .. }));
    }

    #[tokio::test]
    async fn search_sink_filters_and_verifies() {
        let key = b"test-key".to_vec();
        let sink = SearchSink::new(key.clone());

        let good = sealed_event(&key, AuditSeverity::High);
        let mut tampered = sealed_event(&key, AuditSeverity::High);
        tampered.actor = "someone-else".to_owned();
        sink.deliver(&[good.clone(), tampered]).await.expect("deliver");

        let all = sink.query(&AuditQueryFilter::default()).await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, good.id);

        let none = sink
            .query(&AuditQueryFilter {
                actor: Some("other".to_owned()),
                ..Default::default()
            })
            .await;
        assert!(none.is_empty());

        let by_severity = sink
            .query(&AuditQueryFilter {
                min_severity: Some(AuditSeverity::Critical),
                ..Default::default()
            })
            .await;
        assert!(by_severity.is_empty());
    }
}
