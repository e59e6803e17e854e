//! Configuration loading and management.
//!
//! Loads configuration from `./straylight.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file
//! values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audit::AuditConfig;
use crate::guard::ValidationOptions;
use crate::token::TokenConfig;

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration loaded from TOML.
///
/// Path: `./straylight.toml` or `$STRAYLIGHT_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StraylightConfig {
    /// Token issuance and verification settings (`[token]`).
    pub token: TokenSettings,
    /// Key derivation and rotation settings (`[crypto]`).
    pub crypto: CryptoSettings,
    /// Cache TTLs (`[cache]`).
    pub cache: CacheSettings,
    /// Audit pipeline tuning (`[audit]`).
    pub audit: AuditSettings,
    /// Input validation settings (`[guard]`).
    pub guard: GuardSettings,
    /// Logging settings (`[logging]`).
    pub logging: LoggingSettings,
}

impl StraylightConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./straylight.toml`.
    /// If the file does not exist, returns defaults.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: StraylightConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(StraylightConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config file path: `$STRAYLIGHT_CONFIG_PATH`, then
    /// `./straylight.toml` in the working directory.
    fn config_path() -> PathBuf {
        Self::config_path_with(|key| std::env::var(key).ok())
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("STRAYLIGHT_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("straylight.toml"))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        fn parse_override<T: std::str::FromStr>(var: &str, value: &str, slot: &mut T) {
            match value.parse() {
                Ok(v) => *slot = v,
                Err(_) => tracing::warn!(
                    var,
                    value,
                    "ignoring invalid env override"
                ),
            }
        }

        // Token.
        if let Some(v) = env("STRAYLIGHT_TOKEN_ISSUER") {
            self.token.issuer = v;
        }
        if let Some(v) = env("STRAYLIGHT_TOKEN_AUDIENCE") {
            self.token.audience = v;
        }
        if let Some(v) = env("STRAYLIGHT_ACCESS_TTL_SECS") {
            parse_override("STRAYLIGHT_ACCESS_TTL_SECS", &v, &mut self.token.access_ttl_seconds);
        }
        if let Some(v) = env("STRAYLIGHT_REFRESH_TTL_SECS") {
            parse_override("STRAYLIGHT_REFRESH_TTL_SECS", &v, &mut self.token.refresh_ttl_seconds);
        }
        if let Some(v) = env("STRAYLIGHT_MAX_REFRESH_COUNT") {
            parse_override("STRAYLIGHT_MAX_REFRESH_COUNT", &v, &mut self.token.max_refresh_count);
        }
        if let Some(v) = env("STRAYLIGHT_STORE_TIMEOUT_MILLIS") {
            parse_override(
                "STRAYLIGHT_STORE_TIMEOUT_MILLIS",
                &v,
                &mut self.token.store_timeout_millis,
            );
        }

        // Crypto.
        if let Some(v) = env("STRAYLIGHT_KDF_ITERATIONS") {
            parse_override("STRAYLIGHT_KDF_ITERATIONS", &v, &mut self.crypto.kdf_iterations);
        }
        if let Some(v) = env("STRAYLIGHT_ROTATION_GRACE_DAYS") {
            parse_override(
                "STRAYLIGHT_ROTATION_GRACE_DAYS",
                &v,
                &mut self.crypto.rotation_grace_days,
            );
        }

        // Cache.
        if let Some(v) = env("STRAYLIGHT_SECRETS_CACHE_TTL_SECS") {
            parse_override(
                "STRAYLIGHT_SECRETS_CACHE_TTL_SECS",
                &v,
                &mut self.cache.secrets_ttl_seconds,
            );
        }

        // Audit.
        if let Some(v) = env("STRAYLIGHT_AUDIT_QUEUE_CAPACITY") {
            parse_override(
                "STRAYLIGHT_AUDIT_QUEUE_CAPACITY",
                &v,
                &mut self.audit.queue_capacity,
            );
        }
        if let Some(v) = env("STRAYLIGHT_AUDIT_BATCH_SIZE") {
            parse_override("STRAYLIGHT_AUDIT_BATCH_SIZE", &v, &mut self.audit.batch_size);
        }
        if let Some(v) = env("STRAYLIGHT_AUDIT_FLUSH_SECS") {
            parse_override(
                "STRAYLIGHT_AUDIT_FLUSH_SECS",
                &v,
                &mut self.audit.flush_interval_seconds,
            );
        }
        if let Some(v) = env("STRAYLIGHT_AUDIT_LOG_DIR") {
            self.audit.log_dir = v;
        }

        // Guard.
        if let Some(v) = env("STRAYLIGHT_GUARD_STRICT") {
            parse_override("STRAYLIGHT_GUARD_STRICT", &v, &mut self.guard.strict);
        }

        // Logging.
        if let Some(v) = env("STRAYLIGHT_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Reject configurations that would weaken the security posture.
    pub fn validate(&self) -> Result<()> {
        if self.crypto.kdf_iterations < 100_000 {
            anyhow::bail!(
                "crypto.kdf_iterations must be at least 100000, got {}",
                self.crypto.kdf_iterations
            );
        }
        if self.token.max_refresh_count == 0 {
            anyhow::bail!("token.max_refresh_count must be at least 1");
        }
        if self.token.access_ttl_seconds == 0 || self.token.refresh_ttl_seconds == 0 {
            anyhow::bail!("token TTLs must be non-zero");
        }
        if self.audit.queue_capacity == 0 || self.audit.batch_size == 0 {
            anyhow::bail!("audit queue capacity and batch size must be non-zero");
        }
        Ok(())
    }

    /// Parse a TOML string into config (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: StraylightConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Materialize the token service configuration.
    pub fn token_config(&self) -> TokenConfig {
        TokenConfig {
            issuer: self.token.issuer.clone(),
            audience: self.token.audience.clone(),
            access_ttl: Duration::from_secs(self.token.access_ttl_seconds),
            refresh_ttl: Duration::from_secs(self.token.refresh_ttl_seconds),
            max_refresh_count: self.token.max_refresh_count,
            store_timeout: Duration::from_millis(self.token.store_timeout_millis),
        }
    }

    /// Materialize the audit pipeline configuration.
    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            queue_capacity: self.audit.queue_capacity,
            batch_size: self.audit.batch_size,
            flush_interval: Duration::from_secs(self.audit.flush_interval_seconds),
        }
    }

    /// Materialize the input validation options.
    pub fn validation_options(&self) -> ValidationOptions {
        ValidationOptions {
            strict: self.guard.strict,
            max_length: Some(self.guard.max_length),
            allow_empty: false,
        }
    }
}

// ── Token settings ──────────────────────────────────────────────

/// Token issuance and verification settings (`[token]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenSettings {
    /// Issuer claim stamped on tokens.
    pub issuer: String,
    /// Audience claim stamped on tokens.
    pub audience: String,
    /// Access-token lifetime in seconds.
    pub access_ttl_seconds: u64,
    /// Refresh-token lifetime in seconds.
    pub refresh_ttl_seconds: u64,
    /// Refresh uses allowed before a chain is revoked.
    pub max_refresh_count: u32,
    /// Revocation/refresh store lookup timeout in milliseconds.
    pub store_timeout_millis: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            issuer: "straylight".to_string(),
            audience: "straylight-api".to_string(),
            access_ttl_seconds: 15 * 60,
            refresh_ttl_seconds: 7 * 24 * 60 * 60,
            max_refresh_count: 5,
            store_timeout_millis: 2_000,
        }
    }
}

// ── Crypto settings ─────────────────────────────────────────────

/// Key derivation and rotation settings (`[crypto]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CryptoSettings {
    /// PBKDF2 iteration count for context-key derivation.
    pub kdf_iterations: u32,
    /// Days a retired key version stays decryptable after rotation.
    pub rotation_grace_days: u32,
}

impl Default for CryptoSettings {
    fn default() -> Self {
        Self {
            kdf_iterations: 100_000,
            rotation_grace_days: 7,
        }
    }
}

// ── Cache settings ──────────────────────────────────────────────

/// Cache TTLs (`[cache]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// User-record cache TTL in seconds.
    pub user_ttl_seconds: u64,
    /// Role-record cache TTL in seconds.
    pub role_ttl_seconds: u64,
    /// Secrets cache TTL in seconds.
    pub secrets_ttl_seconds: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            user_ttl_seconds: 300,
            role_ttl_seconds: 3_600,
            secrets_ttl_seconds: 300,
        }
    }
}

// ── Audit settings ──────────────────────────────────────────────

/// Audit pipeline tuning (`[audit]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditSettings {
    /// Bounded queue capacity before synchronous fallback.
    pub queue_capacity: usize,
    /// Events per batch before an early flush.
    pub batch_size: usize,
    /// Time-based flush interval in seconds.
    pub flush_interval_seconds: u64,
    /// Archive retry attempts for high-severity events.
    pub archive_max_attempts: u32,
    /// Base archive retry backoff in milliseconds.
    pub archive_backoff_millis: u64,
    /// Directory for the rotating JSONL sink.
    pub log_dir: String,
    /// File name prefix for the rotating JSONL sink.
    pub file_prefix: String,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            batch_size: 64,
            flush_interval_seconds: 5,
            archive_max_attempts: 3,
            archive_backoff_millis: 200,
            log_dir: "/var/log/straylight".to_string(),
            file_prefix: "audit".to_string(),
        }
    }
}

// ── Guard settings ──────────────────────────────────────────────

/// Input validation settings (`[guard]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
    /// Run injection scans on free-form strings too.
    pub strict: bool,
    /// Maximum accepted field length in bytes.
    pub max_length: usize,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            strict: false,
            max_length: 65_536,
        }
    }
}

// ── Logging settings ────────────────────────────────────────────

/// Logging settings (`[logging]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Tracing log level filter.
    pub level: String,
    /// Directory for rotating log files.
    pub dir: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "/var/log/straylight".to_string(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_constants() {
        let config = StraylightConfig::default();

        assert_eq!(config.token.issuer, "straylight");
        assert_eq!(config.token.access_ttl_seconds, 900);
        assert_eq!(config.token.refresh_ttl_seconds, 604_800);
        assert_eq!(config.token.max_refresh_count, 5);
        assert_eq!(config.token.store_timeout_millis, 2_000);

        assert_eq!(config.crypto.kdf_iterations, 100_000);
        assert_eq!(config.crypto.rotation_grace_days, 7);

        assert_eq!(config.cache.user_ttl_seconds, 300);
        assert_eq!(config.cache.role_ttl_seconds, 3_600);

        assert_eq!(config.audit.queue_capacity, 1_024);
        assert_eq!(config.audit.batch_size, 64);
        assert!(!config.guard.strict);
        assert_eq!(config.logging.level, "info");

        config.validate().expect("defaults are valid");
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
[token]
issuer = "tessier"
audience = "tessier-api"
access_ttl_seconds = 600
refresh_ttl_seconds = 86400
max_refresh_count = 3
store_timeout_millis = 500

[crypto]
kdf_iterations = 200000
rotation_grace_days = 3

[cache]
user_ttl_seconds = 60
role_ttl_seconds = 120
secrets_ttl_seconds = 30

[audit]
queue_capacity = 256
batch_size = 16
flush_interval_seconds = 1
archive_max_attempts = 5
archive_backoff_millis = 50
log_dir = "/tmp/straylight-logs"
file_prefix = "sec"

[guard]
strict = true
max_length = 4096

[logging]
level = "debug"
dir = "/tmp/straylight-logs"
"#;

        let config = StraylightConfig::from_toml(toml_str).expect("should parse");
        assert_eq!(config.token.issuer, "tessier");
        assert_eq!(config.token.max_refresh_count, 3);
        assert_eq!(config.crypto.kdf_iterations, 200_000);
        assert_eq!(config.cache.secrets_ttl_seconds, 30);
        assert_eq!(config.audit.archive_max_attempts, 5);
        assert!(config.guard.strict);
        assert_eq!(config.logging.level, "debug");
        config.validate().expect("valid");
    }

    #[test]
    fn parse_partial_toml_uses_defaults() {
        let config = StraylightConfig::from_toml("[token]\nissuer = \"x\"\n").expect("parse");
        assert_eq!(config.token.issuer, "x");
        assert_eq!(config.token.access_ttl_seconds, 900);
        assert_eq!(config.crypto.kdf_iterations, 100_000);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config =
            StraylightConfig::from_toml("[token]\naccess_ttl_seconds = 600\n").expect("parse");

        let env = |key: &str| -> Option<String> {
            match key {
                "STRAYLIGHT_ACCESS_TTL_SECS" => Some("120".to_string()),
                "STRAYLIGHT_GUARD_STRICT" => Some("true".to_string()),
                _ => None,
            }
        };
        config.apply_overrides(env);

        assert_eq!(config.token.access_ttl_seconds, 120);
        assert!(config.guard.strict);
        // File value kept when no env override.
        assert_eq!(config.token.max_refresh_count, 5);
    }

    #[test]
    fn invalid_env_override_is_ignored() {
        let mut config = StraylightConfig::default();
        config.apply_overrides(|key| match key {
            "STRAYLIGHT_KDF_ITERATIONS" => Some("not-a-number".to_string()),
            _ => None,
        });
        assert_eq!(config.crypto.kdf_iterations, 100_000);
    }

    #[test]
    fn weak_kdf_iterations_are_rejected() {
        let config =
            StraylightConfig::from_toml("[crypto]\nkdf_iterations = 1000\n").expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_refresh_count_is_rejected() {
        let config =
            StraylightConfig::from_toml("[token]\nmax_refresh_count = 0\n").expect("parse");
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_path_uses_env_var() {
        let path = StraylightConfig::config_path_with(|key| match key {
            "STRAYLIGHT_CONFIG_PATH" => Some("/custom/straylight.toml".to_string()),
            _ => None,
        });
        assert_eq!(path, PathBuf::from("/custom/straylight.toml"));

        let default = StraylightConfig::config_path_with(|_| None);
        assert_eq!(default, PathBuf::from("straylight.toml"));
    }

    #[test]
    fn invalid_toml_returns_error() {
        assert!(StraylightConfig::from_toml("this is {{ not valid toml").is_err());
    }

    #[test]
    fn materialized_configs_reflect_settings() {
        let config = StraylightConfig::from_toml(
            "[token]\naccess_ttl_seconds = 60\n\n[audit]\nbatch_size = 8\n",
        )
        .expect("parse");
        assert_eq!(config.token_config().access_ttl, Duration::from_secs(60));
        assert_eq!(config.audit_config().batch_size, 8);
        assert!(!config.validation_options().strict);
    }
}
