//! Declared-type validation and sanitization for untrusted input.
//!
//! Every inbound field is validated against its declared type before
//! any other component sees it. Validation never panics and never
//! errors out of band: the result is always a structured outcome so
//! callers can accumulate every bad field before responding.
//! Injection-shaped types (sql, path, command) reject outright rather
//! than attempting to repair hostile input.

pub mod patterns;

use std::net::IpAddr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub use patterns::{InjectionCategory, InjectionScanner};

/// Declared type of an inbound field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Free-form text; markup is stripped.
    String,
    /// Signed 64-bit integer.
    Integer,
    /// Finite 64-bit float.
    Float,
    /// Boolean in common textual encodings.
    Boolean,
    /// RFC-5322-shaped email address.
    Email,
    /// Absolute http(s) URL.
    Url,
    /// IPv4 or IPv6 address.
    Ip,
    /// Well-formed JSON document.
    Json,
    /// SQL fragment; rejected on injection signatures.
    Sql,
    /// HTML; active content is stripped.
    Html,
    /// Filesystem path; rejected on traversal sequences.
    Path,
    /// Shell command argument; rejected on metacharacters.
    Command,
    /// RFC 3339 timestamp or `YYYY-MM-DD` date.
    Date,
    /// Canonical or hyphenless UUID.
    Uuid,
    /// Compact JWT shape: three dot-separated base64url segments.
    Token,
    /// Standard base64.
    Base64,
    /// International phone number.
    Phone,
}

/// Per-call validation options.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Run injection scans on free-form strings too.
    pub strict: bool,
    /// Maximum accepted length in bytes.
    pub max_length: Option<usize>,
    /// Whether an empty value passes.
    pub allow_empty: bool,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            strict: false,
            max_length: Some(65_536),
            allow_empty: false,
        }
    }
}

/// Result of validating one value. `ok == false` always carries the
/// original value back along with a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// Whether the value passed.
    pub ok: bool,
    /// Sanitized value on success; the original value on failure.
    pub sanitized: String,
    /// Rejection reason when `ok == false`.
    pub error: Option<String>,
}

impl ValidationOutcome {
    fn pass(sanitized: impl Into<String>) -> Self {
        Self {
            ok: true,
            sanitized: sanitized.into(),
            error: None,
        }
    }

    fn fail(original: &str, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            sanitized: original.to_owned(),
            error: Some(reason.into()),
        }
    }
}

/// One rejected field in an aggregated validation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field name.
    pub field: String,
    /// Why it was rejected.
    pub reason: String,
}

static EMAIL_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").ok()
});
static PHONE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\+?[0-9][0-9 ().\-]{5,18}[0-9]$").ok());
static TAG_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?is)<[^>]*>").ok());
static ACTIVE_HTML_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)<\s*script\b.*?</\s*script\s*>|<\s*/?\s*(script|iframe|object|embed)\b[^>]*>|\bon\w+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)|javascript\s*:"#,
    )
    .ok()
});

/// Type-directed validator over a compiled injection-pattern table.
#[derive(Debug, Clone, Default)]
pub struct InputGuard {
    scanner: InjectionScanner,
}

impl InputGuard {
    /// Build a guard with the default pattern table.
    pub fn new() -> Self {
        Self {
            scanner: InjectionScanner::new(),
        }
    }

    /// Validate one value against its declared type.
    pub fn validate(
        &self,
        value: &str,
        declared: InputType,
        options: &ValidationOptions,
    ) -> ValidationOutcome {
        if let Some(max) = options.max_length {
            if value.len() > max {
                return ValidationOutcome::fail(value, format!("Exceeds maximum length of {max}"));
            }
        }
        if value.trim().is_empty() {
            return if options.allow_empty {
                ValidationOutcome::pass("")
            } else {
                ValidationOutcome::fail(value, "Value must not be empty")
            };
        }

        let outcome = match declared {
            InputType::String => self.validate_string(value, options),
            InputType::Integer => validate_integer(value),
            InputType::Float => validate_float(value),
            InputType::Boolean => validate_boolean(value),
            InputType::Email => validate_email(value),
            InputType::Url => validate_url(value),
            InputType::Ip => validate_ip(value),
            InputType::Json => validate_json(value),
            InputType::Sql => self.reject_category(value, InjectionCategory::Sql),
            InputType::Html => self.validate_html(value),
            InputType::Path => self.reject_category(value, InjectionCategory::PathTraversal),
            InputType::Command => self.reject_category(value, InjectionCategory::Command),
            InputType::Date => validate_date(value),
            InputType::Uuid => validate_uuid(value),
            InputType::Token => validate_token(value),
            InputType::Base64 => validate_base64(value),
            InputType::Phone => validate_phone(value),
        };
        if !outcome.ok {
            debug!(declared = ?declared, "input rejected");
        }
        outcome
    }

    /// Validate a set of named fields, accumulating every failure.
    /// Returns the sanitized values on success.
    pub fn validate_fields(
        &self,
        fields: &[(&str, &str, InputType)],
        options: &ValidationOptions,
    ) -> Result<Vec<(String, String)>, Vec<FieldError>> {
        let mut sanitized = Vec::with_capacity(fields.len());
        let mut errors = Vec::new();
        for (name, value, declared) in fields {
            let outcome = self.validate(value, *declared, options);
            if outcome.ok {
                sanitized.push(((*name).to_owned(), outcome.sanitized));
            } else {
                errors.push(FieldError {
                    field: (*name).to_owned(),
                    reason: outcome
                        .error
                        .unwrap_or_else(|| "Invalid value".to_owned()),
                });
            }
        }
        if errors.is_empty() {
            Ok(sanitized)
        } else {
            Err(errors)
        }
    }

    fn validate_string(&self, value: &str, options: &ValidationOptions) -> ValidationOutcome {
        if options.strict {
            if let Some(category) = self.scanner.scan(value) {
                return ValidationOutcome::fail(value, category.message());
            }
        }
        let stripped = match TAG_RE.as_ref() {
            Some(re) => re.replace_all(value, "").to_string(),
            None => value.to_owned(),
        };
        ValidationOutcome::pass(stripped.trim())
    }

    fn validate_html(&self, value: &str) -> ValidationOutcome {
        let stripped = match ACTIVE_HTML_RE.as_ref() {
            Some(re) => re.replace_all(value, "").to_string(),
            None => value.to_owned(),
        };
        ValidationOutcome::pass(stripped)
    }

    fn reject_category(&self, value: &str, category: InjectionCategory) -> ValidationOutcome {
        if self.scanner.matches(category, value) {
            ValidationOutcome::fail(value, category.message())
        } else {
            ValidationOutcome::pass(value)
        }
    }
}

fn validate_integer(value: &str) -> ValidationOutcome {
    match value.trim().parse::<i64>() {
        Ok(n) => ValidationOutcome::pass(n.to_string()),
        Err(_) => ValidationOutcome::fail(value, "Not a valid integer"),
    }
}

fn validate_float(value: &str) -> ValidationOutcome {
    match value.trim().parse::<f64>() {
        Ok(f) if f.is_finite() => ValidationOutcome::pass(value.trim()),
        _ => ValidationOutcome::fail(value, "Not a valid number"),
    }
}

fn validate_boolean(value: &str) -> ValidationOutcome {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => ValidationOutcome::pass("true"),
        "false" | "0" | "no" | "off" => ValidationOutcome::pass("false"),
        _ => ValidationOutcome::fail(value, "Not a valid boolean"),
    }
}

fn validate_email(value: &str) -> ValidationOutcome {
    let trimmed = value.trim();
    let valid = EMAIL_RE
        .as_ref()
        .is_some_and(|re| re.is_match(trimmed));
    if valid {
        ValidationOutcome::pass(trimmed.to_ascii_lowercase())
    } else {
        ValidationOutcome::fail(value, "Not a valid email address")
    }
}

fn validate_url(value: &str) -> ValidationOutcome {
    match Url::parse(value.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {
            ValidationOutcome::pass(url.to_string())
        }
        Ok(_) => ValidationOutcome::fail(value, "URL scheme must be http or https"),
        Err(_) => ValidationOutcome::fail(value, "Not a valid URL"),
    }
}

fn validate_ip(value: &str) -> ValidationOutcome {
    match value.trim().parse::<IpAddr>() {
        Ok(addr) => ValidationOutcome::pass(addr.to_string()),
        Err(_) => ValidationOutcome::fail(value, "Not a valid IP address"),
    }
}

fn validate_json(value: &str) -> ValidationOutcome {
    match serde_json::from_str::<serde_json::Value>(value) {
        Ok(_) => ValidationOutcome::pass(value),
        Err(_) => ValidationOutcome::fail(value, "Not valid JSON"),
    }
}

fn validate_date(value: &str) -> ValidationOutcome {
    let trimmed = value.trim();
    if DateTime::parse_from_rfc3339(trimmed).is_ok()
        || NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok()
    {
        ValidationOutcome::pass(trimmed)
    } else {
        ValidationOutcome::fail(value, "Not a valid date")
    }
}

fn validate_uuid(value: &str) -> ValidationOutcome {
    match Uuid::parse_str(value.trim()) {
        Ok(id) => ValidationOutcome::pass(id.to_string()),
        Err(_) => ValidationOutcome::fail(value, "Not a valid UUID"),
    }
}

/// Structural check only; signature verification happens downstream.
fn validate_token(value: &str) -> ValidationOutcome {
    let trimmed = value.trim();
    let segments: Vec<&str> = trimmed.split('.').collect();
    let well_formed = segments.len() == 3
        && segments.iter().all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'=')
        });
    if well_formed {
        ValidationOutcome::pass(trimmed)
    } else {
        ValidationOutcome::fail(value, "Not a well-formed token")
    }
}

fn validate_base64(value: &str) -> ValidationOutcome {
    use base64::Engine;
    let trimmed = value.trim();
    match base64::engine::general_purpose::STANDARD.decode(trimmed) {
        Ok(_) => ValidationOutcome::pass(trimmed),
        Err(_) => ValidationOutcome::fail(value, "Not valid base64"),
    }
}

fn validate_phone(value: &str) -> ValidationOutcome {
    let trimmed = value.trim();
    let digits = trimmed.chars().filter(char::is_ascii_digit).count();
    let valid = PHONE_RE
        .as_ref()
        .is_some_and(|re| re.is_match(trimmed))
        && (7..=15).contains(&digits);
    if valid {
        ValidationOutcome::pass(trimmed)
    } else {
        ValidationOutcome::fail(value, "Not a valid phone number")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> InputGuard {
        InputGuard::new()
    }

    fn opts() -> ValidationOptions {
        ValidationOptions::default()
    }

    #[test]
    fn sql_injection_returns_original_value_and_exact_reason() {
        let outcome = guard().validate("' OR 1=1 --", InputType::Sql, &opts());
        assert!(!outcome.ok);
        assert_eq!(outcome.sanitized, "' OR 1=1 --");
        assert_eq!(
            outcome.error.as_deref(),
            Some("Potential SQL injection detected")
        );
    }

    #[test]
    fn benign_sql_fragment_passes() {
        let outcome = guard().validate("status = 'active'", InputType::Sql, &opts());
        assert!(outcome.ok);
    }

    #[test]
    fn scalar_types() {
        let g = guard();
        assert!(g.validate("42", InputType::Integer, &opts()).ok);
        assert!(!g.validate("42.5", InputType::Integer, &opts()).ok);
        assert!(g.validate("3.14", InputType::Float, &opts()).ok);
        assert!(!g.validate("NaN", InputType::Float, &opts()).ok);
        assert_eq!(
            g.validate("YES", InputType::Boolean, &opts()).sanitized,
            "true"
        );
        assert!(!g.validate("maybe", InputType::Boolean, &opts()).ok);
    }

    #[test]
    fn email_normalizes_case() {
        let outcome = guard().validate("Case@Straylight.Test", InputType::Email, &opts());
        assert!(outcome.ok);
        assert_eq!(outcome.sanitized, "case@straylight.test");
        assert!(!guard().validate("not-an-email", InputType::Email, &opts()).ok);
    }

    #[test]
    fn url_requires_http_scheme() {
        let g = guard();
        assert!(g.validate("https://straylight.test/a", InputType::Url, &opts()).ok);
        assert!(!g.validate("ftp://straylight.test", InputType::Url, &opts()).ok);
        assert!(!g.validate("::nope::", InputType::Url, &opts()).ok);
    }

    #[test]
    fn ip_json_date_uuid() {
        let g = guard();
        assert!(g.validate("10.0.0.1", InputType::Ip, &opts()).ok);
        assert!(g.validate("::1", InputType::Ip, &opts()).ok);
        assert!(!g.validate("999.1.1.1", InputType::Ip, &opts()).ok);
        assert!(g.validate(r#"{"a": [1, 2]}"#, InputType::Json, &opts()).ok);
        assert!(!g.validate("{broken", InputType::Json, &opts()).ok);
        assert!(g.validate("2026-08-28", InputType::Date, &opts()).ok);
        assert!(g.validate("2026-08-28T10:00:00Z", InputType::Date, &opts()).ok);
        assert!(!g.validate("28/08/2026", InputType::Date, &opts()).ok);
        assert!(g
            .validate("8f9a3f6e-2a1b-4c5d-9e7f-123456789abc", InputType::Uuid, &opts())
            .ok);
        assert!(!g.validate("not-a-uuid", InputType::Uuid, &opts()).ok);
    }

    #[test]
    fn path_and_command_reject_rather_than_fix() {
        let g = guard();
        let traversal = g.validate("../../etc/passwd", InputType::Path, &opts());
        assert!(!traversal.ok);
        assert_eq!(traversal.sanitized, "../../etc/passwd");
        assert!(g.validate("reports/2026/summary.txt", InputType::Path, &opts()).ok);

        assert!(!g.validate("ls; rm -rf /", InputType::Command, &opts()).ok);
        assert!(g.validate("status-report", InputType::Command, &opts()).ok);
    }

    #[test]
    fn string_strips_markup() {
        let outcome = guard().validate(
            "hello <b>world</b><script>alert(1)</script>",
            InputType::String,
            &opts(),
        );
        assert!(outcome.ok);
        assert!(!outcome.sanitized.contains('<'));
        assert!(outcome.sanitized.contains("hello"));
    }

    #[test]
    fn html_strips_active_content_only() {
        let outcome = guard().validate(
            "<p>fine</p><script>alert(1)</script><img src=x onerror=alert(2)>",
            InputType::Html,
            &opts(),
        );
        assert!(outcome.ok);
        assert!(outcome.sanitized.contains("<p>fine</p>"));
        assert!(!outcome.sanitized.to_ascii_lowercase().contains("script"));
        assert!(!outcome.sanitized.to_ascii_lowercase().contains("onerror"));
    }

    #[test]
    fn strict_mode_scans_free_form_strings() {
        let strict = ValidationOptions {
            strict: true,
            ..ValidationOptions::default()
        };
        let outcome = guard().validate("' OR 1=1 --", InputType::String, &strict);
        assert!(!outcome.ok);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Potential SQL injection detected")
        );
        // Relaxed mode only strips markup.
        assert!(guard().validate("' OR 1=1 --", InputType::String, &opts()).ok);
    }

    #[test]
    fn token_and_base64_and_phone() {
        let g = guard();
        assert!(g.validate("aGVhZA.Y2xhaW1z.c2ln", InputType::Token, &opts()).ok);
        assert!(!g.validate("only.two", InputType::Token, &opts()).ok);
        assert!(g.validate("aGVsbG8=", InputType::Base64, &opts()).ok);
        assert!(!g.validate("not base64!!", InputType::Base64, &opts()).ok);
        assert!(g.validate("+1 (555) 123-4567", InputType::Phone, &opts()).ok);
        assert!(!g.validate("12ab34", InputType::Phone, &opts()).ok);
    }

    #[test]
    fn empty_and_oversized_values() {
        let g = guard();
        assert!(!g.validate("", InputType::String, &opts()).ok);
        let permissive = ValidationOptions {
            allow_empty: true,
            ..ValidationOptions::default()
        };
        assert!(g.validate("", InputType::String, &permissive).ok);

        let capped = ValidationOptions {
            max_length: Some(4),
            ..ValidationOptions::default()
        };
        assert!(!g.validate("abcdef", InputType::String, &capped).ok);
    }

    #[test]
    fn field_errors_accumulate() {
        let g = guard();
        let result = g.validate_fields(
            &[
                ("age", "not-a-number", InputType::Integer),
                ("email", "nope", InputType::Email),
                ("name", "case", InputType::String),
            ],
            &opts(),
        );
        let errors = result.expect_err("two fields should fail");
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "age");
        assert_eq!(errors[1].field, "email");
    }
}
