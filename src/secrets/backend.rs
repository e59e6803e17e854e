//! Secret backend implementations.
//!
//! Every backend conforms to [`SecretBackend`] so the facade stays
//! backend-agnostic. Shipped backends: a self-hosted KV secret engine
//! (versioned KV over HTTP), a cloud secret-manager REST API, and a
//! read-only environment-variable fallback for local development.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Failure modes for a single backend call.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend answered but has no such secret.
    #[error("secret {0} not found")]
    NotFound(String),
    /// The backend answered with data the client could not interpret.
    /// The facade treats this as a miss for that backend.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The backend could not be reached or returned a server error.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend does not support the requested mutation.
    #[error("backend is read-only: {0}")]
    ReadOnly(String),
}

/// Capability interface every secret backend implements.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Stable backend identifier used in logs and audit events.
    fn name(&self) -> &str;

    /// Fetch the current value of a secret.
    async fn get(&self, id: &str) -> Result<String, BackendError>;

    /// Create a secret. Fails if the backend is read-only.
    async fn create(&self, id: &str, value: &str) -> Result<(), BackendError>;

    /// Replace the value of an existing secret.
    async fn update(&self, id: &str, value: &str) -> Result<(), BackendError>;

    /// Delete a secret. Backends with versioning perform a soft delete
    /// with a recovery window.
    async fn delete(&self, id: &str) -> Result<(), BackendError>;

    /// List secret ids, optionally filtered by prefix.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BackendError>;
}

/// Self-hosted KV secret engine speaking the versioned-KV HTTP API.
pub struct VaultKvBackend {
    client: reqwest::Client,
    address: String,
    mount: String,
    token: String,
}

impl VaultKvBackend {
    /// Connect to a KV engine at `address` with the given mount path
    /// and access token.
    pub fn new(address: impl Into<String>, mount: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.into(),
            mount: mount.into(),
            token: token.into(),
        }
    }

    fn data_url(&self, id: &str) -> String {
        format!("{}/v1/{}/data/{id}", self.address, self.mount)
    }

    async fn write(&self, id: &str, value: &str) -> Result<(), BackendError> {
        let body = serde_json::json!({ "data": { "value": value } });
        let resp = self
            .client
            .post(self.data_url(id))
            .header("X-Vault-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "kv write returned {}",
                resp.status()
            )))
        }
    }
}

#[async_trait]
impl SecretBackend for VaultKvBackend {
    fn name(&self) -> &str {
        "kv-engine"
    }

    async fn get(&self, id: &str) -> Result<String, BackendError> {
        let resp = self
            .client
            .get(self.data_url(id))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(id.to_owned()));
        }
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "kv read returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        body.pointer("/data/data/value")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Malformed("missing data.data.value".to_owned()))
    }

    async fn create(&self, id: &str, value: &str) -> Result<(), BackendError> {
        self.write(id, value).await
    }

    async fn update(&self, id: &str, value: &str) -> Result<(), BackendError> {
        self.write(id, value).await
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        // Versioned KV delete is soft; versions remain recoverable
        // until destroyed.
        let resp = self
            .client
            .delete(self.data_url(id))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "kv delete returned {}",
                resp.status()
            )))
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BackendError> {
        let url = format!(
            "{}/v1/{}/metadata?list=true",
            self.address, self.mount
        );
        let resp = self
            .client
            .get(url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "kv list returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        let keys = body
            .pointer("/data/keys")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BackendError::Malformed("missing data.keys".to_owned()))?;
        Ok(keys
            .iter()
            .filter_map(|k| k.as_str())
            .filter(|k| prefix.is_none_or(|p| k.starts_with(p)))
            .map(str::to_owned)
            .collect())
    }
}

/// Cloud secret-manager backend speaking a bearer-token REST API.
pub struct CloudSecretBackend {
    client: reqwest::Client,
    endpoint: String,
    api_token: String,
}

impl CloudSecretBackend {
    /// Connect to a secret-manager API at `endpoint`.
    pub fn new(endpoint: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_token: api_token.into(),
        }
    }

    fn secret_url(&self, id: &str) -> String {
        format!("{}/v1/secrets/{id}", self.endpoint)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        self.client.request(method, url).bearer_auth(&self.api_token)
    }
}

#[async_trait]
impl SecretBackend for CloudSecretBackend {
    fn name(&self) -> &str {
        "cloud-manager"
    }

    async fn get(&self, id: &str) -> Result<String, BackendError> {
        let resp = self
            .request(reqwest::Method::GET, self.secret_url(id))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(id.to_owned()));
        }
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "secret read returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        body.get("value")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| BackendError::Malformed("missing value".to_owned()))
    }

    async fn create(&self, id: &str, value: &str) -> Result<(), BackendError> {
        let resp = self
            .request(reqwest::Method::POST, self.secret_url(id))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "secret create returned {}",
                resp.status()
            )))
        }
    }

    async fn update(&self, id: &str, value: &str) -> Result<(), BackendError> {
        let resp = self
            .request(reqwest::Method::PUT, self.secret_url(id))
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "secret update returned {}",
                resp.status()
            )))
        }
    }

    async fn delete(&self, id: &str) -> Result<(), BackendError> {
        // Scheduled deletion with a recovery window on the manager side.
        let resp = self
            .request(reqwest::Method::DELETE, self.secret_url(id))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Unavailable(format!(
                "secret delete returned {}",
                resp.status()
            )))
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BackendError> {
        let mut url = format!("{}/v1/secrets", self.endpoint);
        if let Some(p) = prefix {
            url = format!("{url}?prefix={p}");
        }
        let resp = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BackendError::Unavailable(format!(
                "secret list returned {}",
                resp.status()
            )));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BackendError::Malformed(e.to_string()))?;
        let ids = body
            .get("ids")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BackendError::Malformed("missing ids".to_owned()))?;
        Ok(ids
            .iter()
            .filter_map(|k| k.as_str())
            .map(str::to_owned)
            .collect())
    }
}

/// Read-only environment-variable backend for local development.
///
/// Secret id `db/password` maps to env var `{prefix}DB_PASSWORD`.
pub struct EnvBackend {
    prefix: String,
    snapshot: BTreeMap<String, String>,
}

impl EnvBackend {
    /// Snapshot the current environment under `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let snapshot = std::env::vars()
            .filter(|(k, _)| k.starts_with(&prefix))
            .collect();
        Self { prefix, snapshot }
    }

    /// Build from an explicit map, bypassing the process environment.
    pub fn from_map(prefix: impl Into<String>, vars: BTreeMap<String, String>) -> Self {
        Self {
            prefix: prefix.into(),
            snapshot: vars,
        }
    }

    fn var_name(&self, id: &str) -> String {
        let normalized: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{normalized}", self.prefix)
    }
}

#[async_trait]
impl SecretBackend for EnvBackend {
    fn name(&self) -> &str {
        "env"
    }

    async fn get(&self, id: &str) -> Result<String, BackendError> {
        let var = self.var_name(id);
        debug!(backend = self.name(), %var, "env secret lookup");
        self.snapshot
            .get(&var)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(id.to_owned()))
    }

    async fn create(&self, _id: &str, _value: &str) -> Result<(), BackendError> {
        Err(BackendError::ReadOnly("env".to_owned()))
    }

    async fn update(&self, _id: &str, _value: &str) -> Result<(), BackendError> {
        Err(BackendError::ReadOnly("env".to_owned()))
    }

    async fn delete(&self, _id: &str) -> Result<(), BackendError> {
        Err(BackendError::ReadOnly("env".to_owned()))
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>, BackendError> {
        let filter = prefix.map(|p| self.var_name(p));
        Ok(self
            .snapshot
            .keys()
            .filter(|k| {
                filter
                    .as_deref()
                    .is_none_or(|f| k.starts_with(f))
            })
            .filter_map(|k| k.strip_prefix(&self.prefix))
            .map(str::to_owned)
            .collect())
    }
}
