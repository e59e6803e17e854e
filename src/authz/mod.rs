//! Role/permission authorization with resource-scoped policies.
//!
//! Permission resolution is O(roles held): every role carries a
//! precomputed effective permission set (own permissions unioned with
//! all ancestors'), recomputed whenever the role graph changes, so
//! [`AuthorizationEngine::check`] is a set-membership test. Missing
//! users or roles deny rather than erroring; deactivated users always
//! deny.
//!
//! User and role snapshots written to the shared cache store are
//! sealed through a [`CryptoEngine`] first; the store never holds
//! plaintext identity data. Reads fall back to the sealed snapshot
//! when the in-memory state has no entry, so engines sharing a store
//! and a master key can serve each other's records.

pub mod policy;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::crypto::{CryptoEngine, EncryptedPayload};
use crate::store::KeyValueStore;
pub use policy::{AccessContext, PolicyCondition, ResourcePolicy};

/// Closed catalogue of grantable permissions.
pub const PERMISSION_CATALOGUE: &[&str] = &[
    "token:issue",
    "token:verify",
    "token:revoke",
    "secret:read",
    "secret:create",
    "secret:update",
    "secret:delete",
    "secret:list",
    "secret:rotate",
    "config:read",
    "config:write",
    "config:delete",
    "user:read",
    "user:write",
    "role:read",
    "role:write",
    "audit:read",
    "key:rotate",
];

/// Cache TTL for user snapshots.
const USER_CACHE_TTL: Duration = Duration::from_secs(300);
/// Cache TTL for role snapshots.
const ROLE_CACHE_TTL: Duration = Duration::from_secs(3600);
/// Derivation context for sealed cache snapshots.
const CACHE_CONTEXT: &str = "rbac-cache";

/// Authorization mutation failure modes. Checks never return these;
/// a check that cannot resolve its inputs simply denies.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Referenced role does not exist.
    #[error("role {0} not found")]
    RoleNotFound(String),
    /// Referenced user does not exist.
    #[error("user {0} not found")]
    UserNotFound(String),
    /// A role with that name already exists.
    #[error("role {0} already exists")]
    DuplicateRole(String),
    /// A user with that id already exists.
    #[error("user {0} already exists")]
    DuplicateUser(String),
    /// System roles cannot be modified or deleted.
    #[error("role {0} is a system role")]
    SystemRoleImmutable(String),
    /// Permission is not in the closed catalogue.
    #[error("unknown permission {0}")]
    UnknownPermission(String),
    /// The requested parents would create an inheritance cycle.
    #[error("role inheritance cycle through {0}")]
    RoleCycle(String),
}

/// A named role with declared and resolved permissions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    /// Unique role name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Permissions declared directly on this role.
    pub permissions: HashSet<String>,
    /// Parent role names this role inherits from.
    pub parents: Vec<String>,
    /// Effective set: declared ∪ all ancestors' declared. Maintained by
    /// the engine on every role-graph mutation.
    pub effective: HashSet<String>,
    /// Free-form metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// System roles are seeded at startup and immutable.
    pub system: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A user snapshot held by the engine's cache layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user id.
    pub id: String,
    /// Display username.
    pub username: String,
    /// Contact email.
    pub email: String,
    /// Assigned role names.
    pub roles: HashSet<String>,
    /// Permissions granted directly, outside any role.
    pub direct_permissions: HashSet<String>,
    /// Attributes referenced by resource policies.
    pub attributes: HashMap<String, serde_json::Value>,
    /// Deactivated users fail every check.
    pub active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Partial update for [`AuthorizationEngine::update_role`].
#[derive(Debug, Clone, Default)]
pub struct RoleUpdate {
    /// Replacement description.
    pub description: Option<String>,
    /// Replacement declared permission set.
    pub permissions: Option<HashSet<String>>,
    /// Replacement parent list.
    pub parents: Option<Vec<String>>,
    /// Replacement metadata.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// Partial update for [`AuthorizationEngine::update_user`].
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    /// Replacement email.
    pub email: Option<String>,
    /// Replacement direct permission set.
    pub direct_permissions: Option<HashSet<String>>,
    /// Replacement attribute map.
    pub attributes: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Default)]
struct EngineState {
    roles: HashMap<String, Role>,
    users: HashMap<String, User>,
    policies: HashMap<String, ResourcePolicy>,
}

/// Evaluates permission checks and administers users/roles/policies.
pub struct AuthorizationEngine {
    state: RwLock<EngineState>,
    cache: Arc<dyn KeyValueStore>,
    cache_crypto: CryptoEngine,
}

impl AuthorizationEngine {
    /// Create an engine seeded with the system roles (`admin`,
    /// `operator`, `viewer`). Cache snapshots are sealed under a
    /// process-local ephemeral key; other processes cannot read them
    /// but the store still never sees plaintext.
    pub fn new(cache: Arc<dyn KeyValueStore>) -> Self {
        Self::with_crypto(cache, CryptoEngine::ephemeral())
    }

    /// Create an engine sealing its cache snapshots with the given
    /// crypto engine. Instances that share a store must be built over
    /// rings with the same master key and salt to read each other's
    /// entries.
    pub fn with_crypto(cache: Arc<dyn KeyValueStore>, cache_crypto: CryptoEngine) -> Self {
        let mut state = EngineState::default();
        let now = Utc::now();
        for (name, description, permissions) in system_roles() {
            let permissions: HashSet<String> =
                permissions.iter().map(|p| (*p).to_owned()).collect();
            state.roles.insert(
                name.to_owned(),
                Role {
                    name: name.to_owned(),
                    description: description.to_owned(),
                    effective: permissions.clone(),
                    permissions,
                    parents: Vec::new(),
                    metadata: HashMap::new(),
                    system: true,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        Self {
            state: RwLock::new(state),
            cache,
            cache_crypto,
        }
    }

    /// Whether `user_id` may perform `permission`, optionally scoped to
    /// a resource and evaluated against an access context.
    ///
    /// Always answers; unresolved references and policy failures deny.
    /// Users and roles absent from local state are looked up in the
    /// sealed cache before denying.
    pub async fn check(
        &self,
        user_id: &str,
        permission: &str,
        resource: Option<&str>,
        ctx: Option<&AccessContext>,
    ) -> bool {
        let state = self.state.read().await;
        let fetched;
        let user = match state.users.get(user_id) {
            Some(user) => user,
            None => match self.cached_user(user_id).await {
                Some(user) => {
                    fetched = user;
                    &fetched
                }
                None => {
                    debug!(user_id, "check denied: unknown user");
                    return false;
                }
            },
        };
        if !user.active {
            debug!(user_id, "check denied: user deactivated");
            return false;
        }

        let mut granted = user.direct_permissions.contains(permission);
        if !granted {
            for role_name in &user.roles {
                let allows = match state.roles.get(role_name) {
                    Some(role) => role.effective.contains(permission),
                    None => self
                        .cached_role(role_name)
                        .await
                        .is_some_and(|role| role.effective.contains(permission)),
                };
                if allows {
                    granted = true;
                    break;
                }
            }
        }
        if !granted {
            return false;
        }

        if let Some(resource) = resource {
            if let Some(resource_policy) = state.policies.get(resource) {
                let default_ctx = AccessContext::default();
                let ctx = ctx.unwrap_or(&default_ctx);
                if !policy::evaluate(resource_policy, user, ctx) {
                    debug!(user_id, resource, "check denied by resource policy");
                    return false;
                }
            }
        }
        true
    }

    /// Create a role. Permissions must come from the catalogue; parents
    /// must exist and not introduce a cycle.
    pub async fn create_role(
        &self,
        name: &str,
        description: &str,
        permissions: HashSet<String>,
        parents: Vec<String>,
    ) -> Result<Role, AuthzError> {
        validate_permissions(&permissions)?;
        let mut state = self.state.write().await;
        if state.roles.contains_key(name) {
            return Err(AuthzError::DuplicateRole(name.to_owned()));
        }
        for parent in &parents {
            if !state.roles.contains_key(parent) {
                return Err(AuthzError::RoleNotFound(parent.clone()));
            }
        }
        let now = Utc::now();
        let role = Role {
            name: name.to_owned(),
            description: description.to_owned(),
            effective: HashSet::new(),
            permissions,
            parents,
            metadata: HashMap::new(),
            system: false,
            created_at: now,
            updated_at: now,
        };
        state.roles.insert(name.to_owned(), role);
        recompute_effective(&mut state.roles);
        let role = state.roles.get(name).cloned().ok_or_else(|| {
            AuthzError::RoleNotFound(name.to_owned())
        })?;
        drop(state);
        self.cache_role(&role).await;
        info!(role = name, "role created");
        Ok(role)
    }

    /// Update a non-system role and recompute effective sets.
    pub async fn update_role(&self, name: &str, update: RoleUpdate) -> Result<Role, AuthzError> {
        if let Some(permissions) = &update.permissions {
            validate_permissions(permissions)?;
        }
        let mut state = self.state.write().await;
        {
            let role = state
                .roles
                .get(name)
                .ok_or_else(|| AuthzError::RoleNotFound(name.to_owned()))?;
            if role.system {
                return Err(AuthzError::SystemRoleImmutable(name.to_owned()));
            }
        }
        if let Some(parents) = &update.parents {
            for parent in parents {
                if !state.roles.contains_key(parent) {
                    return Err(AuthzError::RoleNotFound(parent.clone()));
                }
            }
            if would_cycle(&state.roles, name, parents) {
                return Err(AuthzError::RoleCycle(name.to_owned()));
            }
        }
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| AuthzError::RoleNotFound(name.to_owned()))?;
        if let Some(description) = update.description {
            role.description = description;
        }
        if let Some(permissions) = update.permissions {
            role.permissions = permissions;
        }
        if let Some(parents) = update.parents {
            role.parents = parents;
        }
        if let Some(metadata) = update.metadata {
            role.metadata = metadata;
        }
        role.updated_at = Utc::now();
        recompute_effective(&mut state.roles);
        let role = state.roles.get(name).cloned().ok_or_else(|| {
            AuthzError::RoleNotFound(name.to_owned())
        })?;
        self.warn_if_no_admin(&state);
        drop(state);
        self.invalidate_role(name).await;
        self.cache_role(&role).await;
        info!(role = name, "role updated");
        Ok(role)
    }

    /// Delete a non-system role. Users holding it simply lose it.
    pub async fn delete_role(&self, name: &str) -> Result<(), AuthzError> {
        let mut state = self.state.write().await;
        let role = state
            .roles
            .get(name)
            .ok_or_else(|| AuthzError::RoleNotFound(name.to_owned()))?;
        if role.system {
            return Err(AuthzError::SystemRoleImmutable(name.to_owned()));
        }
        state.roles.remove(name);
        for user in state.users.values_mut() {
            user.roles.remove(name);
        }
        recompute_effective(&mut state.roles);
        self.warn_if_no_admin(&state);
        drop(state);
        self.invalidate_role(name).await;
        info!(role = name, "role deleted");
        Ok(())
    }

    /// Register a user.
    pub async fn create_user(
        &self,
        id: &str,
        username: &str,
        email: &str,
    ) -> Result<User, AuthzError> {
        let mut state = self.state.write().await;
        if state.users.contains_key(id) {
            return Err(AuthzError::DuplicateUser(id.to_owned()));
        }
        let now = Utc::now();
        let user = User {
            id: id.to_owned(),
            username: username.to_owned(),
            email: email.to_owned(),
            roles: HashSet::new(),
            direct_permissions: HashSet::new(),
            attributes: HashMap::new(),
            active: true,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(id.to_owned(), user.clone());
        drop(state);
        self.cache_user(&user).await;
        info!(user_id = id, "user created");
        Ok(user)
    }

    /// Update a user's email, direct permissions, or attributes.
    pub async fn update_user(&self, id: &str, update: UserUpdate) -> Result<User, AuthzError> {
        if let Some(perms) = &update.direct_permissions {
            validate_permissions(perms)?;
        }
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| AuthzError::UserNotFound(id.to_owned()))?;
        if let Some(email) = update.email {
            user.email = email;
        }
        if let Some(perms) = update.direct_permissions {
            user.direct_permissions = perms;
        }
        if let Some(attributes) = update.attributes {
            user.attributes = attributes;
        }
        user.updated_at = Utc::now();
        let user = user.clone();
        self.warn_if_no_admin(&state);
        drop(state);
        self.invalidate_user(id).await;
        self.cache_user(&user).await;
        Ok(user)
    }

    /// Deactivate a user. Deactivated users fail every check.
    pub async fn deactivate_user(&self, id: &str) -> Result<(), AuthzError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| AuthzError::UserNotFound(id.to_owned()))?;
        user.active = false;
        user.updated_at = Utc::now();
        self.warn_if_no_admin(&state);
        drop(state);
        self.invalidate_user(id).await;
        info!(user_id = id, "user deactivated");
        Ok(())
    }

    /// Assign a role to a user.
    pub async fn assign_role(&self, user_id: &str, role: &str) -> Result<(), AuthzError> {
        let mut state = self.state.write().await;
        if !state.roles.contains_key(role) {
            return Err(AuthzError::RoleNotFound(role.to_owned()));
        }
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| AuthzError::UserNotFound(user_id.to_owned()))?;
        user.roles.insert(role.to_owned());
        user.updated_at = Utc::now();
        let user = user.clone();
        drop(state);
        self.invalidate_user(user_id).await;
        self.cache_user(&user).await;
        info!(user_id, role, "role assigned");
        Ok(())
    }

    /// Remove a role from a user.
    pub async fn revoke_role(&self, user_id: &str, role: &str) -> Result<(), AuthzError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| AuthzError::UserNotFound(user_id.to_owned()))?;
        user.roles.remove(role);
        user.updated_at = Utc::now();
        self.warn_if_no_admin(&state);
        drop(state);
        self.invalidate_user(user_id).await;
        info!(user_id, role, "role revoked");
        Ok(())
    }

    /// Install or replace the policy for a resource.
    pub async fn set_policy(&self, resource_policy: ResourcePolicy) {
        let mut state = self.state.write().await;
        state
            .policies
            .insert(resource_policy.resource.clone(), resource_policy);
    }

    /// Remove the policy for a resource.
    pub async fn remove_policy(&self, resource: &str) {
        let mut state = self.state.write().await;
        state.policies.remove(resource);
    }

    /// Fetch a user snapshot, falling back to the sealed cache when
    /// local state has no entry.
    pub async fn get_user(&self, id: &str) -> Option<User> {
        {
            let state = self.state.read().await;
            if let Some(user) = state.users.get(id) {
                return Some(user.clone());
            }
        }
        self.cached_user(id).await
    }

    /// Fetch a role snapshot, falling back to the sealed cache when
    /// local state has no entry.
    pub async fn get_role(&self, name: &str) -> Option<Role> {
        {
            let state = self.state.read().await;
            if let Some(role) = state.roles.get(name) {
                return Some(role.clone());
            }
        }
        self.cached_role(name).await
    }

    /// Serialize and encrypt a snapshot for the external store. The
    /// stored value is an [`EncryptedPayload`] document, never the
    /// record itself.
    fn seal_snapshot<T: Serialize>(&self, value: &T) -> Option<String> {
        let plaintext = serde_json::to_vec(value).ok()?;
        let payload = self.cache_crypto.encrypt(&plaintext, CACHE_CONTEXT).ok()?;
        serde_json::to_string(&payload).ok()
    }

    /// Decrypt and deserialize a stored snapshot. `None` covers both
    /// malformed documents and payloads sealed under a foreign key.
    fn open_snapshot<T: DeserializeOwned>(&self, sealed: &str) -> Option<T> {
        let payload: EncryptedPayload = serde_json::from_str(sealed).ok()?;
        let plaintext = self.cache_crypto.decrypt(&payload).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    async fn cache_user(&self, user: &User) {
        let Some(sealed) = self.seal_snapshot(user) else {
            warn!(user_id = %user.id, "user cache seal failed");
            return;
        };
        if let Err(e) = self
            .cache
            .set_ex(&format!("rbac:user:{}", user.id), sealed, USER_CACHE_TTL)
            .await
        {
            warn!(error = %e, user_id = %user.id, "user cache write failed");
        }
    }

    async fn cache_role(&self, role: &Role) {
        let Some(sealed) = self.seal_snapshot(role) else {
            warn!(role = %role.name, "role cache seal failed");
            return;
        };
        if let Err(e) = self
            .cache
            .set_ex(&format!("rbac:role:{}", role.name), sealed, ROLE_CACHE_TTL)
            .await
        {
            warn!(error = %e, role = %role.name, "role cache write failed");
        }
    }

    async fn cached_user(&self, id: &str) -> Option<User> {
        let sealed = self
            .cache
            .get(&format!("rbac:user:{id}"))
            .await
            .ok()
            .flatten()?;
        let user = self.open_snapshot(&sealed);
        if user.is_none() {
            debug!(user_id = id, "cached user entry unreadable, ignoring");
        }
        user
    }

    async fn cached_role(&self, name: &str) -> Option<Role> {
        let sealed = self
            .cache
            .get(&format!("rbac:role:{name}"))
            .await
            .ok()
            .flatten()?;
        let role = self.open_snapshot(&sealed);
        if role.is_none() {
            debug!(role = name, "cached role entry unreadable, ignoring");
        }
        role
    }

    async fn invalidate_user(&self, id: &str) {
        let _ = self.cache.delete(&format!("rbac:user:{id}")).await;
    }

    async fn invalidate_role(&self, name: &str) {
        let _ = self.cache.delete(&format!("rbac:role:{name}")).await;
    }

    /// Log at high severity when a mutation leaves the system without
    /// any active user holding an admin-equivalent role. The mutation
    /// itself is not blocked; that policy call belongs to the caller.
    fn warn_if_no_admin(&self, state: &EngineState) {
        let full: HashSet<&str> = PERMISSION_CATALOGUE.iter().copied().collect();
        let admin_roles: HashSet<&str> = state
            .roles
            .values()
            .filter(|role| full.iter().all(|p| role.effective.contains(*p)))
            .map(|role| role.name.as_str())
            .collect();
        let has_admin = state.users.values().any(|user| {
            user.active
                && (user.roles.iter().any(|r| admin_roles.contains(r.as_str()))
                    || full.iter().all(|p| user.direct_permissions.contains(*p)))
        });
        if !has_admin {
            error!("no active super-admin-equivalent user remains");
        }
    }
}

fn system_roles() -> Vec<(&'static str, &'static str, &'static [&'static str])> {
    vec![
        ("admin", "Full administrative access", PERMISSION_CATALOGUE),
        (
            "operator",
            "Day-to-day operational access",
            &[
                "token:issue",
                "token:verify",
                "token:revoke",
                "secret:read",
                "secret:list",
                "config:read",
                "user:read",
                "role:read",
                "audit:read",
            ],
        ),
        (
            "viewer",
            "Read-only access",
            &["token:verify", "config:read", "user:read", "role:read"],
        ),
    ]
}

fn validate_permissions(permissions: &HashSet<String>) -> Result<(), AuthzError> {
    for permission in permissions {
        if !PERMISSION_CATALOGUE.contains(&permission.as_str()) {
            return Err(AuthzError::UnknownPermission(permission.clone()));
        }
    }
    Ok(())
}

/// Recompute every role's effective permission set from the graph.
fn recompute_effective(roles: &mut HashMap<String, Role>) {
    let names: Vec<String> = roles.keys().cloned().collect();
    let mut resolved: HashMap<String, HashSet<String>> = HashMap::new();
    for name in &names {
        let mut effective = HashSet::new();
        let mut visited = HashSet::new();
        collect_permissions(roles, name, &mut effective, &mut visited);
        resolved.insert(name.clone(), effective);
    }
    for (name, effective) in resolved {
        if let Some(role) = roles.get_mut(&name) {
            role.effective = effective;
        }
    }
}

fn collect_permissions(
    roles: &HashMap<String, Role>,
    name: &str,
    out: &mut HashSet<String>,
    visited: &mut HashSet<String>,
) {
    if !visited.insert(name.to_owned()) {
        return;
    }
    let Some(role) = roles.get(name) else {
        return;
    };
    out.extend(role.permissions.iter().cloned());
    for parent in &role.parents {
        collect_permissions(roles, parent, out, visited);
    }
}

/// Would pointing `role` at `parents` create an inheritance cycle?
fn would_cycle(roles: &HashMap<String, Role>, role: &str, parents: &[String]) -> bool {
    let mut stack: Vec<String> = parents.to_vec();
    let mut visited = HashSet::new();
    while let Some(current) = stack.pop() {
        if current == role {
            return true;
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        if let Some(r) = roles.get(&current) {
            stack.extend(r.parents.iter().cloned());
        }
    }
    false
}
