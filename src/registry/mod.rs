//! Authoritative store of server configurations.
//!
//! The working set lives in memory; every mutation is written through the
//! configured [`store::ConfigStore`] before the call returns, so a document
//! store (when present) is durable and the in-memory fallback simply
//! forgets on restart.

pub mod store;
pub mod validation;

use crate::error::{Error, Result};
use crate::types::ToolDescriptor;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use store::{ConfigStore, JsonFileStore, MemoryStore};

/// OAuth provider description attached to a server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub authorization_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Name of the process env var holding the OAuth client id.
    pub client_id_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_env: Option<String>,
    pub redirect_path: String,
}

/// A persisted server configuration row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Restart on abnormal exit, within the supervisor's backoff policy.
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    /// Denormalized copy of the last successful `tools/list`; a hint for
    /// discovery endpoints, never used to dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServerConfig {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn default_true() -> bool {
    true
}

/// Wire form for `POST /api/servers`. Unknown fields are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateServer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Wire form for `PUT /api/servers/{id}`. `id` and `created_at` are listed
/// so an attempt to change them fails with `immutable-field` instead of a
/// generic parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateServer {
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<Option<PathBuf>>,
    pub enabled: Option<bool>,
    pub auto_restart: Option<bool>,
    pub auth: Option<Option<AuthConfig>>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListFilter {
    pub enabled_only: bool,
    pub include_deleted: bool,
}

/// In-memory working set backed by a write-through store.
pub struct Registry {
    servers: DashMap<String, ServerConfig>,
    store: Arc<dyn ConfigStore>,
}

impl Registry {
    pub async fn load(store: Arc<dyn ConfigStore>) -> Result<Self> {
        let servers = DashMap::new();
        for config in store.load_all().await? {
            servers.insert(config.id.clone(), config);
        }
        Ok(Self { servers, store })
    }

    pub async fn create(&self, request: CreateServer) -> Result<ServerConfig> {
        validation::validate_server_id(&request.id)?;
        validation::validate_command(&request.command)?;
        validation::validate_env(&request.env)?;

        if let Some(existing) = self.servers.get(&request.id) {
            if !existing.is_deleted() {
                return Err(Error::Conflict(request.id.clone()));
            }
        }

        let now = Utc::now();
        let config = ServerConfig {
            id: request.id,
            name: request.name,
            description: request.description,
            command: request.command,
            args: request.args,
            env: request.env,
            cwd: request.cwd,
            enabled: request.enabled,
            auto_restart: request.auto_restart,
            auth: request.auth,
            tools: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };

        self.store.put(&config).await?;
        self.servers.insert(config.id.clone(), config.clone());
        Ok(config)
    }

    /// Fetch a non-deleted row.
    pub fn get(&self, id: &str) -> Result<ServerConfig> {
        match self.servers.get(id) {
            Some(config) if !config.is_deleted() => Ok(config.clone()),
            _ => Err(Error::UnknownServer(id.to_string())),
        }
    }

    /// Deterministic listing, sorted by id for cursor stability.
    pub fn list(&self, filter: ListFilter) -> Vec<ServerConfig> {
        let mut rows: Vec<ServerConfig> = self
            .servers
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|config| filter.include_deleted || !config.is_deleted())
            .filter(|config| !filter.enabled_only || config.enabled)
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub async fn update(&self, id: &str, patch: UpdateServer) -> Result<ServerConfig> {
        let mut config = self.get(id)?;

        if let Some(new_id) = &patch.id {
            if new_id != &config.id {
                return Err(Error::ImmutableField("id"));
            }
        }
        if let Some(created_at) = &patch.created_at {
            if created_at != &config.created_at {
                return Err(Error::ImmutableField("created_at"));
            }
        }

        if let Some(command) = &patch.command {
            validation::validate_command(command)?;
        }
        if let Some(env) = &patch.env {
            validation::validate_env(env)?;
        }

        if let Some(name) = patch.name {
            config.name = name;
        }
        if let Some(description) = patch.description {
            config.description = description;
        }
        if let Some(command) = patch.command {
            config.command = command;
        }
        if let Some(args) = patch.args {
            config.args = args;
        }
        if let Some(env) = patch.env {
            config.env = env;
        }
        if let Some(cwd) = patch.cwd {
            config.cwd = cwd;
        }
        if let Some(enabled) = patch.enabled {
            config.enabled = enabled;
        }
        if let Some(auto_restart) = patch.auto_restart {
            config.auto_restart = auto_restart;
        }
        if let Some(auth) = patch.auth {
            config.auth = auth;
        }
        config.updated_at = Utc::now();

        self.store.put(&config).await?;
        self.servers.insert(config.id.clone(), config.clone());
        Ok(config)
    }

    /// Soft delete: the row is retained, hidden from default listings, and
    /// can never be started again.
    pub async fn delete(&self, id: &str) -> Result<ServerConfig> {
        let mut config = self.get(id)?;
        config.deleted_at = Some(Utc::now());
        config.updated_at = Utc::now();

        self.store.put(&config).await?;
        self.servers.insert(config.id.clone(), config.clone());
        Ok(config)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<ServerConfig> {
        self.update(
            id,
            UpdateServer {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Record the denormalized `tools` hint after a successful handshake.
    pub async fn set_tools(&self, id: &str, tools: Vec<ToolDescriptor>) -> Result<()> {
        let mut config = self.get(id)?;
        config.tools = Some(tools);
        config.updated_at = Utc::now();
        self.store.put(&config).await?;
        self.servers.insert(config.id.clone(), config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> CreateServer {
        CreateServer {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            command: "npx".to_string(),
            args: vec!["-y".into(), "@x/fs".into()],
            env: HashMap::new(),
            cwd: None,
            enabled: true,
            auto_restart: false,
            auth: None,
        }
    }

    async fn registry() -> Registry {
        Registry::load(Arc::new(MemoryStore)).await.unwrap()
    }

    #[tokio::test]
    async fn create_then_get() {
        let registry = registry().await;
        let created = registry.create(request("fs")).await.unwrap();
        assert_eq!(created.id, "fs");
        assert!(created.enabled);

        let fetched = registry.get("fs").unwrap();
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[tokio::test]
    async fn duplicate_id_conflicts() {
        let registry = registry().await;
        registry.create(request("fs")).await.unwrap();
        let err = registry.create(request("fs")).await.unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn create_over_soft_deleted_id_is_allowed() {
        let registry = registry().await;
        registry.create(request("fs")).await.unwrap();
        registry.delete("fs").await.unwrap();
        registry.create(request("fs")).await.unwrap();
        assert!(!registry.get("fs").unwrap().is_deleted());
    }

    #[tokio::test]
    async fn update_rejects_id_change() {
        let registry = registry().await;
        registry.create(request("fs")).await.unwrap();
        let err = registry
            .update(
                "fs",
                UpdateServer {
                    id: Some("fs2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "immutable-field");
    }

    #[tokio::test]
    async fn update_with_same_id_is_a_noop_guard() {
        let registry = registry().await;
        registry.create(request("fs")).await.unwrap();
        let updated = registry
            .update(
                "fs",
                UpdateServer {
                    id: Some("fs".into()),
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "renamed");
    }

    #[tokio::test]
    async fn delete_hides_from_default_listing() {
        let registry = registry().await;
        registry.create(request("a")).await.unwrap();
        registry.create(request("b")).await.unwrap();
        registry.delete("a").await.unwrap();

        let visible = registry.list(ListFilter::default());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "b");

        let all = registry.list(ListFilter {
            include_deleted: true,
            ..Default::default()
        });
        assert_eq!(all.len(), 2);

        let err = registry.get("a").unwrap_err();
        assert_eq!(err.kind(), "unknown-server");
    }

    #[tokio::test]
    async fn listing_is_sorted_by_id() {
        let registry = registry().await;
        for id in ["zeta", "alpha", "mid"] {
            registry.create(request(id)).await.unwrap();
        }
        let ids: Vec<_> = registry
            .list(ListFilter::default())
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn disabled_servers_hidden_from_enabled_only() {
        let registry = registry().await;
        registry.create(request("a")).await.unwrap();
        registry.create(request("b")).await.unwrap();
        registry.set_enabled("a", false).await.unwrap();

        let enabled = registry.list(ListFilter {
            enabled_only: true,
            ..Default::default()
        });
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, "b");

        // Disabled rows are retained.
        assert!(registry.get("a").is_ok());
    }

    #[tokio::test]
    async fn denied_command_rejected_on_create() {
        let registry = registry().await;
        let mut bad = request("fs");
        bad.command = "bash".into();
        let err = registry.create(bad).await.unwrap_err();
        assert_eq!(err.kind(), "command-denied");
    }
}
