//! Persistence seam for server configurations.
//!
//! `JsonFileStore` keeps one JSON document per server id and makes each
//! mutation durable with a tmp-file rename before the API returns.
//! `MemoryStore` is the documented fallback: the registry's own map is the
//! working set, so there is nothing to persist and loss on restart is
//! acceptable.

use crate::error::{Error, Result};
use crate::logs::LogRecord;
use crate::registry::ServerConfig;
use crate::supervisor::StatusSnapshot;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, warn};

/// How many log lines the persisted `server_logs` document keeps.
pub const PERSISTED_LOG_CAP: usize = 1_000;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ServerConfig>>;
    async fn put(&self, config: &ServerConfig) -> Result<()>;

    /// Runtime snapshot for observability only; the in-memory instance is
    /// the truth. Default: not persisted.
    async fn put_instance(&self, _snapshot: &StatusSnapshot) -> Result<()> {
        Ok(())
    }

    /// Capped log tail for a server. Default: not persisted.
    async fn put_log_tail(&self, _server_id: &str, _records: &[LogRecord]) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryStore;

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<ServerConfig>> {
        Ok(Vec::new())
    }

    async fn put(&self, _config: &ServerConfig) -> Result<()> {
        Ok(())
    }
}

pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub async fn open(dir: PathBuf) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Internal(format!("cannot create store dir {dir:?}: {e}")))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ConfigStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<ServerConfig>> {
        let mut configs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<ServerConfig>(&bytes) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("skipping unreadable server document {path:?}: {e}"),
            }
        }
        debug!("loaded {} server documents from {:?}", configs.len(), self.dir);
        Ok(configs)
    }

    async fn put(&self, config: &ServerConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        let path = self.path_for(&config.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", config.id));

        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn put_instance(&self, snapshot: &StatusSnapshot) -> Result<()> {
        let dir = self.dir.join("instances");
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        let tmp = dir.join(format!(".{}.json.tmp", snapshot.id));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, dir.join(format!("{}.json", snapshot.id))).await?;
        Ok(())
    }

    async fn put_log_tail(&self, server_id: &str, records: &[LogRecord]) -> Result<()> {
        let dir = self.dir.join("logs");
        tokio::fs::create_dir_all(&dir).await?;
        let capped = &records[records.len().saturating_sub(PERSISTED_LOG_CAP)..];
        let bytes = serde_json::to_vec(capped)?;
        let tmp = dir.join(format!(".{server_id}.json.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, dir.join(format!("{server_id}.json"))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{CreateServer, ListFilter, Registry};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn request(id: &str) -> CreateServer {
        CreateServer {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            command: "node".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            enabled: true,
            auto_restart: false,
            auth: None,
        }
    }

    #[tokio::test]
    async fn mutations_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::open(dir.path().to_path_buf()).await.unwrap());

        let registry = Registry::load(store.clone()).await.unwrap();
        registry.create(request("alpha")).await.unwrap();
        registry.create(request("beta")).await.unwrap();
        registry.delete("beta").await.unwrap();
        drop(registry);

        // A fresh registry over the same directory sees the same rows.
        let reloaded = Registry::load(store).await.unwrap();
        let visible = reloaded.list(ListFilter::default());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "alpha");

        let all = reloaded.list(ListFilter {
            include_deleted: true,
            ..Default::default()
        });
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.id == "beta" && c.is_deleted()));
    }

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().to_path_buf()).await.unwrap();

        let registry = Registry::load(Arc::new(MemoryStore)).await.unwrap();
        let mut config = registry.create(request("gamma")).await.unwrap();
        store.put(&config).await.unwrap();

        config.name = "renamed".into();
        store.put(&config).await.unwrap();

        let rows = store.load_all().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "renamed");
    }

    #[tokio::test]
    async fn non_json_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("README.txt"), "not a server")
            .await
            .unwrap();
        let store = JsonFileStore::open(dir.path().to_path_buf()).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
