use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` for lock-free reads, providing high performance
/// for frequent configuration access in hot paths.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub path: PathBuf,
}

impl ConfigStore {
    /// Load the configuration file, writing defaults if it does not exist
    pub async fn load(path: &Path) -> Result<Self> {
        let config = match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str::<AppConfig>(&text).map_err(|e| {
                AppError::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::write_file(path, &config).await?;
                info!("Wrote default configuration to {}", path.display());
                config
            }
            Err(e) => {
                return Err(AppError::Config(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        config.validate()?;

        let (change_tx, _) = broadcast::channel(16);
        Ok(Self {
            path: path.to_path_buf(),
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        })
    }

    /// Serialize and write atomically (temp file + rename)
    async fn write_file(path: &Path, config: &AppConfig) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = toml::to_string_pretty(config)
            .map_err(|e| AppError::Config(format!("Failed to serialize config: {}", e)))?;
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Replace the configuration and persist it
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        Self::write_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            path: self.path.clone(),
        });
        Ok(())
    }

    /// Update configuration with a closure
    ///
    /// Read-modify-write; for concurrent updates the last write wins.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (**self.cache.load()).clone();
        f(&mut config);
        self.set(config).await
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_config_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("clip-relay.toml");

        // Missing file gets defaults written
        let store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(*store.get(), AppConfig::default());
        assert!(path.exists());

        let mut changes = store.subscribe();
        store
            .update(|c| {
                c.web.http_port = 9000;
                c.clips.buffer_seconds = 10;
            })
            .await
            .unwrap();
        assert!(changes.try_recv().is_ok());
        assert_eq!(store.get().web.http_port, 9000);

        // Create new store instance and verify persistence
        let store2 = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store2.get().web.http_port, 9000);
        assert_eq!(store2.get().clips.buffer_seconds, 10);
    }

    #[tokio::test]
    async fn test_invalid_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");

        tokio::fs::write(&path, "[video]\nfps = \"fast\"\n").await.unwrap();
        assert!(matches!(
            ConfigStore::load(&path).await,
            Err(AppError::Config(_))
        ));

        tokio::fs::write(&path, "[relay]\nvideo_capacity = 0\n").await.unwrap();
        assert!(ConfigStore::load(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_set_rejects_invalid() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::load(&dir.path().join("c.toml")).await.unwrap();
        let result = store.update(|c| c.video.fps = 0).await;
        assert!(result.is_err());
        assert_eq!(store.get().video.fps, 30);
    }
}
