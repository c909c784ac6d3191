//! Local-disk backend for single-host deployments and tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::{public_url, validate_key, MediaStorage, StoredObject};

/// Configuration for [`LocalStorage`].
#[derive(Debug, Clone)]
pub struct LocalStorageConfig {
    /// Directory objects are stored under
    pub root: PathBuf,
    /// Base URL the directory is served from
    pub public_base_url: Option<String>,
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("vgen-media"),
            public_base_url: None,
        }
    }
}

impl LocalStorageConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root: std::env::var("LOCAL_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.root),
            public_base_url: std::env::var("LOCAL_STORAGE_PUBLIC_URL")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

/// Stores objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
    public_base_url: Option<String>,
}

impl LocalStorage {
    pub fn new(config: LocalStorageConfig) -> Self {
        Self {
            root: config.root,
            public_base_url: config.public_base_url,
        }
    }

    /// Storage rooted at `root` without public URLs.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self::new(LocalStorageConfig {
            root: root.into(),
            public_base_url: None,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl MediaStorage for LocalStorage {
    async fn upload(&self, local: &Path, key: &str) -> StorageResult<StoredObject> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let size_bytes = tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| StorageError::upload_failed(format!("{}: {}", local.display(), e)))?;

        debug!(key, size_bytes, "Stored object on disk");

        Ok(StoredObject {
            remote_path: key.to_string(),
            public_url: public_url(self.public_base_url.as_deref(), key),
            size_bytes,
        })
    }

    async fn download(&self, remote: &str, local: &Path) -> StorageResult<()> {
        let src = self.path_for(remote)?;
        if !tokio::fs::try_exists(&src).await? {
            return Err(StorageError::not_found(remote));
        }
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, local)
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, remote: &str) -> StorageResult<()> {
        let path = self.path_for(remote)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(e.to_string())),
        }
    }

    async fn exists(&self, remote: &str) -> StorageResult<bool> {
        let path = self.path_for(remote)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
