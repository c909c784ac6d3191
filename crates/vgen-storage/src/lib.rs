//! Media storage for the video pipeline.
//!
//! [`MediaStorage`] is the seam the workers use; [`R2Storage`] talks to
//! Cloudflare R2 through the S3 API and [`LocalStorage`] keeps files on disk.

pub mod error;
pub mod local;
pub mod r2;

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{StorageError, StorageResult};
pub use local::{LocalStorage, LocalStorageConfig};
pub use r2::{R2Config, R2Storage};

/// Reference to an uploaded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Object key in the backend
    pub remote_path: String,
    /// Public URL, when the backend exposes one
    pub public_url: Option<String>,
    pub size_bytes: u64,
}

/// Object storage used by the workers.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Upload a local file under `key`.
    async fn upload(&self, local: &Path, key: &str) -> StorageResult<StoredObject>;

    /// Download `remote` into `local`, creating parent directories.
    async fn download(&self, remote: &str, local: &Path) -> StorageResult<()>;

    /// Delete an object; deleting a missing object succeeds.
    async fn delete(&self, remote: &str) -> StorageResult<()>;

    async fn exists(&self, remote: &str) -> StorageResult<bool>;
}

/// Reject keys that are empty, absolute, or escape the key space.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.trim().is_empty() {
        return Err(StorageError::InvalidKey("empty key".to_string()));
    }
    if key.starts_with('/') || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// MIME type from the file extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Join a public base URL and a key.
pub(crate) fn public_url(base: Option<&str>, key: &str) -> Option<String> {
    base.map(|b| format!("{}/{}", b.trim_end_matches('/'), key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("exports/abc/video.mp4").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/etc/passwd").is_err());
        assert!(validate_key("exports/../secret").is_err());
        assert!(validate_key("exports//video.mp4").is_err());
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type_for("a/b.MP4"), "video/mp4");
        assert_eq!(content_type_for("thumb.jpg"), "image/jpeg");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_public_url_join() {
        assert_eq!(
            public_url(Some("https://cdn.example.com/"), "a/b.mp4").as_deref(),
            Some("https://cdn.example.com/a/b.mp4")
        );
        assert_eq!(public_url(None, "a/b.mp4"), None);
    }
}
