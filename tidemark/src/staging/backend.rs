//! Storage primitives the staged writer promotes artifacts with.
//!
//! Locations are `/`-separated keys relative to the backend root.

use crate::errors::{Result, TidemarkError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Storage operations used by [`super::StagedWriter`].
#[async_trait]
pub trait StagingBackend: Send + Sync {
    /// Writes an object, creating parent directories as needed.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Reads an object.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;

    /// Returns true if the object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Whether `rename` is atomic and available. Backends that return false
    /// are promoted by copy, checksum comparison and delete.
    fn supports_rename(&self) -> bool {
        true
    }

    /// Moves an object, replacing any existing target.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Copies an object, replacing any existing target.
    async fn copy(&self, from: &str, to: &str) -> Result<()>;

    /// Hex SHA-256 digest of an object's contents.
    async fn checksum(&self, key: &str) -> Result<String>;

    /// Deletes an object. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Deletes every object under a prefix. A missing prefix succeeds.
    async fn clear_prefix(&self, prefix: &str) -> Result<()>;

    /// Keys under a prefix, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Hex SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A staging backend on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalStagingBackend {
    root: PathBuf,
    rename_supported: bool,
}

impl LocalStagingBackend {
    /// Creates a backend rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            rename_supported: true,
        }
    }

    /// Forces promotion through copy-verify-delete.
    #[must_use]
    pub fn without_rename(mut self) -> Self {
        self.rename_supported = false;
        self
    }

    /// The backend root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim_matches('/');
        if key
            .split('/')
            .any(|segment| segment == ".." || segment == "." || segment.contains('\\'))
        {
            return Err(TidemarkError::configuration(format!(
                "invalid storage key '{key}'"
            )));
        }
        Ok(key
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(self.root.clone(), |path, segment| path.join(segment)))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl StagingBackend for LocalStagingBackend {
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        Self::ensure_parent(&path).await?;
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(key)?).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(key)?).await?)
    }

    fn supports_rename(&self) -> bool {
        self.rename_supported
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve(to)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::rename(self.resolve(from)?, &target).await?;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve(to)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::copy(self.resolve(from)?, &target).await?;
        Ok(())
    }

    async fn checksum(&self, key: &str) -> Result<String> {
        let bytes = tokio::fs::read(self.resolve(key)?).await?;
        Ok(sha256_hex(&bytes))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.resolve(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<()> {
        let path = self.resolve(prefix)?;
        if path == self.root {
            return Err(TidemarkError::configuration(
                "refusing to clear the staging backend root",
            ));
        }
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let start = self.resolve(prefix)?;
        let mut keys = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_of(&path) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_read_delete() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStagingBackend::new(dir.path());

        backend.write("a/b/c.txt", b"hello").await.unwrap();
        assert!(backend.exists("a/b/c.txt").await.unwrap());
        assert_eq!(backend.read("a/b/c.txt").await.unwrap(), b"hello");

        backend.delete("a/b/c.txt").await.unwrap();
        backend.delete("a/b/c.txt").await.unwrap();
        assert!(!backend.exists("a/b/c.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_preserves_checksum() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStagingBackend::new(dir.path());

        backend.write("src/part.jsonl", b"{\"id\":1}\n").await.unwrap();
        backend.copy("src/part.jsonl", "dst/part.jsonl").await.unwrap();

        assert_eq!(
            backend.checksum("src/part.jsonl").await.unwrap(),
            backend.checksum("dst/part.jsonl").await.unwrap()
        );
        assert_eq!(
            backend.checksum("dst/part.jsonl").await.unwrap(),
            sha256_hex(b"{\"id\":1}\n")
        );
    }

    #[tokio::test]
    async fn test_list_and_clear_prefix() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStagingBackend::new(dir.path());

        backend.write("orders/2.jsonl", b"2").await.unwrap();
        backend.write("orders/nested/1.jsonl", b"1").await.unwrap();
        backend.write("other/x", b"x").await.unwrap();

        assert_eq!(
            backend.list("orders").await.unwrap(),
            vec!["orders/2.jsonl".to_string(), "orders/nested/1.jsonl".to_string()]
        );

        backend.clear_prefix("orders").await.unwrap();
        backend.clear_prefix("orders").await.unwrap();
        assert!(backend.list("orders").await.unwrap().is_empty());
        assert!(backend.exists("other/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let backend = LocalStagingBackend::new(dir.path());

        assert!(backend.write("../outside", b"x").await.is_err());
        assert!(backend.clear_prefix("").await.is_err());
    }
}
