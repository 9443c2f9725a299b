//! Byte-object storage. Blobs live under owner-scoped prefixes:
//! `{user}/upload/...` for source images, `{user}/generated/...` for outputs,
//! `{user}/archive_*.zip` for training bundles and `{user}/index.md` for the
//! rendered ledger document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub path: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Lists blobs whose path starts with `prefix`, with their byte sizes.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;

    /// Externally resolvable address for a stored blob (handed to the remote
    /// provider and to notification consumers).
    fn public_url(&self, path: &str) -> String;
}

/// Filesystem-backed store rooted at the configured data directory.
pub struct FsBlobStore {
    root: PathBuf,
    public_base: String,
}

impl FsBlobStore {
    pub fn new(root: PathBuf, public_base: String) -> Self {
        Self {
            root,
            public_base: public_base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create data root at {}", self.root.display()))
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            anyhow::bail!("Refusing blob path outside the data root: {path}");
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create blob directory {}", parent.display()))?;
        }
        fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write blob {}", target.display()))
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to read blob {}", target.display()))
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        // Prefixes used by this service always name a directory plus an
        // optional file-name prefix; owner data is laid out flat inside it.
        let (dir, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", prefix),
        };
        let dir_path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.resolve(dir)?
        };
        let mut reader = match fs::read_dir(&dir_path).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to list {}", dir_path.display()));
            }
        };

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", dir_path.display()))?
        {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(name_prefix) {
                continue;
            }
            let path = if dir.is_empty() {
                name
            } else {
                format!("{dir}/{name}")
            };
            entries.push(BlobEntry {
                path,
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{path}", self.public_base)
    }
}

/// In-memory store used by tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: tokio::sync::RwLock<std::collections::BTreeMap<String, Vec<u8>>>,
}

#[cfg(test)]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().await.get(path).cloned())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(path, _)| path.starts_with(prefix))
            .map(|(path, bytes)| BlobEntry {
                path: path.clone(),
                size: bytes.len() as u64,
            })
            .collect())
    }

    fn public_url(&self, path: &str) -> String {
        format!("memory://{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_roundtrips_and_lists_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf(), "http://localhost/data".into());
        store.ensure_root().await.expect("root");

        store.put("u1/upload/a.jpg", b"abc").await.expect("put a");
        store.put("u1/upload/b.jpg", b"defg").await.expect("put b");
        store.put("u1/generated/c.jpg", b"x").await.expect("put c");

        let got = store.get("u1/upload/a.jpg").await.expect("get");
        assert_eq!(got.as_deref(), Some(b"abc".as_slice()));

        let uploads = store.list("u1/upload/").await.expect("list");
        assert_eq!(
            uploads,
            vec![
                BlobEntry {
                    path: "u1/upload/a.jpg".into(),
                    size: 3
                },
                BlobEntry {
                    path: "u1/upload/b.jpg".into(),
                    size: 4
                },
            ]
        );

        assert_eq!(
            store.public_url("u1/upload/a.jpg"),
            "http://localhost/data/u1/upload/a.jpg"
        );
    }

    #[tokio::test]
    async fn fs_store_tolerates_missing_prefixes_and_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf(), "http://localhost".into());
        store.ensure_root().await.expect("root");

        assert!(store.list("nobody/upload/").await.expect("list").is_empty());
        assert!(store.get("nobody/upload/x.jpg").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn fs_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().to_path_buf(), "http://localhost".into());
        assert!(store.get("../escape").await.is_err());
    }

    #[tokio::test]
    async fn memory_store_lists_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("u1/upload/a.jpg", b"abc").await.expect("put");
        store.put("u2/upload/b.jpg", b"de").await.expect("put");

        let uploads = store.list("u1/upload/").await.expect("list");
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].size, 3);
    }
}
