//! Imagery blob storage, deduplicated per vineyard by content digest.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub content_hash: String,
    pub relative_path: PathBuf,
    /// Location recorded on the image observation.
    pub url: String,
    pub byte_size: usize,
    /// The same bytes were already stored for this vineyard.
    pub deduplicated: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, vineyard_id: i64, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob>;
}

fn content_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn normalized_extension(extension: &str) -> String {
    let ext = extension.trim().trim_start_matches('.').to_ascii_lowercase();
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        "bin".to_string()
    } else {
        ext
    }
}

/// `vineyard-{id}/{first two digest chars}/{digest}.{ext}`; capture time plays
/// no part, so a re-upload of the same raster lands on the existing file.
fn imagery_path(vineyard_id: i64, digest: &str, extension: &str) -> PathBuf {
    let fanout = digest.get(..2).unwrap_or("00");
    PathBuf::from(format!("vineyard-{vineyard_id}"))
        .join(fanout)
        .join(format!("{digest}.{}", normalized_extension(extension)))
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    public_base: Option<String>,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public_base: None,
        }
    }

    /// Serve blob urls under `base` instead of `file://` paths.
    pub fn with_public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    fn blob(&self, content_hash: String, relative_path: PathBuf, byte_size: usize, deduplicated: bool) -> StoredBlob {
        let url = match &self.public_base {
            Some(base) => format!("{base}/{}", relative_path.display()),
            None => format!("file://{}", self.root.join(&relative_path).display()),
        };
        StoredBlob {
            content_hash,
            relative_path,
            url,
            byte_size,
            deduplicated,
        }
    }

    /// Publishes `staged` at `target` only if nothing is there yet. Returns
    /// false when another upload got there first.
    async fn publish(staged: &Path, target: &Path) -> anyhow::Result<bool> {
        let linked = match fs::hard_link(staged, target).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => false,
            Err(err) => {
                let _ = fs::remove_file(staged).await;
                return Err(err).with_context(|| format!("publishing imagery blob {}", target.display()));
            }
        };
        fs::remove_file(staged)
            .await
            .with_context(|| format!("removing staged blob {}", staged.display()))?;
        Ok(linked)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, vineyard_id: i64, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        let digest = content_digest(bytes);
        let relative_path = imagery_path(vineyard_id, &digest, extension);
        let target = self.root.join(&relative_path);

        if let Ok(existing) = fs::metadata(&target).await {
            if existing.len() == bytes.len() as u64 {
                return Ok(self.blob(digest, relative_path, bytes.len(), true));
            }
            anyhow::bail!(
                "imagery blob {} exists with {} bytes, expected {}",
                target.display(),
                existing.len(),
                bytes.len()
            );
        }

        let dir = self.root.join(format!("vineyard-{vineyard_id}"));
        let staging = dir.join(".staging");
        fs::create_dir_all(&staging)
            .await
            .with_context(|| format!("creating staging directory {}", staging.display()))?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating blob directory {}", parent.display()))?;
        }

        let staged = staging.join(Uuid::new_v4().to_string());
        fs::write(&staged, bytes)
            .await
            .with_context(|| format!("staging imagery for vineyard {vineyard_id}"))?;

        let fresh = Self::publish(&staged, &target).await?;
        if fresh {
            tracing::debug!(vineyard_id, path = %relative_path.display(), bytes = bytes.len(), "stored imagery blob");
        }
        Ok(self.blob(digest, relative_path, bytes.len(), !fresh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_fan_out_by_digest_and_sanitize_extensions() {
        let digest = content_digest(b"hello world");
        assert_eq!(digest, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        assert_eq!(
            imagery_path(3, &digest, ".TIF"),
            PathBuf::from(format!("vineyard-3/b9/{digest}.tif"))
        );
        assert!(imagery_path(3, &digest, "../etc").ends_with(format!("{digest}.bin")));
        assert!(imagery_path(3, &digest, "").ends_with(format!("{digest}.bin")));
    }

    #[tokio::test]
    async fn reuploads_dedupe_per_vineyard() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path()).with_public_base("https://blobs.example/imagery/");

        let first = store.put(5, ".tif", b"raster").await.expect("first put");
        let again = store.put(5, "tif", b"raster").await.expect("second put");
        let elsewhere = store.put(6, "tif", b"raster").await.expect("other vineyard");

        assert!(!first.deduplicated);
        assert!(again.deduplicated);
        assert_eq!(first.relative_path, again.relative_path);
        assert!(!elsewhere.deduplicated);
        assert_ne!(first.relative_path, elsewhere.relative_path);
        assert_eq!(
            std::fs::read(dir.path().join(&first.relative_path)).expect("read blob"),
            b"raster"
        );
        assert!(first.url.starts_with("https://blobs.example/imagery/vineyard-5/"));
        assert!(first.url.ends_with(".tif"));
    }

    #[tokio::test]
    async fn racing_uploads_store_once() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        let (a, b) = tokio::join!(store.put(9, "png", b"same"), store.put(9, "png", b"same"));
        let (a, b) = (a.expect("put a"), b.expect("put b"));

        assert_eq!(a.relative_path, b.relative_path);
        assert!(a.deduplicated || b.deduplicated);
        let staged: Vec<_> = std::fs::read_dir(dir.path().join("vineyard-9/.staging"))
            .expect("staging dir")
            .collect();
        assert!(staged.is_empty());
        assert!(a.url.starts_with("file://"));
    }
}
