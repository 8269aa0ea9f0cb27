use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Slash-separated key relative to the store root.
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    /// The same bytes were already stored under this key.
    pub reused: bool,
}

/// Content-addressed object store on the local filesystem. Objects are immutable once written.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<prefix>/<hash>.<ext>`. Empty, `.` and `..` prefix segments are dropped.
    pub fn object_key(prefix: &str, content_hash: &str, extension: &str) -> String {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        let mut segments: Vec<&str> = prefix
            .split('/')
            .filter(|s| !matches!(*s, "" | "." | ".."))
            .collect();
        let file = format!("{content_hash}.{ext}");
        segments.push(&file);
        segments.join("/")
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, segment| path.join(segment))
    }

    pub async fn put(&self, prefix: &str, extension: &str, bytes: &[u8]) -> Result<StoredObject> {
        let content_hash = sha256_hex(bytes);
        let key = Self::object_key(prefix, &content_hash, extension);
        let dest = self.path_for(&key);
        let dir = dest
            .parent()
            .with_context(|| format!("object path {} has no parent", dest.display()))?;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating object directory {}", dir.display()))?;

        let reused = fs::try_exists(&dest)
            .await
            .with_context(|| format!("checking object {}", dest.display()))?;
        if !reused {
            write_atomically(dir, &dest, bytes).await?;
        }
        Ok(StoredObject {
            key,
            content_hash,
            byte_size: bytes.len(),
            reused,
        })
    }
}

/// Writes to a hidden temp file in `dir`, fsyncs, then renames over `dest`.
async fn write_atomically(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let temp = dir.join(format!(".{}.partial", Uuid::new_v4()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp)
            .await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, dest).await
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(err).with_context(|| format!("writing object {}", dest.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn keys_drop_traversal_segments() {
        assert_eq!(ObjectStore::object_key("issues/../x/./42", "abc", ".jpg"), "issues/x/42/abc.jpg");
        assert_eq!(ObjectStore::object_key("issues/1", "abc", ""), "issues/1/abc.bin");
        assert_eq!(ObjectStore::object_key("", "abc", "png"), "abc.png");
    }

    #[tokio::test]
    async fn same_bytes_under_same_prefix_are_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path());

        let first = store.put("issues/7", "jpg", b"\xFF\xD8\xFFsame").await.unwrap();
        let second = store.put("issues/7", "jpg", b"\xFF\xD8\xFFsame").await.unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.key, second.key);
        assert_eq!(first.byte_size, 7);
        let on_disk = std::fs::read(store.path_for(&first.key)).unwrap();
        assert_eq!(on_disk, b"\xFF\xD8\xFFsame");

        let leftovers = std::fs::read_dir(dir.path().join("issues/7"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
