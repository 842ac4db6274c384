//! Content-addressed blob storage for fetched and uploaded files.
//!
//! Blobs live under `<root>/blobs/<aa>/<hash>` where `aa` is the first two
//! hex digits of the content hash. Paths stored on [`ImportFile`] records
//! are relative to the root so the data directory can move.
//!
//! [`ImportFile`]: crate::models::ImportFile

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn relative_path(content_hash: &str) -> String {
        let shard = content_hash.get(..2).unwrap_or("00");
        format!("blobs/{}/{}", shard, content_hash)
    }

    /// Write bytes under their content hash. Returns the relative storage
    /// path. Writing the same content twice is a no-op.
    pub async fn write(&self, content_hash: &str, bytes: &[u8]) -> Result<String> {
        let relative = Self::relative_path(content_hash);
        let path = self.root.join(&relative);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(relative);
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(relative)
    }

    /// Read a blob by its stored relative path.
    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let bytes = tokio::fs::read(self.root.join(relative)).await?;
        Ok(bytes)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let path = store.write("abcd1234", b"a,b\n1,2\n").await.unwrap();
        assert_eq!(path, "blobs/ab/abcd1234");
        assert_eq!(store.read(&path).await.unwrap(), b"a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_rewrite_same_content_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        store.write("ffff", b"first").await.unwrap();
        let path = store.write("ffff", b"ignored").await.unwrap();
        assert_eq!(store.read(&path).await.unwrap(), b"first");
    }
}
