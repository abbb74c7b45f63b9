use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

// ============================================================================
// File Content Storage
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("content for file {0} already exists")]
    AlreadyExists(i64),

    #[error("content for file {0} not found")]
    NotFound(i64),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-level storage for uploaded files, keyed by descriptor id
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn store(&self, file_id: i64, content: &[u8]) -> Result<(), StorageError>;

    async fn retrieve(&self, file_id: i64) -> Result<Vec<u8>, StorageError>;
}

/// One file per descriptor under a root directory
pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, file_id: i64) -> PathBuf {
        self.root.join(file_id.to_string())
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn store(&self, file_id: i64, content: &[u8]) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let path = self.path_for(file_id);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => StorageError::AlreadyExists(file_id),
                _ => StorageError::Io(e),
            })?;

        file.write_all(content).await?;
        file.flush().await?;

        tracing::debug!(file_id = file_id, bytes = content.len(), path = %path.display(), "Stored file content");
        Ok(())
    }

    async fn retrieve(&self, file_id: i64) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(self.path_for(file_id))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StorageError::NotFound(file_id),
                _ => StorageError::Io(e),
            })
    }
}
