use std::sync::Arc;

use sqlx::AnyPool;

use super::errors::UploadError;
use super::model::{FileRecord, FileState, NewFile};
use super::repository::FileRepository;
use super::storage::FileStorage;
use crate::db::UnitOfWork;

// ============================================================================
// File Service - upload pipeline
// ============================================================================
//
// 1. PENDING descriptor + CREATED event, one transaction
// 2. content to storage, outside any transaction
// 3. PENDING -> UPLOADED + UPDATED event, second transaction
//
// A storage failure leaves the descriptor PENDING and is returned as is.
//
// ============================================================================

#[derive(Clone)]
pub struct FileService {
    pool: AnyPool,
    repository: FileRepository,
    storage: Arc<dyn FileStorage>,
}

impl FileService {
    pub fn new(pool: AnyPool, repository: FileRepository, storage: Arc<dyn FileStorage>) -> Self {
        Self {
            pool,
            repository,
            storage,
        }
    }

    pub async fn upload(&self, file: NewFile, content: &[u8]) -> Result<FileRecord, UploadError> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let pending = self.repository.insert_pending(&mut uow, file).await?;
        uow.commit().await?;

        if let Err(source) = self.storage.store(pending.id, content).await {
            tracing::warn!(file_id = pending.id, error = %source, "Storing file content failed, descriptor left PENDING");
            return Err(UploadError::Storage {
                file_id: pending.id,
                source,
            });
        }

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let version = self
            .repository
            .transition(&mut uow, pending.id, pending.version, FileState::Uploaded)
            .await?;
        uow.commit().await?;

        tracing::info!(file_id = pending.id, bytes = content.len(), "File uploaded");

        Ok(FileRecord {
            state: FileState::Uploaded,
            version,
            ..pending
        })
    }

    pub async fn content(&self, file_id: i64) -> Result<Vec<u8>, UploadError> {
        self.storage
            .retrieve(file_id)
            .await
            .map_err(|source| UploadError::Storage { file_id, source })
    }
}
