use super::model::FileState;
use super::storage::StorageError;
use crate::db::StoreError;

// ============================================================================
// File Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("file descriptor {0} not found")]
    NotFound(i64),

    #[error("file descriptor {id} is no longer at version {expected_version}")]
    VersioningConflict { id: i64, expected_version: i64 },

    #[error("file descriptor cannot move from {from} to {to}")]
    InvalidTransition { from: FileState, to: FileState },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for TransitionError {
    fn from(e: sqlx::Error) -> Self {
        TransitionError::Store(StoreError::Database(e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("storing content of file {file_id} failed: {source}")]
    Storage {
        file_id: i64,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
