use std::collections::HashMap;

use sqlx::Row;

use super::errors::TransitionError;
use super::model::{FileRecord, FileState, NewFile};
use crate::db::{values_placeholders, StoreError, UnitOfWork};
use crate::events::proto::FileDescriptorChangedEvent;
use crate::events::OutboxWriter;

// ============================================================================
// File Repository - versioned file descriptors
// ============================================================================
//
// Every write goes through the caller's UnitOfWork and emits exactly one
// FileDescriptorChangedEvent into the outbox in the same transaction.
//
// `transition` is optimistic: a single conditional UPDATE guarded by the
// caller's expected version. Zero affected rows means another writer moved
// the version first, reported as `VersioningConflict` and never retried here.
//
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct FileRepository {
    outbox: OutboxWriter,
}

impl FileRepository {
    pub fn new(outbox: OutboxWriter) -> Self {
        Self { outbox }
    }

    /// Insert a descriptor at PENDING, version 1, and emit CREATED
    pub async fn insert_pending(&self, uow: &mut UnitOfWork, file: NewFile) -> Result<FileRecord, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO file_descriptor (file_name, content_type, state, version)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(file.file_name.clone())
        .bind(file.content_type.clone())
        .bind(FileState::Pending.as_str())
        .bind(1_i64)
        .fetch_one(uow.connection()?)
        .await?;

        if !file.attributes.is_empty() {
            let sql = format!(
                "INSERT INTO file_attribute (file_id, name, value) VALUES {}",
                values_placeholders(file.attributes.len(), 3)
            );
            let mut query = sqlx::query(&sql);
            for (name, value) in &file.attributes {
                query = query.bind(id).bind(name.clone()).bind(value.clone());
            }
            query.execute(uow.connection()?).await?;
        }

        let record = FileRecord {
            id,
            state: FileState::Pending,
            version: 1,
            file_name: file.file_name,
            content_type: file.content_type,
            attributes: file.attributes,
        };

        self.outbox
            .publish(uow, &[FileDescriptorChangedEvent::created(record.to_proto()).into()])
            .await?;

        tracing::info!(file_id = id, file_name = %record.file_name, "File descriptor created");
        Ok(record)
    }

    /// Move a descriptor to `new_state` if it is still at `expected_version`.
    /// Returns the new version.
    pub async fn transition(
        &self,
        uow: &mut UnitOfWork,
        id: i64,
        expected_version: i64,
        new_state: FileState,
    ) -> Result<i64, TransitionError> {
        let current = self
            .find_by_id(uow, id)
            .await?
            .ok_or(TransitionError::NotFound(id))?;

        if current.version != expected_version {
            return Err(TransitionError::VersioningConflict { id, expected_version });
        }
        if !current.state.can_transition_to(new_state) {
            return Err(TransitionError::InvalidTransition {
                from: current.state,
                to: new_state,
            });
        }

        self.apply(uow, &current, new_state).await
    }

    /// Conditional UPDATE from `current.version`, then UPDATED into the outbox.
    /// `current` may already be stale; the version guard decides.
    async fn apply(
        &self,
        uow: &mut UnitOfWork,
        current: &FileRecord,
        new_state: FileState,
    ) -> Result<i64, TransitionError> {
        let (id, expected_version) = (current.id, current.version);

        let updated = sqlx::query(
            "UPDATE file_descriptor
             SET state = $1, version = version + 1
             WHERE id = $2 AND version = $3",
        )
        .bind(new_state.as_str())
        .bind(id)
        .bind(expected_version)
        .execute(uow.connection()?)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::debug!(file_id = id, expected_version = expected_version, "Lost optimistic update race");
            return Err(TransitionError::VersioningConflict { id, expected_version });
        }

        let new_version = expected_version + 1;
        let next = FileRecord {
            state: new_state,
            version: new_version,
            ..current.clone()
        };

        self.outbox
            .publish(
                uow,
                &[FileDescriptorChangedEvent::updated(current.to_proto(), next.to_proto()).into()],
            )
            .await?;

        tracing::info!(
            file_id = id,
            from = %current.state,
            to = %new_state,
            version = new_version,
            "File descriptor transitioned"
        );
        Ok(new_version)
    }

    pub async fn find_by_id(&self, uow: &mut UnitOfWork, id: i64) -> Result<Option<FileRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, file_name, content_type, state, version
             FROM file_descriptor
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(uow.connection()?)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let state_text: String = row.try_get("state")?;
        let state = state_text
            .parse::<FileState>()
            .map_err(|reason| StoreError::CorruptRow { table: "file_descriptor", reason })?;

        let attributes = sqlx::query("SELECT name, value FROM file_attribute WHERE file_id = $1")
            .bind(id)
            .fetch_all(uow.connection()?)
            .await?
            .iter()
            .map(|attr| -> Result<(String, String), sqlx::Error> {
                Ok((attr.try_get("name")?, attr.try_get("value")?))
            })
            .collect::<Result<HashMap<String, String>, sqlx::Error>>()?;

        Ok(Some(FileRecord {
            id: row.try_get("id")?,
            state,
            version: row.try_get("version")?,
            file_name: row.try_get("file_name")?,
            content_type: row.try_get("content_type")?,
            attributes,
        }))
    }
}
