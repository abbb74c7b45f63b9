use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use sqlx::any::AnyRow;
use sqlx::Row;

use crate::db::{StoreError, UnitOfWork};

// ============================================================================
// Subscription Directory
// ============================================================================
//
// Persisted canvas -> connection interest list. Membership is the natural
// key (canvas_id, connection_id), so a repeated subscribe is a no-op.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: i64,
    pub canvas_id: i64,
    pub connection_id: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscriptionDirectory;

impl SubscriptionDirectory {
    pub fn new() -> Self {
        Self
    }

    /// Returns false when the membership already existed
    pub async fn subscribe(&self, uow: &mut UnitOfWork, canvas_id: i64, connection_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO canvas_subscription (canvas_id, connection_id)
             VALUES ($1, $2)
             ON CONFLICT (canvas_id, connection_id) DO NOTHING",
        )
        .bind(canvas_id)
        .bind(connection_id)
        .execute(uow.connection()?)
        .await?;

        let inserted = result.rows_affected() > 0;
        tracing::debug!(canvas_id = canvas_id, connection_id = connection_id, inserted = inserted, "Subscribed");
        Ok(inserted)
    }

    /// Returns false when there was nothing to remove
    pub async fn unsubscribe(&self, uow: &mut UnitOfWork, canvas_id: i64, connection_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM canvas_subscription WHERE canvas_id = $1 AND connection_id = $2")
            .bind(canvas_id)
            .bind(connection_id)
            .execute(uow.connection()?)
            .await?;

        let removed = result.rows_affected() > 0;
        tracing::debug!(canvas_id = canvas_id, connection_id = connection_id, removed = removed, "Unsubscribed");
        Ok(removed)
    }

    pub async fn delete_all_for_connection(&self, uow: &mut UnitOfWork, connection_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM canvas_subscription WHERE connection_id = $1")
            .bind(connection_id)
            .execute(uow.connection()?)
            .await?;

        Ok(result.rows_affected())
    }

    /// Streams the subscribers of a canvas. A closed handle yields a single
    /// `NoActiveTransaction`.
    pub fn find_subscribers<'a>(
        &self,
        uow: &'a mut UnitOfWork,
        canvas_id: i64,
    ) -> BoxStream<'a, Result<SubscriptionRecord, StoreError>> {
        match uow.connection() {
            Ok(conn) => sqlx::query(
                "SELECT id, canvas_id, connection_id
                 FROM canvas_subscription
                 WHERE canvas_id = $1
                 ORDER BY id",
            )
            .bind(canvas_id)
            .fetch(conn)
            .map(|row| row.map_err(StoreError::from).and_then(|row| decode(&row)))
            .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }
}

fn decode(row: &AnyRow) -> Result<SubscriptionRecord, StoreError> {
    Ok(SubscriptionRecord {
        id: row.try_get("id")?,
        canvas_id: row.try_get("canvas_id")?,
        connection_id: row.try_get("connection_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use futures_util::TryStreamExt;

    async fn subscribers(uow: &mut UnitOfWork, canvas_id: i64) -> Vec<i64> {
        SubscriptionDirectory::new()
            .find_subscribers(uow, canvas_id)
            .map_ok(|s| s.connection_id)
            .try_collect()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let pool = memory_pool().await;
        let directory = SubscriptionDirectory::new();
        let mut uow = UnitOfWork::begin(&pool).await.unwrap();

        assert!(directory.subscribe(&mut uow, 42, 7).await.unwrap());
        assert!(!directory.subscribe(&mut uow, 42, 7).await.unwrap());
        directory.subscribe(&mut uow, 42, 8).await.unwrap();
        directory.subscribe(&mut uow, 43, 7).await.unwrap();

        assert_eq!(subscribers(&mut uow, 42).await, vec![7, 8]);
        assert_eq!(subscribers(&mut uow, 43).await, vec![7]);
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_only_that_membership() {
        let pool = memory_pool().await;
        let directory = SubscriptionDirectory::new();
        let mut uow = UnitOfWork::begin(&pool).await.unwrap();

        directory.subscribe(&mut uow, 42, 7).await.unwrap();
        directory.subscribe(&mut uow, 43, 7).await.unwrap();

        assert!(directory.unsubscribe(&mut uow, 42, 7).await.unwrap());
        assert!(!directory.unsubscribe(&mut uow, 42, 7).await.unwrap());

        assert!(subscribers(&mut uow, 42).await.is_empty());
        assert_eq!(subscribers(&mut uow, 43).await, vec![7]);
    }

    #[tokio::test]
    async fn test_delete_all_for_connection() {
        let pool = memory_pool().await;
        let directory = SubscriptionDirectory::new();
        let mut uow = UnitOfWork::begin(&pool).await.unwrap();

        directory.subscribe(&mut uow, 42, 7).await.unwrap();
        directory.subscribe(&mut uow, 43, 7).await.unwrap();
        directory.subscribe(&mut uow, 42, 8).await.unwrap();

        assert_eq!(directory.delete_all_for_connection(&mut uow, 7).await.unwrap(), 2);
        assert_eq!(subscribers(&mut uow, 42).await, vec![8]);
        assert!(subscribers(&mut uow, 43).await.is_empty());
    }

    #[tokio::test]
    async fn test_directory_requires_open_transaction() {
        let directory = SubscriptionDirectory::new();
        let mut uow = UnitOfWork::closed();

        assert!(matches!(
            directory.subscribe(&mut uow, 42, 7).await,
            Err(StoreError::NoActiveTransaction)
        ));
        let found: Vec<_> = directory.find_subscribers(&mut uow, 42).collect().await;
        assert!(matches!(found.as_slice(), [Err(StoreError::NoActiveTransaction)]));
    }
}
