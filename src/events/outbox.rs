use sqlx::{AnyPool, Row};
use uuid::Uuid;

use super::codec::DomainEvent;
use crate::db::{values_placeholders, StoreError, UnitOfWork};

// ============================================================================
// Outbox Writer
// ============================================================================
//
// Appends domain events to `event_outbox` inside the caller's transaction so
// they commit or roll back with the business change that produced them. The
// CDC connector (or the built-in relay) publishes them afterwards; nothing
// here waits on the broker.
//
// ============================================================================

const OUTBOX_COLUMNS: usize = 6;

/// Rows per INSERT, keeps bind parameters under the SQLite and Postgres limits
const ROWS_PER_STATEMENT: usize = 1000;

/// A row of `event_outbox` as the relay sees it
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    pub position: i64,
    pub id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload_type_name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxWriter;

impl OutboxWriter {
    pub fn new() -> Self {
        Self
    }

    /// Insert one outbox row per event, in order. Large batches are split into
    /// several statements on the same transaction.
    pub async fn publish(&self, uow: &mut UnitOfWork, events: &[DomainEvent]) -> Result<(), StoreError> {
        uow.connection()?;

        if events.is_empty() {
            return Ok(());
        }

        for chunk in events.chunks(ROWS_PER_STATEMENT) {
            let sql = format!(
                "INSERT INTO event_outbox (id, aggregatetype, aggregateid, type, payload_type_name, payload) VALUES {}",
                values_placeholders(chunk.len(), OUTBOX_COLUMNS)
            );

            let mut query = sqlx::query(&sql);
            for event in chunk {
                let subject = event
                    .header()
                    .and_then(|h| h.subject.as_ref())
                    .ok_or(StoreError::MissingSubject { type_name: event.type_name() })?;
                let (payload, payload_type_name) = event.encode();

                query = query
                    .bind(Uuid::now_v7().to_string())
                    .bind(subject.r#type.clone())
                    .bind(subject.id.clone())
                    .bind(event.event_name())
                    .bind(payload_type_name)
                    .bind(payload);
            }

            query.execute(uow.connection()?).await?;
        }

        tracing::debug!(
            event_count = events.len(),
            first_type = events[0].event_name(),
            "Appended events to outbox"
        );
        Ok(())
    }
}

/// Oldest rows first, in write order
pub async fn fetch_pending(pool: &AnyPool, limit: i64) -> Result<Vec<OutboxRecord>, StoreError> {
    let rows = sqlx::query(
        "SELECT position, id, aggregatetype, aggregateid, type, payload_type_name, payload
         FROM event_outbox
         ORDER BY position
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<OutboxRecord, StoreError> {
            Ok(OutboxRecord {
                position: row.try_get("position")?,
                id: row.try_get("id")?,
                aggregate_type: row.try_get("aggregatetype")?,
                aggregate_id: row.try_get("aggregateid")?,
                event_type: row.try_get("type")?,
                payload_type_name: row.try_get("payload_type_name")?,
                payload: row.try_get("payload")?,
            })
        })
        .collect()
}

pub async fn remove(pool: &AnyPool, position: i64) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM event_outbox WHERE position = $1")
        .bind(position)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use crate::events::codec::{EventRegistry, CONNECTION_CHANGED};
    use crate::events::proto::{ClientMessageReceivedEvent, Connection, ConnectionChangedEvent};

    fn connection(id: i64) -> Connection {
        Connection {
            id,
            session_id: format!("session-{}", id),
            user_name: "admin".to_string(),
            host: "node-a:9400".to_string(),
        }
    }

    async fn outbox_count(pool: &AnyPool) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM event_outbox")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_without_transaction_fails_fast() {
        let writer = OutboxWriter::new();
        let mut uow = UnitOfWork::closed();

        let events: Vec<DomainEvent> = vec![ConnectionChangedEvent::created(connection(1)).into()];
        assert!(matches!(
            writer.publish(&mut uow, &events).await,
            Err(StoreError::NoActiveTransaction)
        ));
        assert!(matches!(
            writer.publish(&mut uow, &[]).await,
            Err(StoreError::NoActiveTransaction)
        ));
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let pool = memory_pool().await;
        let mut uow = UnitOfWork::begin(&pool).await.unwrap();

        OutboxWriter::new().publish(&mut uow, &[]).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(outbox_count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_committed_batch_writes_one_row_per_event_in_order() {
        let pool = memory_pool().await;
        let events: Vec<DomainEvent> = vec![
            ConnectionChangedEvent::created(connection(7)).into(),
            ClientMessageReceivedEvent::text(connection(7), "hello").into(),
            ConnectionChangedEvent::deleted(connection(7)).into(),
        ];

        let mut uow = UnitOfWork::begin(&pool).await.unwrap();
        OutboxWriter::new().publish(&mut uow, &events).await.unwrap();
        uow.commit().await.unwrap();

        let rows = fetch_pending(&pool, 10).await.unwrap();
        assert_eq!(rows.len(), 3);

        let registry = EventRegistry::with_domain_events();
        for (row, event) in rows.iter().zip(&events) {
            assert_eq!(row.aggregate_id, "7");
            assert_eq!(row.event_type, event.event_name());
            let decoded = registry
                .decode(&row.payload, Some(&row.payload_type_name))
                .unwrap();
            assert_eq!(&decoded, event);
        }
        assert_eq!(rows[0].aggregate_type, "connection");
        assert_eq!(rows[0].payload_type_name, CONNECTION_CHANGED);
        assert_eq!(rows[1].aggregate_type, "client-message");
        assert!(rows.windows(2).all(|w| w[0].position < w[1].position));
    }

    #[tokio::test]
    async fn test_batch_larger_than_one_statement_keeps_order() {
        let pool = memory_pool().await;
        let count = ROWS_PER_STATEMENT + 5;
        let events: Vec<DomainEvent> = (0..count as i64)
            .map(|id| ConnectionChangedEvent::created(connection(id)).into())
            .collect();

        let mut uow = UnitOfWork::begin(&pool).await.unwrap();
        OutboxWriter::new().publish(&mut uow, &events).await.unwrap();
        uow.commit().await.unwrap();

        let rows = fetch_pending(&pool, count as i64 + 1).await.unwrap();
        assert_eq!(rows.len(), count);
        let ids: Vec<String> = rows.iter().map(|row| row.aggregate_id.clone()).collect();
        let expected: Vec<String> = (0..count).map(|id| id.to_string()).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_rolled_back_batch_leaves_nothing() {
        let pool = memory_pool().await;
        let events: Vec<DomainEvent> = vec![
            ConnectionChangedEvent::created(connection(1)).into(),
            ConnectionChangedEvent::created(connection(2)).into(),
        ];

        let mut uow = UnitOfWork::begin(&pool).await.unwrap();
        OutboxWriter::new().publish(&mut uow, &events).await.unwrap();
        uow.rollback().await.unwrap();

        assert_eq!(outbox_count(&pool).await, 0);
    }

    #[tokio::test]
    async fn test_event_without_subject_is_rejected() {
        let pool = memory_pool().await;
        let mut event = ConnectionChangedEvent::created(connection(1));
        event.header = None;

        let mut uow = UnitOfWork::begin(&pool).await.unwrap();
        let result = OutboxWriter::new().publish(&mut uow, &[event.into()]).await;
        assert!(matches!(result, Err(StoreError::MissingSubject { .. })));
    }

    #[tokio::test]
    async fn test_remove_deletes_single_position() {
        let pool = memory_pool().await;
        let events: Vec<DomainEvent> = vec![
            ConnectionChangedEvent::created(connection(1)).into(),
            ConnectionChangedEvent::created(connection(2)).into(),
        ];
        let mut uow = UnitOfWork::begin(&pool).await.unwrap();
        OutboxWriter::new().publish(&mut uow, &events).await.unwrap();
        uow.commit().await.unwrap();

        let rows = fetch_pending(&pool, 10).await.unwrap();
        remove(&pool, rows[0].position).await.unwrap();

        let remaining = fetch_pending(&pool, 10).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].aggregate_id, "2");
    }
}
