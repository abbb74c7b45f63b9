use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};

use crate::db::{StoreError, UnitOfWork};
use crate::events::proto;

// ============================================================================
// Connection records
// ============================================================================
//
// `host` is the owning node (`<address>:<grpc port>`), the only durable fact
// other nodes use to find a live session.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub id: i64,
    pub session_id: String,
    pub user_name: String,
    pub host: String,
}

impl ConnectionRecord {
    pub fn to_proto(&self) -> proto::Connection {
        proto::Connection {
            id: self.id,
            session_id: self.session_id.clone(),
            user_name: self.user_name.clone(),
            host: self.host.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionRepository;

impl ConnectionRepository {
    pub fn new() -> Self {
        Self
    }

    pub async fn insert(
        &self,
        uow: &mut UnitOfWork,
        session_id: &str,
        user_name: &str,
        host: &str,
    ) -> Result<ConnectionRecord, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO connection (session_id, user_name, host) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(session_id.to_string())
        .bind(user_name.to_string())
        .bind(host.to_string())
        .fetch_one(uow.connection()?)
        .await?;

        Ok(ConnectionRecord {
            id,
            session_id: session_id.to_string(),
            user_name: user_name.to_string(),
            host: host.to_string(),
        })
    }

    pub async fn delete(&self, uow: &mut UnitOfWork, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM connection WHERE id = $1")
            .bind(id)
            .execute(uow.connection()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Plain read, no transaction needed
    pub async fn find_by_id(&self, pool: &AnyPool, id: i64) -> Result<Option<ConnectionRecord>, StoreError> {
        let row = sqlx::query("SELECT id, session_id, user_name, host FROM connection WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(decode).transpose()
    }

    pub async fn find_by_host(&self, pool: &AnyPool, host: &str) -> Result<Vec<ConnectionRecord>, StoreError> {
        sqlx::query("SELECT id, session_id, user_name, host FROM connection WHERE host = $1 ORDER BY id")
            .bind(host.to_string())
            .fetch_all(pool)
            .await?
            .iter()
            .map(decode)
            .collect()
    }

    /// Nodes currently holding at least one session of `user_name`
    pub async fn find_hosts_for_user(&self, pool: &AnyPool, user_name: &str) -> Result<Vec<String>, StoreError> {
        let hosts = sqlx::query_scalar("SELECT DISTINCT host FROM connection WHERE user_name = $1 ORDER BY host")
            .bind(user_name.to_string())
            .fetch_all(pool)
            .await?;
        Ok(hosts)
    }
}

fn decode(row: &AnyRow) -> Result<ConnectionRecord, StoreError> {
    Ok(ConnectionRecord {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        user_name: row.try_get("user_name")?,
        host: row.try_get("host")?,
    })
}
