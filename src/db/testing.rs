//! In-memory SQLite pool with the notification schema, for unit tests.

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

const SQLITE_SCHEMA: &[&str] = &[
    "CREATE TABLE event_outbox (
        position INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        aggregatetype TEXT NOT NULL,
        aggregateid TEXT NOT NULL,
        type TEXT NOT NULL,
        payload_type_name TEXT NOT NULL,
        payload BLOB NOT NULL
    )",
    "CREATE TABLE file_descriptor (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        file_name TEXT NOT NULL,
        content_type TEXT NOT NULL,
        state TEXT NOT NULL,
        version INTEGER NOT NULL
    )",
    "CREATE TABLE file_attribute (
        file_id INTEGER NOT NULL REFERENCES file_descriptor (id),
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (file_id, name)
    )",
    "CREATE TABLE connection (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        user_name TEXT NOT NULL,
        host TEXT NOT NULL
    )",
    "CREATE TABLE canvas_subscription (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        canvas_id INTEGER NOT NULL,
        connection_id INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX canvas_subscription_membership
        ON canvas_subscription (canvas_id, connection_id)",
];

/// One connection only: every in-memory SQLite connection is its own database.
pub async fn memory_pool() -> AnyPool {
    sqlx::any::install_default_drivers();

    let pool = AnyPoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite pool");

    for statement in SQLITE_SCHEMA {
        sqlx::query(statement)
            .execute(&pool)
            .await
            .expect("apply test schema");
    }

    pool
}
