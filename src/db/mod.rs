// ============================================================================
// Database access
// ============================================================================
//
// Postgres in production, SQLite in tests, both through the sqlx `Any`
// driver. Queries stick to `$N` placeholders and BIGINT/TEXT/BLOB columns so
// the same statements run unchanged on both backends.
//
// ============================================================================

mod unit_of_work;

#[cfg(test)]
pub mod testing;

pub use unit_of_work::{StoreError, UnitOfWork};

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;

pub async fn connect(database_url: &str, max_connections: u32) -> Result<AnyPool, sqlx::Error> {
    sqlx::any::install_default_drivers();

    let pool = AnyPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    tracing::info!(max_connections = max_connections, "Database pool ready");
    Ok(pool)
}

/// `($1, $2), ($3, $4), ...` for a multi-row VALUES clause
pub(crate) fn values_placeholders(rows: usize, columns: usize) -> String {
    (0..rows)
        .map(|row| {
            let cols: Vec<String> = (1..=columns)
                .map(|col| format!("${}", row * columns + col))
                .collect();
            format!("({})", cols.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}
