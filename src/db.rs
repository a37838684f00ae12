//! Database module
//!
//! Database connection and schema utilities.

use sqlx::PgPool;

/// Schema for every table the event store uses
const SCHEMA: &str = include_str!("../migrations/0001_event_store.sql");

/// Tables that must exist before the store is usable
const REQUIRED_TABLES: [&str; 5] = [
    "aggregate_versions",
    "events",
    "pending_events",
    "unique_index",
    "event_snapshots",
];

/// Verify database connectivity
pub async fn verify_connection(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Create missing tables. Safe to run repeatedly.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    for statement in schema_statements() {
        sqlx::query(statement).execute(&mut *tx).await?;
    }

    tx.commit().await?;
    tracing::info!("Event store schema applied");
    Ok(())
}

/// Check if required tables exist
pub async fn check_schema(pool: &PgPool) -> Result<bool, sqlx::Error> {
    for table in REQUIRED_TABLES {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table)
        .fetch_one(pool)
        .await?;

        if !exists {
            tracing::error!("Required table '{}' does not exist", table);
            return Ok(false);
        }
    }

    Ok(true)
}

/// Split the schema file into executable statements, dropping comments
fn schema_statements() -> Vec<&'static str> {
    SCHEMA
        .split(';')
        .map(str::trim)
        .filter(|chunk| {
            chunk.lines().map(str::trim).any(|line| !line.is_empty() && !line.starts_with("--"))
        })
        .collect()
}
