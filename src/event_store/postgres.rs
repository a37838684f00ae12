//! PostgreSQL Event Store
//!
//! sqlx adapter. One transaction per append; the version register row is
//! the serialization point, the `unique_index` primary key arbitrates
//! property collisions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    AggregateKey, AggregateVersion, AppendRequest, DeleteOutcome, EventStore, EventStoreError,
    OutboxStore, PendingEvent, PersistentEvent, UniqueProperty,
};

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL accepts at most this many bind parameters per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Columns bound per row by `insert_rows`
const EVENT_COLUMNS: usize = 10;

/// Rows per multi-row INSERT; larger appends are split inside the transaction
const ROWS_PER_INSERT: usize = MAX_BIND_PARAMS / EVENT_COLUMNS;

/// Row struct shared by the `events` and `pending_events` tables
#[derive(FromRow)]
struct EventRow {
    aggregate_type: String,
    aggregate_id: String,
    version: i64,
    event_type: String,
    payload: serde_json::Value,
    raised_at: DateTime<Utc>,
    message_id: Uuid,
    operation_id: Option<Uuid>,
    correlation_id: Option<Uuid>,
    contributor: Option<String>,
}

impl From<EventRow> for PersistentEvent {
    fn from(row: EventRow) -> Self {
        Self {
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            version: row.version,
            event_type: row.event_type,
            payload: row.payload,
            raised_at: row.raised_at,
            message_id: row.message_id,
            operation_id: row.operation_id,
            correlation_id: row.correlation_id,
            contributor: row.contributor,
        }
    }
}

/// Event store and outbox on PostgreSQL
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Create a new PgEventStore with a database pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Compare-and-set the version register from `expected` to `new_version`
    async fn advance_version(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &AppendRequest,
    ) -> Result<bool, EventStoreError> {
        let new_version = request.new_version();

        let result = if request.expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO aggregate_versions (aggregate_type, aggregate_id, version)
                VALUES ($1, $2, $3)
                ON CONFLICT (aggregate_type, aggregate_id) DO NOTHING
                "#,
            )
            .bind(&request.aggregate_type)
            .bind(&request.aggregate_id)
            .bind(new_version)
            .execute(&mut **tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE aggregate_versions
                SET version = $4, updated_at = NOW()
                WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $3
                "#,
            )
            .bind(&request.aggregate_type)
            .bind(&request.aggregate_id)
            .bind(request.expected_version)
            .bind(new_version)
            .execute(&mut **tx)
            .await?
        };

        Ok(result.rows_affected() == 1)
    }

    /// Insert the batch into `events` or `pending_events`
    async fn insert_rows(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        table: &str,
        rows: &[PersistentEvent],
    ) -> Result<(), sqlx::Error> {
        for chunk in rows.chunks(ROWS_PER_INSERT) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {table} (aggregate_type, aggregate_id, version, event_type, payload, \
                 raised_at, message_id, operation_id, correlation_id, contributor) "
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(&row.aggregate_type)
                    .push_bind(&row.aggregate_id)
                    .push_bind(row.version)
                    .push_bind(&row.event_type)
                    .push_bind(&row.payload)
                    .push_bind(row.raised_at)
                    .push_bind(row.message_id)
                    .push_bind(row.operation_id)
                    .push_bind(row.correlation_id)
                    .push_bind(&row.contributor);
            });

            builder.build().execute(&mut **tx).await?;
        }
        Ok(())
    }

    /// Claim a unique index entry, returning the owner if someone else holds it
    async fn claim_unique_property(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &AppendRequest,
        property: &UniqueProperty,
    ) -> Result<Option<String>, EventStoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO unique_index (aggregate_type, property_name, property_value, aggregate_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (aggregate_type, property_name, property_value) DO NOTHING
            "#,
        )
        .bind(&request.aggregate_type)
        .bind(&property.name)
        .bind(&property.value)
        .bind(&request.aggregate_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(None);
        }

        let owner: String = sqlx::query_scalar(
            r#"
            SELECT aggregate_id FROM unique_index
            WHERE aggregate_type = $1 AND property_name = $2 AND property_value = $3
            "#,
        )
        .bind(&request.aggregate_type)
        .bind(&property.name)
        .bind(&property.value)
        .fetch_one(&mut **tx)
        .await?;

        Ok((owner != request.aggregate_id).then_some(owner))
    }

    async fn try_append(&self, request: &AppendRequest) -> Result<i64, EventStoreError> {
        let conflict = || EventStoreError::ConcurrencyConflict {
            aggregate_type: request.aggregate_type.clone(),
            aggregate_id: request.aggregate_id.clone(),
            expected: request.expected_version,
        };

        // Rolled back on drop for every early return
        let mut tx = self.pool.begin().await?;

        if !self.advance_version(&mut tx, request).await? {
            return Err(conflict());
        }

        let rows = request.to_persistent_events();
        for table in ["events", "pending_events"] {
            self.insert_rows(&mut tx, table, &rows)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        conflict()
                    } else {
                        EventStoreError::from(e)
                    }
                })?;
        }

        for property in &request.unique_properties {
            if let Some(owner_id) = self.claim_unique_property(&mut tx, request, property).await? {
                return Err(EventStoreError::DuplicateUniqueProperty {
                    aggregate_type: request.aggregate_type.clone(),
                    property_name: property.name.clone(),
                    property_value: property.value.clone(),
                    owner_id,
                });
            }
        }

        tx.commit().await?;

        Ok(request.new_version())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, request: AppendRequest) -> Result<i64, EventStoreError> {
        request.validate()?;

        match self.try_append(&request).await {
            Ok(version) => {
                tracing::debug!(
                    aggregate_type = %request.aggregate_type,
                    aggregate_id = %request.aggregate_id,
                    version,
                    events = request.events.len(),
                    "Events appended"
                );
                Ok(version)
            }
            Err(e) => {
                if e.is_concurrency_conflict() {
                    tracing::warn!(
                        aggregate_type = %request.aggregate_type,
                        aggregate_id = %request.aggregate_id,
                        expected = request.expected_version,
                        "Version register compare-and-set failed"
                    );
                }
                Err(e)
            }
        }
    }

    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<PersistentEvent>, EventStoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT aggregate_type, aggregate_id, version, event_type, payload, raised_at,
                   message_id, operation_id, correlation_id, contributor
            FROM events
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND version > $3
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(from_version)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PersistentEvent::from).collect())
    }

    async fn find_id_by_unique_indexed_property(
        &self,
        aggregate_type: &str,
        property_name: &str,
        property_value: &str,
    ) -> Result<Option<String>, EventStoreError> {
        let owner: Option<String> = sqlx::query_scalar(
            r#"
            SELECT aggregate_id FROM unique_index
            WHERE aggregate_type = $1 AND property_name = $2 AND property_value = $3
            "#,
        )
        .bind(aggregate_type)
        .bind(property_name)
        .bind(property_value)
        .fetch_optional(&self.pool)
        .await?;

        Ok(owner)
    }

    async fn load_version(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<AggregateVersion>, EventStoreError> {
        let version: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT version FROM aggregate_versions
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version.map(|current_version| AggregateVersion {
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: aggregate_id.to_string(),
            current_version,
        }))
    }
}

#[async_trait]
impl OutboxStore for PgEventStore {
    async fn load_pending_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Vec<PendingEvent>, EventStoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT aggregate_type, aggregate_id, version, event_type, payload, raised_at,
                   message_id, operation_id, correlation_id, contributor
            FROM pending_events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PendingEvent::from).collect())
    }

    async fn delete_pending_event(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        version: i64,
    ) -> Result<DeleteOutcome, EventStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_events
            WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $3
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(version)
        .execute(&self.pool)
        .await?;

        Ok(match result.rows_affected() {
            0 => DeleteOutcome::AlreadyGone,
            _ => DeleteOutcome::Deleted,
        })
    }

    async fn find_aggregates_with_pending_events(
        &self,
        limit: usize,
    ) -> Result<Vec<AggregateKey>, EventStoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT aggregate_type, aggregate_id
            FROM pending_events
            ORDER BY aggregate_type, aggregate_id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(aggregate_type, aggregate_id)| AggregateKey {
                aggregate_type,
                aggregate_id,
            })
            .collect())
    }

    async fn count_pending_events(&self) -> Result<u64, EventStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.max(0) as u64)
    }
}
