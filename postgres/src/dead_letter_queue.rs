//! Durable dead-letter storage.
//!
//! One row per [`DeadLetterId`]. Writes are upserts, so a repeat failure of
//! the same event replaces its row instead of adding another.

use chrono::{DateTime, Utc};
use inventory_sync_core::dead_letter::{
    DeadLetterEntry, DeadLetterError, DeadLetterId, DeadLetterStatus, DeadLetterStore, FailureKind,
};
use inventory_sync_core::position::PositionKey;
use sqlx::{PgPool, Row};
use std::future::Future;
use std::pin::Pin;

const MIGRATION: &str = include_str!("../migrations/001_inventory_dead_letters.sql");

const COLUMNS: &str = "id, event_id, location_id, item_id, payload, failure_kind, error_message, \
     attempts, status, first_failed_at, last_failed_at, next_attempt_at, resolved_at, \
     resolution_notes";

fn storage_error(e: &sqlx::Error) -> DeadLetterError {
    metrics::counter!("inventory_dead_letter_store_errors_total").increment(1);
    DeadLetterError::Storage(e.to_string())
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `PostgreSQL`-backed [`DeadLetterStore`].
///
/// # Example
///
/// ```no_run
/// use inventory_sync_postgres::PostgresDeadLetterStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresDeadLetterStore::connect("postgres://localhost/inventory").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, DeadLetterError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| storage_error(&e))?;
        Ok(Self::from_pool(pool))
    }

    /// Create the table and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the DDL fails.
    pub async fn migrate(&self) -> Result<(), DeadLetterError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;
        tracing::info!("Dead-letter table migrated");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_entry(&self, entry: &DeadLetterEntry) -> Result<(), DeadLetterError> {
        let (location_id, item_id) = entry
            .key
            .as_ref()
            .map(|k| (Some(k.location_id.as_str()), Some(k.item_id.as_str())))
            .unwrap_or_default();

        sqlx::query(
            r"
            INSERT INTO inventory_dead_letters (
                id, event_id, location_id, item_id, payload, failure_kind, error_message,
                attempts, status, first_failed_at, last_failed_at, next_attempt_at,
                resolved_at, resolution_notes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE SET
                event_id = EXCLUDED.event_id,
                location_id = EXCLUDED.location_id,
                item_id = EXCLUDED.item_id,
                payload = EXCLUDED.payload,
                failure_kind = EXCLUDED.failure_kind,
                error_message = EXCLUDED.error_message,
                attempts = EXCLUDED.attempts,
                status = EXCLUDED.status,
                last_failed_at = EXCLUDED.last_failed_at,
                next_attempt_at = EXCLUDED.next_attempt_at,
                resolved_at = EXCLUDED.resolved_at,
                resolution_notes = EXCLUDED.resolution_notes
            ",
        )
        .bind(entry.id.as_str())
        .bind(entry.event_id.as_deref())
        .bind(location_id)
        .bind(item_id)
        .bind(&entry.payload)
        .bind(entry.failure.as_str())
        .bind(&entry.error_message)
        .bind(i32::try_from(entry.attempts).unwrap_or(i32::MAX))
        .bind(entry.status.as_str())
        .bind(entry.first_failed_at)
        .bind(entry.last_failed_at)
        .bind(entry.next_attempt_at)
        .bind(entry.resolved_at)
        .bind(entry.resolution_notes.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&e))?;

        tracing::debug!(id = %entry.id, status = entry.status.as_str(), "Dead-letter entry stored");
        Ok(())
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, DeadLetterError> {
        let id: String = row.get("id");
        let location_id: Option<String> = row.get("location_id");
        let item_id: Option<String> = row.get("item_id");
        let failure: String = row.get("failure_kind");
        let status: String = row.get("status");
        let attempts: i32 = row.get("attempts");

        Ok(DeadLetterEntry {
            id: DeadLetterId::new(id),
            event_id: row.get("event_id"),
            key: location_id
                .zip(item_id)
                .map(|(location, item)| PositionKey::new(location, item)),
            payload: row.get("payload"),
            failure: FailureKind::parse(&failure)?,
            error_message: row.get("error_message"),
            attempts: u32::try_from(attempts).unwrap_or(0),
            status: DeadLetterStatus::parse(&status)?,
            first_failed_at: row.get("first_failed_at"),
            last_failed_at: row.get("last_failed_at"),
            next_attempt_at: row.get("next_attempt_at"),
            resolved_at: row.get("resolved_at"),
            resolution_notes: row.get("resolution_notes"),
        })
    }
}

impl DeadLetterStore for PostgresDeadLetterStore {
    fn upsert(
        &self,
        entry: DeadLetterEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), DeadLetterError>> + Send + '_>> {
        Box::pin(async move { self.upsert_entry(&entry).await })
    }

    fn get<'a>(
        &'a self,
        id: &'a DeadLetterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<DeadLetterEntry>, DeadLetterError>> + Send + 'a>>
    {
        Box::pin(async move {
            let sql = format!("SELECT {COLUMNS} FROM inventory_dead_letters WHERE id = $1");
            let row = sqlx::query(&sql)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            row.as_ref().map(Self::row_to_entry).transpose()
        })
    }

    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM inventory_dead_letters \
                 WHERE status = 'pending' AND next_attempt_at <= $1 \
                 ORDER BY next_attempt_at ASC, first_failed_at ASC \
                 LIMIT $2"
            );
            let rows = sqlx::query(&sql)
                .bind(now)
                .bind(clamp_limit(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            rows.iter().map(Self::row_to_entry).collect()
        })
    }

    fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetterEntry>, DeadLetterError>> + Send + '_>>
    {
        Box::pin(async move {
            let sql = format!(
                "SELECT {COLUMNS} FROM inventory_dead_letters \
                 WHERE ($1::TEXT IS NULL OR status = $1) \
                 ORDER BY first_failed_at ASC, id ASC \
                 LIMIT $2"
            );
            let rows = sqlx::query(&sql)
                .bind(status.map(|s| s.as_str()))
                .bind(clamp_limit(limit))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            rows.iter().map(Self::row_to_entry).collect()
        })
    }

    fn count(
        &self,
        status: DeadLetterStatus,
    ) -> Pin<Box<dyn Future<Output = Result<usize, DeadLetterError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM inventory_dead_letters WHERE status = $1")
                    .bind(status.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| storage_error(&e))?;

            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_creates_the_table() {
        assert!(MIGRATION.contains("CREATE TABLE IF NOT EXISTS inventory_dead_letters"));
        for column in COLUMNS.split(", ") {
            assert!(MIGRATION.contains(column.trim()), "missing column {column}");
        }
    }

    #[test]
    fn limits_saturate() {
        assert_eq!(clamp_limit(10), 10);
        assert_eq!(clamp_limit(usize::MAX), i64::MAX);
    }
}
