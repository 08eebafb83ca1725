//! Postgres-backed publish job repository.
//!
//! The table is created by `migrations/0001_create_publish_jobs.sql` (also
//! applied by [`PostgresPublishJobRepository::ensure_schema`]).
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `DuplicateKey` | Another job owns `(content_id, publish_at_utc)` |
//! | Database (check violation) | `23514` | `Storage` | Row would break a status/column invariant |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! Rows that decode but fail [`PublishJob::from_parts`] surface as
//! `RepositoryError::Corrupt`.
//!
//! ## Claiming
//!
//! `claim_job` is one conditional `UPDATE ... RETURNING`. Postgres row locking
//! serializes concurrent updates of the same row and the second updater
//! re-evaluates the `WHERE` clause against the committed row, so exactly one
//! caller gets the row back.
//!
//! `delete` and `update_if_queued` carry `status = 'queued'` in their `WHERE`
//! clause, so neither can touch a row a worker has already claimed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use pubsched_core::{ContentId, DomainError, JobId, WorkerId};
use pubsched_scheduler::{
    JobStats, JobStatus, PublishJob, PublishJobParts, PublishJobRepository, RepositoryError,
};

const SCHEMA: &str = include_str!("../../migrations/0001_create_publish_jobs.sql");

const COLUMNS: &str = "id, content_id, publish_at_utc, status, attempts, last_attempt_at, \
     next_retry_at, completed_at, actual_publish_at, error_message, claimed_by, created_at, updated_at";

/// Postgres publish job repository.
#[derive(Debug, Clone)]
pub struct PostgresPublishJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresPublishJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_one_optional(
        &self,
        operation: &str,
        sql: &str,
        id: JobId,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        let row = sqlx::query_as::<_, PublishJobRow>(sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(PublishJob::try_from).transpose()
    }
}

#[async_trait::async_trait]
impl PublishJobRepository for PostgresPublishJobRepository {
    #[instrument(skip(self), fields(content_id = %content_id), err)]
    async fn get_by_idempotency_key(
        &self,
        content_id: &ContentId,
        publish_at_utc: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM publish_jobs WHERE content_id = $1 AND publish_at_utc = $2"
        );
        let row = sqlx::query_as::<_, PublishJobRow>(&sql)
            .bind(content_id.as_str())
            .bind(publish_at_utc)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_by_idempotency_key", e))?;
        row.map(PublishJob::try_from).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<PublishJob>, RepositoryError> {
        let sql = format!("SELECT {COLUMNS} FROM publish_jobs WHERE id = $1");
        self.fetch_one_optional("get", &sql, id).await
    }

    #[instrument(skip(self, job), fields(job_id = %job.id(), status = %job.status()), err)]
    async fn save(&self, job: PublishJob) -> Result<PublishJob, RepositoryError> {
        let parts = job.to_parts();
        let sql = format!(
            r#"
            INSERT INTO publish_jobs ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO UPDATE SET
                content_id = EXCLUDED.content_id,
                publish_at_utc = EXCLUDED.publish_at_utc,
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                last_attempt_at = EXCLUDED.last_attempt_at,
                next_retry_at = EXCLUDED.next_retry_at,
                completed_at = EXCLUDED.completed_at,
                actual_publish_at = EXCLUDED.actual_publish_at,
                error_message = EXCLUDED.error_message,
                claimed_by = EXCLUDED.claimed_by,
                updated_at = EXCLUDED.updated_at
            WHERE publish_jobs.status NOT IN ('succeeded', 'failed')
            RETURNING {COLUMNS}
            "#
        );

        let attempts = i32::try_from(parts.attempts)
            .map_err(|_| RepositoryError::storage(format!("attempts out of range: {}", parts.attempts)))?;

        let result = sqlx::query_as::<_, PublishJobRow>(&sql)
            .bind(parts.id.as_uuid())
            .bind(parts.content_id.as_str())
            .bind(parts.publish_at_utc)
            .bind(parts.status.as_str())
            .bind(attempts)
            .bind(parts.last_attempt_at)
            .bind(parts.next_retry_at)
            .bind(parts.completed_at)
            .bind(parts.actual_publish_at)
            .bind(parts.error_message.as_deref())
            .bind(parts.claimed_by.as_ref().map(WorkerId::as_str))
            .bind(parts.created_at)
            .bind(parts.updated_at)
            .fetch_optional(&*self.pool)
            .await;

        match result {
            Ok(Some(row)) => PublishJob::try_from(row),
            // The conflict branch's WHERE filtered the update out.
            Ok(None) => Err(RepositoryError::Terminal(parts.id)),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::DuplicateKey {
                content_id: parts.content_id,
                publish_at_utc: parts.publish_at_utc,
            }),
            Err(e) => Err(map_sqlx_error("save", e)),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id()), err)]
    async fn update_if_queued(&self, job: PublishJob) -> Result<Option<PublishJob>, RepositoryError> {
        let parts = job.to_parts();
        let sql = format!(
            r#"
            UPDATE publish_jobs
            SET content_id = $2,
                publish_at_utc = $3,
                status = $4,
                attempts = $5,
                last_attempt_at = $6,
                next_retry_at = $7,
                completed_at = $8,
                actual_publish_at = $9,
                error_message = $10,
                claimed_by = $11,
                updated_at = $12
            WHERE id = $1 AND status = 'queued'
            RETURNING {COLUMNS}
            "#
        );

        let attempts = i32::try_from(parts.attempts)
            .map_err(|_| RepositoryError::storage(format!("attempts out of range: {}", parts.attempts)))?;

        let result = sqlx::query_as::<_, PublishJobRow>(&sql)
            .bind(parts.id.as_uuid())
            .bind(parts.content_id.as_str())
            .bind(parts.publish_at_utc)
            .bind(parts.status.as_str())
            .bind(attempts)
            .bind(parts.last_attempt_at)
            .bind(parts.next_retry_at)
            .bind(parts.completed_at)
            .bind(parts.actual_publish_at)
            .bind(parts.error_message.as_deref())
            .bind(parts.claimed_by.as_ref().map(WorkerId::as_str))
            .bind(parts.updated_at)
            .fetch_optional(&*self.pool)
            .await;

        match result {
            Ok(row) => row.map(PublishJob::try_from).transpose(),
            Err(e) if is_unique_violation(&e) => Err(RepositoryError::DuplicateKey {
                content_id: parts.content_id,
                publish_at_utc: parts.publish_at_utc,
            }),
            Err(e) => Err(map_sqlx_error("update_if_queued", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM publish_jobs WHERE id = $1 AND status = 'queued'")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn list_due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PublishJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM publish_jobs
            WHERE publish_at_utc <= $1
              AND (status = 'queued' OR (status = 'retry_wait' AND next_retry_at <= $1))
            ORDER BY publish_at_utc ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, PublishJobRow>(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_due_jobs", e))?;
        rows.into_iter().map(PublishJob::try_from).collect()
    }

    // TODO: reclaim `running` rows whose worker died (lease expiry on updated_at).
    #[instrument(skip(self), fields(job_id = %id, worker_id = %worker_id), err)]
    async fn claim_job(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<PublishJob>, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE publish_jobs
            SET status = 'running',
                claimed_by = $2,
                next_retry_at = NULL,
                updated_at = $3
            WHERE id = $1
              AND publish_at_utc <= $3
              AND (status = 'queued' OR (status = 'retry_wait' AND next_retry_at <= $3))
            RETURNING {COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, PublishJobRow>(&sql)
            .bind(id.as_uuid())
            .bind(worker_id.as_str())
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_job", e))?;
        row.map(PublishJob::try_from).transpose()
    }

    #[instrument(skip(self, statuses), err)]
    async fn list_in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        statuses: Option<&[JobStatus]>,
    ) -> Result<Vec<PublishJob>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS}
            FROM publish_jobs
            WHERE publish_at_utc >= $1
              AND publish_at_utc < $2
              AND ($3::text[] IS NULL OR status = ANY($3))
            ORDER BY publish_at_utc ASC, id ASC
            "#
        );
        let statuses: Option<Vec<String>> =
            statuses.map(|s| s.iter().map(|st| st.as_str().to_string()).collect());

        let rows = sqlx::query_as::<_, PublishJobRow>(&sql)
            .bind(start)
            .bind(end)
            .bind(statuses)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_in_range", e))?;
        rows.into_iter().map(PublishJob::try_from).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, RepositoryError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM publish_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| map_sqlx_error("stats", e))?;
            stats.record(status.parse()?, usize::try_from(count).unwrap_or(0));
        }
        Ok(stats)
    }
}

/// Raw `publish_jobs` row.
#[derive(Debug)]
struct PublishJobRow {
    id: Uuid,
    content_id: String,
    publish_at_utc: DateTime<Utc>,
    status: String,
    attempts: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    next_retry_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    actual_publish_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    claimed_by: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for PublishJobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(PublishJobRow {
            id: row.try_get("id")?,
            content_id: row.try_get("content_id")?,
            publish_at_utc: row.try_get("publish_at_utc")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            next_retry_at: row.try_get("next_retry_at")?,
            completed_at: row.try_get("completed_at")?,
            actual_publish_at: row.try_get("actual_publish_at")?,
            error_message: row.try_get("error_message")?,
            claimed_by: row.try_get("claimed_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<PublishJobRow> for PublishJob {
    type Error = RepositoryError;

    fn try_from(row: PublishJobRow) -> Result<Self, Self::Error> {
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| DomainError::corrupt(format!("job {} has negative attempts", row.id)))?;

        let parts = PublishJobParts {
            id: JobId::from_uuid(row.id),
            content_id: ContentId::new(row.content_id)?,
            publish_at_utc: row.publish_at_utc,
            status: row.status.parse()?,
            attempts,
            last_attempt_at: row.last_attempt_at,
            next_retry_at: row.next_retry_at,
            completed_at: row.completed_at,
            actual_publish_at: row.actual_publish_at,
            error_message: row.error_message,
            claimed_by: row.claimed_by.map(WorkerId::new).transpose()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        };
        Ok(PublishJob::from_parts(parts)?)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

/// Map SQLx errors to `RepositoryError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            RepositoryError::storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            RepositoryError::storage(format!("connection pool closed during {}", operation))
        }
        other => RepositoryError::storage(format!("database error in {}: {}", operation, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn row(status: &str, claimed_by: Option<&str>) -> PublishJobRow {
        let at = Utc.with_ymd_and_hms(2024, 11, 3, 1, 30, 0).unwrap();
        PublishJobRow {
            id: Uuid::now_v7(),
            content_id: "post-42".to_string(),
            publish_at_utc: at,
            status: status.to_string(),
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            completed_at: None,
            actual_publish_at: None,
            error_message: None,
            claimed_by: claimed_by.map(str::to_string),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn queued_row_converts() {
        let job = PublishJob::try_from(row("queued", None)).unwrap();
        assert_eq!(job.status(), JobStatus::Queued);
        assert_eq!(job.content_id().as_str(), "post-42");
    }

    #[test]
    fn running_row_carries_owner() {
        let job = PublishJob::try_from(row("running", Some("worker-1"))).unwrap();
        assert_eq!(job.claimed_by().map(WorkerId::as_str), Some("worker-1"));
    }

    #[test]
    fn corrupt_rows_are_rejected() {
        assert!(matches!(
            PublishJob::try_from(row("queued", Some("worker-1"))),
            Err(RepositoryError::Corrupt(_))
        ));
        assert!(matches!(
            PublishJob::try_from(row("paused", None)),
            Err(RepositoryError::Corrupt(_))
        ));

        let mut negative = row("queued", None);
        negative.attempts = -1;
        assert!(matches!(
            PublishJob::try_from(negative),
            Err(RepositoryError::Corrupt(_))
        ));
    }

    #[test]
    fn schema_declares_invariants() {
        assert!(SCHEMA.contains("UNIQUE (content_id, publish_at_utc)"));
        assert!(SCHEMA.contains("(status = 'running') = (claimed_by IS NOT NULL)"));
    }
}
