// PostgreSQL job repository
// The `stream_jobs` table is owned by the external migration tooling.

use super::{validate_transition, JobRepository};
use crate::db::DbPool;
use crate::errors::RepositoryError;
use crate::models::{Job, JobStatus, JobUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

const JOB_COLUMNS: &str = r#"
    id, scheduled_at, status, attempt_count, max_attempts, next_retry_at,
    required_feature, payload, last_error, updated_at
"#;

/// Repository for stream job state in PostgreSQL
pub struct PgJobRepository {
    pool: DbPool,
}

impl PgJobRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &PgRow) -> Result<Job, RepositoryError> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<JobStatus>()
            .map_err(RepositoryError::Serialization)?;
        let attempt_count: i32 = row.try_get("attempt_count")?;
        let max_attempts: i32 = row.try_get("max_attempts")?;

        Ok(Job {
            id: row.try_get("id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            status,
            attempt_count: attempt_count.max(0) as u32,
            max_attempts: max_attempts.max(1) as u32,
            next_retry_at: row.try_get("next_retry_at")?,
            required_feature: row.try_get("required_feature")?,
            payload: row.try_get("payload")?,
            last_error: row.try_get("last_error")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl JobRepository for PgJobRepository {
    #[instrument(skip(self))]
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, RepositoryError> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM stream_jobs
            WHERE (status = 'pending' AND scheduled_at <= $1)
               OR (status = 'retrying' AND next_retry_at <= $1)
            ORDER BY
                CASE WHEN status = 'retrying' THEN next_retry_at ELSE scheduled_at END ASC,
                id ASC
            "#
        );

        let rows = sqlx::query(&query)
            .bind(now)
            .fetch_all(self.pool.pool())
            .await?;

        let jobs = rows
            .iter()
            .map(Self::row_to_job)
            .collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(count = jobs.len(), "Found due jobs");
        Ok(jobs)
    }

    #[instrument(skip(self, update), fields(attempt_count = update.attempt_count))]
    async fn compare_and_set_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new_status: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, RepositoryError> {
        let current = sqlx::query("SELECT status, max_attempts FROM stream_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(self.pool.pool())
            .await?
            .ok_or_else(|| RepositoryError::NotFound(job_id.to_string()))?;

        let current_status: String = current.try_get("status")?;
        let current_status = current_status
            .parse::<JobStatus>()
            .map_err(RepositoryError::Serialization)?;
        if current_status != expected {
            return Ok(false);
        }
        let max_attempts: i32 = current.try_get("max_attempts")?;
        validate_transition(job_id, current_status, max_attempts.max(1) as u32, update)?;

        // The status predicate makes the write itself the compare-and-set
        let result = sqlx::query(
            r#"
            UPDATE stream_jobs
            SET status = $3,
                attempt_count = $4,
                next_retry_at = $5,
                last_error = $6,
                updated_at = $7
            WHERE id = $1 AND status = $2 AND $4 <= max_attempts
            "#,
        )
        .bind(job_id)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(update.attempt_count as i32)
        .bind(update.next_retry_at)
        .bind(&update.last_error)
        .bind(update.updated_at)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn recover_stale_running(
        &self,
        stale_since: DateTime<Utc>,
    ) -> Result<Vec<Job>, RepositoryError> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM stream_jobs
            WHERE status = 'running' AND updated_at <= $1
            ORDER BY updated_at ASC, id ASC
            "#
        );

        let rows = sqlx::query(&query)
            .bind(stale_since)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn earliest_running_update(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        let row = sqlx::query("SELECT MIN(updated_at) AS earliest FROM stream_jobs WHERE status = 'running'")
            .fetch_one(self.pool.pool())
            .await?;
        Ok(row.try_get("earliest")?)
    }

    #[instrument(skip(self))]
    async fn find_by_id(&self, job_id: &str) -> Result<Option<Job>, RepositoryError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM stream_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(self.pool.pool())
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }
}
