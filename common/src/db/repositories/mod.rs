// Job repository adapters
// The runner reads due jobs and writes every transition through compare-and-set
// on status, so a delayed holder racing lock recovery cannot lose an update.

pub mod job;
pub mod memory;

pub use job::PgJobRepository;
pub use memory::InMemoryJobRepository;

use crate::errors::RepositoryError;
use crate::models::{Job, JobStatus, JobUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable job state, owned by the external persistence layer
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Pending jobs with `scheduled_at <= now` and retrying jobs with
    /// `next_retry_at <= now`, ascending by due time then job id.
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, RepositoryError>;

    /// Atomically move `job_id` from `expected` to `new_status`, writing `update`.
    /// Returns `false` when the stored status no longer matches `expected`.
    async fn compare_and_set_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new_status: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, RepositoryError>;

    /// Jobs left `Running` whose last write is at or before `stale_since`
    async fn recover_stale_running(
        &self,
        stale_since: DateTime<Utc>,
    ) -> Result<Vec<Job>, RepositoryError>;

    /// Oldest `updated_at` among jobs still `Running`, if any
    async fn earliest_running_update(&self) -> Result<Option<DateTime<Utc>>, RepositoryError>;

    async fn find_by_id(&self, job_id: &str) -> Result<Option<Job>, RepositoryError>;
}

/// Checks shared by every adapter before a compare-and-set write
pub(crate) fn validate_transition(
    job_id: &str,
    current: JobStatus,
    max_attempts: u32,
    update: &JobUpdate,
) -> Result<(), RepositoryError> {
    if current.is_terminal() {
        return Err(RepositoryError::InvariantViolation {
            job_id: job_id.to_string(),
            reason: format!("job is terminal ({})", current),
        });
    }
    if update.attempt_count > max_attempts {
        return Err(RepositoryError::InvariantViolation {
            job_id: job_id.to_string(),
            reason: format!(
                "attempt_count {} exceeds max_attempts {}",
                update.attempt_count, max_attempts
            ),
        });
    }
    Ok(())
}

/// Deterministic dispatch order: due time, then job id
pub fn sort_due(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| a.due_at().cmp(&b.due_at()).then_with(|| a.id.cmp(&b.id)));
}
