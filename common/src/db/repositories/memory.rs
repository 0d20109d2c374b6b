// In-memory job repository for single-instance deployments and tests

use super::{sort_due, validate_transition, JobRepository};
use crate::errors::RepositoryError;
use crate::models::{Job, JobStatus, JobUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryJobRepository {
    jobs: Mutex<BTreeMap<String, Job>>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a job as the API layer would. Replaces any job with the same id.
    pub async fn insert(&self, job: Job) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    /// Cancel a non-terminal job. Returns `false` if it is missing or terminal.
    pub async fn cancel(&self, job_id: &str, now: DateTime<Utc>) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.get_mut(job_id) {
            Some(job) if !job.status.is_terminal() => {
                let update = JobUpdate {
                    next_retry_at: None,
                    ..JobUpdate::from_job(job, now)
                };
                job.apply(JobStatus::Cancelled, &update);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn all(&self) -> Vec<Job> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Number of successful compare-and-set writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make subsequent reads fail, simulating a storage outage
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent writes fail, simulating a storage outage
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), RepositoryError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RepositoryError::ConnectionFailed("storage unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<Job>, RepositoryError> {
        self.check_reads()?;
        let jobs = self.jobs.lock().await;
        let mut due: Vec<Job> = jobs.values().filter(|j| j.is_due(now)).cloned().collect();
        sort_due(&mut due);
        Ok(due)
    }

    async fn compare_and_set_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        new_status: JobStatus,
        update: &JobUpdate,
    ) -> Result<bool, RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::ConnectionFailed("storage unavailable".to_string()));
        }

        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| RepositoryError::NotFound(job_id.to_string()))?;

        if job.status != expected {
            return Ok(false);
        }
        validate_transition(job_id, job.status, job.max_attempts, update)?;

        job.apply(new_status, update);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn recover_stale_running(
        &self,
        stale_since: DateTime<Utc>,
    ) -> Result<Vec<Job>, RepositoryError> {
        self.check_reads()?;
        let jobs = self.jobs.lock().await;
        let mut stale: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == JobStatus::Running && j.updated_at <= stale_since)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(stale)
    }

    async fn earliest_running_update(&self) -> Result<Option<DateTime<Utc>>, RepositoryError> {
        self.check_reads()?;
        let jobs = self.jobs.lock().await;
        Ok(jobs
            .values()
            .filter(|j| j.status == JobStatus::Running)
            .map(|j| j.updated_at)
            .min())
    }

    async fn find_by_id(&self, job_id: &str) -> Result<Option<Job>, RepositoryError> {
        self.check_reads()?;
        Ok(self.get(job_id).await)
    }
}
