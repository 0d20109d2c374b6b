// Scheduler runner: one dispatch cycle per tick under the runner lock

use crate::clock::TickSource;
use crate::config::RunnerConfig;
use crate::db::repositories::JobRepository;
use crate::errors::{ExecutionError, SchedulerError};
use crate::events::{EventKind, EventSink, TransitionEvent};
use crate::executor::JobExecutor;
use crate::licensing::Entitlements;
use crate::lock::{try_acquire_within, LockProvider};
use crate::models::{Job, JobStatus, JobUpdate, RunnerLockHandle};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the scheduler runner
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Owner identity written into the runner lock
    pub runner_id: String,
    pub lock_ttl: Duration,
    /// How often the lock is refreshed while a job executes; a third of the TTL by default
    pub heartbeat_interval: Duration,
    /// Upper bound on waiting for the lock before the cycle is skipped
    pub lock_acquire_timeout: Duration,
    pub job_execution_timeout: Duration,
    pub retry_backoff_base_seconds: u64,
    pub retry_backoff_cap_seconds: u64,
    pub max_jobs_per_cycle: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&RunnerConfig::default())
    }
}

impl From<&RunnerConfig> for SchedulerConfig {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            runner_id: config.runner_id.clone(),
            lock_ttl: Duration::from_secs(config.lock_ttl_seconds),
            heartbeat_interval: Duration::from_secs(config.lock_ttl_seconds / 3).max(Duration::from_secs(1)),
            lock_acquire_timeout: Duration::from_secs(config.lock_acquire_timeout_seconds),
            job_execution_timeout: Duration::from_secs(config.job_execution_timeout_seconds),
            retry_backoff_base_seconds: config.retry_backoff_base_seconds,
            retry_backoff_cap_seconds: config.retry_backoff_cap_seconds,
            max_jobs_per_cycle: config.max_jobs_per_cycle,
        }
    }
}

/// Outcome counts of one dispatch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Lock held elsewhere; nothing was read or written
    pub skipped: bool,
    /// Shutdown was requested before every due job was processed
    pub interrupted: bool,
    pub dispatched: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Compare-and-set writes lost to a concurrent writer
    pub conflicts: usize,
    pub recovered: usize,
}

impl CycleReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    fn outcome(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.interrupted {
            "interrupted"
        } else {
            "completed"
        }
    }
}

/// Main scheduler runner
pub struct SchedulerRunner {
    config: SchedulerConfig,
    repo: Arc<dyn JobRepository>,
    lock: Arc<dyn LockProvider>,
    entitlements: Arc<dyn Entitlements>,
    executor: Arc<dyn JobExecutor>,
    events: Arc<dyn EventSink>,
    backoff: ExponentialBackoff,
    /// Earliest instant at which a recovery pass is worth running.
    /// Starts at the minimum so the first locked cycle recovers.
    recovery_due: Mutex<Option<DateTime<Utc>>>,
    stopping: AtomicBool,
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

impl SchedulerRunner {
    pub fn new(
        config: SchedulerConfig,
        repo: Arc<dyn JobRepository>,
        lock: Arc<dyn LockProvider>,
        entitlements: Arc<dyn Entitlements>,
        executor: Arc<dyn JobExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel(1);
        let backoff = ExponentialBackoff::with_config(
            config.retry_backoff_base_seconds,
            config.retry_backoff_cap_seconds,
            0.0,
        );

        Self {
            config,
            repo,
            lock,
            entitlements,
            executor,
            events,
            backoff,
            recovery_due: Mutex::new(Some(DateTime::<Utc>::MIN_UTC)),
            stopping: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run one dispatch cycle as of `now`
    #[instrument(skip(self), fields(runner_id = %self.config.runner_id))]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleReport, SchedulerError> {
        if self.is_stopping() {
            return Ok(CycleReport {
                interrupted: true,
                ..Default::default()
            });
        }

        let Some(mut handle) = try_acquire_within(
            self.lock.as_ref(),
            &self.config.runner_id,
            self.config.lock_ttl,
            self.config.lock_acquire_timeout,
        )
        .await
        else {
            debug!("Runner lock held by another instance, skipping cycle");
            telemetry::record_cycle("skipped");
            return Ok(CycleReport::skipped());
        };

        let result = self.dispatch(now, &mut handle).await;
        self.release(handle).await;

        match &result {
            Ok(report) => {
                telemetry::record_cycle(report.outcome());
                if report.dispatched > 0 || report.deferred > 0 || report.recovered > 0 {
                    info!(
                        dispatched = report.dispatched,
                        succeeded = report.succeeded,
                        retried = report.retried,
                        failed = report.failed,
                        deferred = report.deferred,
                        conflicts = report.conflicts,
                        recovered = report.recovered,
                        "Dispatch cycle completed"
                    );
                } else {
                    debug!("No jobs due");
                }
            }
            Err(e) => {
                error!(error = %e, "Dispatch cycle aborted");
                telemetry::record_cycle("aborted");
                // A job may have been left running; look again once it can be stale
                self.arm_recovery(now);
                self.events.emit(
                    TransitionEvent::new(
                        now,
                        EventKind::CycleAborted,
                        self.config.runner_id.as_str(),
                        "dispatching",
                        "aborted",
                    )
                    .with_reason(e.to_string()),
                );
            }
        }
        result
    }

    /// Reclassify jobs left `Running` by a crashed or delayed holder.
    /// When the lock is busy the pass stays pending for the next locked cycle.
    #[instrument(skip(self), fields(runner_id = %self.config.runner_id))]
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let Some(handle) = try_acquire_within(
            self.lock.as_ref(),
            &self.config.runner_id,
            self.config.lock_ttl,
            self.config.lock_acquire_timeout,
        )
        .await
        else {
            info!("Runner lock busy, stale job recovery deferred");
            return Ok(0);
        };

        let result = self.recover_locked(now).await;
        self.release(handle).await;
        result
    }

    /// Drive cycles from `ticks` until `stop()` is called or the source ends
    pub async fn start<T: TickSource>(&self, mut ticks: T) {
        info!(runner_id = %self.config.runner_id, "Starting scheduler runner");
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !self.is_stopping() {
            tokio::select! {
                tick = ticks.next_tick() => {
                    let Some(now) = tick else {
                        info!("Tick source exhausted");
                        break;
                    };
                    // Errors are reported inside the cycle; the next tick retries
                    let _ = self.run_once(now).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping scheduler runner");
                    break;
                }
            }
        }

        info!("Scheduler runner stopped");
    }

    /// Request cooperative shutdown. An in-flight job still has its outcome
    /// persisted; remaining due jobs are left for the next runner.
    pub fn stop(&self) {
        info!("Stopping scheduler runner");
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        handle: &mut RunnerLockHandle,
    ) -> Result<CycleReport, SchedulerError> {
        let mut report = CycleReport::default();

        let recovery_due = *self.lock_recovery_due();
        if recovery_due.is_some_and(|at| at <= now) {
            report.recovered = self.recover_locked(now).await?;
        }

        let due = self.repo.list_due(now).await?;
        debug!(due = due.len(), "Fetched due jobs");

        for (index, job) in due.into_iter().take(self.config.max_jobs_per_cycle).enumerate() {
            if self.is_stopping() {
                info!("Shutdown requested, leaving remaining jobs for the next cycle");
                report.interrupted = true;
                break;
            }
            if index > 0 && !self.lock.heartbeat(handle, self.config.lock_ttl).await? {
                return Err(SchedulerError::LockLost(handle.owner_id.clone()));
            }
            self.dispatch_job(job, now, handle, &mut report).await?;
        }

        Ok(report)
    }

    #[instrument(skip(self, job, handle, report), fields(job_id = %job.id, status = %job.status))]
    async fn dispatch_job(
        &self,
        job: Job,
        now: DateTime<Utc>,
        handle: &mut RunnerLockHandle,
        report: &mut CycleReport,
    ) -> Result<(), SchedulerError> {
        if let Some(feature) = job.required_feature.as_deref() {
            if !self.entitlements.is_feature_enabled_at(feature, now) {
                report.deferred += 1;
                debug!(feature, "Feature not licensed, job deferred");
                self.emit(
                    now,
                    EventKind::JobDeferred,
                    &job.id,
                    job.status,
                    job.status,
                    format!("license: feature {} not enabled", feature),
                );
                return Ok(());
            }
        }

        let from = job.status;
        if !job.attempts_remaining() {
            // Budget already spent by an earlier holder; close it out
            let update = JobUpdate {
                attempt_count: job.max_attempts,
                next_retry_at: None,
                ..JobUpdate::from_job(&job, now)
            };
            if self.write(&job.id, from, JobStatus::Failed, &update, report).await? {
                report.failed += 1;
                self.emit(now, EventKind::JobFailed, &job.id, from, JobStatus::Failed, "attempts exhausted");
            }
            return Ok(());
        }

        let attempt = job.attempt_count + 1;
        let running = JobUpdate {
            attempt_count: attempt,
            next_retry_at: None,
            ..JobUpdate::from_job(&job, now)
        };
        if !self.write(&job.id, from, JobStatus::Running, &running, report).await? {
            return Ok(());
        }
        report.dispatched += 1;
        self.emit(
            now,
            EventKind::JobStarted,
            &job.id,
            from,
            JobStatus::Running,
            format!("attempt {}/{}", attempt, job.max_attempts),
        );

        let started = Instant::now();
        let (outcome, lock_held) = self.execute_holding_lock(&job, handle).await;

        let (status, update, kind, reason) = match outcome {
            Ok(()) => (
                JobStatus::Succeeded,
                JobUpdate {
                    last_error: None,
                    ..running.clone()
                },
                EventKind::JobSucceeded,
                format!("attempt {}/{}", attempt, job.max_attempts),
            ),
            Err(e) if e.is_retryable() && self.backoff.should_retry(attempt, job.max_attempts) => {
                let delay = self.backoff.next_delay(attempt);
                let next_retry_at = retry_at(now, delay);
                (
                    JobStatus::Retrying,
                    JobUpdate {
                        next_retry_at: Some(next_retry_at),
                        last_error: Some(e.to_string()),
                        ..running.clone()
                    },
                    EventKind::JobRetrying,
                    format!("{}; next attempt at {}", e, next_retry_at.to_rfc3339()),
                )
            }
            Err(e) => (
                JobStatus::Failed,
                JobUpdate {
                    attempt_count: job.max_attempts,
                    last_error: Some(e.to_string()),
                    ..running.clone()
                },
                EventKind::JobFailed,
                e.to_string(),
            ),
        };
        telemetry::record_job_duration(status.as_str(), started.elapsed().as_secs_f64());

        if self.write(&job.id, JobStatus::Running, status, &update, report).await? {
            match status {
                JobStatus::Succeeded => report.succeeded += 1,
                JobStatus::Retrying => report.retried += 1,
                _ => report.failed += 1,
            }
            self.emit(now, kind, &job.id, JobStatus::Running, status, reason);
        }

        if !lock_held {
            return Err(SchedulerError::LockLost(handle.owner_id.clone()));
        }
        Ok(())
    }

    /// Run the executor under the execution timeout, refreshing the runner
    /// lock every `heartbeat_interval`. Returns the outcome and whether the
    /// lock was still ours at the last refresh.
    async fn execute_holding_lock(
        &self,
        job: &Job,
        handle: &mut RunnerLockHandle,
    ) -> (Result<(), ExecutionError>, bool) {
        let execution = tokio::time::timeout(
            self.config.job_execution_timeout,
            self.executor.execute(&job.id, &job.payload),
        );
        tokio::pin!(execution);

        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lock_held = true;

        let outcome = loop {
            tokio::select! {
                result = &mut execution => {
                    break result.unwrap_or_else(|_| {
                        Err(ExecutionError::Timeout(self.config.job_execution_timeout.as_secs()))
                    });
                }
                _ = heartbeat.tick(), if lock_held => {
                    match self.lock.heartbeat(handle, self.config.lock_ttl).await {
                        Ok(true) => debug!("Runner lock refreshed during execution"),
                        Ok(false) => {
                            error!(owner_id = %handle.owner_id, "Runner lock lost while a job was executing");
                            lock_held = false;
                        }
                        // The next tick tries again before the TTL runs out
                        Err(e) => warn!(error = %e, "Runner lock heartbeat failed"),
                    }
                }
            }
        };
        (outcome, lock_held)
    }

    async fn recover_locked(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let stale_after = TimeDelta::from_std(self.config.job_execution_timeout + self.config.lock_ttl)
            .unwrap_or(TimeDelta::MAX);
        let stale_since = now.checked_sub_signed(stale_after).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let stale = self.repo.recover_stale_running(stale_since).await?;

        let mut recovered = 0;
        for job in stale {
            let (status, update) = if job.attempts_remaining() {
                let delay = self.backoff.next_delay(job.attempt_count);
                (
                    JobStatus::Retrying,
                    JobUpdate {
                        next_retry_at: Some(retry_at(now, delay)),
                        last_error: Some("interrupted while running".to_string()),
                        ..JobUpdate::from_job(&job, now)
                    },
                )
            } else {
                (
                    JobStatus::Failed,
                    JobUpdate {
                        attempt_count: job.max_attempts,
                        next_retry_at: None,
                        last_error: Some("interrupted while running, attempts exhausted".to_string()),
                        ..JobUpdate::from_job(&job, now)
                    },
                )
            };

            if self
                .repo
                .compare_and_set_status(&job.id, JobStatus::Running, status, &update)
                .await?
            {
                recovered += 1;
                warn!(job_id = %job.id, status = %status, attempt_count = job.attempt_count, "Recovered stale running job");
                self.emit(
                    now,
                    EventKind::JobRecovered,
                    &job.id,
                    JobStatus::Running,
                    status,
                    format!("running since {}", job.updated_at.to_rfc3339()),
                );
            }
        }

        // Jobs still running schedule the next pass for when they turn stale
        let next = self.repo.earliest_running_update().await?;
        *self.lock_recovery_due() = next.map(|at| {
            at.checked_add_signed(stale_after)
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
                .max(now)
        });
        Ok(recovered)
    }

    /// Compare-and-set write; a lost race is counted and reported, not an error
    async fn write(
        &self,
        job_id: &str,
        expected: JobStatus,
        status: JobStatus,
        update: &JobUpdate,
        report: &mut CycleReport,
    ) -> Result<bool, SchedulerError> {
        let written = self
            .repo
            .compare_and_set_status(job_id, expected, status, update)
            .await?;
        if !written {
            report.conflicts += 1;
            warn!(
                job_id,
                expected = %expected,
                target = %status,
                "Job changed concurrently, transition dropped"
            );
        }
        Ok(written)
    }

    async fn release(&self, handle: RunnerLockHandle) {
        if let Err(e) = self.lock.release(handle).await {
            // The TTL reclaims it
            warn!(error = %e, "Failed to release runner lock");
        }
    }

    fn arm_recovery(&self, now: DateTime<Utc>) {
        let mut due = self.lock_recovery_due();
        *due = Some(due.map_or(now, |at| at.min(now)));
    }

    fn emit(
        &self,
        now: DateTime<Utc>,
        kind: EventKind,
        job_id: &str,
        from: JobStatus,
        to: JobStatus,
        reason: impl Into<String>,
    ) {
        self.events
            .emit(TransitionEvent::new(now, kind, job_id, from, to).with_reason(reason));
    }

    fn lock_recovery_due(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.recovery_due.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// `now + delay`, saturating at the latest representable instant
fn retry_at(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
