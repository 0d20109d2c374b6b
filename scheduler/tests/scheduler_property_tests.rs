// Property-based tests for the scheduler runner

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use common::clock::ManualClock;
use common::db::repositories::InMemoryJobRepository;
use common::errors::ExecutionError;
use common::events::{EventKind, MemoryEventSink};
use common::executor::JobExecutor;
use common::licensing::Entitlements;
use common::lock::InMemoryLockProvider;
use common::models::{Job, JobStatus, FEATURE_AUDIO_REPLACE};
use common::scheduler::{SchedulerConfig, SchedulerRunner};
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Executor replaying a fixed list of outcomes, succeeding once it runs out
struct ScriptedExecutor {
    outcomes: Mutex<VecDeque<Result<(), ExecutionError>>>,
    calls: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(outcomes: Vec<Result<(), ExecutionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, _job_id: &str, _payload: &serde_json::Value) -> Result<(), ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

struct NoEntitlements;

impl Entitlements for NoEntitlements {
    fn is_feature_enabled_at(&self, _feature: &str, _now: DateTime<Utc>) -> bool {
        false
    }
}

fn outcome_strategy() -> impl Strategy<Value = Result<(), ExecutionError>> {
    prop_oneof![
        3 => Just(Err(ExecutionError::Transient("ingest refused".into()))),
        1 => Just(Err(ExecutionError::Permanent("stream key revoked".into()))),
        1 => Just(Err(ExecutionError::Timeout(300))),
        2 => Just(Ok(())),
    ]
}

fn runner(
    repo: Arc<InMemoryJobRepository>,
    clock: Arc<ManualClock>,
    executor: Arc<dyn JobExecutor>,
    events: Arc<MemoryEventSink>,
) -> SchedulerRunner {
    SchedulerRunner::new(
        SchedulerConfig {
            runner_id: "runner-a".to_string(),
            lock_ttl: Duration::from_secs(180),
            heartbeat_interval: Duration::from_secs(60),
            lock_acquire_timeout: Duration::from_secs(1),
            job_execution_timeout: Duration::from_secs(300),
            retry_backoff_base_seconds: 30,
            retry_backoff_cap_seconds: 1800,
            max_jobs_per_cycle: 100,
        },
        repo,
        Arc::new(InMemoryLockProvider::new(clock)),
        Arc::new(NoEntitlements),
        executor,
        events,
    )
}

/// **Property: Attempt budget is never exceeded**
///
/// *For any* sequence of execution outcomes and attempt budget, a job's
/// `attempt_count` never exceeds `max_attempts`, a failed job has spent its
/// whole budget, and a retrying job is always scheduled in the future.
#[test]
fn property_attempt_count_within_budget() {
    proptest!(|(
        outcomes in prop::collection::vec(outcome_strategy(), 0..8),
        max_attempts in 1u32..6u32
    )| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(t0()));
            let repo = Arc::new(InMemoryJobRepository::new());
            let executor = Arc::new(ScriptedExecutor::new(outcomes));
            let events = Arc::new(MemoryEventSink::new());
            let runner = runner(repo.clone(), clock.clone(), executor.clone(), events.clone());
            repo.insert(Job::new_pending("job-1", t0(), max_attempts, serde_json::json!({})))
                .await;

            let mut now = t0();
            let mut previous_retry_at = None;
            for _ in 0..(max_attempts + 2) {
                clock.set(now);
                runner.run_once(now).await.unwrap();
                let job = repo.get("job-1").await.unwrap();

                prop_assert!(job.attempt_count <= job.max_attempts);
                prop_assert!(executor.calls.load(Ordering::SeqCst) as u32 <= job.attempt_count);
                match job.status {
                    JobStatus::Failed => prop_assert_eq!(job.attempt_count, job.max_attempts),
                    JobStatus::Retrying => {
                        let retry_at = job.next_retry_at.unwrap();
                        prop_assert!(retry_at > now);
                        prop_assert!(retry_at - now <= TimeDelta::seconds(1800));
                        if let Some(previous) = previous_retry_at {
                            prop_assert!(retry_at > previous);
                        }
                        previous_retry_at = Some(retry_at);
                        now = retry_at;
                    }
                    JobStatus::Succeeded => {}
                    other => prop_assert!(false, "unexpected status {}", other),
                }
                if job.status.is_terminal() {
                    break;
                }
            }

            let job = repo.get("job-1").await.unwrap();
            prop_assert!(job.status.is_terminal());
            Ok::<(), TestCaseError>(())
        })?;
    });
}

/// **Property: Unlicensed jobs never run**
///
/// *For any* number of cycles, a job gated on a feature that is never granted
/// stays pending with no attempt consumed and no execution.
#[test]
fn property_ungranted_feature_never_runs() {
    proptest!(|(cycles in 1usize..10usize, spacing_minutes in 1i64..120i64)| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(t0()));
            let repo = Arc::new(InMemoryJobRepository::new());
            let executor = Arc::new(ScriptedExecutor::new(Vec::new()));
            let events = Arc::new(MemoryEventSink::new());
            let runner = runner(repo.clone(), clock.clone(), executor.clone(), events.clone());
            repo.insert(
                Job::new_pending("job-1", t0(), 3, serde_json::json!({}))
                    .with_required_feature(FEATURE_AUDIO_REPLACE),
            )
            .await;

            for cycle in 0..cycles {
                let now = t0() + TimeDelta::minutes(spacing_minutes * cycle as i64);
                clock.set(now);
                runner.run_once(now).await.unwrap();
            }

            let job = repo.get("job-1").await.unwrap();
            prop_assert_eq!(job.status, JobStatus::Pending);
            prop_assert_eq!(job.attempt_count, 0);
            prop_assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
            prop_assert_eq!(repo.write_count(), 0);
            prop_assert_eq!(events.events_of(EventKind::JobDeferred).len(), cycles);
            prop_assert!(events.events_of(EventKind::JobStarted).is_empty());
            Ok::<(), TestCaseError>(())
        })?;
    });
}

#[test]
fn test_scheduler_config_defaults() {
    let config = SchedulerConfig::default();
    assert_eq!(config.lock_ttl, Duration::from_secs(180));
    assert_eq!(config.job_execution_timeout, Duration::from_secs(300));
    assert_eq!(config.retry_backoff_base_seconds, 30);
    assert_eq!(config.retry_backoff_cap_seconds, 1800);
    assert_eq!(config.max_jobs_per_cycle, 100);
}
