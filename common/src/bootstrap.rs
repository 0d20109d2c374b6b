// Bootstrap utilities for binary initialization
// Builds the runner's collaborators from settings, picking the backend each
// section asks for.

use crate::clock::Clock;
use crate::config::{LockBackend, Settings, StorageBackend};
use crate::db::repositories::{InMemoryJobRepository, JobRepository, PgJobRepository};
use crate::db::{DbPool, RedisPool};
use crate::events::EventSink;
use crate::executor::JobExecutor;
use crate::licensing::{HttpLeaseIssuer, LicensingClient};
use crate::lock::{InMemoryLockProvider, LockProvider, RedisLockProvider};
use crate::scheduler::{SchedulerConfig, SchedulerRunner};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Initialize database pool
///
/// # Errors
/// Returns error if database pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_database_pool(settings: &Settings) -> Result<DbPool> {
    info!("Initializing database pool");

    let db_pool = DbPool::new(&settings.database)
        .await
        .context("Failed to initialize database pool")?;

    info!("Database pool initialized");
    Ok(db_pool)
}

/// Initialize Redis pool for the runner lock
///
/// # Errors
/// Returns error if Redis pool initialization fails
#[tracing::instrument(skip(settings))]
pub async fn init_redis_pool(settings: &Settings) -> Result<RedisPool> {
    info!("Initializing Redis pool");

    let redis_pool = RedisPool::new(&settings.redis)
        .await
        .context("Failed to initialize Redis pool")?;

    info!("Redis pool initialized");
    Ok(redis_pool)
}

/// Lock provider for the configured backend
pub async fn build_lock_provider(
    settings: &Settings,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn LockProvider>> {
    let provider: Arc<dyn LockProvider> = match settings.lock.backend {
        LockBackend::Memory => {
            info!("Using process-local runner lock");
            Arc::new(InMemoryLockProvider::new(clock))
        }
        LockBackend::Redis => {
            let pool = init_redis_pool(settings).await?;
            info!(redis_url = %settings.redis.url, "Using Redis runner lock");
            Arc::new(RedisLockProvider::new(pool, clock))
        }
    };
    Ok(provider)
}

/// Job repository for the configured backend
pub async fn build_job_repository(settings: &Settings) -> Result<Arc<dyn JobRepository>> {
    let repo: Arc<dyn JobRepository> = match settings.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory job repository");
            Arc::new(InMemoryJobRepository::new())
        }
        StorageBackend::Postgres => {
            let pool = init_database_pool(settings).await?;
            pool.health_check()
                .await
                .context("Database health check failed")?;
            Arc::new(PgJobRepository::new(pool))
        }
    };
    Ok(repo)
}

/// Licensing client talking to the configured lease issuer
pub fn build_licensing_client(
    settings: &Settings,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
) -> Result<Arc<LicensingClient>> {
    let licensing = &settings.licensing;
    let issuer = HttpLeaseIssuer::new(
        licensing.endpoint.as_str(),
        licensing.request_timeout_seconds,
        Duration::from_secs(licensing.lease_grace_period_seconds),
    )
    .context("Failed to create lease issuer client")?;

    info!(endpoint = %licensing.endpoint, install_id = %licensing.install_id, "Licensing client initialized");
    Ok(Arc::new(LicensingClient::new(
        licensing,
        Arc::new(issuer),
        clock,
        events,
    )))
}

/// Wire a runner from settings and already-built collaborators
pub async fn build_runner(
    settings: &Settings,
    clock: Arc<dyn Clock>,
    licensing: Arc<LicensingClient>,
    executor: Arc<dyn JobExecutor>,
    events: Arc<dyn EventSink>,
) -> Result<Arc<SchedulerRunner>> {
    let repo = build_job_repository(settings).await?;
    let lock = build_lock_provider(settings, clock).await?;

    Ok(Arc::new(SchedulerRunner::new(
        SchedulerConfig::from(&settings.runner),
        repo,
        lock,
        licensing,
        executor,
        events,
    )))
}
