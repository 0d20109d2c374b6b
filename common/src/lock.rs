// Runner lock: mutual exclusion of the dispatch cycle across runner instances
// A crashed holder is recovered once its TTL lapses; heartbeat and release
// are ownership-checked so a delayed holder cannot touch a lock it lost.

use crate::clock::Clock;
use crate::db::RedisPool;
use crate::errors::LockError;
use crate::models::RunnerLockHandle;
use async_trait::async_trait;
use chrono::TimeDelta;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Name of the single lock guarding the dispatch cycle
pub const RUNNER_LOCK_RESOURCE: &str = "scheduler";

/// Lock provider capability
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try once to take the runner lock. `Ok(None)` means another live
    /// owner holds it, which is a normal outcome.
    async fn try_acquire(
        &self,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<RunnerLockHandle>, LockError>;

    /// Extend the TTL of a held lock. `Ok(false)` means ownership was lost.
    async fn heartbeat(&self, handle: &mut RunnerLockHandle, ttl: Duration)
        -> Result<bool, LockError>;

    /// Release a held lock. Releasing a lock that has already lapsed is a no-op.
    async fn release(&self, handle: RunnerLockHandle) -> Result<(), LockError>;
}

/// Acquire with a bounded wait. Timeouts and backend errors both yield
/// `None` so the caller simply skips the cycle.
pub async fn try_acquire_within(
    provider: &dyn LockProvider,
    owner_id: &str,
    ttl: Duration,
    timeout: Duration,
) -> Option<RunnerLockHandle> {
    match tokio::time::timeout(timeout, provider.try_acquire(owner_id, ttl)).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            warn!(owner_id, error = %e, "Runner lock backend error, skipping cycle");
            None
        }
        Err(_) => {
            warn!(
                owner_id,
                timeout_ms = timeout.as_millis() as u64,
                "Runner lock acquisition timed out, skipping cycle"
            );
            None
        }
    }
}

fn ttl_delta(ttl: Duration) -> TimeDelta {
    TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX)
}

#[derive(Debug, Clone)]
struct HeldLock {
    owner_id: String,
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Process-local lock provider for single-instance deployments and tests.
/// Share one instance (via `Arc`) between runners to simulate a cluster.
pub struct InMemoryLockProvider {
    resource: String,
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, HeldLock>>,
}

impl InMemoryLockProvider {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            resource: RUNNER_LOCK_RESOURCE.to_string(),
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Current owner, if the lock is held and fresh
    pub fn current_owner(&self) -> Option<String> {
        let now = self.clock.now();
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.get(&self.resource)
            .filter(|lock| lock.expires_at > now)
            .map(|lock| lock.owner_id.clone())
    }
}

#[async_trait]
impl LockProvider for InMemoryLockProvider {
    async fn try_acquire(
        &self,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<RunnerLockHandle>, LockError> {
        let now = self.clock.now();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = held.get(&self.resource) {
            if existing.expires_at > now && existing.owner_id != owner_id {
                debug!(
                    owner_id,
                    holder = %existing.owner_id,
                    "Runner lock busy"
                );
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        let expires_at = now + ttl_delta(ttl);
        held.insert(
            self.resource.clone(),
            HeldLock {
                owner_id: owner_id.to_string(),
                token: token.clone(),
                expires_at,
            },
        );

        Ok(Some(RunnerLockHandle {
            resource: self.resource.clone(),
            owner_id: owner_id.to_string(),
            token,
            acquired_at: now,
            expires_at,
        }))
    }

    async fn heartbeat(
        &self,
        handle: &mut RunnerLockHandle,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let now = self.clock.now();
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());

        match held.get_mut(&handle.resource) {
            Some(lock) if lock.token == handle.token && lock.expires_at > now => {
                lock.expires_at = now + ttl_delta(ttl);
                handle.expires_at = lock.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, handle: RunnerLockHandle) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if held
            .get(&handle.resource)
            .is_some_and(|lock| lock.token == handle.token)
        {
            held.remove(&handle.resource);
        }
        Ok(())
    }
}

/// Redis-backed lock provider using compare-token Lua scripts
pub struct RedisLockProvider {
    pool: RedisPool,
    resource: String,
    clock: Arc<dyn Clock>,
}

// A live owner may refresh its own lock; anyone else needs the key to be absent
const ACQUIRE_SCRIPT: &str = r#"
    local current = redis.call("get", KEYS[1])
    if (not current) or string.sub(current, 1, string.len(ARGV[3])) == ARGV[3] then
        redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2])
        return 1
    else
        return 0
    end
"#;

const HEARTBEAT_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("pexpire", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

impl RedisLockProvider {
    pub fn new(pool: RedisPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            resource: RUNNER_LOCK_RESOURCE.to_string(),
            clock,
        }
    }

    fn key(&self) -> String {
        format!("lock:{}", self.resource)
    }

    /// Token values are prefixed with the owner id so the owner can refresh its lock
    fn token_for(owner_id: &str) -> String {
        format!("{}:{}", owner_id, Uuid::new_v4())
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    #[instrument(skip(self), fields(resource = %self.resource, ttl_ms = ttl.as_millis() as u64))]
    async fn try_acquire(
        &self,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<Option<RunnerLockHandle>, LockError> {
        let mut conn = self.pool.get_connection();
        let key = self.key();
        let token = Self::token_for(owner_id);

        let acquired: i32 = redis::Script::new(ACQUIRE_SCRIPT)
            .key(&key)
            .arg(&token)
            .arg(ttl.as_millis() as u64)
            .arg(format!("{}:", owner_id))
            .invoke_async(&mut conn)
            .await?;

        if acquired != 1 {
            debug!(owner_id, "Runner lock busy");
            return Ok(None);
        }

        let now = self.clock.now();
        info!(owner_id, "Runner lock acquired");
        Ok(Some(RunnerLockHandle {
            resource: self.resource.clone(),
            owner_id: owner_id.to_string(),
            token,
            acquired_at: now,
            expires_at: now + ttl_delta(ttl),
        }))
    }

    #[instrument(skip(self, handle), fields(resource = %handle.resource, owner_id = %handle.owner_id))]
    async fn heartbeat(
        &self,
        handle: &mut RunnerLockHandle,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let mut conn = self.pool.get_connection();
        let extended: i32 = redis::Script::new(HEARTBEAT_SCRIPT)
            .key(self.key())
            .arg(&handle.token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            handle.expires_at = self.clock.now() + ttl_delta(ttl);
            Ok(true)
        } else {
            warn!("Runner lock heartbeat rejected, ownership lost");
            Ok(false)
        }
    }

    #[instrument(skip(self, handle), fields(resource = %handle.resource, owner_id = %handle.owner_id))]
    async fn release(&self, handle: RunnerLockHandle) -> Result<(), LockError> {
        let mut conn = self.pool.get_connection();
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key())
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;

        if released == 1 {
            debug!("Runner lock released");
        } else {
            warn!("Runner lock was not owned or already expired");
        }
        Ok(())
    }
}
