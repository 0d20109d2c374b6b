// Licensing client: holds the current lease, renews it ahead of expiry and
// degrades through grace to fail-closed when the issuer stays unreachable.

use super::issuer::LeaseIssuer;
use super::store::LeaseStore;
use super::Entitlements;
use crate::clock::Clock;
use crate::config::LicensingConfig;
use crate::errors::LeaseError;
use crate::events::{EventKind, EventSink, TransitionEvent};
use crate::models::{Lease, LeaseStatus, LicenseCredentials, LicenseTier};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::telemetry;
use chrono::{DateTime, TimeDelta, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const LEASE_ENTITY: &str = "license";
const RENEWAL_JITTER: f64 = 0.2;

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

pub struct LicensingClient {
    issuer: Arc<dyn LeaseIssuer>,
    store: LeaseStore,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    credentials: Mutex<Option<LicenseCredentials>>,
    /// Last status reported through events and the gauge
    observed: Mutex<LeaseStatus>,
    consecutive_failures: AtomicU32,
    renewal_margin: TimeDelta,
    request_timeout: Duration,
    renewal_backoff: ExponentialBackoff,
    grace_retry: Duration,
    stopping: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl LicensingClient {
    pub fn new(
        config: &LicensingConfig,
        issuer: Arc<dyn LeaseIssuer>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);
        let credentials = (!config.install_id.is_empty()).then(|| config.credentials());

        Self {
            issuer,
            store: LeaseStore::new(),
            clock,
            events,
            credentials: Mutex::new(credentials),
            observed: Mutex::new(LeaseStatus::Unacquired),
            consecutive_failures: AtomicU32::new(0),
            renewal_margin: TimeDelta::seconds(config.lease_renewal_margin_seconds as i64),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            renewal_backoff: ExponentialBackoff::with_config(
                config.renewal_retry_base_seconds,
                config.renewal_retry_cap_seconds,
                RENEWAL_JITTER,
            ),
            grace_retry: Duration::from_secs(config.grace_retry_seconds.max(1)),
            stopping: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Obtain a fresh lease. The credentials are kept for later re-acquisition
    /// by the renewal loop. This is the only way out of `Expired`.
    #[instrument(skip(self, credentials), fields(install_id = %credentials.install_id))]
    pub async fn acquire(&self, credentials: LicenseCredentials) -> Result<Arc<Lease>, LeaseError> {
        *self.lock_credentials() = Some(credentials.clone());
        let _guard = self
            .store
            .begin_renewal()
            .ok_or(LeaseError::RenewalInProgress)?;
        self.acquire_with(&credentials).await
    }

    /// Renew the current lease. A renewal answered after the lease expired
    /// is discarded and reported as `Exhausted`.
    #[instrument(skip(self))]
    pub async fn renew(&self) -> Result<Arc<Lease>, LeaseError> {
        let _guard = self
            .store
            .begin_renewal()
            .ok_or(LeaseError::RenewalInProgress)?;
        self.renew_current().await
    }

    pub fn is_feature_enabled(&self, feature: &str) -> bool {
        self.is_feature_enabled_at(feature, self.clock.now())
    }

    pub fn current_status(&self) -> LeaseStatus {
        self.status_at(self.clock.now())
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> LeaseStatus {
        self.store.status_at(now)
    }

    pub fn tier(&self) -> Option<LicenseTier> {
        self.store.load().map(|lease| lease.tier)
    }

    pub fn lease(&self) -> Option<Arc<Lease>> {
        self.store.load()
    }

    /// One pass of the renewal loop: report status changes, renew or
    /// re-acquire when due, and return how long to sleep before the next pass.
    pub async fn renewal_step(&self, now: DateTime<Utc>) -> Duration {
        let status = self.observe(now);

        match (status, self.store.load()) {
            (LeaseStatus::Valid, Some(lease)) => {
                let wait = until(lease.expires_at - self.renewal_margin, now);
                if !wait.is_zero() {
                    return wait;
                }
                match self.renew().await {
                    Ok(renewed) => self.next_renewal_delay(&renewed, now),
                    // Keep retrying while the lease is still usable, but wake
                    // up at expiry to report grace.
                    Err(_) => self.failure_delay().min(until(lease.expires_at, now)),
                }
            }
            (LeaseStatus::Grace, Some(lease)) => match self.renew().await {
                Ok(renewed) => self.next_renewal_delay(&renewed, now),
                Err(_) => self
                    .grace_retry
                    .min(until(lease.grace_until, now) + Duration::from_secs(1)),
            },
            _ => {
                let credentials = self.lock_credentials().clone();
                let Some(credentials) = credentials else {
                    debug!("No license credentials configured, lease not requested");
                    return self.renewal_backoff.max_delay();
                };
                let result = match self.store.begin_renewal() {
                    Some(_guard) => self.acquire_with(&credentials).await,
                    None => Err(LeaseError::RenewalInProgress),
                };
                match result {
                    Ok(lease) => self.next_renewal_delay(&lease, now),
                    Err(_) => self.failure_delay(),
                }
            }
        }
    }

    /// Spawn the background renewal loop
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Lease renewal loop started");
            while !client.stopping.load(Ordering::Acquire) {
                let delay = client.renewal_step(client.clock.now()).await;
                debug!(delay_ms = delay.as_millis() as u64, "Next lease check scheduled");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("Lease renewal loop stopped");
        })
    }

    pub fn stop(&self) {
        info!("Stopping lease renewal loop");
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    async fn acquire_with(&self, credentials: &LicenseCredentials) -> Result<Arc<Lease>, LeaseError> {
        match self.bounded(self.issuer.request_lease(credentials)).await {
            Ok(lease) => {
                let now = self.clock.now();
                let from = self.observe(now);
                self.store.publish(lease);
                self.published(EventKind::LeaseAcquired, from, now)
            }
            Err(e) => {
                self.record_failure(self.clock.now(), &e);
                Err(e)
            }
        }
    }

    async fn renew_current(&self) -> Result<Arc<Lease>, LeaseError> {
        let current = self.store.load().ok_or(LeaseError::NotAcquired)?;
        if current.status_at(self.clock.now()) == LeaseStatus::Expired {
            return Err(LeaseError::Exhausted(current.expires_at.to_rfc3339()));
        }

        let renewed = match self.bounded(self.issuer.renew_lease(&current.token)).await {
            Ok(lease) => lease,
            Err(e) => {
                self.record_failure(self.clock.now(), &e);
                return Err(e);
            }
        };

        let now = self.clock.now();
        let from = self.observe(now);
        if !self.store.publish_renewal(&current.token, renewed, now) {
            let err = LeaseError::Exhausted(current.expires_at.to_rfc3339());
            self.record_failure(now, &err);
            return Err(err);
        }
        self.published(EventKind::LeaseRenewed, from, now)
    }

    async fn bounded<F>(&self, call: F) -> Result<Lease, LeaseError>
    where
        F: Future<Output = Result<Lease, LeaseError>>,
    {
        match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LeaseError::Timeout(self.request_timeout.as_secs())),
        }
    }

    fn published(
        &self,
        kind: EventKind,
        from: LeaseStatus,
        now: DateTime<Utc>,
    ) -> Result<Arc<Lease>, LeaseError> {
        let lease = self.store.load().ok_or(LeaseError::NotAcquired)?;
        let to = lease.status_at(now);
        *self.lock_observed() = to;
        self.consecutive_failures.store(0, Ordering::Release);
        telemetry::set_lease_status(to);

        info!(
            tier = %lease.tier,
            expires_at = %lease.expires_at,
            grace_until = %lease.grace_until,
            features = lease.features.len(),
            "{}", kind
        );
        self.events.emit(
            TransitionEvent::new(now, kind, LEASE_ENTITY, from, to).with_reason(format!(
                "tier={} expires_at={}",
                lease.tier,
                lease.expires_at.to_rfc3339()
            )),
        );
        Ok(lease)
    }

    fn record_failure(&self, now: DateTime<Utc>, err: &LeaseError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let status = self.store.status_at(now);
        warn!(
            error = %err,
            status = %status,
            consecutive_failures = failures,
            "Lease request failed"
        );
        self.events.emit(
            TransitionEvent::new(now, EventKind::LeaseRenewalFailed, LEASE_ENTITY, status, status)
                .with_reason(err.to_string()),
        );
    }

    /// Report grace and expiry the first time they are observed
    fn observe(&self, now: DateTime<Utc>) -> LeaseStatus {
        let status = self.store.status_at(now);
        let previous = std::mem::replace(&mut *self.lock_observed(), status);
        if previous == status {
            return status;
        }

        telemetry::set_lease_status(status);
        let kind = match status {
            LeaseStatus::Grace => EventKind::LeaseGrace,
            LeaseStatus::Expired => EventKind::LeaseExpired,
            _ => return status,
        };
        let reason = match status {
            LeaseStatus::Grace => "lease past expiry, entitlements honored until grace ends",
            _ => "grace period exhausted, all features disabled",
        };
        self.events
            .emit(TransitionEvent::new(now, kind, LEASE_ENTITY, previous, status).with_reason(reason));
        status
    }

    fn next_renewal_delay(&self, lease: &Lease, now: DateTime<Utc>) -> Duration {
        let floor = Duration::from_secs(self.renewal_backoff.base_delay(0));
        until(lease.expires_at - self.renewal_margin, now).max(floor)
    }

    fn failure_delay(&self) -> Duration {
        let failures = self.consecutive_failures.load(Ordering::Acquire);
        self.renewal_backoff.next_delay(failures.saturating_sub(1))
    }

    fn lock_credentials(&self) -> MutexGuard<'_, Option<LicenseCredentials>> {
        self.credentials.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_observed(&self) -> MutexGuard<'_, LeaseStatus> {
        self.observed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Entitlements for LicensingClient {
    /// Honored while Valid or in Grace; fails closed otherwise
    fn is_feature_enabled_at(&self, feature: &str, now: DateTime<Utc>) -> bool {
        match self.store.load() {
            Some(lease) => match lease.status_at(now) {
                LeaseStatus::Valid | LeaseStatus::Grace => lease.has_feature(feature),
                LeaseStatus::Expired | LeaseStatus::Unacquired => false,
            },
            None => false,
        }
    }
}
