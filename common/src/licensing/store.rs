// Lease store: the only state shared between the renewal task and dispatch.
// Readers clone an `Arc<Lease>` under a briefly held lock; writers publish a
// complete replacement, so a reader sees the old lease or the new one.

use crate::models::{Lease, LeaseStatus};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct LeaseStore {
    current: RwLock<Option<Arc<Lease>>>,
    renewing: AtomicBool,
}

impl LeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current lease
    pub fn load(&self) -> Option<Arc<Lease>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Atomically replace the current lease
    pub fn publish(&self, lease: Lease) -> Option<Arc<Lease>> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        guard.replace(Arc::new(lease))
    }

    /// Replace the lease only if the one being renewed is still current and
    /// has not expired at `now`. Returns `false` when the renewal is discarded.
    pub fn publish_renewal(&self, renewed_from: &str, lease: Lease, now: DateTime<Utc>) -> bool {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(current)
                if current.token == renewed_from
                    && current.status_at(now) != LeaseStatus::Expired =>
            {
                *guard = Some(Arc::new(lease));
                true
            }
            _ => false,
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> LeaseStatus {
        self.load()
            .map(|lease| lease.status_at(now))
            .unwrap_or(LeaseStatus::Unacquired)
    }

    /// Claim the single renewal slot. `None` if a renewal is already in flight.
    pub fn begin_renewal(&self) -> Option<RenewalGuard<'_>> {
        self.renewing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RenewalGuard { store: self })
    }

    pub fn is_renewing(&self) -> bool {
        self.renewing.load(Ordering::Acquire)
    }
}

/// Clears the `renewing` flag when dropped
#[derive(Debug)]
pub struct RenewalGuard<'a> {
    store: &'a LeaseStore,
}

impl Drop for RenewalGuard<'_> {
    fn drop(&mut self) {
        self.store.renewing.store(false, Ordering::Release);
    }
}
