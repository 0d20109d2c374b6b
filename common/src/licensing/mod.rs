// Licensing: time-bounded leases granting feature entitlements

pub mod client;
pub mod issuer;
pub mod store;

pub use client::LicensingClient;
pub use issuer::{HttpLeaseIssuer, LeaseIssuer, LeaseResponse};
pub use store::LeaseStore;

use chrono::{DateTime, Utc};

/// Read-only entitlement view consulted by the runner during dispatch.
/// Implementations must answer from memory without blocking on the network.
#[cfg_attr(test, mockall::automock)]
pub trait Entitlements: Send + Sync {
    fn is_feature_enabled_at(&self, feature: &str, now: DateTime<Utc>) -> bool;
}
