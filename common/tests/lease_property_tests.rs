// Property-based tests for lease status transitions

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use common::clock::{Clock, ManualClock};
use common::config::LicensingConfig;
use common::errors::LeaseError;
use common::events::MemoryEventSink;
use common::licensing::{Entitlements, LeaseIssuer, LicensingClient};
use common::models::{Lease, LeaseStatus, LicenseCredentials, LicenseTier, FEATURE_HOT_SWAP};
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Issues a one-hour premium lease whenever `available` is set
struct ToggleIssuer {
    clock: Arc<ManualClock>,
    available: AtomicBool,
}

impl ToggleIssuer {
    fn issue(&self) -> Result<Lease, LeaseError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(LeaseError::Request("issuer unreachable".into()));
        }
        let now = self.clock.now();
        Ok(Lease::new(
            format!("tok-{}", now.timestamp()),
            now,
            now + TimeDelta::seconds(3600),
            now + TimeDelta::seconds(3900),
            LicenseTier::Premium,
            Vec::new(),
        ))
    }
}

#[async_trait]
impl LeaseIssuer for ToggleIssuer {
    async fn request_lease(&self, _credentials: &LicenseCredentials) -> Result<Lease, LeaseError> {
        self.issue()
    }

    async fn renew_lease(&self, _token: &str) -> Result<Lease, LeaseError> {
        self.issue()
    }
}

/// **Property: Lease status is monotonic in time**
///
/// *For any* lease and two observation instants, the later observation never
/// reports an earlier status in `Valid -> Grace -> Expired`.
#[test]
fn property_lease_status_monotonic_in_time() {
    proptest!(|(
        ttl in 1i64..10_000i64,
        grace in 0i64..10_000i64,
        a in -100i64..30_000i64,
        b in -100i64..30_000i64
    )| {
        let lease = Lease::new(
            "tok",
            t0(),
            t0() + TimeDelta::seconds(ttl),
            t0() + TimeDelta::seconds(ttl + grace),
            LicenseTier::Basic,
            Vec::new(),
        );
        let (early, late) = (a.min(b), a.max(b));
        let early_status = lease.status_at(t0() + TimeDelta::seconds(early));
        let late_status = lease.status_at(t0() + TimeDelta::seconds(late));

        prop_assert!(lease.grace_until >= lease.expires_at);
        prop_assert!(early_status <= late_status);
        prop_assert_ne!(early_status, LeaseStatus::Unacquired);
    });
}

/// **Property: Only renewal leads back from grace**
///
/// *For any* sequence of clock advances and renewal attempts, every backward
/// status edge is `Grace -> Valid` produced by a successful renewal, and once
/// expired no renewal restores entitlements.
#[test]
fn property_only_renewal_leaves_grace() {
    proptest!(|(steps in prop::collection::vec((0i64..2_000i64, any::<bool>()), 1..20))| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(t0()));
            let issuer = Arc::new(ToggleIssuer {
                clock: clock.clone(),
                available: AtomicBool::new(true),
            });
            let client = LicensingClient::new(
                &LicensingConfig::default(),
                issuer.clone(),
                clock.clone(),
                Arc::new(MemoryEventSink::new()),
            );
            client
                .acquire(LicenseCredentials {
                    install_id: "install-1".into(),
                    install_secret: "secret".into(),
                })
                .await
                .unwrap();

            let mut previous = client.status_at(t0());
            let mut now = t0();
            for (advance, issuer_up) in steps {
                now += TimeDelta::seconds(advance);
                clock.set(now);
                let before_renewal = client.status_at(now);
                prop_assert!(before_renewal >= previous);

                issuer.available.store(issuer_up, Ordering::SeqCst);
                let renewed = client.renew().await.is_ok();
                let after = client.status_at(now);

                if after < before_renewal {
                    prop_assert!(renewed);
                    prop_assert_eq!(before_renewal, LeaseStatus::Grace);
                    prop_assert_eq!(after, LeaseStatus::Valid);
                }
                if before_renewal == LeaseStatus::Expired {
                    prop_assert_eq!(after, LeaseStatus::Expired);
                    prop_assert!(!client.is_feature_enabled_at(FEATURE_HOT_SWAP, now));
                } else {
                    prop_assert!(client.is_feature_enabled_at(FEATURE_HOT_SWAP, now));
                }
                previous = after;
            }
            Ok::<(), TestCaseError>(())
        })?;
    });
}
