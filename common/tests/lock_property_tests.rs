// Property-based tests for runner lock exclusivity

use chrono::{TimeDelta, TimeZone, Utc};
use common::clock::ManualClock;
use common::lock::{InMemoryLockProvider, LockProvider};
use common::models::RunnerLockHandle;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Op {
    Acquire(usize),
    Heartbeat(usize),
    Release(usize),
    Advance(i64),
}

fn op_strategy(owners: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..owners).prop_map(Op::Acquire),
        (0..owners).prop_map(Op::Heartbeat),
        (0..owners).prop_map(Op::Release),
        (1i64..120i64).prop_map(Op::Advance),
    ]
}

/// **Property: Mutual exclusion**
///
/// *For any* interleaving of acquire, heartbeat, release and clock advances by
/// several runner instances sharing one provider, at most one instance holds a
/// live lock at any instant, and a live lock is never taken over.
#[test]
fn property_at_most_one_live_holder() {
    proptest!(|(ops in prop::collection::vec(op_strategy(4), 1..60))| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
            let clock = Arc::new(ManualClock::new(start));
            let provider = InMemoryLockProvider::new(clock.clone());
            let ttl = Duration::from_secs(90);
            let mut now = start;
            let mut handles: HashMap<usize, RunnerLockHandle> = HashMap::new();

            for op in ops {
                match op {
                    Op::Acquire(owner) => {
                        let live_other = handles
                            .iter()
                            .any(|(o, h)| *o != owner && h.expires_at > now);
                        let owner_id = format!("runner-{}", owner);
                        let acquired = provider.try_acquire(&owner_id, ttl).await.unwrap();
                        if live_other {
                            prop_assert!(acquired.is_none());
                        }
                        if let Some(handle) = acquired {
                            handles.retain(|o, _| *o == owner);
                            handles.insert(owner, handle);
                        }
                    }
                    Op::Heartbeat(owner) => {
                        if let Some(mut handle) = handles.remove(&owner) {
                            let was_live = handle.expires_at > now;
                            let kept = provider.heartbeat(&mut handle, ttl).await.unwrap();
                            if was_live {
                                prop_assert!(kept);
                            }
                            if kept {
                                handles.insert(owner, handle);
                            }
                        }
                    }
                    Op::Release(owner) => {
                        if let Some(handle) = handles.remove(&owner) {
                            provider.release(handle).await.unwrap();
                        }
                    }
                    Op::Advance(seconds) => {
                        now += TimeDelta::seconds(seconds);
                        clock.set(now);
                    }
                }

                let live = handles.values().filter(|h| h.expires_at > now).count();
                prop_assert!(live <= 1);
            }
            Ok::<(), TestCaseError>(())
        })?;
    });
}
