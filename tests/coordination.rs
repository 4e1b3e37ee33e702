// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2026 Rowlock contributors
//
// This file is part of Rowlock.
//
// Rowlock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// Rowlock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with Rowlock. If not, see <https://www.gnu.org/licenses/>.

//! End-to-end coordination tests.
//!
//! Each registry instance plays the role of one process; a store shared
//! between registries is the durable table they coordinate through. These
//! tests verify the properties the crate exists for:
//! - Mutual exclusion across contending registries, and between tasks
//!   sharing one registry
//! - Reentrancy within one task without extra store writes
//! - Timeout correctness, including the non-blocking zero timeout
//! - Crash recovery through lease expiry
//! - Renewal keeping long critical sections alive
//! - Lock-loss propagation into an in-progress critical section

#![cfg(feature = "memory-backend")]

use rowlock::memory::MemoryLeaseStore;
use rowlock::{LeaseStore, LockConfig, LockCoordinator, LockError, LockRegistry};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const REGION: &str = "default";

fn config(node: &str, ttl: Duration, renew: Duration) -> LockConfig {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    LockConfig {
        node_id: node.to_string(),
        lease_ttl: ttl,
        renew_interval: renew,
        retry_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        ..Default::default()
    }
}

fn coordinator(store: &Arc<MemoryLeaseStore>, node: &str) -> Arc<LockCoordinator> {
    let config = config(node, Duration::from_secs(2), Duration::from_millis(500));
    let registry = Arc::new(
        LockRegistry::new(Arc::clone(store) as Arc<dyn LeaseStore>, config).unwrap(),
    );
    Arc::new(LockCoordinator::new(registry))
}

#[tokio::test]
async fn test_mutual_exclusion_across_processes() {
    let store = Arc::new(MemoryLeaseStore::new());
    let active = Arc::new(AtomicU32::new(0));
    let max_active = Arc::new(AtomicU32::new(0));
    let mut tasks = vec![];

    for i in 0..8 {
        let coordinator = coordinator(&store, &format!("node-{i}"));
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);

        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                coordinator
                    .run_guarded("shared-record", Duration::from_secs(10), |_| {
                        let active = Arc::clone(&active);
                        let max_active = Arc::clone(&max_active);
                        async move {
                            let inside = active.fetch_add(1, Ordering::SeqCst) + 1;
                            max_active.fetch_max(inside, Ordering::SeqCst);
                            sleep(Duration::from_millis(10)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        }
                    })
                    .await
                    .unwrap();
            }
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        max_active.load(Ordering::SeqCst),
        1,
        "two critical sections overlapped"
    );
    assert!(store.get(REGION, "shared-record").await.unwrap().is_none());
}

#[tokio::test]
async fn test_mutual_exclusion_within_one_process() {
    let store = Arc::new(MemoryLeaseStore::new());
    // One registry shared by all tasks: contention is on the local gate,
    // not the store.
    let coordinator = coordinator(&store, "node-1");
    let active = Arc::new(AtomicU32::new(0));
    let max_active = Arc::new(AtomicU32::new(0));
    let mut tasks = vec![];

    for _ in 0..4 {
        let coordinator = Arc::clone(&coordinator);
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);

        tasks.push(tokio::spawn(async move {
            coordinator
                .run_guarded("shared-record", Duration::from_secs(10), |_| {
                    let active = Arc::clone(&active);
                    let max_active = Arc::clone(&max_active);
                    async move {
                        let inside = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(inside, Ordering::SeqCst);
                        sleep(Duration::from_millis(100)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
                .await
                .unwrap();
        }));
    }

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(
        max_active.load(Ordering::SeqCst),
        1,
        "critical sections from tasks in the same process overlapped"
    );
    assert!(store.get(REGION, "shared-record").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reentrant_nested_guarded_sections() {
    let store = Arc::new(MemoryLeaseStore::new());
    let coordinator = coordinator(&store, "node-1");

    let inner_coordinator = Arc::clone(&coordinator);
    let outer_token = coordinator
        .run_guarded("shared-record", Duration::from_secs(1), |outer| {
            let coordinator = inner_coordinator;
            async move {
                // Same task, same key: re-entry must succeed with a zero
                // wait and no second lease.
                let inner_token = coordinator
                    .run_guarded("shared-record", Duration::ZERO, |inner| async move {
                        inner.fencing_token
                    })
                    .await
                    .unwrap();
                assert_eq!(inner_token, outer.fencing_token);
                outer.fencing_token
            }
        })
        .await
        .unwrap();

    assert_eq!(outer_token, 1);
    // Fully released only after the outer section ended.
    assert!(store.get(REGION, "shared-record").await.unwrap().is_none());
}

#[tokio::test]
async fn test_zero_timeout_against_remote_holder() {
    let store = Arc::new(MemoryLeaseStore::new());
    let holder = coordinator(&store, "node-1");
    let contender = coordinator(&store, "node-2");

    holder
        .run_guarded("shared-record", Duration::from_secs(1), |_| {
            let contender = Arc::clone(&contender);
            async move {
                let result = contender
                    .run_guarded("shared-record", Duration::ZERO, |_| async {})
                    .await;
                assert!(matches!(result, Err(LockError::AcquireTimeout { .. })));
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_crash_recovery_via_lease_expiry() {
    let store = Arc::new(MemoryLeaseStore::new());

    // A holder that died mid-critical-section: lease row present, no
    // release ever coming.
    let dead = store
        .try_insert(REGION, "shared-record", "crashed-node:1", Duration::from_millis(300))
        .await
        .unwrap();

    let survivor = coordinator(&store, "node-2");
    let token = survivor
        .run_guarded("shared-record", Duration::from_secs(5), |lease| async move {
            lease.fencing_token
        })
        .await
        .unwrap();

    // Took over after expiry, with a fencing token that supersedes the
    // crashed holder's.
    assert!(token > dead.fencing_token);
}

#[tokio::test]
async fn test_renewal_outlives_ttl() {
    let store = Arc::new(MemoryLeaseStore::new());
    let config = config("node-1", Duration::from_millis(300), Duration::from_millis(100));
    let registry = Arc::new(
        LockRegistry::new(Arc::clone(&store) as Arc<dyn LeaseStore>, config).unwrap(),
    );
    let coordinator = LockCoordinator::new(registry);

    let contender = self::coordinator(&store, "node-2");

    // Critical section three times longer than the TTL: only renewal keeps
    // it protected to the end.
    coordinator
        .run_guarded("shared-record", Duration::from_secs(1), |_| {
            let contender = Arc::clone(&contender);
            async move {
                sleep(Duration::from_millis(500)).await;
                // Still held mid-section; a contender cannot sneak in.
                let result = contender
                    .run_guarded("shared-record", Duration::from_millis(100), |_| async {})
                    .await;
                assert!(matches!(result, Err(LockError::AcquireTimeout { .. })));
                sleep(Duration::from_millis(400)).await;
            }
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_lock_loss_propagates_to_critical_section() {
    let store = Arc::new(MemoryLeaseStore::new());
    let config = config("node-1", Duration::from_secs(1), Duration::from_millis(200));
    let registry = Arc::new(
        LockRegistry::new(Arc::clone(&store) as Arc<dyn LeaseStore>, config).unwrap(),
    );
    let coordinator = LockCoordinator::new(registry);

    let thief_store = Arc::clone(&store);
    let result = coordinator
        .run_guarded("shared-record", Duration::from_secs(1), |lease| {
            let store = thief_store;
            async move {
                // The lease vanishes behind the holder's back (another
                // operator deleting the row, clock trouble, takeover).
                store
                    .release(REGION, "shared-record", &lease.owner_id)
                    .await
                    .unwrap();
                store
                    .try_insert(REGION, "shared-record", "thief:1", Duration::from_secs(30))
                    .await
                    .unwrap();

                // Keep running until the renewer notices.
                sleep(Duration::from_millis(500)).await;
                "operation finished anyway"
            }
        })
        .await;

    // The operation completed, but exclusivity was not maintained, so the
    // coordinator must not report success.
    assert!(matches!(result, Err(LockError::LeaseLost { .. })));

    // The thief's lease was never touched by the unwinding holder.
    let lease = store.get(REGION, "shared-record").await.unwrap().unwrap();
    assert_eq!(lease.owner_id, "thief:1");
}

#[tokio::test]
async fn test_sequential_guarded_updates_see_increasing_tokens() {
    let store = Arc::new(MemoryLeaseStore::new());
    let coordinator = coordinator(&store, "node-1");

    let mut last_token = 0;
    for _ in 0..3 {
        let token = coordinator
            .run_guarded("shared-record", Duration::from_secs(1), |lease| async move {
                lease.fencing_token
            })
            .await
            .unwrap();
        assert!(token > last_token);
        last_token = token;
    }
}
