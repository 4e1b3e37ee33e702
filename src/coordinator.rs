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

//! Scoped critical-section execution: acquire, mutate, release.

use futures::FutureExt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{instrument, warn};

use crate::error::{LockError, LockResult};
use crate::handle::{EpochState, LockGuard};
use crate::registry::LockRegistry;
use crate::store::LockLease;

tokio::task_local! {
    // Epochs held by the current task, keyed by (region, key). A nested
    // guarded section on a key this task already holds re-enters instead
    // of queueing behind itself on the local gate.
    static HELD_EPOCHS: RefCell<HashMap<(String, String), Arc<EpochState>>>;
}

/// Orchestrates acquire → guarded mutation → release for caller-supplied
/// operations.
///
/// The guarded record itself is external: the coordinator hands the
/// operation a snapshot of the held [`LockLease`] (fencing token included)
/// and otherwise never touches record semantics.
pub struct LockCoordinator {
    registry: Arc<LockRegistry>,
}

impl LockCoordinator {
    pub fn new(registry: Arc<LockRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this coordinator obtains locks from.
    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.registry
    }

    /// Run `operation` with the lock for `key` held, waiting at most
    /// `max_wait` to acquire. Reentrant per task: a guarded section nested
    /// inside another on the same key runs under the outer lease with no
    /// extra acquisition.
    ///
    /// - [`LockError::AcquireTimeout`]: the deadline elapsed; the operation
    ///   was never invoked.
    /// - [`LockError::LeaseLost`]: the lease expired or was taken over
    ///   before the operation finished. Surfaced even when the operation
    ///   itself completed, because exclusivity was not maintained
    ///   throughout; the caller decides whether its partial work is safe.
    ///
    /// The lock is released on every exit path: normal return, operation
    /// failure (embedded in `T`), and panic — panics are re-raised after
    /// release.
    #[instrument(skip_all, fields(lock_key = %key))]
    pub async fn run_guarded<T, F, Fut>(
        &self,
        key: &str,
        max_wait: Duration,
        operation: F,
    ) -> LockResult<T>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = T>,
    {
        if HELD_EPOCHS.try_with(|_| ()).is_ok() {
            return self.run_locked(key, max_wait, operation).await;
        }
        HELD_EPOCHS
            .scope(
                RefCell::new(HashMap::new()),
                self.run_locked(key, max_wait, operation),
            )
            .await
    }

    async fn run_locked<T, F, Fut>(
        &self,
        key: &str,
        max_wait: Duration,
        operation: F,
    ) -> LockResult<T>
    where
        F: FnOnce(LockLease) -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = (self.registry.config().region.clone(), key.to_string());

        let held = HELD_EPOCHS.with(|held| held.borrow().get(&slot).map(LockGuard::from_epoch));
        let (guard, entered) = match held {
            Some(guard) => (guard, false),
            None => {
                let handle = self.registry.obtain(key);
                let guard = handle.try_lock(max_wait).await?;
                HELD_EPOCHS.with(|held| {
                    held.borrow_mut().insert(slot.clone(), guard.epoch());
                });
                (guard, true)
            }
        };

        // Loss can race acquisition; never start the mutation unprotected.
        if !guard.is_valid() {
            if entered {
                HELD_EPOCHS.with(|held| {
                    held.borrow_mut().remove(&slot);
                });
            }
            if let Err(e) = guard.unlock().await {
                warn!(lock_key = %key, error = %e, "failed to release lock lost at acquisition");
            }
            return Err(LockError::LeaseLost {
                key: key.to_string(),
            });
        }

        let lease = guard.lease().clone();
        let outcome = AssertUnwindSafe(operation(lease)).catch_unwind().await;
        let still_valid = guard.is_valid();

        if entered {
            HELD_EPOCHS.with(|held| {
                held.borrow_mut().remove(&slot);
            });
        }
        if let Err(e) = guard.unlock().await {
            // The mutation already ran; a failed release is not worth
            // masking its result. The row expires on its own.
            warn!(lock_key = %key, error = %e, "failed to release lock after guarded operation");
        }

        let value = match outcome {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        };

        if !still_valid {
            return Err(LockError::LeaseLost {
                key: key.to_string(),
            });
        }
        Ok(value)
    }
}

#[cfg(all(test, feature = "memory-backend"))]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::memory::MemoryLeaseStore;
    use crate::store::LeaseStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_coordinator(store: Arc<MemoryLeaseStore>) -> LockCoordinator {
        let config = LockConfig {
            lease_ttl: Duration::from_secs(2),
            renew_interval: Duration::from_millis(500),
            retry_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        let registry =
            Arc::new(LockRegistry::new(store as Arc<dyn LeaseStore>, config).unwrap());
        LockCoordinator::new(registry)
    }

    #[tokio::test]
    async fn test_run_guarded_returns_operation_result() {
        let store = Arc::new(MemoryLeaseStore::new());
        let coordinator = test_coordinator(Arc::clone(&store));

        let value = coordinator
            .run_guarded("reservation:1", Duration::from_secs(1), |lease| async move {
                assert_eq!(lease.key, "reservation:1");
                assert!(lease.fencing_token > 0);
                42
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        // Released on the way out.
        assert!(store.get("default", "reservation:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_skips_operation() {
        let store = Arc::new(MemoryLeaseStore::new());
        store
            .try_insert("default", "reservation:1", "remote-owner", Duration::from_secs(30))
            .await
            .unwrap();
        let coordinator = test_coordinator(Arc::clone(&store));

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_probe = Arc::clone(&invoked);
        let result = coordinator
            .run_guarded("reservation:1", Duration::from_millis(100), |_| {
                let invoked = Arc::clone(&invoked_probe);
                async move {
                    invoked.store(true, Ordering::SeqCst);
                }
            })
            .await;

        assert!(matches!(result, Err(LockError::AcquireTimeout { .. })));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_runs_when_operation_panics() {
        let store = Arc::new(MemoryLeaseStore::new());
        let coordinator = Arc::new(test_coordinator(Arc::clone(&store)));

        let coordinator_task = Arc::clone(&coordinator);
        let join = tokio::spawn(async move {
            coordinator_task
                .run_guarded("reservation:1", Duration::from_secs(1), |_| async move {
                    panic!("guarded operation blew up");
                })
                .await
        });

        assert!(join.await.is_err());
        // The panic must not leak the lease.
        assert!(store.get("default", "reservation:1").await.unwrap().is_none());

        coordinator
            .run_guarded("reservation:1", Duration::from_millis(200), |_| async {})
            .await
            .unwrap();
    }
}
