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

//! Per-key lock handle: the acquire/release state machine.
//!
//! One handle per `(region, key)` per process, cached by the
//! [`LockRegistry`](crate::LockRegistry). Local tasks are serialized on the
//! handle's gate mutex, so at most one local acquirer owns the lease at a
//! time; cross-process contention goes through the lease store. A
//! successful acquisition hands back a [`LockGuard`], and only the holder
//! of a guard can re-enter — reentrancy is scoped to the owner, not the
//! process. While a lease is held a background renewer task extends its
//! expiry, and flips the epoch invalid when renewal reports the lease lost.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout as deadline, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::config::LockConfig;
use crate::error::{LockError, LockResult};
use crate::store::{LeaseStore, LockLease, Released};

/// Process-local lock handle for one `(region, key)`.
///
/// Acquisition is two gates in sequence: the local mutex (one owner per
/// process) and then the store's conditional insert (one owner across
/// processes). Waiters queue on the local mutex instead of hammering the
/// store, so within a process only the current owner ever polls it.
pub struct LockHandle {
    region: String,
    key: String,
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    // Held (through the epoch) by whoever owns the lease, released only
    // after the store row is gone.
    gate: Arc<Mutex<()>>,
}

impl LockHandle {
    pub(crate) fn new(
        region: String,
        key: String,
        store: Arc<dyn LeaseStore>,
        config: LockConfig,
    ) -> Self {
        Self {
            region,
            key,
            store,
            config,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Lock key this handle guards.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Region this handle's key lives in.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Acquire the lock, waiting at most `timeout`.
    ///
    /// First queues on the local gate behind any same-process owner, then
    /// polls the lease store with capped-exponential backoff, all within
    /// the deadline. `timeout == 0` makes a single immediate attempt at
    /// both gates. Re-entry goes through [`LockGuard::nest`] on the guard
    /// already held; a second `try_lock` from the owning task would queue
    /// behind itself and time out.
    ///
    /// A timed-out attempt never performed a successful insert, so it
    /// leaves no residual lease row.
    pub async fn try_lock(&self, timeout: Duration) -> LockResult<LockGuard> {
        self.acquire(Some(timeout)).await
    }

    /// Acquire the lock, suspending the caller until it is available.
    pub async fn lock(&self) -> LockResult<LockGuard> {
        self.acquire(None).await
    }

    async fn acquire(&self, timeout: Option<Duration>) -> LockResult<LockGuard> {
        let start = Instant::now();

        let gate = match timeout {
            Some(limit) if limit.is_zero() => match Arc::clone(&self.gate).try_lock_owned() {
                Ok(gate) => gate,
                Err(_) => {
                    return Err(LockError::AcquireTimeout {
                        key: self.key.clone(),
                        waited: start.elapsed(),
                    })
                }
            },
            Some(limit) => match deadline(limit, Arc::clone(&self.gate).lock_owned()).await {
                Ok(gate) => gate,
                Err(_) => {
                    return Err(LockError::AcquireTimeout {
                        key: self.key.clone(),
                        waited: start.elapsed(),
                    })
                }
            },
            None => Arc::clone(&self.gate).lock_owned().await,
        };

        // Fresh token per acquisition epoch; a handle that lost its lease
        // never re-acquires under the old identity.
        let owner = self.config.new_owner_token();
        let mut backoff = self.config.retry_backoff;

        loop {
            match self
                .store
                .try_insert(&self.region, &self.key, &owner, self.config.lease_ttl)
                .await
            {
                Ok(lease) => return Ok(self.install_epoch(gate, owner, lease)),
                Err(LockError::AlreadyHeld { holder, .. }) => {
                    trace!(
                        lock_key = %self.key,
                        holder = %holder,
                        "lock contended, backing off"
                    );
                }
                Err(e) if e.is_retryable() => {
                    // Transient store failure: not ownership loss, retry.
                    warn!(lock_key = %self.key, error = %e, "lease store unavailable, retrying");
                }
                Err(e) => return Err(e),
            }

            match timeout {
                Some(limit) => {
                    let waited = start.elapsed();
                    if waited >= limit {
                        return Err(LockError::AcquireTimeout {
                            key: self.key.clone(),
                            waited,
                        });
                    }
                    sleep(backoff.min(limit - waited)).await;
                }
                None => sleep(backoff).await,
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    fn install_epoch(&self, gate: OwnedMutexGuard<()>, owner: String, lease: LockLease) -> LockGuard {
        debug!(
            lock_key = %self.key,
            owner_id = %owner,
            fencing_token = lease.fencing_token,
            "lock acquired"
        );

        let valid = Arc::new(AtomicBool::new(true));
        let renewer = Renewer::spawn(
            Arc::clone(&self.store),
            self.region.clone(),
            self.key.clone(),
            owner.clone(),
            self.config.lease_ttl,
            self.config.renew_interval,
            Arc::clone(&valid),
        );

        LockGuard {
            epoch: Arc::new(EpochState {
                region: self.region.clone(),
                key: self.key.clone(),
                owner_id: owner,
                lease,
                valid,
                guards: AtomicU32::new(1),
                store: Arc::clone(&self.store),
                renewer: StdMutex::new(Some(renewer)),
                _gate: gate,
            }),
            released: false,
        }
    }

    /// Non-blocking probe used by registry eviction: nobody owns or is
    /// waiting to own the lease through this handle.
    pub(crate) fn try_is_idle(&self) -> bool {
        self.gate.try_lock().is_ok()
    }
}

/// Shared state of one acquisition epoch: everything that lives from a
/// successful insert until the last guard of the epoch is gone.
pub(crate) struct EpochState {
    region: String,
    key: String,
    owner_id: String,
    lease: LockLease,
    /// Shared with the renewer; false once the lease has been lost.
    valid: Arc<AtomicBool>,
    /// Outstanding guards over this epoch.
    guards: AtomicU32,
    store: Arc<dyn LeaseStore>,
    renewer: StdMutex<Option<Renewer>>,
    // Keeps other local acquirers queued until the release is done.
    _gate: OwnedMutexGuard<()>,
}

impl EpochState {
    async fn release_lease(&self) -> LockResult<()> {
        if let Some(renewer) = self
            .renewer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            renewer.stop();
        }

        // If the lease was already lost the row no longer belongs to this
        // epoch; skip the store call.
        let was_valid = self.valid.swap(false, Ordering::AcqRel);
        if !was_valid {
            debug!(lock_key = %self.key, "lease already lost, skipping store release");
            return Ok(());
        }

        match self
            .store
            .release(&self.region, &self.key, &self.owner_id)
            .await
        {
            Ok(Released::Deleted) => {
                debug!(
                    lock_key = %self.key,
                    fencing_token = self.lease.fencing_token,
                    "lock released"
                );
                Ok(())
            }
            Ok(Released::NotOwner) => {
                // Ownership violation at the store is an intentional no-op.
                warn!(lock_key = %self.key, "release found lease owned elsewhere, ignoring");
                Ok(())
            }
            Err(e) => {
                warn!(lock_key = %self.key, error = %e, "failed to release lease");
                Err(e)
            }
        }
    }
}

/// Proof of acquisition for one `(region, key)`.
///
/// Only the holder of a guard can re-enter the lock ([`nest`](Self::nest));
/// every other local task queues on the handle until the last guard of the
/// epoch releases. Release with [`unlock`](Self::unlock); a guard dropped
/// without it stops renewal and releases the lease best-effort in the
/// background.
pub struct LockGuard {
    epoch: Arc<EpochState>,
    released: bool,
}

impl LockGuard {
    /// Re-enter the lock: a nested guard over the same lease, no store
    /// access. Each nested guard must be released like the original; the
    /// lease row survives until the last one is gone.
    pub fn nest(&self) -> LockGuard {
        Self::from_epoch(&self.epoch)
    }

    pub(crate) fn from_epoch(epoch: &Arc<EpochState>) -> LockGuard {
        epoch.guards.fetch_add(1, Ordering::AcqRel);
        LockGuard {
            epoch: Arc::clone(epoch),
            released: false,
        }
    }

    pub(crate) fn epoch(&self) -> Arc<EpochState> {
        Arc::clone(&self.epoch)
    }

    /// The lease backing this guard, as of acquisition; expiry extensions
    /// happen store-side.
    pub fn lease(&self) -> &LockLease {
        &self.epoch.lease
    }

    /// Whether the lease is still believed valid. Callers in a critical
    /// section must check this before and after the guarded mutation.
    pub fn is_valid(&self) -> bool {
        self.epoch.valid.load(Ordering::Acquire)
    }

    /// Release this guard.
    ///
    /// The last guard of the epoch stops the renewer and deletes the lease
    /// row, and only then unblocks the next local acquirer. A release that
    /// races a takeover comes back `NotOwner` and is logged, never surfaced
    /// as an error.
    pub async fn unlock(mut self) -> LockResult<()> {
        self.released = true;
        let epoch = Arc::clone(&self.epoch);
        drop(self);

        if epoch.guards.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }
        epoch.release_lease().await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.epoch.guards.fetch_sub(1, Ordering::AcqRel) > 1 {
            return;
        }
        // Last guard dropped without unlock(): release in the background so
        // neither the renewer nor the lease row outlives the epoch. The
        // gate stays held until the release finishes.
        warn!(
            lock_key = %self.epoch.key,
            "lock guard dropped without unlock, releasing in background"
        );
        let epoch = Arc::clone(&self.epoch);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = epoch.release_lease().await;
            });
        }
    }
}

/// Background renewal task for one held lease epoch.
///
/// Fires strictly more than twice per TTL (enforced by
/// [`LockConfig::validate`](crate::LockConfig::validate)) so a single
/// delayed or dropped renewal cannot let the lease expire under a live
/// holder.
struct Renewer {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Renewer {
    fn spawn(
        store: Arc<dyn LeaseStore>,
        region: String,
        key: String,
        owner_id: String,
        ttl: Duration,
        period: Duration,
        valid: Arc<AtomicBool>,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the lease was just
            // written, so skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.renew(&region, &key, &owner_id, ttl).await {
                            Ok(lease) => {
                                trace!(
                                    lock_key = %key,
                                    fencing_token = lease.fencing_token,
                                    "lease renewed"
                                );
                            }
                            Err(LockError::LeaseLost { .. }) => {
                                valid.store(false, Ordering::Release);
                                warn!(
                                    lock_key = %key,
                                    owner_id = %owner_id,
                                    "lease lost while held (expired or taken over)"
                                );
                                break;
                            }
                            Err(e) => {
                                // Transient store failure: keep the epoch
                                // valid and try again next tick.
                                warn!(lock_key = %key, error = %e, "lease renewal attempt failed");
                            }
                        }
                    }
                    _ = shutdown_rx.notified() => break,
                }
            }
        });

        Self { shutdown, task }
    }

    fn stop(self) {
        self.shutdown.notify_one();
        self.task.abort();
    }
}
