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

//! Background sweep of expired leases.
//!
//! A holder that crashes before `release()` leaves a row behind that only
//! expiry removes. Acquisition already treats expired rows as free, so the
//! reaper is pure garbage collection — it keeps the table from accumulating
//! dead rows, it is not on any acquisition path.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, trace, warn};

use crate::store::LeaseStore;

/// Periodic sweep removing leases past expiry, across one or more regions.
///
/// Runs independently of any single acquisition. Store errors are logged
/// and the sweep carries on next period.
pub struct ExpiryReaper {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ExpiryReaper {
    /// Spawn a reaper sweeping `regions` every `period`.
    pub fn spawn(store: Arc<dyn LeaseStore>, regions: Vec<String>, period: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let shutdown_rx = Arc::clone(&shutdown);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for region in &regions {
                            match store.sweep_expired(region).await {
                                Ok(0) => trace!(region = %region, "no expired leases"),
                                Ok(reclaimed) => {
                                    info!(region = %region, reclaimed, "reclaimed expired leases");
                                }
                                Err(e) => {
                                    warn!(region = %region, error = %e, "lease sweep failed");
                                }
                            }
                        }
                    }
                    _ = shutdown_rx.notified() => break,
                }
            }
        });

        Self { shutdown, task }
    }

    /// Request the sweep loop to stop after the current iteration.
    pub fn stop(&self) {
        self.shutdown.notify_one();
    }

    /// Stop the sweep loop and wait for it to finish.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}

#[cfg(all(test, feature = "memory-backend"))]
mod tests {
    use super::*;
    use crate::memory::MemoryLeaseStore;
    use crate::store::LeaseStore;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_reaper_removes_abandoned_leases() {
        let store = Arc::new(MemoryLeaseStore::new());
        store
            .try_insert("default", "abandoned", "dead-owner", Duration::from_millis(50))
            .await
            .unwrap();
        store
            .try_insert("default", "live", "live-owner", Duration::from_secs(60))
            .await
            .unwrap();

        let reaper = ExpiryReaper::spawn(
            Arc::clone(&store) as Arc<dyn LeaseStore>,
            vec!["default".to_string()],
            Duration::from_millis(50),
        );

        sleep(Duration::from_millis(300)).await;
        reaper.shutdown().await;

        assert!(store.get("default", "abandoned").await.unwrap().is_none());
        assert!(store.get("default", "live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reaper_sweeps_all_regions() {
        let store = Arc::new(MemoryLeaseStore::new());
        store
            .try_insert("region-a", "stale", "dead-owner", Duration::from_millis(50))
            .await
            .unwrap();
        store
            .try_insert("region-b", "stale", "dead-owner", Duration::from_millis(50))
            .await
            .unwrap();

        let reaper = ExpiryReaper::spawn(
            Arc::clone(&store) as Arc<dyn LeaseStore>,
            vec!["region-a".to_string(), "region-b".to_string()],
            Duration::from_millis(50),
        );

        sleep(Duration::from_millis(300)).await;
        reaper.shutdown().await;

        assert!(store.get("region-a", "stale").await.unwrap().is_none());
        assert!(store.get("region-b", "stale").await.unwrap().is_none());
    }
}
