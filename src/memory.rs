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

//! In-memory lease store implementation (for testing).

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{LockError, LockResult};
use crate::store::{LeaseStore, LockLease, Released};

/// In-memory lease store.
///
/// ## Purpose
/// A simple implementation of [`LeaseStore`] for tests and single-process
/// scenarios. The write lock over the whole table plays the role a real
/// backend's row-level atomicity plays.
///
/// ## Limitations
/// - Not persistent (leases lost on restart)
/// - Not distributed (single process only)
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    leases: HashMap<(String, String), LockLease>,
    // Fencing counters survive lease deletion so tokens stay monotonic
    // across release and sweep.
    fencing: HashMap<(String, String), u64>,
}

impl MemoryLeaseStore {
    /// Create a new in-memory lease store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn ttl_delta(ttl: Duration) -> LockResult<TimeDelta> {
    TimeDelta::from_std(ttl).map_err(|e| LockError::Store(format!("ttl out of range: {e}")))
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_insert(
        &self,
        region: &str,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> LockResult<LockLease> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let slot = (region.to_string(), key.to_string());

        if let Some(existing) = inner.leases.get(&slot) {
            if !existing.is_expired(now) {
                return Err(LockError::AlreadyHeld {
                    key: key.to_string(),
                    holder: existing.owner_id.clone(),
                });
            }
        }

        let token = inner.fencing.get(&slot).copied().unwrap_or(0) + 1;
        inner.fencing.insert(slot.clone(), token);

        let lease = LockLease {
            region: region.to_string(),
            key: key.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at: now,
            expires_at: now + ttl_delta(ttl)?,
            fencing_token: token,
        };
        inner.leases.insert(slot, lease.clone());
        Ok(lease)
    }

    async fn renew(
        &self,
        region: &str,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> LockResult<LockLease> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let slot = (region.to_string(), key.to_string());

        let lost = || LockError::LeaseLost {
            key: key.to_string(),
        };

        let expires_at = now + ttl_delta(ttl)?;
        let lease = inner.leases.get_mut(&slot).ok_or_else(&lost)?;
        if lease.owner_id != owner_id || lease.is_expired(now) {
            return Err(lost());
        }
        lease.expires_at = expires_at;
        Ok(lease.clone())
    }

    async fn release(&self, region: &str, key: &str, owner_id: &str) -> LockResult<Released> {
        let mut inner = self.inner.write().await;
        let slot = (region.to_string(), key.to_string());

        match inner.leases.get(&slot) {
            Some(lease) if lease.owner_id == owner_id => {
                inner.leases.remove(&slot);
                Ok(Released::Deleted)
            }
            _ => Ok(Released::NotOwner),
        }
    }

    async fn sweep_expired(&self, region: &str) -> LockResult<u64> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let before = inner.leases.len();
        inner
            .leases
            .retain(|(r, _), lease| r != region || !lease.is_expired(now));
        Ok((before - inner.leases.len()) as u64)
    }

    async fn get(&self, region: &str, key: &str) -> LockResult<Option<LockLease>> {
        let inner = self.inner.read().await;
        Ok(inner
            .leases
            .get(&(region.to_string(), key.to_string()))
            .cloned())
    }
}
