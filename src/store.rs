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

//! Lease model and the durable lease store trait.
//!
//! The store's row-level conditional writes are the only cross-process
//! synchronization primitive in this crate: competing holders never talk
//! to each other, they only race atomic writes keyed by ownership.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::LockResult;

/// A time-bounded ownership record in durable storage representing a held
/// lock on one `(region, key)` pair.
///
/// At most one lease row per `(region, key)` with `expires_at > now` exists
/// at any instant; backends enforce this with a uniqueness constraint plus
/// check-then-write inside a single transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockLease {
    /// Logical namespace for the key.
    pub region: String,
    /// Lock key, unique within the region.
    pub key: String,
    /// Opaque token identifying the acquiring process+task. Never reused
    /// across distinct holders.
    pub owner_id: String,
    /// First successful insert of this acquisition epoch.
    pub acquired_at: DateTime<Utc>,
    /// The lease is invalid once `now > expires_at`.
    pub expires_at: DateTime<Utc>,
    /// Monotonically increasing per `(region, key)`, bumped on every
    /// successful acquisition including takeover after expiry. Guarded
    /// writers use it to detect stale holders after lock loss.
    pub fencing_token: u64,
}

impl LockLease {
    /// Whether the lease is past its expiry at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Remaining lease time at `now`, zero when expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Outcome of [`LeaseStore::release`].
///
/// A release by a token that no longer owns the lease is intentionally a
/// no-op rather than an error: the handle that lost its lease still needs
/// to unwind cleanly, and the store must never delete someone else's row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    /// The lease row was owned by the caller and has been deleted.
    Deleted,
    /// No row, or a row owned by a different token; nothing was mutated.
    NotOwner,
}

/// Durable table of lock leases exposing atomic conditional writes.
///
/// ## Contract
/// Every mutation is a single conditional write keyed by ownership, so
/// correctness does not depend on any cross-process signaling. All
/// implementations must make each operation atomic with respect to
/// concurrent callers (in-process or not).
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically insert a fresh lease for `(region, key)`.
    ///
    /// Fails with [`LockError::AlreadyHeld`](crate::LockError::AlreadyHeld)
    /// if a non-expired row exists. Otherwise writes a row with
    /// `expires_at = now + ttl` and a fencing token one greater than any
    /// prior token for the key (including expired and released ones).
    async fn try_insert(
        &self,
        region: &str,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> LockResult<LockLease>;

    /// Extend the expiry of a held lease.
    ///
    /// Succeeds only if the row exists, is owned by `owner_id`, and has not
    /// expired; sets `expires_at = now + ttl` leaving the fencing token and
    /// `acquired_at` unchanged. Every other case is
    /// [`LockError::LeaseLost`](crate::LockError::LeaseLost) — this is how
    /// the renewer detects theft and expiry.
    async fn renew(
        &self,
        region: &str,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> LockResult<LockLease>;

    /// Delete the lease row only if it is currently owned by `owner_id`.
    async fn release(&self, region: &str, key: &str, owner_id: &str) -> LockResult<Released>;

    /// Delete all rows in `region` with `expires_at <= now`, returning the
    /// number removed. Idempotent; run periodically by the reaper to
    /// recover leases abandoned by crashed holders.
    async fn sweep_expired(&self, region: &str) -> LockResult<u64>;

    /// Read the current lease for `(region, key)`, expired or not.
    async fn get(&self, region: &str, key: &str) -> LockResult<Option<LockLease>>;
}
