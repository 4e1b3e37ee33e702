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

//! Lock registry configuration.

use std::time::Duration;
use ulid::Ulid;

use crate::error::{LockError, LockResult};

/// Configuration shared by every handle a [`LockRegistry`](crate::LockRegistry)
/// hands out.
///
/// Acquisition wait (the `try_lock` argument) and lease TTL are deliberately
/// independent: how long a caller is willing to wait for a lock has nothing
/// to do with how long the lease protects the critical section once held.
#[derive(Clone, Debug)]
pub struct LockConfig {
    /// Logical namespace for keys. Independent registries pointed at the
    /// same store but different regions never contend.
    pub region: String,

    /// Identifies this process in owner tokens. Diagnostic only; uniqueness
    /// of ownership comes from the per-acquisition token suffix.
    pub node_id: String,

    /// How long a lease protects the key without renewal. Also the crash
    /// recovery horizon: a holder that dies without releasing blocks the
    /// key for at most this long.
    pub lease_ttl: Duration,

    /// Renewal period for held leases. Must satisfy
    /// `renew_interval * 2 < lease_ttl` so at least one renewal lands
    /// before expiry even if one attempt is delayed or dropped.
    pub renew_interval: Duration,

    /// Initial sleep between acquisition polls when the key is contended.
    pub retry_backoff: Duration,

    /// Cap for the exponential acquisition backoff.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            region: "default".to_string(),
            node_id: format!("{}-{}", std::process::id(), Ulid::new()),
            lease_ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl LockConfig {
    /// Validate invariants between the timing knobs.
    pub fn validate(&self) -> LockResult<()> {
        if self.region.is_empty() {
            return Err(LockError::Config("region must not be empty".to_string()));
        }
        if self.node_id.is_empty() {
            return Err(LockError::Config("node_id must not be empty".to_string()));
        }
        if self.lease_ttl.is_zero() {
            return Err(LockError::Config("lease_ttl must be nonzero".to_string()));
        }
        if self.retry_backoff.is_zero() {
            return Err(LockError::Config(
                "retry_backoff must be nonzero to avoid hammering the store".to_string(),
            ));
        }
        if self.max_backoff < self.retry_backoff {
            return Err(LockError::Config(
                "max_backoff must be >= retry_backoff".to_string(),
            ));
        }
        if self.renew_interval.is_zero() || self.renew_interval * 2 >= self.lease_ttl {
            return Err(LockError::Config(format!(
                "renew_interval ({:?}) must be nonzero and less than half of lease_ttl ({:?})",
                self.renew_interval, self.lease_ttl
            )));
        }
        Ok(())
    }

    /// Mint a fresh ownership token for one acquisition epoch.
    ///
    /// Tokens are never reused across distinct holders: a handle that lost
    /// its lease re-acquires under a new token.
    pub(crate) fn new_owner_token(&self) -> String {
        format!("{}:{}", self.node_id, Ulid::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        LockConfig::default().validate().unwrap();
    }

    #[test]
    fn renew_interval_must_be_under_half_ttl() {
        let config = LockConfig {
            lease_ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(5),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn zero_backoff_is_rejected() {
        let config = LockConfig {
            retry_backoff: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LockError::Config(_))));
    }

    #[test]
    fn owner_tokens_are_unique() {
        let config = LockConfig::default();
        let a = config.new_owner_token();
        let b = config.new_owner_token();
        assert_ne!(a, b);
        assert!(a.starts_with(&config.node_id));
    }
}
