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

//! # Rowlock — database-backed distributed locks
//!
//! ## Purpose
//! Coordinates mutually-exclusive updates to shared records across
//! independent processes with no shared memory, using a durable store as
//! the single arbiter of lock ownership. Lock leases live as rows in the
//! store; acquisition, renewal, and release are atomic conditional writes,
//! so the store's row-level atomicity is the only synchronization
//! primitive between competing processes.
//!
//! ## Architecture
//! - [`LeaseStore`]: durable lease table with atomic conditional
//!   insert/renew/delete ([`memory::MemoryLeaseStore`] for tests,
//!   [`sql::SqliteLeaseStore`] for persistence)
//! - [`LockRegistry`]: per-process cache handing out one shared
//!   [`LockHandle`] per key
//! - [`LockHandle`]: serializes local acquirers and hands out re-enterable
//!   [`LockGuard`]s, with timeout-bounded store polling and a background
//!   lease renewer per held epoch
//! - [`ExpiryReaper`]: periodic sweep reclaiming leases abandoned by
//!   crashed holders
//! - [`LockCoordinator`]: scoped acquire → mutate → release execution of
//!   caller-supplied critical sections
//!
//! ## Design decisions
//! - **Lease expiry for crash recovery**: a holder that dies without
//!   releasing blocks its key for at most one TTL
//! - **Fencing tokens**: monotonic per key across takeovers and releases,
//!   handed to guarded operations to fence stale writers
//! - **No fairness**: contenders race with capped-exponential backoff;
//!   only exclusivity is guaranteed
//!
//! ## Example
//! ```rust,no_run
//! use rowlock::{memory::MemoryLeaseStore, LockConfig, LockCoordinator, LockRegistry};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryLeaseStore::new());
//! let registry = Arc::new(LockRegistry::new(store, LockConfig::default())?);
//! let coordinator = LockCoordinator::new(registry);
//!
//! let token = coordinator
//!     .run_guarded("reservation:42", Duration::from_secs(5), |lease| async move {
//!         // mutate the guarded record here, fencing writes with the token
//!         lease.fencing_token
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod registry;
pub mod reaper;
pub mod store;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "sqlite-backend")]
pub mod sql;

pub use config::LockConfig;
pub use coordinator::LockCoordinator;
pub use error::{LockError, LockResult};
pub use handle::{LockGuard, LockHandle};
pub use registry::LockRegistry;
pub use reaper::ExpiryReaper;
pub use store::{LeaseStore, LockLease, Released};
