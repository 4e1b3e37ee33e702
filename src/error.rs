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

//! Error types for distributed lock operations.

use std::time::Duration;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// A live lease for the key exists and belongs to another owner.
    ///
    /// Surfaced by [`LeaseStore::try_insert`](crate::LeaseStore::try_insert);
    /// the acquisition loop in [`LockHandle`](crate::LockHandle) absorbs it
    /// and retries with backoff.
    #[error("lock {key:?} already held by {holder}")]
    AlreadyHeld { key: String, holder: String },

    /// Acquisition did not complete within the caller's deadline.
    ///
    /// Recoverable; the caller may retry. A timed-out attempt never performed
    /// a successful insert, so there is nothing to clean up.
    #[error("timed out acquiring lock {key:?} after {waited:?}")]
    AcquireTimeout { key: String, waited: Duration },

    /// The lease expired or was taken over while this process believed it
    /// held the lock. The critical section was no longer protected.
    #[error("lease for lock {key:?} was lost (expired or taken over)")]
    LeaseLost { key: String },

    /// Invalid lock configuration.
    #[error("invalid lock configuration: {0}")]
    Config(String),

    /// Backend error (database, network, etc.). Transient: callers retry
    /// with backoff rather than treating it as ownership loss.
    #[error("lease store error: {0}")]
    Store(String),
}

impl LockError {
    /// Whether the acquisition loop should keep polling after this error.
    ///
    /// Contention and transient backend failures are retried; everything
    /// else propagates to the caller.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, LockError::AlreadyHeld { .. } | LockError::Store(_))
    }
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::Store(format!("SQL error: {err}"))
    }
}
