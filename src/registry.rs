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

//! Per-process registry mapping lock keys to shared handles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::LockConfig;
use crate::error::LockResult;
use crate::handle::LockHandle;
use crate::store::LeaseStore;

/// Per-process cache of [`LockHandle`]s, one per key.
///
/// All callers in a process requesting the same key observe the same handle
/// object, which is what makes in-process reentrancy tracking possible.
/// An explicit instance, constructed once and passed by reference to every
/// component that obtains locks; tests get isolated registries for free.
pub struct LockRegistry {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    // Held only across single-key lookup/insert, never across an await, so
    // unrelated keys are not serialized behind each other's acquisitions.
    handles: Mutex<HashMap<String, Arc<LockHandle>>>,
}

impl LockRegistry {
    /// Create a registry over `store` with a validated configuration.
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Return the process-local handle for `key`, creating and caching it
    /// on first use. Creation happens under the map lock, so two handles
    /// are never created for the same key concurrently.
    pub fn obtain(&self, key: &str) -> Arc<LockHandle> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(handles.entry(key.to_string()).or_insert_with(|| {
            debug!(region = %self.config.region, lock_key = %key, "creating lock handle");
            Arc::new(LockHandle::new(
                self.config.region.clone(),
                key.to_string(),
                Arc::clone(&self.store),
                self.config.clone(),
            ))
        }))
    }

    /// Drop the cached handle for `key` if it is idle: no epoch held or
    /// being acquired through it, and no other caller retaining the handle.
    /// Returns whether an eviction happened. Handles are otherwise kept for
    /// the life of the process.
    pub fn evict(&self, key: &str) -> bool {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        let idle = match handles.get(key) {
            Some(handle) => Arc::strong_count(handle) == 1 && handle.try_is_idle(),
            None => false,
        };
        if idle {
            handles.remove(key);
            debug!(region = %self.config.region, lock_key = %key, "evicted idle lock handle");
        }
        idle
    }

    /// The lease store this registry coordinates through; handy for wiring
    /// an [`ExpiryReaper`](crate::ExpiryReaper) over the same backend.
    pub fn store(&self) -> Arc<dyn LeaseStore> {
        Arc::clone(&self.store)
    }

    /// The configuration every handle from this registry shares.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }
}
