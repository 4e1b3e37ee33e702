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

//! SQL-based lease store implementation (SQLite).
//!
//! Row-based, transactional leases with explicit expiration semantics.
//! Every mutation is check-then-write inside a single transaction, so the
//! database's atomicity is the cross-process mutual-exclusion primitive.
//! PostgreSQL can be added by following the same pattern with a `PgPool`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::instrument;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::error::{LockError, LockResult};
use crate::store::{LeaseStore, LockLease, Released};

/// SQLite-based lease store.
///
/// Uses a `lock_leases` table keyed by `(region, lock_key)` plus a
/// `lock_fencing` counter table:
///
/// ```sql
/// CREATE TABLE lock_leases (
///   region        TEXT NOT NULL,
///   lock_key      TEXT NOT NULL,
///   owner_id      TEXT NOT NULL,
///   acquired_at   INTEGER NOT NULL,
///   expires_at    INTEGER NOT NULL,
///   fencing_token INTEGER NOT NULL,
///   PRIMARY KEY (region, lock_key)
/// );
/// ```
///
/// - `acquired_at` / `expires_at` are stored as UNIX epoch milliseconds
/// - fencing counters live in their own table so deleting a lease row
///   (release or sweep) cannot reset the token sequence
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
}

impl SqliteLeaseStore {
    /// Create a new SQLite lease store.
    ///
    /// `database_url` is any valid `sqlx` SQLite URL, e.g.:
    /// - `sqlite::memory:` (in-memory)
    /// - `sqlite://locks.db`
    #[instrument(skip(database_url))]
    pub async fn new(database_url: &str) -> LockResult<Self> {
        // One connection: SQLite serializes writers anyway, and a pooled
        // `:memory:` database must stay a single database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| LockError::Store(format!("failed to connect SQLite: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lock_leases (
              region        TEXT NOT NULL,
              lock_key      TEXT NOT NULL,
              owner_id      TEXT NOT NULL,
              acquired_at   INTEGER NOT NULL,
              expires_at    INTEGER NOT NULL,
              fencing_token INTEGER NOT NULL,
              PRIMARY KEY (region, lock_key)
            );
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::Store(format!("failed to create lock_leases table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lock_fencing (
              region     TEXT NOT NULL,
              lock_key   TEXT NOT NULL,
              last_token INTEGER NOT NULL,
              PRIMARY KEY (region, lock_key)
            );
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::Store(format!("failed to create lock_fencing table: {e}")))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_lock_leases_expiry
            ON lock_leases(region, expires_at);
        "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| LockError::Store(format!("failed to create index: {e}")))?;

        Ok(Self { pool })
    }

    fn now_epoch_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn ttl_millis(ttl: Duration) -> LockResult<i64> {
        i64::try_from(ttl.as_millis())
            .map_err(|_| LockError::Store(format!("ttl out of range: {ttl:?}")))
    }

    fn timestamp_from_millis(millis: i64) -> LockResult<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| LockError::Store(format!("invalid timestamp in row: {millis}")))
    }

    /// Explicit, statically-typed mapping from a result row to a lease.
    fn lease_from_row(row: &sqlx::sqlite::SqliteRow) -> LockResult<LockLease> {
        let region: String = row.get("region");
        let key: String = row.get("lock_key");
        let owner_id: String = row.get("owner_id");
        let acquired_at: i64 = row.get("acquired_at");
        let expires_at: i64 = row.get("expires_at");
        let fencing_token: i64 = row.get("fencing_token");

        Ok(LockLease {
            region,
            key,
            owner_id,
            acquired_at: Self::timestamp_from_millis(acquired_at)?,
            expires_at: Self::timestamp_from_millis(expires_at)?,
            fencing_token: fencing_token as u64,
        })
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    #[instrument(skip_all, fields(region = %region, lock_key = %key, owner_id = %owner_id))]
    async fn try_insert(
        &self,
        region: &str,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> LockResult<LockLease> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Store(format!("begin tx: {e}")))?;

        let now = Self::now_epoch_millis();
        let expires_at = now + Self::ttl_millis(ttl)?;

        let existing = sqlx::query(
            r#"SELECT owner_id, expires_at FROM lock_leases
               WHERE region = ?1 AND lock_key = ?2"#,
        )
        .bind(region)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::Store(format!("select lease: {e}")))?;

        if let Some(row) = &existing {
            let holder: String = row.get("owner_id");
            let row_expires: i64 = row.get("expires_at");
            if row_expires > now {
                return Err(LockError::AlreadyHeld {
                    key: key.to_string(),
                    holder,
                });
            }
        }

        // Next fencing token: one greater than any prior token for this key,
        // including expired and released ones.
        let prior: Option<i64> = sqlx::query(
            r#"SELECT last_token FROM lock_fencing WHERE region = ?1 AND lock_key = ?2"#,
        )
        .bind(region)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::Store(format!("select fencing token: {e}")))?
        .map(|row| row.get("last_token"));

        let token = prior.unwrap_or(0) + 1;

        sqlx::query(
            r#"INSERT INTO lock_fencing (region, lock_key, last_token)
               VALUES (?1, ?2, ?3)
               ON CONFLICT (region, lock_key) DO UPDATE SET last_token = excluded.last_token"#,
        )
        .bind(region)
        .bind(key)
        .bind(token)
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Store(format!("update fencing token: {e}")))?;

        if existing.is_some() {
            // Expired row: take it over in place.
            sqlx::query(
                r#"UPDATE lock_leases
                   SET owner_id = ?3, acquired_at = ?4, expires_at = ?5, fencing_token = ?6
                 WHERE region = ?1 AND lock_key = ?2"#,
            )
            .bind(region)
            .bind(key)
            .bind(owner_id)
            .bind(now)
            .bind(expires_at)
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Store(format!("take over lease: {e}")))?;
        } else {
            sqlx::query(
                r#"INSERT INTO lock_leases
                   (region, lock_key, owner_id, acquired_at, expires_at, fencing_token)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            )
            .bind(region)
            .bind(key)
            .bind(owner_id)
            .bind(now)
            .bind(expires_at)
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| LockError::Store(format!("insert lease: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| LockError::Store(format!("commit tx: {e}")))?;

        Ok(LockLease {
            region: region.to_string(),
            key: key.to_string(),
            owner_id: owner_id.to_string(),
            acquired_at: Self::timestamp_from_millis(now)?,
            expires_at: Self::timestamp_from_millis(expires_at)?,
            fencing_token: token as u64,
        })
    }

    #[instrument(skip_all, fields(region = %region, lock_key = %key, owner_id = %owner_id))]
    async fn renew(
        &self,
        region: &str,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> LockResult<LockLease> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| LockError::Store(format!("begin tx: {e}")))?;

        let now = Self::now_epoch_millis();
        let new_expires = now + Self::ttl_millis(ttl)?;

        let row = sqlx::query(
            r#"SELECT region, lock_key, owner_id, acquired_at, expires_at, fencing_token
               FROM lock_leases WHERE region = ?1 AND lock_key = ?2"#,
        )
        .bind(region)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| LockError::Store(format!("select lease: {e}")))?;

        let row = match row {
            Some(row) => row,
            None => {
                return Err(LockError::LeaseLost {
                    key: key.to_string(),
                })
            }
        };

        let mut lease = Self::lease_from_row(&row)?;
        let row_expires: i64 = row.get("expires_at");

        if lease.owner_id != owner_id || row_expires <= now {
            return Err(LockError::LeaseLost {
                key: key.to_string(),
            });
        }

        sqlx::query(
            r#"UPDATE lock_leases SET expires_at = ?3
             WHERE region = ?1 AND lock_key = ?2 AND owner_id = ?4"#,
        )
        .bind(region)
        .bind(key)
        .bind(new_expires)
        .bind(owner_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| LockError::Store(format!("extend lease: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| LockError::Store(format!("commit tx: {e}")))?;

        lease.expires_at = Self::timestamp_from_millis(new_expires)?;
        Ok(lease)
    }

    #[instrument(skip_all, fields(region = %region, lock_key = %key, owner_id = %owner_id))]
    async fn release(&self, region: &str, key: &str, owner_id: &str) -> LockResult<Released> {
        let result = sqlx::query(
            r#"DELETE FROM lock_leases
               WHERE region = ?1 AND lock_key = ?2 AND owner_id = ?3"#,
        )
        .bind(region)
        .bind(key)
        .bind(owner_id)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Store(format!("delete lease: {e}")))?;

        if result.rows_affected() > 0 {
            Ok(Released::Deleted)
        } else {
            Ok(Released::NotOwner)
        }
    }

    #[instrument(skip_all, fields(region = %region))]
    async fn sweep_expired(&self, region: &str) -> LockResult<u64> {
        let now = Self::now_epoch_millis();
        let result = sqlx::query(
            r#"DELETE FROM lock_leases WHERE region = ?1 AND expires_at <= ?2"#,
        )
        .bind(region)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| LockError::Store(format!("sweep expired leases: {e}")))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip_all, fields(region = %region, lock_key = %key))]
    async fn get(&self, region: &str, key: &str) -> LockResult<Option<LockLease>> {
        let row = sqlx::query(
            r#"SELECT region, lock_key, owner_id, acquired_at, expires_at, fencing_token
               FROM lock_leases WHERE region = ?1 AND lock_key = ?2"#,
        )
        .bind(region)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::Store(format!("select lease: {e}")))?;

        row.as_ref().map(Self::lease_from_row).transpose()
    }
}
