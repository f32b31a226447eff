//! SQLite persistence for the rewards engine
//!
//! ## Tables
//!
//! - `points_transactions` - append-only ledger, unique on the dedup key
//! - `user_aggregates` - materialized per-user totals, counters, streak
//! - `badges` - badge definitions synced from configuration
//! - `badge_awards` - one row per (user, badge)
//! - `reconciliation_queue` - users whose aggregate may lag the ledger
//!
//! ## Concurrency
//!
//! The repository holds several connections to the same database file.
//! A user is pinned to one connection by hashing the user id, so units of
//! work for one user queue on that connection's mutex while other users
//! proceed on the others. SQLite still serializes writers across
//! connections; WAL plus a busy timeout keep that wait short.

pub mod aggregates;
pub mod badges;
pub mod ledger;
pub mod models;
pub mod reconciliation;
pub mod schema;
pub mod work;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::catalog::BadgeDefinition;
use crate::error::RewardsError;
use crate::repository::{
    BadgeGrant, DedupKey, GrantOutcome, LedgerBatch, LedgerOutcome, LedgerPrefix, RebuildOutcome,
    RewardsRepository,
};
use crate::tier::TierTable;
use models::{BadgeAward, LeaderboardEntry, PendingReconciliation, PointsTransaction, UserAggregate};

/// Database file name inside the storage directory
pub const DB_FILE: &str = "rewards.db";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`RewardsRepository`]
pub struct SqliteRepository {
    shards: Vec<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create the rewards database with `connections` connection shards
    pub fn open(storage_dir: &Path, connections: usize) -> Result<Self, RewardsError> {
        std::fs::create_dir_all(storage_dir)?;
        let db_path = storage_dir.join(DB_FILE);
        info!("Opening SQLite database at {:?} with {} connections", db_path, connections.max(1));

        let mut shards = Vec::with_capacity(connections.max(1));
        for i in 0..connections.max(1) {
            let conn = Connection::open(&db_path)
                .map_err(|e| RewardsError::db("Failed to open SQLite", e))?;

            conn.busy_timeout(BUSY_TIMEOUT)
                .map_err(|e| RewardsError::db("Failed to set busy timeout", e))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
                .map_err(|e| RewardsError::db("Failed to set PRAGMA", e))?;

            if i == 0 {
                schema::init_schema(&conn)?;
            }
            shards.push(Mutex::new(conn));
        }

        Ok(Self { shards })
    }

    /// Open an in-memory database (for testing). Always a single connection.
    pub fn open_in_memory() -> Result<Self, RewardsError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| RewardsError::db("Failed to open in-memory SQLite", e))?;
        schema::init_schema(&conn)?;

        Ok(Self {
            shards: vec![Mutex::new(conn)],
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, user_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn lock(&self, index: usize) -> Result<MutexGuard<'_, Connection>, RewardsError> {
        self.shards[index]
            .lock()
            .map_err(|e| RewardsError::Internal(format!("Lock poisoned: {}", e)))
    }

    /// Run a read against the user's connection
    pub fn with_conn<F, T>(&self, user_id: &str, f: F) -> Result<T, RewardsError>
    where
        F: FnOnce(&Connection) -> Result<T, RewardsError>,
    {
        let conn = self.lock(self.shard_index(user_id))?;
        f(&conn)
    }

    /// Run a unit of work with exclusive access to the user's connection
    pub fn with_conn_mut<F, T>(&self, user_id: &str, f: F) -> Result<T, RewardsError>
    where
        F: FnOnce(&mut Connection) -> Result<T, RewardsError>,
    {
        let mut conn = self.lock(self.shard_index(user_id))?;
        f(&mut conn)
    }

    /// Cross-user queries go through the first connection
    fn with_any_conn<F, T>(&self, f: F) -> Result<T, RewardsError>
    where
        F: FnOnce(&Connection) -> Result<T, RewardsError>,
    {
        let conn = self.lock(0)?;
        f(&conn)
    }
}

impl RewardsRepository for SqliteRepository {
    fn apply_ledger_batch(&self, batch: &LedgerBatch, tiers: &TierTable) -> Result<LedgerOutcome, RewardsError> {
        self.with_conn_mut(&batch.user_id, |conn| work::apply_ledger_batch(conn, batch, tiers))
    }

    fn grant_badge(&self, grant: &BadgeGrant, tiers: &TierTable) -> Result<Option<GrantOutcome>, RewardsError> {
        self.with_conn_mut(&grant.user_id, |conn| work::grant_badge(conn, grant, tiers))
    }

    fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>, RewardsError> {
        self.with_conn(user_id, |conn| aggregates::get(conn, user_id))
    }

    fn transactions_for_keys(&self, keys: &[DedupKey]) -> Result<Vec<PointsTransaction>, RewardsError> {
        let Some(first) = keys.first() else {
            return Ok(vec![]);
        };
        self.with_conn(&first.user_id, |conn| {
            let mut found = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(row) = ledger::find_by_key(conn, key)? {
                    found.push(row);
                }
            }
            Ok(found)
        })
    }

    fn awards_for_sources(&self, user_id: &str, source_ids: &[String]) -> Result<Vec<BadgeAward>, RewardsError> {
        self.with_conn(user_id, |conn| badges::awards_for_sources(conn, user_id, source_ids))
    }

    fn transactions_for_user(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<PointsTransaction>, RewardsError> {
        self.with_conn(user_id, |conn| ledger::list_for_user(conn, user_id, limit, offset))
    }

    fn ledger_through(&self, user_id: &str, transaction_ids: &[String]) -> Result<Option<LedgerPrefix>, RewardsError> {
        self.with_conn(user_id, |conn| {
            let Some(position) = ledger::last_position(conn, user_id, transaction_ids)? else {
                return Ok(None);
            };
            let (total_points, activity_dates) = ledger::prefix(conn, user_id, position)?;
            Ok(Some(LedgerPrefix {
                total_points,
                activity_dates,
            }))
        })
    }

    fn rule_transactions(&self, user_id: &str) -> Result<Vec<PointsTransaction>, RewardsError> {
        self.with_conn(user_id, |conn| ledger::rule_rows_for_user(conn, user_id))
    }

    fn awards_for_user(&self, user_id: &str) -> Result<Vec<BadgeAward>, RewardsError> {
        self.with_conn(user_id, |conn| badges::awards_for_user(conn, user_id))
    }

    fn ledger_total(&self, user_id: &str) -> Result<i64, RewardsError> {
        self.with_conn(user_id, |conn| ledger::sum_for_user(conn, user_id))
    }

    fn leaderboard(&self, limit: u32) -> Result<Vec<LeaderboardEntry>, RewardsError> {
        self.with_any_conn(|conn| aggregates::leaderboard(conn, limit))
    }

    fn sync_badges(&self, definitions: &[BadgeDefinition]) -> Result<(), RewardsError> {
        let synced = self.with_any_conn(|conn| badges::sync_definitions(conn, definitions))?;
        info!("Synced {} badge definitions", synced);
        Ok(())
    }

    fn rebuild_aggregate(&self, user_id: &str, tiers: &TierTable) -> Result<RebuildOutcome, RewardsError> {
        self.with_conn_mut(user_id, |conn| work::rebuild_aggregate(conn, user_id, tiers))
    }

    fn flag_reconciliation(&self, entry: &PendingReconciliation) -> Result<(), RewardsError> {
        self.with_conn(&entry.user_id, |conn| reconciliation::flag(conn, entry))
    }

    fn clear_reconciliation(&self, user_id: &str) -> Result<(), RewardsError> {
        self.with_conn(user_id, |conn| reconciliation::clear(conn, user_id).map(|_| ()))
    }

    fn pending_reconciliations(&self) -> Result<Vec<PendingReconciliation>, RewardsError> {
        self.with_any_conn(reconciliation::list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_file_database_with_shards() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteRepository::open(dir.path(), 3).unwrap();
        assert_eq!(repo.shard_count(), 3);
        assert!(dir.path().join(DB_FILE).exists());

        // Every shard sees the same file
        repo.with_conn("a", |conn| {
            aggregates::ensure(conn, "a", "Bronze")?;
            Ok(())
        })
        .unwrap();
        for i in 0..repo.shard_count() {
            let conn = repo.lock(i).unwrap();
            assert!(aggregates::get(&conn, "a").unwrap().is_some());
        }
    }

    #[test]
    fn test_shard_is_stable() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteRepository::open(dir.path(), 4).unwrap();
        assert_eq!(repo.shard_index("user-42"), repo.shard_index("user-42"));
    }

    #[test]
    fn test_reconciliation_queue_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let repo = SqliteRepository::open(dir.path(), 2).unwrap();
            repo.flag_reconciliation(&PendingReconciliation {
                user_id: "alice".into(),
                reason: "database is locked".into(),
                flagged_at: models::current_timestamp(),
            })
            .unwrap();
        }

        let reopened = SqliteRepository::open(dir.path(), 2).unwrap();
        let pending = reopened.pending_reconciliations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].user_id, "alice");

        reopened.clear_reconciliation("alice").unwrap();
        assert!(reopened.pending_reconciliations().unwrap().is_empty());
    }

    #[test]
    fn test_zero_connections_opens_one() {
        let dir = TempDir::new().unwrap();
        let repo = SqliteRepository::open(dir.path(), 0).unwrap();
        assert_eq!(repo.shard_count(), 1);
    }
}
