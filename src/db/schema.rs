//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::RewardsError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), RewardsError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, RewardsError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| RewardsError::db("Failed to create schema_version table", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(RewardsError::db("Failed to read schema_version", other)),
        })?;

    Ok(version.unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), RewardsError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| RewardsError::db("Failed to clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| RewardsError::db("Failed to set schema_version", e))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), RewardsError> {
    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| RewardsError::db("Failed to create ledger tables", e))?;

    conn.execute_batch(AGGREGATE_SCHEMA)
        .map_err(|e| RewardsError::db("Failed to create aggregate tables", e))?;

    conn.execute_batch(BADGE_SCHEMA)
        .map_err(|e| RewardsError::db("Failed to create badge tables", e))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| RewardsError::db("Failed to create indexes", e))?;

    create_v2_tables(conn)?;

    Ok(())
}

/// Append-only guard on the ledger and the persisted reconciliation queue
fn create_v2_tables(conn: &Connection) -> Result<(), RewardsError> {
    conn.execute_batch(LEDGER_GUARD_SCHEMA)
        .map_err(|e| RewardsError::db("Failed to create ledger guards", e))?;

    conn.execute_batch(RECONCILIATION_SCHEMA)
        .map_err(|e| RewardsError::db("Failed to create reconciliation table", e))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), RewardsError> {
    if from_version < 2 {
        create_v2_tables(conn)?;
    }
    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Points ledger schema
const LEDGER_SCHEMA: &str = r#"
-- Append-only point transactions. The UNIQUE constraint is the dedup key:
-- a retried trigger collides here and becomes a no-op.
CREATE TABLE IF NOT EXISTS points_transactions (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    amount INTEGER NOT NULL,
    trigger_type TEXT NOT NULL,
    reference_type TEXT NOT NULL,
    reference_id TEXT NOT NULL,
    rule_id TEXT,

    -- 1 on the entry that bumped the trigger's occurrence counter
    counted INTEGER NOT NULL DEFAULT 0,
    -- Streak day (YYYY-MM-DD) the counted entry contributed, if any
    activity_date TEXT,

    occurred_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),

    UNIQUE (user_id, trigger_type, reference_type, reference_id)
);
"#;

/// User aggregate schema
const AGGREGATE_SCHEMA: &str = r#"
-- Materialized per-user view; rebuilt from the ledger on reconciliation
CREATE TABLE IF NOT EXISTS user_aggregates (
    user_id TEXT PRIMARY KEY NOT NULL,
    total_points INTEGER NOT NULL DEFAULT 0,
    level INTEGER NOT NULL DEFAULT 1,
    tier TEXT NOT NULL,

    -- Streak
    streak_days INTEGER NOT NULL DEFAULT 0,
    best_streak INTEGER NOT NULL DEFAULT 0,
    last_activity_date TEXT,
    utc_offset_minutes INTEGER,

    -- Occurrence counters
    events_attended INTEGER NOT NULL DEFAULT 0,
    events_completed INTEGER NOT NULL DEFAULT 0,
    feedback_submitted INTEGER NOT NULL DEFAULT 0,
    activities_completed INTEGER NOT NULL DEFAULT 0,
    recognitions_sent INTEGER NOT NULL DEFAULT 0,
    recognitions_received INTEGER NOT NULL DEFAULT 0,
    surveys_completed INTEGER NOT NULL DEFAULT 0,
    profiles_completed INTEGER NOT NULL DEFAULT 0,
    teams_joined INTEGER NOT NULL DEFAULT 0,

    version INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);
"#;

/// Badge definitions and awards schema
const BADGE_SCHEMA: &str = r#"
-- Badge definitions, synced from configuration at startup
CREATE TABLE IF NOT EXISTS badges (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    rarity TEXT NOT NULL DEFAULT 'common',
    counter_name TEXT,
    threshold INTEGER,
    points_value INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

-- Immutable awards; a badge is earned at most once per user
CREATE TABLE IF NOT EXISTS badge_awards (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    badge_id TEXT NOT NULL,
    awarded_at TEXT NOT NULL,
    reason TEXT NOT NULL,
    source_transaction_id TEXT,

    UNIQUE (user_id, badge_id)
);
"#;

/// Ledger rows are never rewritten or removed
const LEDGER_GUARD_SCHEMA: &str = r#"
CREATE TRIGGER IF NOT EXISTS points_transactions_no_update
BEFORE UPDATE ON points_transactions
BEGIN
    SELECT RAISE(ABORT, 'points_transactions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS points_transactions_no_delete
BEFORE DELETE ON points_transactions
BEGIN
    SELECT RAISE(ABORT, 'points_transactions is append-only');
END;
"#;

/// Reconciliation queue schema
const RECONCILIATION_SCHEMA: &str = r#"
-- Users whose aggregate may lag the ledger; survives restarts
CREATE TABLE IF NOT EXISTS reconciliation_queue (
    user_id TEXT PRIMARY KEY NOT NULL,
    reason TEXT NOT NULL,
    flagged_at TEXT NOT NULL
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
CREATE INDEX IF NOT EXISTS idx_points_user_created ON points_transactions(user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_points_user_trigger ON points_transactions(user_id, trigger_type);
CREATE INDEX IF NOT EXISTS idx_aggregates_total ON user_aggregates(total_points DESC);
CREATE INDEX IF NOT EXISTS idx_badge_awards_source ON badge_awards(source_transaction_id);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_ledger_unique_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let insert = "INSERT INTO points_transactions \
            (id, user_id, amount, trigger_type, reference_type, reference_id, occurred_at) \
            VALUES (?, 'u', 10, 'team_join', 'team', 'r-1', '2024-01-01T00:00:00Z')";
        conn.execute(insert, ["a"]).unwrap();
        assert!(conn.execute(insert, ["b"]).is_err());
    }

    #[test]
    fn test_ledger_rejects_update_and_delete() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO points_transactions \
             (id, user_id, amount, trigger_type, reference_type, reference_id, occurred_at) \
             VALUES ('a', 'u', 10, 'team_join', 'team', 'r-1', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        assert!(conn.execute("UPDATE points_transactions SET counted = 1", []).is_err());
        assert!(conn.execute("DELETE FROM points_transactions", []).is_err());
        let amount: i64 = conn
            .query_row("SELECT amount FROM points_transactions WHERE id = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(amount, 10);
    }

    #[test]
    fn test_migrates_v1_database() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn.execute_batch(
            "DROP TABLE reconciliation_queue; \
             DROP TRIGGER points_transactions_no_update; \
             DROP TRIGGER points_transactions_no_delete;",
        )
        .unwrap();
        set_schema_version(&conn, 1).unwrap();

        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        conn.execute(
            "INSERT INTO reconciliation_queue (user_id, reason, flagged_at) VALUES ('u', 'x', 'now')",
            [],
        )
        .unwrap();
    }
}
