//! Persisted reconciliation queue
//!
//! One row per flagged user. Re-flagging replaces the reason and time.

use rusqlite::{params, Connection};

use super::models::PendingReconciliation;
use crate::error::RewardsError;

pub fn flag(conn: &Connection, entry: &PendingReconciliation) -> Result<(), RewardsError> {
    conn.execute(
        r#"
        INSERT INTO reconciliation_queue (user_id, reason, flagged_at)
        VALUES (?, ?, ?)
        ON CONFLICT (user_id) DO UPDATE SET
            reason = excluded.reason,
            flagged_at = excluded.flagged_at
        "#,
        params![entry.user_id, entry.reason, entry.flagged_at],
    )
    .map_err(|e| RewardsError::db("Reconciliation flag failed", e))?;
    Ok(())
}

/// Returns whether the user was queued
pub fn clear(conn: &Connection, user_id: &str) -> Result<bool, RewardsError> {
    let removed = conn
        .execute("DELETE FROM reconciliation_queue WHERE user_id = ?", params![user_id])
        .map_err(|e| RewardsError::db("Reconciliation clear failed", e))?;
    Ok(removed > 0)
}

/// Oldest first
pub fn list(conn: &Connection) -> Result<Vec<PendingReconciliation>, RewardsError> {
    let mut stmt = conn
        .prepare("SELECT * FROM reconciliation_queue ORDER BY flagged_at ASC, user_id ASC")
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map([], PendingReconciliation::from_row)
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn entry(user_id: &str, reason: &str, flagged_at: &str) -> PendingReconciliation {
        PendingReconciliation {
            user_id: user_id.into(),
            reason: reason.into(),
            flagged_at: flagged_at.into(),
        }
    }

    #[test]
    fn test_flag_replaces_and_clear_removes() {
        let conn = setup();
        flag(&conn, &entry("bob", "disk full", "2024-01-02T00:00:00Z")).unwrap();
        flag(&conn, &entry("alice", "locked", "2024-01-01T00:00:00Z")).unwrap();
        flag(&conn, &entry("bob", "locked again", "2024-01-03T00:00:00Z")).unwrap();

        let queued = list(&conn).unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].user_id, "alice");
        assert_eq!(queued[1].reason, "locked again");

        assert!(clear(&conn, "bob").unwrap());
        assert!(!clear(&conn, "bob").unwrap());
        assert_eq!(list(&conn).unwrap().len(), 1);
    }
}
