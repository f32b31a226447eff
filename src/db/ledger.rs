//! Points ledger operations
//!
//! Rows are only ever inserted. A retried trigger hits the
//! `(user_id, trigger_type, reference_type, reference_id)` constraint and
//! the insert becomes a no-op, which the caller detects from the changed
//! row count.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::models::{current_timestamp, PointsTransaction};
use crate::error::RewardsError;
use crate::repository::DedupKey;

/// Input for a ledger insert
#[derive(Debug, Clone)]
pub struct NewTransaction<'a> {
    pub user_id: &'a str,
    pub amount: i64,
    pub trigger_type: &'a str,
    pub reference_type: &'a str,
    pub reference_id: &'a str,
    pub rule_id: Option<&'a str>,
    pub occurred_at: &'a str,
    /// Row that bumps its trigger's occurrence counter
    pub counted: bool,
    /// Streak day credited by this row
    pub activity_date: Option<&'a str>,
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert a ledger row unless its dedup key already exists.
///
/// Returns the new row, or None when the key was taken.
pub fn insert_if_absent(conn: &Connection, input: &NewTransaction) -> Result<Option<PointsTransaction>, RewardsError> {
    let id = Uuid::new_v4().to_string();

    let changed = conn
        .execute(
            r#"
            INSERT INTO points_transactions (
                id, user_id, amount, trigger_type, reference_type, reference_id,
                rule_id, occurred_at, counted, activity_date, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, trigger_type, reference_type, reference_id) DO NOTHING
            "#,
            params![
                id,
                input.user_id,
                input.amount,
                input.trigger_type,
                input.reference_type,
                input.reference_id,
                input.rule_id,
                input.occurred_at,
                input.counted,
                input.activity_date,
                current_timestamp(),
            ],
        )
        .map_err(|e| RewardsError::db("Ledger insert failed", e))?;

    if changed == 0 {
        return Ok(None);
    }

    get_transaction(conn, &id)?
        .map(Some)
        .ok_or_else(|| RewardsError::Internal(format!("Ledger row {} not found after insert", id)))
}

// ============================================================================
// Read Operations
// ============================================================================

pub fn get_transaction(conn: &Connection, id: &str) -> Result<Option<PointsTransaction>, RewardsError> {
    conn.query_row(
        "SELECT * FROM points_transactions WHERE id = ?",
        params![id],
        PointsTransaction::from_row,
    )
    .optional()
    .map_err(|e| RewardsError::db("Query failed", e))
}

/// Look up the row holding a dedup key
pub fn find_by_key(conn: &Connection, key: &DedupKey) -> Result<Option<PointsTransaction>, RewardsError> {
    conn.query_row(
        r#"
        SELECT * FROM points_transactions
        WHERE user_id = ? AND trigger_type = ? AND reference_type = ? AND reference_id = ?
        "#,
        params![key.user_id, key.trigger_type.as_str(), key.reference_type, key.reference_id],
        PointsTransaction::from_row,
    )
    .optional()
    .map_err(|e| RewardsError::db("Query failed", e))
}

/// Rows written by a catalog rule, oldest first
pub fn rule_rows_for_user(conn: &Connection, user_id: &str) -> Result<Vec<PointsTransaction>, RewardsError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM points_transactions
            WHERE user_id = ? AND rule_id IS NOT NULL
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![user_id], PointsTransaction::from_row)
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

/// Newest first
pub fn list_for_user(
    conn: &Connection,
    user_id: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<PointsTransaction>, RewardsError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT * FROM points_transactions
            WHERE user_id = ?
            ORDER BY created_at DESC, rowid DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![user_id, limit as i64, offset as i64], PointsTransaction::from_row)
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

pub fn sum_for_user(conn: &Connection, user_id: &str) -> Result<i64, RewardsError> {
    conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM points_transactions WHERE user_id = ?",
        params![user_id],
        |row| row.get(0),
    )
    .map_err(|e| RewardsError::db("Query failed", e))
}

/// Counted occurrences per trigger type
pub fn counted_by_trigger(conn: &Connection, user_id: &str) -> Result<Vec<(String, i64)>, RewardsError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT trigger_type, COUNT(*) FROM points_transactions
            WHERE user_id = ? AND counted = 1
            GROUP BY trigger_type
            "#,
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

/// Every streak day recorded for a user, in no particular order
pub fn activity_dates(conn: &Connection, user_id: &str) -> Result<Vec<String>, RewardsError> {
    let mut stmt = conn
        .prepare(
            "SELECT activity_date FROM points_transactions \
             WHERE user_id = ? AND activity_date IS NOT NULL",
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![user_id], |row| row.get(0))
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

/// Insert position of the latest of `ids`; None when none of them exist
pub fn last_position(conn: &Connection, user_id: &str, ids: &[String]) -> Result<Option<i64>, RewardsError> {
    let mut last = None;
    for id in ids {
        let position: Option<i64> = conn
            .query_row(
                "SELECT rowid FROM points_transactions WHERE id = ? AND user_id = ?",
                params![id, user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RewardsError::db("Query failed", e))?;
        last = last.max(position);
    }
    Ok(last)
}

/// Ledger sum and streak days of the rows written up to `position`
pub fn prefix(conn: &Connection, user_id: &str, position: i64) -> Result<(i64, Vec<String>), RewardsError> {
    let total: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM points_transactions WHERE user_id = ? AND rowid <= ?",
            params![user_id, position],
            |row| row.get(0),
        )
        .map_err(|e| RewardsError::db("Sum failed", e))?;

    let mut stmt = conn
        .prepare(
            "SELECT activity_date FROM points_transactions \
             WHERE user_id = ? AND rowid <= ? AND activity_date IS NOT NULL",
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let days = stmt
        .query_map(params![user_id, position], |row| row.get(0))
        .map_err(|e| RewardsError::db("Query failed", e))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))?;

    Ok((total, days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TriggerKind;
    use crate::db::schema::init_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn entry<'a>(reference_id: &'a str, amount: i64) -> NewTransaction<'a> {
        NewTransaction {
            user_id: "u-1",
            amount,
            trigger_type: "event_attendance",
            reference_type: "participation",
            reference_id,
            rule_id: Some("attend_event"),
            occurred_at: "2024-01-15T10:00:00Z",
            counted: false,
            activity_date: None,
        }
    }

    #[test]
    fn test_insert_and_conflict() {
        let conn = setup();
        let first = insert_if_absent(&conn, &entry("p-1", 10)).unwrap();
        assert!(first.is_some());
        let again = insert_if_absent(&conn, &entry("p-1", 10)).unwrap();
        assert!(again.is_none());
        assert_eq!(sum_for_user(&conn, "u-1").unwrap(), 10);
    }

    #[test]
    fn test_find_by_key() {
        let conn = setup();
        let row = insert_if_absent(&conn, &entry("p-1", 10)).unwrap().unwrap();
        let key = DedupKey {
            user_id: "u-1".into(),
            trigger_type: TriggerKind::EventAttendance,
            reference_type: "participation".into(),
            reference_id: "p-1".into(),
        };
        assert_eq!(find_by_key(&conn, &key).unwrap(), Some(row));

        let other = DedupKey {
            reference_id: "p-2".into(),
            ..key
        };
        assert_eq!(find_by_key(&conn, &other).unwrap(), None);
    }

    #[test]
    fn test_counted_and_activity_dates() {
        let conn = setup();
        let first = NewTransaction {
            counted: true,
            activity_date: Some("2024-01-15"),
            ..entry("p-1", 10)
        };
        let a = insert_if_absent(&conn, &first).unwrap().unwrap();
        assert!(a.counted);
        assert_eq!(a.activity_date.as_deref(), Some("2024-01-15"));
        insert_if_absent(&conn, &entry("p-2", 10)).unwrap();

        assert_eq!(counted_by_trigger(&conn, "u-1").unwrap(), vec![("event_attendance".to_string(), 1)]);
        assert_eq!(activity_dates(&conn, "u-1").unwrap(), vec!["2024-01-15".to_string()]);
    }

    #[test]
    fn test_rule_rows_skip_bonus_entries() {
        let conn = setup();
        insert_if_absent(&conn, &entry("p-1", 10)).unwrap();
        let bonus = NewTransaction {
            trigger_type: "badge_award",
            reference_type: "badge",
            reference_id: "first_event",
            rule_id: None,
            ..entry("p-1", 10)
        };
        insert_if_absent(&conn, &bonus).unwrap();

        let rows = rule_rows_for_user(&conn, "u-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].rule_id.as_deref(), Some("attend_event"));
    }

    #[test]
    fn test_prefix_stops_at_last_given_row() {
        let conn = setup();
        let a = insert_if_absent(
            &conn,
            &NewTransaction {
                activity_date: Some("2024-01-15"),
                ..entry("p-1", 10)
            },
        )
        .unwrap()
        .unwrap();
        let b = insert_if_absent(&conn, &entry("p-2", 20)).unwrap().unwrap();
        insert_if_absent(
            &conn,
            &NewTransaction {
                activity_date: Some("2024-01-16"),
                ..entry("p-3", 40)
            },
        )
        .unwrap();

        let position = last_position(&conn, "u-1", &[a.id.clone(), b.id.clone()]).unwrap().unwrap();
        let (total, days) = prefix(&conn, "u-1", position).unwrap();
        assert_eq!(total, 30);
        assert_eq!(days, vec!["2024-01-15".to_string()]);

        assert_eq!(last_position(&conn, "u-2", &[a.id]).unwrap(), None);
    }

    #[test]
    fn test_list_pagination() {
        let conn = setup();
        for i in 0..5 {
            insert_if_absent(&conn, &entry(&format!("p-{}", i), 10)).unwrap();
        }
        let page = list_for_user(&conn, "u-1", 2, 0).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].reference_id, "p-4");
        let rest = list_for_user(&conn, "u-1", 10, 2).unwrap();
        assert_eq!(rest.len(), 3);
        assert!(list_for_user(&conn, "someone-else", 10, 0).unwrap().is_empty());
    }
}
