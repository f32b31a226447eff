//! Badge definition and award operations

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::models::{current_timestamp, BadgeAward};
use crate::catalog::BadgeDefinition;
use crate::error::RewardsError;

const AWARD_SELECT: &str = r#"
    SELECT a.id, a.user_id, a.badge_id, b.name AS badge_name, a.awarded_at,
           a.reason, a.source_transaction_id
    FROM badge_awards a
    LEFT JOIN badges b ON b.id = a.badge_id
"#;

// ============================================================================
// Definitions
// ============================================================================

/// Upsert configured badges so awards can be joined with their names
pub fn sync_definitions(conn: &Connection, badges: &[BadgeDefinition]) -> Result<usize, RewardsError> {
    let now = current_timestamp();
    let mut stmt = conn
        .prepare(
            r#"
            INSERT INTO badges (
                id, name, description, rarity, counter_name, threshold, points_value, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                description = excluded.description,
                rarity = excluded.rarity,
                counter_name = excluded.counter_name,
                threshold = excluded.threshold,
                points_value = excluded.points_value,
                updated_at = excluded.updated_at
            "#,
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    for badge in badges {
        let criteria = badge.award_criteria.as_ref();
        stmt.execute(params![
            badge.id,
            badge.name,
            badge.description,
            badge.rarity.as_str(),
            criteria.map(|c| c.counter_name.as_str()),
            criteria.map(|c| c.threshold),
            badge.points_value,
            now,
        ])
        .map_err(|e| RewardsError::db("Badge upsert failed", e))?;
    }

    Ok(badges.len())
}

// ============================================================================
// Awards
// ============================================================================

/// Record an award unless the user already holds the badge
pub fn insert_award_if_absent(
    conn: &Connection,
    user_id: &str,
    badge_id: &str,
    reason: &str,
    source_transaction_id: Option<&str>,
) -> Result<Option<BadgeAward>, RewardsError> {
    let id = Uuid::new_v4().to_string();

    let changed = conn
        .execute(
            r#"
            INSERT INTO badge_awards (id, user_id, badge_id, awarded_at, reason, source_transaction_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, badge_id) DO NOTHING
            "#,
            params![id, user_id, badge_id, current_timestamp(), reason, source_transaction_id],
        )
        .map_err(|e| RewardsError::db("Award insert failed", e))?;

    if changed == 0 {
        return Ok(None);
    }

    conn.query_row(&format!("{} WHERE a.id = ?", AWARD_SELECT), params![id], BadgeAward::from_row)
        .optional()
        .map_err(|e| RewardsError::db("Query failed", e))
}

/// All awards for a user, oldest first
pub fn awards_for_user(conn: &Connection, user_id: &str) -> Result<Vec<BadgeAward>, RewardsError> {
    let sql = format!("{} WHERE a.user_id = ? ORDER BY a.awarded_at, a.rowid", AWARD_SELECT);
    let mut stmt = conn.prepare(&sql).map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![user_id], BadgeAward::from_row)
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

/// Awards caused by any of the given ledger rows
pub fn awards_for_sources(
    conn: &Connection,
    user_id: &str,
    source_ids: &[String],
) -> Result<Vec<BadgeAward>, RewardsError> {
    if source_ids.is_empty() {
        return Ok(vec![]);
    }

    let placeholders: Vec<_> = source_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "{} WHERE a.user_id = ? AND a.source_transaction_id IN ({}) ORDER BY a.awarded_at, a.rowid",
        AWARD_SELECT,
        placeholders.join(", ")
    );

    let mut params: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(source_ids.len() + 1);
    params.push(&user_id);
    for id in source_ids {
        params.push(id);
    }

    let mut stmt = conn.prepare(&sql).map_err(|e| RewardsError::db("Prepare failed", e))?;
    let rows = stmt
        .query_map(params.as_slice(), BadgeAward::from_row)
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

pub fn badge_ids_for_user(conn: &Connection, user_id: &str) -> Result<BTreeSet<String>, RewardsError> {
    let mut stmt = conn
        .prepare("SELECT badge_id FROM badge_awards WHERE user_id = ?")
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![user_id], |row| row.get(0))
        .map_err(|e| RewardsError::db("Query failed", e))?;

    rows.collect::<Result<BTreeSet<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_badges;
    use crate::db::schema::init_schema;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        sync_definitions(&conn, &default_badges()).unwrap();
        conn
    }

    #[test]
    fn test_award_once() {
        let conn = setup();
        let award = insert_award_if_absent(&conn, "u-1", "first_event", "events_attended >= 1", Some("tx-1"))
            .unwrap()
            .unwrap();
        assert_eq!(award.badge_name.as_deref(), Some("First Event"));

        let again = insert_award_if_absent(&conn, "u-1", "first_event", "events_attended >= 1", None).unwrap();
        assert!(again.is_none());
        assert_eq!(awards_for_user(&conn, "u-1").unwrap().len(), 1);
    }

    #[test]
    fn test_awards_for_sources() {
        let conn = setup();
        insert_award_if_absent(&conn, "u-1", "first_event", "r", Some("tx-1")).unwrap();
        insert_award_if_absent(&conn, "u-1", "team_player", "r", Some("tx-2")).unwrap();

        let found = awards_for_sources(&conn, "u-1", &["tx-2".to_string()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].badge_id, "team_player");
        assert!(awards_for_sources(&conn, "u-1", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_sync_is_upsert() {
        let conn = setup();
        let mut badges = default_badges();
        badges[0].name = "Renamed".into();
        sync_definitions(&conn, &badges).unwrap();

        let name: String = conn
            .query_row("SELECT name FROM badges WHERE id = ?", params![badges[0].id], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "Renamed");
    }
}
