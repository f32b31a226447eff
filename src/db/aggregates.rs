//! Per-user aggregate operations
//!
//! Point and counter changes are applied as in-place increments so that
//! two units of work never overwrite each other's totals. Level and tier
//! are recomputed from the committed total afterwards.

use rusqlite::{params, Connection, OptionalExtension};

use super::badges::badge_ids_for_user;
use super::models::{current_timestamp, LeaderboardEntry, UserAggregate, DATE_FORMAT};
use crate::catalog::Counter;
use crate::error::RewardsError;
use crate::streak::StreakState;
use crate::tier::TierTable;

/// Create the zero aggregate if the user has none yet
pub fn ensure(conn: &Connection, user_id: &str, lowest_tier: &str) -> Result<(), RewardsError> {
    conn.execute(
        "INSERT OR IGNORE INTO user_aggregates (user_id, tier, updated_at) VALUES (?, ?, ?)",
        params![user_id, lowest_tier, current_timestamp()],
    )
    .map_err(|e| RewardsError::db("Aggregate insert failed", e))?;
    Ok(())
}

/// Aggregate with its badge set loaded
pub fn get(conn: &Connection, user_id: &str) -> Result<Option<UserAggregate>, RewardsError> {
    let aggregate = conn
        .query_row(
            "SELECT * FROM user_aggregates WHERE user_id = ?",
            params![user_id],
            UserAggregate::from_row,
        )
        .optional()
        .map_err(|e| RewardsError::db("Query failed", e))?;

    match aggregate {
        Some(mut agg) => {
            agg.badges_earned = badge_ids_for_user(conn, user_id)?;
            Ok(Some(agg))
        }
        None => Ok(None),
    }
}

/// Add `points` to the total and bump `counter` by one.
///
/// A known `utc_offset_minutes` replaces the stored one.
pub fn increment(
    conn: &Connection,
    user_id: &str,
    points: i64,
    counter: Option<Counter>,
    utc_offset_minutes: Option<i32>,
) -> Result<(), RewardsError> {
    let counter_clause = match counter.and_then(|c| c.increment_column()) {
        Some(column) => format!(", {column} = {column} + 1"),
        None => String::new(),
    };

    let sql = format!(
        r#"
        UPDATE user_aggregates SET
            total_points = total_points + ?{}
            , utc_offset_minutes = COALESCE(?, utc_offset_minutes)
            , version = version + 1
            , updated_at = ?
        WHERE user_id = ?
        "#,
        counter_clause
    );

    let changed = conn
        .execute(&sql, params![points, utc_offset_minutes, current_timestamp(), user_id])
        .map_err(|e| RewardsError::db("Aggregate update failed", e))?;

    if changed == 0 {
        return Err(RewardsError::NotFound(format!("aggregate for {}", user_id)));
    }
    Ok(())
}

pub fn write_streak(conn: &Connection, user_id: &str, streak: &StreakState) -> Result<(), RewardsError> {
    let last = streak.last_activity_date.map(|d| d.format(DATE_FORMAT).to_string());
    conn.execute(
        r#"
        UPDATE user_aggregates
        SET streak_days = ?, best_streak = ?, last_activity_date = ?
        WHERE user_id = ?
        "#,
        params![streak.streak_days, streak.best_streak, last, user_id],
    )
    .map_err(|e| RewardsError::db("Streak update failed", e))?;
    Ok(())
}

/// Recompute level and tier from the stored total. Returns the tier held before.
pub fn refresh_standing(conn: &Connection, user_id: &str, tiers: &TierTable) -> Result<String, RewardsError> {
    let (total, previous_tier): (i64, String) = conn
        .query_row(
            "SELECT total_points, tier FROM user_aggregates WHERE user_id = ?",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|e| RewardsError::db("Query failed", e))?;

    let standing = tiers.standing(total);
    conn.execute(
        "UPDATE user_aggregates SET level = ?, tier = ? WHERE user_id = ?",
        params![standing.level, standing.tier, user_id],
    )
    .map_err(|e| RewardsError::db("Standing update failed", e))?;

    Ok(previous_tier)
}

/// Replace every derived column, used by ledger rebuilds
pub fn overwrite(conn: &Connection, agg: &UserAggregate) -> Result<(), RewardsError> {
    let last = agg.last_activity_date.map(|d| d.format(DATE_FORMAT).to_string());
    conn.execute(
        r#"
        UPDATE user_aggregates SET
            total_points = ?, level = ?, tier = ?,
            streak_days = ?, best_streak = ?, last_activity_date = ?,
            events_attended = ?, events_completed = ?, feedback_submitted = ?,
            activities_completed = ?, recognitions_sent = ?, recognitions_received = ?,
            surveys_completed = ?, profiles_completed = ?, teams_joined = ?,
            version = version + 1, updated_at = ?
        WHERE user_id = ?
        "#,
        params![
            agg.total_points,
            agg.level,
            agg.tier,
            agg.streak_days,
            agg.best_streak,
            last,
            agg.events_attended,
            agg.events_completed,
            agg.feedback_submitted,
            agg.activities_completed,
            agg.recognitions_sent,
            agg.recognitions_received,
            agg.surveys_completed,
            agg.profiles_completed,
            agg.teams_joined,
            current_timestamp(),
            agg.user_id,
        ],
    )
    .map_err(|e| RewardsError::db("Aggregate overwrite failed", e))?;
    Ok(())
}

/// Highest totals first; ties broken by user id
pub fn leaderboard(conn: &Connection, limit: u32) -> Result<Vec<LeaderboardEntry>, RewardsError> {
    let mut stmt = conn
        .prepare(
            r#"
            SELECT user_id, total_points, level, tier FROM user_aggregates
            ORDER BY total_points DESC, user_id ASC
            LIMIT ?
            "#,
        )
        .map_err(|e| RewardsError::db("Prepare failed", e))?;

    let rows = stmt
        .query_map(params![limit as i64], |row| {
            Ok(LeaderboardEntry {
                rank: 0,
                user_id: row.get(0)?,
                total_points: row.get(1)?,
                level: row.get(2)?,
                tier: row.get(3)?,
            })
        })
        .map_err(|e| RewardsError::db("Query failed", e))?;

    let mut entries = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RewardsError::db("Row parse failed", e))?;
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i as u32 + 1;
    }
    Ok(entries)
}
