//! Units of work spanning the ledger, awards and aggregate tables
//!
//! Each function runs in one `BEGIN IMMEDIATE` transaction. The write lock
//! is taken up front, so concurrent units of work for the same database
//! queue on the busy timeout instead of failing mid-transaction.

use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;

use super::models::{UserAggregate, DATE_FORMAT};
use super::{aggregates, badges, ledger};
use crate::catalog::{TriggerKind, BADGE_REFERENCE_TYPE};
use crate::error::RewardsError;
use crate::repository::{BadgeGrant, GrantOutcome, LedgerBatch, LedgerOutcome, RebuildOutcome};
use crate::streak::{self, StreakState};
use crate::tier::TierTable;

fn begin(conn: &mut Connection) -> Result<rusqlite::Transaction<'_>, RewardsError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| RewardsError::db("Transaction failed", e))
}

fn load(conn: &Connection, user_id: &str) -> Result<UserAggregate, RewardsError> {
    aggregates::get(conn, user_id)?
        .ok_or_else(|| RewardsError::Internal(format!("Aggregate for {} missing inside transaction", user_id)))
}

/// Append a trigger's ledger rows and fold them into the aggregate.
///
/// The occurrence counter and streak only move when every row of the batch
/// is new. A batch whose rows all exist is a duplicate and changes nothing.
pub fn apply_ledger_batch(
    conn: &mut Connection,
    batch: &LedgerBatch,
    tiers: &TierTable,
) -> Result<LedgerOutcome, RewardsError> {
    let tx = begin(conn)?;

    aggregates::ensure(&tx, &batch.user_id, tiers.lowest())?;
    let before = load(&tx, &batch.user_id)?;
    let occurred_at = batch.occurred_at.to_rfc3339();

    // The write lock is held, so keys found absent here stay absent until commit
    let mut present = 0;
    for key in batch.keys() {
        if ledger::find_by_key(&tx, &key)?.is_some() {
            present += 1;
        }
    }
    if present == batch.entries.len() {
        debug!(user_id = %batch.user_id, trigger_type = %batch.trigger_type, "All ledger keys already present");
        tx.commit().map_err(|e| RewardsError::db("Commit failed", e))?;
        return Ok(LedgerOutcome {
            inserted: Vec::new(),
            counted: false,
            streak_updated: false,
            previous_tier: before.tier.clone(),
            aggregate: before,
        });
    }

    let counted = present == 0;
    let offset = batch.utc_offset_minutes.or(before.utc_offset_minutes);
    let streak_day = (counted && batch.streak_relevant).then(|| streak::activity_day(batch.occurred_at, offset));
    let activity_date = streak_day.map(|d| d.format(DATE_FORMAT).to_string());

    let mut inserted = Vec::with_capacity(batch.entries.len());
    for entry in &batch.entries {
        let first = counted && inserted.is_empty();
        let row = ledger::insert_if_absent(
            &tx,
            &ledger::NewTransaction {
                user_id: &batch.user_id,
                amount: entry.amount,
                trigger_type: batch.trigger_type.as_str(),
                reference_type: &entry.reference_type,
                reference_id: &entry.reference_id,
                rule_id: Some(&entry.rule_id),
                occurred_at: &occurred_at,
                counted: first,
                activity_date: if first { activity_date.as_deref() } else { None },
            },
        )?;
        if let Some(row) = row {
            inserted.push(row);
        }
    }

    let delta: i64 = inserted.iter().map(|t| t.amount).sum();
    aggregates::increment(
        &tx,
        &batch.user_id,
        delta,
        counted.then_some(batch.counter),
        batch.utc_offset_minutes,
    )?;

    let mut streak_updated = false;
    if let Some(day) = streak_day {
        let next = streak::advance(before.streak_state(), day);
        aggregates::write_streak(&tx, &batch.user_id, &next)?;
        streak_updated = next != before.streak_state();
    }

    let previous_tier = aggregates::refresh_standing(&tx, &batch.user_id, tiers)?;
    let aggregate = load(&tx, &batch.user_id)?;

    tx.commit().map_err(|e| RewardsError::db("Commit failed", e))?;

    Ok(LedgerOutcome {
        inserted,
        counted,
        streak_updated,
        previous_tier,
        aggregate,
    })
}

/// Record a badge award plus its bonus ledger row, if the user lacks the badge
pub fn grant_badge(
    conn: &mut Connection,
    grant: &BadgeGrant,
    tiers: &TierTable,
) -> Result<Option<GrantOutcome>, RewardsError> {
    let tx = begin(conn)?;

    aggregates::ensure(&tx, &grant.user_id, tiers.lowest())?;

    let award = badges::insert_award_if_absent(
        &tx,
        &grant.user_id,
        &grant.badge_id,
        &grant.reason,
        grant.source_transaction_id.as_deref(),
    )?;
    let Some(award) = award else {
        tx.commit().map_err(|e| RewardsError::db("Commit failed", e))?;
        return Ok(None);
    };

    let mut bonus = None;
    if grant.bonus_points > 0 {
        let occurred_at = grant.occurred_at.to_rfc3339();
        bonus = ledger::insert_if_absent(
            &tx,
            &ledger::NewTransaction {
                user_id: &grant.user_id,
                amount: grant.bonus_points,
                trigger_type: TriggerKind::BadgeAward.as_str(),
                reference_type: BADGE_REFERENCE_TYPE,
                reference_id: &grant.badge_id,
                rule_id: None,
                occurred_at: &occurred_at,
                counted: false,
                activity_date: None,
            },
        )?;
        if let Some(ref row) = bonus {
            aggregates::increment(&tx, &grant.user_id, row.amount, None, None)?;
        }
    }

    let previous_tier = aggregates::refresh_standing(&tx, &grant.user_id, tiers)?;
    let aggregate = load(&tx, &grant.user_id)?;

    tx.commit().map_err(|e| RewardsError::db("Commit failed", e))?;

    Ok(Some(GrantOutcome {
        award,
        bonus,
        previous_tier,
        aggregate,
    }))
}

/// Recompute totals, counters, streak and standing from the ledger
pub fn rebuild_aggregate(
    conn: &mut Connection,
    user_id: &str,
    tiers: &TierTable,
) -> Result<RebuildOutcome, RewardsError> {
    let tx = begin(conn)?;

    let before = aggregates::get(&tx, user_id)?;
    aggregates::ensure(&tx, user_id, tiers.lowest())?;

    let mut rebuilt = UserAggregate::empty(user_id, tiers.lowest());
    rebuilt.total_points = ledger::sum_for_user(&tx, user_id)?;

    for (trigger_type, count) in ledger::counted_by_trigger(&tx, user_id)? {
        match TriggerKind::parse(&trigger_type) {
            Some(kind) => rebuilt.set_counter(kind.counter(), count),
            None => debug!(user_id, trigger_type = %trigger_type, "Skipping unknown trigger type in ledger"),
        }
    }

    let mut days = Vec::new();
    for raw in ledger::activity_dates(&tx, user_id)? {
        let day = chrono::NaiveDate::parse_from_str(&raw, DATE_FORMAT)
            .map_err(|e| RewardsError::Internal(format!("Bad activity_date {}: {}", raw, e)))?;
        days.push(day);
    }
    let StreakState {
        streak_days,
        best_streak,
        last_activity_date,
    } = streak::replay(days);
    rebuilt.streak_days = streak_days;
    rebuilt.best_streak = best_streak;
    rebuilt.last_activity_date = last_activity_date;

    let standing = tiers.standing(rebuilt.total_points);
    rebuilt.level = standing.level;
    rebuilt.tier = standing.tier;

    aggregates::overwrite(&tx, &rebuilt)?;
    let after = load(&tx, user_id)?;

    tx.commit().map_err(|e| RewardsError::db("Commit failed", e))?;

    Ok(RebuildOutcome { before, after })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Counter;
    use crate::db::schema::init_schema;
    use crate::repository::LedgerEntry;
    use chrono::{DateTime, Utc};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn at(ts: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
    }

    fn attendance(reference_id: &str, ts: &str) -> LedgerBatch {
        LedgerBatch {
            user_id: "u-1".into(),
            trigger_type: TriggerKind::EventAttendance,
            entries: vec![LedgerEntry {
                rule_id: "attend_event".into(),
                reference_type: "participation".into(),
                reference_id: reference_id.into(),
                amount: 10,
            }],
            counter: Counter::EventsAttended,
            occurred_at: at(ts),
            utc_offset_minutes: None,
            streak_relevant: true,
        }
    }

    #[test]
    fn test_batch_then_duplicate() {
        let mut conn = setup();
        let tiers = TierTable::default();

        let first = apply_ledger_batch(&mut conn, &attendance("p-1", "2024-01-15T10:00:00Z"), &tiers).unwrap();
        assert_eq!(first.points_delta(), 10);
        assert!(first.counted);
        assert!(first.streak_updated);
        assert_eq!(first.aggregate.events_attended, 1);
        assert_eq!(first.aggregate.streak_days, 1);

        let second = apply_ledger_batch(&mut conn, &attendance("p-1", "2024-01-15T10:00:00Z"), &tiers).unwrap();
        assert!(second.is_duplicate());
        assert_eq!(second.aggregate, first.aggregate);
    }

    #[test]
    fn test_partial_batch_does_not_count() {
        let mut conn = setup();
        let tiers = TierTable::default();
        apply_ledger_batch(&mut conn, &attendance("p-1", "2024-01-15T10:00:00Z"), &tiers).unwrap();

        let mut widened = attendance("p-1", "2024-01-15T10:00:00Z");
        widened.entries.push(LedgerEntry {
            rule_id: "bonus".into(),
            reference_type: "bonus".into(),
            reference_id: "p-1".into(),
            amount: 5,
        });
        let outcome = apply_ledger_batch(&mut conn, &widened, &tiers).unwrap();
        assert_eq!(outcome.points_delta(), 5);
        assert!(!outcome.counted);
        assert_eq!(outcome.aggregate.events_attended, 1);
        assert_eq!(outcome.aggregate.total_points, 15);
    }

    #[test]
    fn test_grant_badge_once_with_bonus() {
        let mut conn = setup();
        let tiers = TierTable::default();
        let grant = BadgeGrant {
            user_id: "u-1".into(),
            badge_id: "first_event".into(),
            reason: "events_attended >= 1".into(),
            source_transaction_id: None,
            bonus_points: 10,
            occurred_at: at("2024-01-15T10:00:00Z"),
        };

        let outcome = grant_badge(&mut conn, &grant, &tiers).unwrap().unwrap();
        assert_eq!(outcome.bonus.as_ref().map(|b| b.amount), Some(10));
        assert_eq!(outcome.aggregate.total_points, 10);
        assert!(outcome.aggregate.badges_earned.contains("first_event"));

        assert!(grant_badge(&mut conn, &grant, &tiers).unwrap().is_none());
        assert_eq!(ledger::sum_for_user(&conn, "u-1").unwrap(), 10);
    }

    #[test]
    fn test_rebuild_repairs_drift() {
        let mut conn = setup();
        let tiers = TierTable::default();
        for (i, ts) in ["2024-01-15T10:00:00Z", "2024-01-16T10:00:00Z"].iter().enumerate() {
            apply_ledger_batch(&mut conn, &attendance(&format!("p-{}", i), ts), &tiers).unwrap();
        }
        conn.execute(
            "UPDATE user_aggregates SET total_points = 999, events_attended = 0, streak_days = 0",
            [],
        )
        .unwrap();

        let outcome = rebuild_aggregate(&mut conn, "u-1", &tiers).unwrap();
        assert_eq!(outcome.before.unwrap().total_points, 999);
        assert_eq!(outcome.after.total_points, 20);
        assert_eq!(outcome.after.events_attended, 2);
        assert_eq!(outcome.after.streak_days, 2);
        assert_eq!(outcome.after.tier, "Bronze");
    }
}
