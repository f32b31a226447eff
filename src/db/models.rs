//! Row types for the rewards tables
//!
//! SQLite stores timestamps as TEXT (ISO 8601, UTC) and calendar days as
//! `YYYY-MM-DD`.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::catalog::Counter;
use crate::streak::StreakState;

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Format used for `last_activity_date`
pub const DATE_FORMAT: &str = "%Y-%m-%d";

// ============================================================================
// Points Ledger
// ============================================================================

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointsTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub trigger_type: String,
    pub reference_type: String,
    pub reference_id: String,
    pub rule_id: Option<String>,
    /// Whether this entry bumped the trigger's occurrence counter
    pub counted: bool,
    /// Streak day this entry contributed (`YYYY-MM-DD`)
    pub activity_date: Option<String>,
    pub occurred_at: String,
    pub created_at: String,
}

impl PointsTransaction {
    pub(crate) fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            amount: row.get("amount")?,
            trigger_type: row.get("trigger_type")?,
            reference_type: row.get("reference_type")?,
            reference_id: row.get("reference_id")?,
            rule_id: row.get("rule_id")?,
            counted: row.get::<_, i64>("counted")? != 0,
            activity_date: row.get("activity_date")?,
            occurred_at: row.get("occurred_at")?,
            created_at: row.get("created_at")?,
        })
    }
}

// ============================================================================
// Aggregates
// ============================================================================

/// Materialized per-user view derived from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAggregate {
    pub user_id: String,
    pub total_points: i64,
    pub level: i64,
    pub tier: String,
    pub streak_days: i64,
    pub best_streak: i64,
    pub last_activity_date: Option<NaiveDate>,
    pub utc_offset_minutes: Option<i32>,
    pub events_attended: i64,
    pub events_completed: i64,
    pub feedback_submitted: i64,
    pub activities_completed: i64,
    pub recognitions_sent: i64,
    pub recognitions_received: i64,
    pub surveys_completed: i64,
    pub profiles_completed: i64,
    pub teams_joined: i64,
    /// Loaded from `badge_awards`
    pub badges_earned: BTreeSet<String>,
    pub version: i64,
    pub updated_at: String,
}

impl UserAggregate {
    /// Zero state for a user with no ledger entries
    pub fn empty(user_id: &str, tier: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_points: 0,
            level: 1,
            tier: tier.to_string(),
            streak_days: 0,
            best_streak: 0,
            last_activity_date: None,
            utc_offset_minutes: None,
            events_attended: 0,
            events_completed: 0,
            feedback_submitted: 0,
            activities_completed: 0,
            recognitions_sent: 0,
            recognitions_received: 0,
            surveys_completed: 0,
            profiles_completed: 0,
            teams_joined: 0,
            badges_earned: BTreeSet::new(),
            version: 0,
            updated_at: current_timestamp(),
        }
    }

    pub(crate) fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let last_activity_date = match row.get::<_, Option<String>>("last_activity_date")? {
            Some(s) => Some(NaiveDate::parse_from_str(&s, DATE_FORMAT).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
            })?),
            None => None,
        };

        Ok(Self {
            user_id: row.get("user_id")?,
            total_points: row.get("total_points")?,
            level: row.get("level")?,
            tier: row.get("tier")?,
            streak_days: row.get("streak_days")?,
            best_streak: row.get("best_streak")?,
            last_activity_date,
            utc_offset_minutes: row.get("utc_offset_minutes")?,
            events_attended: row.get("events_attended")?,
            events_completed: row.get("events_completed")?,
            feedback_submitted: row.get("feedback_submitted")?,
            activities_completed: row.get("activities_completed")?,
            recognitions_sent: row.get("recognitions_sent")?,
            recognitions_received: row.get("recognitions_received")?,
            surveys_completed: row.get("surveys_completed")?,
            profiles_completed: row.get("profiles_completed")?,
            teams_joined: row.get("teams_joined")?,
            badges_earned: BTreeSet::new(), // Loaded separately
            version: row.get("version")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Current value of a badge criteria counter
    pub fn counter_value(&self, counter: Counter) -> i64 {
        match counter {
            Counter::TotalPoints => self.total_points,
            Counter::StreakDays => self.streak_days,
            Counter::BestStreak => self.best_streak,
            Counter::EventsAttended => self.events_attended,
            Counter::EventsCompleted => self.events_completed,
            Counter::FeedbackSubmitted => self.feedback_submitted,
            Counter::ActivitiesCompleted => self.activities_completed,
            Counter::RecognitionsSent => self.recognitions_sent,
            Counter::RecognitionsReceived => self.recognitions_received,
            Counter::SurveysCompleted => self.surveys_completed,
            Counter::ProfilesCompleted => self.profiles_completed,
            Counter::TeamsJoined => self.teams_joined,
            Counter::BadgesEarned => self.badges_earned.len() as i64,
        }
    }

    pub(crate) fn set_counter(&mut self, counter: Counter, value: i64) {
        match counter {
            Counter::TotalPoints => self.total_points = value,
            Counter::StreakDays => self.streak_days = value,
            Counter::BestStreak => self.best_streak = value,
            Counter::EventsAttended => self.events_attended = value,
            Counter::EventsCompleted => self.events_completed = value,
            Counter::FeedbackSubmitted => self.feedback_submitted = value,
            Counter::ActivitiesCompleted => self.activities_completed = value,
            Counter::RecognitionsSent => self.recognitions_sent = value,
            Counter::RecognitionsReceived => self.recognitions_received = value,
            Counter::SurveysCompleted => self.surveys_completed = value,
            Counter::ProfilesCompleted => self.profiles_completed = value,
            Counter::TeamsJoined => self.teams_joined = value,
            // Derived from the award set
            Counter::BadgesEarned => {}
        }
    }

    pub fn streak_state(&self) -> StreakState {
        StreakState {
            streak_days: self.streak_days,
            best_streak: self.best_streak,
            last_activity_date: self.last_activity_date,
        }
    }
}

/// Leaderboard row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: u32,
    pub user_id: String,
    pub total_points: i64,
    pub level: i64,
    pub tier: String,
}

// ============================================================================
// Badge Awards
// ============================================================================

/// Immutable record of a badge earned by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BadgeAward {
    pub id: String,
    pub user_id: String,
    pub badge_id: String,
    /// Display name from the badge table at read time
    pub badge_name: Option<String>,
    pub awarded_at: String,
    pub reason: String,
    /// Ledger entry of the trigger that caused this award
    pub source_transaction_id: Option<String>,
}

impl BadgeAward {
    pub(crate) fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            badge_id: row.get("badge_id")?,
            badge_name: row.get("badge_name")?,
            awarded_at: row.get("awarded_at")?,
            reason: row.get("reason")?,
            source_transaction_id: row.get("source_transaction_id")?,
        })
    }
}

// ============================================================================
// Reconciliation Queue
// ============================================================================

/// A user whose aggregate may have drifted from the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReconciliation {
    pub user_id: String,
    pub reason: String,
    pub flagged_at: String,
}

impl PendingReconciliation {
    pub(crate) fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            user_id: row.get("user_id")?,
            reason: row.get("reason")?,
            flagged_at: row.get("flagged_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_access() {
        let mut agg = UserAggregate::empty("u-1", "Bronze");
        agg.set_counter(Counter::TeamsJoined, 2);
        agg.badges_earned.insert("team_player".into());
        assert_eq!(agg.counter_value(Counter::TeamsJoined), 2);
        assert_eq!(agg.counter_value(Counter::BadgesEarned), 1);
        assert_eq!(agg.counter_value(Counter::TotalPoints), 0);
    }

    #[test]
    fn test_timestamp_format() {
        let ts = current_timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
    }
}
