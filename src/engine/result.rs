//! Result reporting
//!
//! Every trigger call ends in exactly one [`TriggerResult`]. Duplicate
//! calls rebuild theirs from the rows the original call left behind,
//! including the standing the user had at that point.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::catalog::{BadgeCatalog, TriggerKind, BADGE_REFERENCE_TYPE};
use crate::db::models::{BadgeAward, UserAggregate, DATE_FORMAT};
use crate::error::{ErrorKind, RewardsError};
use crate::repository::{DedupKey, LedgerBatch, LedgerPrefix, RewardsRepository};
use crate::streak;
use crate::tier::{level_for, TierTable};

/// Outcome of a trigger call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStatus {
    /// New ledger rows were written
    Applied,
    /// Every dedup key already existed; the prior result is reported
    Duplicate,
    /// Unknown trigger type or no matching rule; nothing written
    Ignored,
    /// Malformed metadata; nothing written
    Rejected,
    /// Storage failed after retries; nothing written
    Failed,
}

/// Badge reference in a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardedBadge {
    pub badge_id: String,
    pub name: String,
}

impl AwardedBadge {
    pub(crate) fn from_award(award: &BadgeAward, badges: &BadgeCatalog) -> Self {
        let name = badges
            .get(&award.badge_id)
            .map(|b| b.name.clone())
            .or_else(|| award.badge_name.clone())
            .unwrap_or_else(|| award.badge_id.clone());
        Self {
            badge_id: award.badge_id.clone(),
            name,
        }
    }
}

/// What a caller renders as a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardSummary {
    pub points_delta: i64,
    pub total_points: i64,
    pub level: i64,
    pub tier: String,
    pub streak_days: i64,
    pub badges_awarded: Vec<AwardedBadge>,
}

impl AwardSummary {
    /// Zero delta on top of the user's current standing
    pub fn snapshot(aggregate: &UserAggregate) -> Self {
        Self {
            points_delta: 0,
            total_points: aggregate.total_points,
            level: aggregate.level,
            tier: aggregate.tier.clone(),
            streak_days: aggregate.streak_days,
            badges_awarded: vec![],
        }
    }

    /// Zero summary for a user we know nothing about
    pub fn empty(lowest_tier: &str) -> Self {
        Self {
            points_delta: 0,
            total_points: 0,
            level: level_for(0),
            tier: lowest_tier.to_string(),
            streak_days: 0,
            badges_awarded: vec![],
        }
    }
}

/// Consolidated response to one trigger call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResult {
    pub status: TriggerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub summary: AwardSummary,
    /// Badge criteria still met after the pass limit; picked up by the next trigger
    #[serde(default)]
    pub badges_deferred: bool,
    /// The user was queued for a ledger rebuild
    #[serde(default)]
    pub needs_reconciliation: bool,
}

impl TriggerResult {
    pub(crate) fn new(status: TriggerStatus, summary: AwardSummary) -> Self {
        Self {
            status,
            error: None,
            message: None,
            summary,
            badges_deferred: false,
            needs_reconciliation: false,
        }
    }

    /// Zero-effect result for an error recovered at the call boundary
    pub(crate) fn from_error(error: &RewardsError, summary: AwardSummary) -> Self {
        let kind = error.kind().unwrap_or(ErrorKind::TransientPersistenceError);
        let status = match kind {
            ErrorKind::UnknownTrigger => TriggerStatus::Ignored,
            ErrorKind::ValidationError => TriggerStatus::Rejected,
            ErrorKind::TransientPersistenceError => TriggerStatus::Failed,
        };
        Self {
            error: Some(kind),
            message: Some(error.to_string()),
            ..Self::new(status, summary)
        }
    }

    /// Whether the caller has anything worth showing
    pub fn has_awards(&self) -> bool {
        self.summary.points_delta != 0 || !self.summary.badges_awarded.is_empty()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error
    }
}

/// Rebuild the result of an already-processed trigger from its ledger rows
/// and the badge awards they caused.
///
/// Total, level, tier and streak are those of the ledger right after the
/// trigger's last row (its own rows or its badge bonuses), not the user's
/// current standing. Rows of other triggers written in between the original
/// rows and their bonuses are counted as well.
pub(crate) fn replay(
    repo: &dyn RewardsRepository,
    badges: &BadgeCatalog,
    batch: &LedgerBatch,
    tiers: &TierTable,
) -> Result<AwardSummary, RewardsError> {
    let rows = repo.transactions_for_keys(&batch.keys())?;
    let source_ids: Vec<String> = rows.iter().map(|t| t.id.clone()).collect();
    let awards = repo.awards_for_sources(&batch.user_id, &source_ids)?;

    let bonus_keys: Vec<DedupKey> = awards
        .iter()
        .map(|a| DedupKey {
            user_id: batch.user_id.clone(),
            trigger_type: TriggerKind::BadgeAward,
            reference_type: BADGE_REFERENCE_TYPE.to_string(),
            reference_id: a.badge_id.clone(),
        })
        .collect();
    let bonuses = repo.transactions_for_keys(&bonus_keys)?;

    let written: Vec<String> = rows.iter().chain(bonuses.iter()).map(|t| t.id.clone()).collect();
    let mut summary = match repo.ledger_through(&batch.user_id, &written)? {
        Some(prefix) => standing_from(&prefix, tiers)?,
        None => AwardSummary::empty(tiers.lowest()),
    };
    summary.points_delta = rows.iter().chain(bonuses.iter()).map(|t| t.amount).sum();
    summary.badges_awarded = awards.iter().map(|a| AwardedBadge::from_award(a, badges)).collect();
    Ok(summary)
}

fn standing_from(prefix: &LedgerPrefix, tiers: &TierTable) -> Result<AwardSummary, RewardsError> {
    let mut days = Vec::with_capacity(prefix.activity_dates.len());
    for raw in &prefix.activity_dates {
        let day = NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map_err(|e| RewardsError::Internal(format!("Bad activity_date {}: {}", raw, e)))?;
        days.push(day);
    }
    let standing = tiers.standing(prefix.total_points);
    Ok(AwardSummary {
        points_delta: 0,
        total_points: prefix.total_points,
        level: standing.level,
        tier: standing.tier,
        streak_days: streak::replay(days).streak_days,
        badges_awarded: vec![],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json_is_flat() {
        let result = TriggerResult::new(TriggerStatus::Applied, AwardSummary::empty("Bronze"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "applied");
        assert_eq!(json["tier"], "Bronze");
        assert_eq!(json["level"], 1);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_mapping() {
        let unknown = TriggerResult::from_error(
            &RewardsError::UnknownTrigger("logged_in".into()),
            AwardSummary::empty("Bronze"),
        );
        assert_eq!(unknown.status, TriggerStatus::Ignored);
        assert_eq!(unknown.error_kind(), Some(ErrorKind::UnknownTrigger));

        let failed = TriggerResult::from_error(
            &RewardsError::Persistence {
                transient: true,
                message: "locked".into(),
            },
            AwardSummary::empty("Bronze"),
        );
        assert_eq!(failed.status, TriggerStatus::Failed);
        assert!(!failed.has_awards());

        let internal = TriggerResult::from_error(&RewardsError::Internal("x".into()), AwardSummary::empty("Bronze"));
        assert_eq!(internal.error_kind(), Some(ErrorKind::TransientPersistenceError));
    }
}
