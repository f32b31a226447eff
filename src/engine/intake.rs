//! Trigger intake: validation and rule matching
//!
//! Everything here is pure. A trigger is fully checked before anything is
//! written, so a rejected trigger leaves no trace in the ledger.

use chrono::{DateTime, Utc};

use crate::catalog::{RuleCatalog, TriggerKind, TriggerPayload, TriggerRequest, TriggerTiming};
use crate::error::RewardsError;
use crate::repository::{LedgerBatch, LedgerEntry};

/// A badge a matched rule grants outright
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleBadge {
    pub rule_id: String,
    pub badge_id: String,
    /// Ledger row written by the rule, once known
    pub source_transaction_id: Option<String>,
}

/// A validated trigger with the ledger rows its matching rules want to write
#[derive(Debug, Clone)]
pub struct TriggerPlan {
    pub user_id: String,
    pub payload: TriggerPayload,
    pub timing: TriggerTiming,
    pub entries: Vec<LedgerEntry>,
    pub rule_badges: Vec<RuleBadge>,
    pub streak_relevant: bool,
}

impl TriggerPlan {
    pub fn kind(&self) -> TriggerKind {
        self.payload.kind()
    }

    pub fn batch(&self) -> LedgerBatch {
        LedgerBatch {
            user_id: self.user_id.clone(),
            trigger_type: self.kind(),
            entries: self.entries.clone(),
            counter: self.kind().counter(),
            occurred_at: self.timing.occurred_at,
            utc_offset_minutes: self.timing.utc_offset_minutes,
            streak_relevant: self.streak_relevant,
        }
    }
}

/// Validate a trigger and match it against the rule catalog.
///
/// Returns `Ok(None)` for a valid trigger no rule fires for.
pub fn plan(request: &TriggerRequest, rules: &RuleCatalog, now: DateTime<Utc>) -> Result<Option<TriggerPlan>, RewardsError> {
    let kind = TriggerKind::parse(request.trigger_type.trim())
        .ok_or_else(|| RewardsError::UnknownTrigger(request.trigger_type.clone()))?;

    let user_id = request.user_id.trim();
    if user_id.is_empty() {
        return Err(RewardsError::Validation("user_id is required".into()));
    }

    let payload = TriggerPayload::from_metadata(kind, &request.metadata)?;
    let timing = TriggerTiming::from_metadata(&request.metadata, now)?;

    let mut entries = Vec::new();
    let mut rule_badges = Vec::new();
    for rule in rules.rules_for(kind) {
        if !rule.condition.matches(&request.metadata) {
            continue;
        }
        entries.push(LedgerEntry {
            rule_id: rule.id.clone(),
            reference_type: rule.reference_type.clone(),
            reference_id: rule.reference_for(&request.metadata)?,
            amount: rule.point_amount,
        });
        if let Some(badge_id) = &rule.badge_ref {
            rule_badges.push(RuleBadge {
                rule_id: rule.id.clone(),
                badge_id: badge_id.clone(),
                source_transaction_id: None,
            });
        }
    }

    if entries.is_empty() {
        return Ok(None);
    }

    Ok(Some(TriggerPlan {
        user_id: user_id.to_string(),
        payload,
        timing,
        entries,
        rule_badges,
        streak_relevant: rules.is_streak_trigger(kind),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    fn rules() -> RuleCatalog {
        Catalog::defaults().unwrap().rules
    }

    #[test]
    fn test_unknown_trigger() {
        let req = TriggerRequest::new("logged_in", "u-1").with("reference_id", "x");
        assert!(matches!(plan(&req, &rules(), Utc::now()), Err(RewardsError::UnknownTrigger(_))));
    }

    #[test]
    fn test_missing_fields_are_validation_errors() {
        let req = TriggerRequest::new("event_attendance", "u-1").with("reference_id", "p-1");
        assert!(matches!(plan(&req, &rules(), Utc::now()), Err(RewardsError::Validation(_))));

        let req = TriggerRequest::new("event_attendance", " ")
            .with("reference_id", "p-1")
            .with("event_id", "e-1");
        assert!(matches!(plan(&req, &rules(), Utc::now()), Err(RewardsError::Validation(_))));
    }

    #[test]
    fn test_attendance_plan() {
        let req = TriggerRequest::new("event_attendance", "u-1")
            .with("reference_id", "p-1")
            .with("event_id", "e-1");
        let plan = plan(&req, &rules(), Utc::now()).unwrap().unwrap();
        assert_eq!(plan.kind(), TriggerKind::EventAttendance);
        assert!(plan.streak_relevant);
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].amount, 10);
        assert_eq!(plan.entries[0].reference_id, "p-1");
    }

    #[test]
    fn test_conditional_rule_adds_entry() {
        let base = TriggerRequest::new("feedback_submitted", "u-1").with("reference_id", "f-1");
        let plain = plan(&base, &rules(), Utc::now()).unwrap().unwrap();
        assert_eq!(plain.entries.len(), 1);

        let detailed = plan(&base.clone().with("comment", "great session"), &rules(), Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(detailed.entries.len(), 2);
        assert_eq!(detailed.batch().keys().len(), 2);
    }

    #[test]
    fn test_rule_badge_collected() {
        let req = TriggerRequest::new("profile_completed", "u-1").with("reference_id", "profile");
        let plan = plan(&req, &rules(), Utc::now()).unwrap().unwrap();
        assert_eq!(plan.rule_badges[0].badge_id, "profile_complete");
    }

    #[test]
    fn test_badge_award_trigger_matches_nothing() {
        let req = TriggerRequest::new("badge_award", "u-1").with("reference_id", "first_event");
        assert!(plan(&req, &rules(), Utc::now()).unwrap().is_none());
    }
}
