//! Static configuration the engine evaluates triggers against
//!
//! - `trigger` - trigger types and typed payloads
//! - `rules` - point rules per trigger type
//! - `badges` - badge definitions and aggregate counters

pub mod badges;
pub mod rules;
pub mod trigger;

pub use badges::{default_badges, AwardCriteria, BadgeCatalog, BadgeDefinition, BadgeRarity, Counter};
pub use rules::{default_rules, default_streak_triggers, RuleCatalog, RuleCondition, RuleDefinition, BADGE_REFERENCE_TYPE};
pub use trigger::{TriggerKind, TriggerPayload, TriggerRequest, TriggerTiming};

use crate::error::RewardsError;

/// Rules and badges validated against each other, swapped as one unit on reload
#[derive(Debug, Clone)]
pub struct Catalog {
    pub rules: RuleCatalog,
    pub badges: BadgeCatalog,
}

impl Catalog {
    pub fn new(
        rules: Vec<RuleDefinition>,
        streak_triggers: &[TriggerKind],
        badges: Vec<BadgeDefinition>,
    ) -> Result<Self, RewardsError> {
        let badges = BadgeCatalog::new(badges)?;
        let rules = RuleCatalog::new(rules, streak_triggers, &badges)?;
        Ok(Self { rules, badges })
    }

    /// Catalog shipped with the default configuration
    pub fn defaults() -> Result<Self, RewardsError> {
        Self::new(default_rules(), &default_streak_triggers(), default_badges())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let catalog = Catalog::defaults().unwrap();
        assert!(!catalog.badges.is_empty());
        assert!(catalog.rules.is_streak_trigger(TriggerKind::EventAttendance));
        assert!(catalog.rules.rules_for(TriggerKind::BadgeAward).is_empty());
    }

    #[test]
    fn test_rule_with_unknown_badge_rejected() {
        let rules = vec![RuleDefinition::new("r", TriggerKind::TeamJoin, "team", 5).granting("nope")];
        assert!(Catalog::new(rules, &[], default_badges()).is_err());
    }
}
