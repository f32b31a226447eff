//! Rule catalog - maps trigger types to point rules
//!
//! A rule decides, from the trigger metadata, whether it fires, how many
//! points it writes to the ledger and which metadata fields form the
//! reference part of its dedup key.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::badges::BadgeCatalog;
use super::trigger::{field_as_string, TriggerKind};
use crate::error::RewardsError;

/// Reference type used for engine-generated badge bonus entries
pub const BADGE_REFERENCE_TYPE: &str = "badge";

/// Predicate over trigger metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleCondition {
    Always,
    Present { field: String },
    Equals { field: String, value: Value },
    AtLeast { field: String, value: f64 },
}

impl Default for RuleCondition {
    fn default() -> Self {
        Self::Always
    }
}

impl RuleCondition {
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match self {
            Self::Always => true,
            Self::Present { field } => matches!(metadata.get(field), Some(v) if !v.is_null()),
            Self::Equals { field, value } => metadata.get(field) == Some(value),
            Self::AtLeast { field, value } => metadata
                .get(field)
                .and_then(Value::as_f64)
                .is_some_and(|v| v >= *value),
        }
    }
}

/// One point rule for a trigger type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: String,
    pub trigger_type: TriggerKind,
    #[serde(default)]
    pub condition: RuleCondition,
    pub point_amount: i64,
    /// Badge granted outright when this rule fires
    #[serde(default)]
    pub badge_ref: Option<String>,
    /// Namespace of the reference in the ledger's dedup key
    pub reference_type: String,
    /// Metadata fields joined into the reference id
    #[serde(default = "default_dedup_scope")]
    pub dedup_scope: Vec<String>,
}

fn default_dedup_scope() -> Vec<String> {
    vec!["reference_id".to_string()]
}

impl RuleDefinition {
    pub fn new(id: &str, trigger_type: TriggerKind, reference_type: &str, point_amount: i64) -> Self {
        Self {
            id: id.to_string(),
            trigger_type,
            condition: RuleCondition::Always,
            point_amount,
            badge_ref: None,
            reference_type: reference_type.to_string(),
            dedup_scope: default_dedup_scope(),
        }
    }

    pub fn when(mut self, condition: RuleCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn granting(mut self, badge_id: &str) -> Self {
        self.badge_ref = Some(badge_id.to_string());
        self
    }

    pub fn scoped_by(mut self, fields: &[&str]) -> Self {
        self.dedup_scope = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    /// Build the reference id from the dedup scope fields
    pub fn reference_for(&self, metadata: &Map<String, Value>) -> Result<String, RewardsError> {
        let mut parts = Vec::with_capacity(self.dedup_scope.len());
        for field in &self.dedup_scope {
            let value = field_as_string(metadata, field).ok_or_else(|| {
                RewardsError::Validation(format!(
                    "rule {} needs metadata field '{}' for deduplication",
                    self.id, field
                ))
            })?;
            parts.push(value);
        }
        Ok(parts.join(":"))
    }
}

/// Trigger type to rules lookup, plus the set of streak-relevant triggers
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: BTreeMap<TriggerKind, Vec<RuleDefinition>>,
    streak_triggers: BTreeSet<TriggerKind>,
}

impl RuleCatalog {
    /// Build and validate a catalog against the configured badges
    pub fn new(
        rules: Vec<RuleDefinition>,
        streak_triggers: &[TriggerKind],
        badges: &BadgeCatalog,
    ) -> Result<Self, RewardsError> {
        let mut keys = HashSet::new();
        let mut by_kind: BTreeMap<TriggerKind, Vec<RuleDefinition>> = BTreeMap::new();

        for rule in rules {
            if rule.id.trim().is_empty() {
                return Err(RewardsError::Config("rule with empty id".into()));
            }
            if rule.dedup_scope.is_empty() {
                return Err(RewardsError::Config(format!("rule {} has an empty dedup_scope", rule.id)));
            }
            if rule.reference_type == BADGE_REFERENCE_TYPE {
                return Err(RewardsError::Config(format!(
                    "rule {} uses reserved reference_type '{}'",
                    rule.id, BADGE_REFERENCE_TYPE
                )));
            }
            if !keys.insert((rule.trigger_type, rule.reference_type.clone())) {
                return Err(RewardsError::Config(format!(
                    "rule {} duplicates reference_type '{}' for {}",
                    rule.id, rule.reference_type, rule.trigger_type
                )));
            }
            if let Some(badge_id) = &rule.badge_ref {
                if badges.get(badge_id).is_none() {
                    return Err(RewardsError::Config(format!(
                        "rule {} references unknown badge {}",
                        rule.id, badge_id
                    )));
                }
            }
            by_kind.entry(rule.trigger_type).or_default().push(rule);
        }

        Ok(Self {
            rules: by_kind,
            streak_triggers: streak_triggers.iter().copied().collect(),
        })
    }

    pub fn rules_for(&self, kind: TriggerKind) -> &[RuleDefinition] {
        self.rules.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_streak_trigger(&self, kind: TriggerKind) -> bool {
        self.streak_triggers.contains(&kind)
    }

    pub fn streak_triggers(&self) -> Vec<TriggerKind> {
        self.streak_triggers.iter().copied().collect()
    }

    pub fn all_rules(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.rules.values().flatten()
    }
}

/// Rules shipped with the default configuration
pub fn default_rules() -> Vec<RuleDefinition> {
    vec![
        RuleDefinition::new("attend_event", TriggerKind::EventAttendance, "participation", 10),
        RuleDefinition::new("complete_event", TriggerKind::EventCompletion, "participation", 15),
        RuleDefinition::new("submit_feedback", TriggerKind::FeedbackSubmitted, "feedback", 5),
        RuleDefinition::new("detailed_feedback", TriggerKind::FeedbackSubmitted, "feedback_comment", 3)
            .when(RuleCondition::Present { field: "comment".into() }),
        RuleDefinition::new("give_recognition", TriggerKind::RecognitionGiven, "recognition", 5),
        RuleDefinition::new("receive_recognition", TriggerKind::RecognitionReceived, "recognition", 10),
        RuleDefinition::new("complete_survey", TriggerKind::SurveyCompleted, "survey_response", 20),
        RuleDefinition::new("complete_profile", TriggerKind::ProfileCompleted, "profile", 25)
            .granting("profile_complete"),
        RuleDefinition::new("join_team", TriggerKind::TeamJoin, "team_membership", 15),
        RuleDefinition::new("complete_activity", TriggerKind::ActivityCompletion, "activity", 10),
        RuleDefinition::new("reach_milestone", TriggerKind::ActivityCompletion, "path_milestone", 50)
            .when(RuleCondition::Equals {
                field: "milestone".into(),
                value: Value::Bool(true),
            }),
    ]
}

/// Trigger types that drive the attendance streak by default
pub fn default_streak_triggers() -> Vec<TriggerKind> {
    vec![TriggerKind::EventAttendance]
}
