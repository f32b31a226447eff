//! Trigger types and typed trigger payloads
//!
//! Callers send `{trigger_type, user_id, metadata}`. The metadata map is
//! checked here against the fields each trigger type requires and turned
//! into a [`TriggerPayload`] before any rule runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::badges::Counter;
use crate::error::RewardsError;

/// The fixed set of trigger types the engine understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    EventAttendance,
    EventCompletion,
    FeedbackSubmitted,
    RecognitionGiven,
    RecognitionReceived,
    SurveyCompleted,
    ProfileCompleted,
    TeamJoin,
    ActivityCompletion,
    BadgeAward,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 10] = [
        Self::EventAttendance,
        Self::EventCompletion,
        Self::FeedbackSubmitted,
        Self::RecognitionGiven,
        Self::RecognitionReceived,
        Self::SurveyCompleted,
        Self::ProfileCompleted,
        Self::TeamJoin,
        Self::ActivityCompletion,
        Self::BadgeAward,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EventAttendance => "event_attendance",
            Self::EventCompletion => "event_completion",
            Self::FeedbackSubmitted => "feedback_submitted",
            Self::RecognitionGiven => "recognition_given",
            Self::RecognitionReceived => "recognition_received",
            Self::SurveyCompleted => "survey_completed",
            Self::ProfileCompleted => "profile_completed",
            Self::TeamJoin => "team_join",
            Self::ActivityCompletion => "activity_completion",
            Self::BadgeAward => "badge_award",
        }
    }

    /// Parse a wire name, returning None for unknown trigger types
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == name)
    }

    /// Aggregate counter bumped once per new occurrence of this trigger
    pub const fn counter(&self) -> Counter {
        match self {
            Self::EventAttendance => Counter::EventsAttended,
            Self::EventCompletion => Counter::EventsCompleted,
            Self::FeedbackSubmitted => Counter::FeedbackSubmitted,
            Self::RecognitionGiven => Counter::RecognitionsSent,
            Self::RecognitionReceived => Counter::RecognitionsReceived,
            Self::SurveyCompleted => Counter::SurveysCompleted,
            Self::ProfileCompleted => Counter::ProfilesCompleted,
            Self::TeamJoin => Counter::TeamsJoined,
            Self::ActivityCompletion => Counter::ActivitiesCompleted,
            Self::BadgeAward => Counter::BadgesEarned,
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw trigger call as received from a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerRequest {
    #[serde(default)]
    pub trigger_type: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TriggerRequest {
    pub fn new(trigger_type: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            trigger_type: trigger_type.into(),
            user_id: user_id.into(),
            metadata: Map::new(),
        }
    }

    /// Builder-style metadata setter
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Metadata validated per trigger type
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerPayload {
    EventAttendance { reference_id: String, event_id: String },
    EventCompletion { reference_id: String, event_id: String },
    FeedbackSubmitted { reference_id: String, event_id: Option<String> },
    RecognitionGiven { reference_id: String, recipient_id: String },
    RecognitionReceived { reference_id: String, sender_id: String },
    SurveyCompleted { reference_id: String, survey_id: String },
    ProfileCompleted { reference_id: String },
    TeamJoin { reference_id: String, team_id: String },
    ActivityCompletion { reference_id: String, activity_id: String, path_id: Option<String> },
    BadgeAward { reference_id: String },
}

impl TriggerPayload {
    /// Check the metadata map against the fields required by `kind`
    pub fn from_metadata(kind: TriggerKind, metadata: &Map<String, Value>) -> Result<Self, RewardsError> {
        let reference_id = required(metadata, "reference_id")?;
        let payload = match kind {
            TriggerKind::EventAttendance => Self::EventAttendance {
                reference_id,
                event_id: required(metadata, "event_id")?,
            },
            TriggerKind::EventCompletion => Self::EventCompletion {
                reference_id,
                event_id: required(metadata, "event_id")?,
            },
            TriggerKind::FeedbackSubmitted => Self::FeedbackSubmitted {
                reference_id,
                event_id: optional(metadata, "event_id"),
            },
            TriggerKind::RecognitionGiven => Self::RecognitionGiven {
                reference_id,
                recipient_id: required(metadata, "recipient_id")?,
            },
            TriggerKind::RecognitionReceived => Self::RecognitionReceived {
                reference_id,
                sender_id: required(metadata, "sender_id")?,
            },
            TriggerKind::SurveyCompleted => Self::SurveyCompleted {
                reference_id,
                survey_id: required(metadata, "survey_id")?,
            },
            TriggerKind::ProfileCompleted => Self::ProfileCompleted { reference_id },
            TriggerKind::TeamJoin => Self::TeamJoin {
                reference_id,
                team_id: required(metadata, "team_id")?,
            },
            TriggerKind::ActivityCompletion => Self::ActivityCompletion {
                reference_id,
                activity_id: required(metadata, "activity_id")?,
                path_id: optional(metadata, "path_id"),
            },
            TriggerKind::BadgeAward => Self::BadgeAward { reference_id },
        };
        Ok(payload)
    }

    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::EventAttendance { .. } => TriggerKind::EventAttendance,
            Self::EventCompletion { .. } => TriggerKind::EventCompletion,
            Self::FeedbackSubmitted { .. } => TriggerKind::FeedbackSubmitted,
            Self::RecognitionGiven { .. } => TriggerKind::RecognitionGiven,
            Self::RecognitionReceived { .. } => TriggerKind::RecognitionReceived,
            Self::SurveyCompleted { .. } => TriggerKind::SurveyCompleted,
            Self::ProfileCompleted { .. } => TriggerKind::ProfileCompleted,
            Self::TeamJoin { .. } => TriggerKind::TeamJoin,
            Self::ActivityCompletion { .. } => TriggerKind::ActivityCompletion,
            Self::BadgeAward { .. } => TriggerKind::BadgeAward,
        }
    }

    pub fn reference_id(&self) -> &str {
        match self {
            Self::EventAttendance { reference_id, .. }
            | Self::EventCompletion { reference_id, .. }
            | Self::FeedbackSubmitted { reference_id, .. }
            | Self::RecognitionGiven { reference_id, .. }
            | Self::RecognitionReceived { reference_id, .. }
            | Self::SurveyCompleted { reference_id, .. }
            | Self::ProfileCompleted { reference_id }
            | Self::TeamJoin { reference_id, .. }
            | Self::ActivityCompletion { reference_id, .. }
            | Self::BadgeAward { reference_id } => reference_id,
        }
    }
}

/// When the activity happened and in which timezone the user lives
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerTiming {
    pub occurred_at: DateTime<Utc>,
    pub utc_offset_minutes: Option<i32>,
}

impl TriggerTiming {
    /// Read `occurred_at` (RFC 3339, default now) and `utc_offset_minutes`
    pub fn from_metadata(metadata: &Map<String, Value>, now: DateTime<Utc>) -> Result<Self, RewardsError> {
        let occurred_at = match metadata.get("occurred_at") {
            None | Some(Value::Null) => now,
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| RewardsError::Validation(format!("occurred_at is not RFC 3339: {}", e)))?,
            Some(other) => {
                return Err(RewardsError::Validation(format!(
                    "occurred_at must be a string, got {}",
                    other
                )))
            }
        };

        let utc_offset_minutes = match metadata.get("utc_offset_minutes") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let minutes = v.as_i64().ok_or_else(|| {
                    RewardsError::Validation("utc_offset_minutes must be an integer".into())
                })?;
                // Real-world offsets stay within UTC-12:00..UTC+14:00
                if !(-12 * 60..=14 * 60).contains(&minutes) {
                    return Err(RewardsError::Validation(format!(
                        "utc_offset_minutes out of range: {}",
                        minutes
                    )));
                }
                Some(minutes as i32)
            }
        };

        Ok(Self {
            occurred_at,
            utc_offset_minutes,
        })
    }
}

/// Read a metadata field as a non-empty string. Numbers are accepted as ids.
pub fn field_as_string(metadata: &Map<String, Value>, field: &str) -> Option<String> {
    match metadata.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required(metadata: &Map<String, Value>, field: &str) -> Result<String, RewardsError> {
    field_as_string(metadata, field)
        .ok_or_else(|| RewardsError::Validation(format!("missing required metadata field: {}", field)))
}

fn optional(metadata: &Map<String, Value>, field: &str) -> Option<String> {
    field_as_string(metadata, field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_parse_known_and_unknown() {
        assert_eq!(TriggerKind::parse("team_join"), Some(TriggerKind::TeamJoin));
        assert_eq!(TriggerKind::parse("badge_award"), Some(TriggerKind::BadgeAward));
        assert_eq!(TriggerKind::parse("login"), None);
        for kind in TriggerKind::ALL {
            assert_eq!(TriggerKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_serde_names_match_wire_names() {
        let json = serde_json::to_string(&TriggerKind::RecognitionGiven).unwrap();
        assert_eq!(json, "\"recognition_given\"");
    }

    #[test]
    fn test_payload_requires_reference_id() {
        let err = TriggerPayload::from_metadata(
            TriggerKind::ProfileCompleted,
            &meta(json!({})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("reference_id"));
    }

    #[test]
    fn test_payload_requires_kind_fields() {
        let err = TriggerPayload::from_metadata(
            TriggerKind::RecognitionGiven,
            &meta(json!({"reference_id": "r-1"})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("recipient_id"));

        let ok = TriggerPayload::from_metadata(
            TriggerKind::RecognitionGiven,
            &meta(json!({"reference_id": "r-1", "recipient_id": 42})),
        )
        .unwrap();
        assert_eq!(
            ok,
            TriggerPayload::RecognitionGiven {
                reference_id: "r-1".into(),
                recipient_id: "42".into()
            }
        );
        assert_eq!(ok.kind(), TriggerKind::RecognitionGiven);
    }

    #[test]
    fn test_blank_strings_are_missing() {
        let err = TriggerPayload::from_metadata(
            TriggerKind::TeamJoin,
            &meta(json!({"reference_id": "m-1", "team_id": "   "})),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_timing_defaults_to_now() {
        let now = Utc::now();
        let timing = TriggerTiming::from_metadata(&Map::new(), now).unwrap();
        assert_eq!(timing.occurred_at, now);
        assert_eq!(timing.utc_offset_minutes, None);
    }

    #[test]
    fn test_timing_parses_fields() {
        let timing = TriggerTiming::from_metadata(
            &meta(json!({"occurred_at": "2024-03-01T23:30:00-05:00", "utc_offset_minutes": -300})),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(timing.occurred_at.to_rfc3339(), "2024-03-02T04:30:00+00:00");
        assert_eq!(timing.utc_offset_minutes, Some(-300));
    }

    #[test]
    fn test_timing_rejects_bad_values() {
        assert!(TriggerTiming::from_metadata(&meta(json!({"occurred_at": "yesterday"})), Utc::now()).is_err());
        assert!(TriggerTiming::from_metadata(&meta(json!({"utc_offset_minutes": 2000})), Utc::now()).is_err());
        assert!(TriggerTiming::from_metadata(&meta(json!({"utc_offset_minutes": "+01:00"})), Utc::now()).is_err());
    }
}
