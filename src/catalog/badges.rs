//! Badge definitions and the aggregate counters their criteria read
//!
//! Badges are configuration: loaded at startup, synced into the `badges`
//! table and cached in memory. Criteria name a counter by string so that a
//! misconfigured badge can be skipped at evaluation time instead of
//! refusing to start.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RewardsError;

/// Per-user aggregate counters that badge criteria can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    TotalPoints,
    StreakDays,
    BestStreak,
    EventsAttended,
    EventsCompleted,
    FeedbackSubmitted,
    ActivitiesCompleted,
    RecognitionsSent,
    RecognitionsReceived,
    SurveysCompleted,
    ProfilesCompleted,
    TeamsJoined,
    BadgesEarned,
}

impl Counter {
    pub const ALL: [Counter; 13] = [
        Self::TotalPoints,
        Self::StreakDays,
        Self::BestStreak,
        Self::EventsAttended,
        Self::EventsCompleted,
        Self::FeedbackSubmitted,
        Self::ActivitiesCompleted,
        Self::RecognitionsSent,
        Self::RecognitionsReceived,
        Self::SurveysCompleted,
        Self::ProfilesCompleted,
        Self::TeamsJoined,
        Self::BadgesEarned,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::TotalPoints => "total_points",
            Self::StreakDays => "streak_days",
            Self::BestStreak => "best_streak",
            Self::EventsAttended => "events_attended",
            Self::EventsCompleted => "events_completed",
            Self::FeedbackSubmitted => "feedback_submitted",
            Self::ActivitiesCompleted => "activities_completed",
            Self::RecognitionsSent => "recognitions_sent",
            Self::RecognitionsReceived => "recognitions_received",
            Self::SurveysCompleted => "surveys_completed",
            Self::ProfilesCompleted => "profiles_completed",
            Self::TeamsJoined => "teams_joined",
            Self::BadgesEarned => "badges_earned",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }

    /// Column in `user_aggregates` holding a plain occurrence count.
    ///
    /// Points, streaks and earned badges are maintained by their own
    /// code paths and have no increment column.
    pub const fn increment_column(&self) -> Option<&'static str> {
        match self {
            Self::TotalPoints | Self::StreakDays | Self::BestStreak | Self::BadgesEarned => None,
            other => Some(other.as_str()),
        }
    }
}

impl std::fmt::Display for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Badge rarity, used for display and ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BadgeRarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

impl BadgeRarity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Uncommon => "uncommon",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "common" => Some(Self::Common),
            "uncommon" => Some(Self::Uncommon),
            "rare" => Some(Self::Rare),
            "epic" => Some(Self::Epic),
            "legendary" => Some(Self::Legendary),
            _ => None,
        }
    }
}

impl Default for BadgeRarity {
    fn default() -> Self {
        Self::Common
    }
}

/// Threshold over one aggregate counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwardCriteria {
    pub counter_name: String,
    pub threshold: i64,
}

impl AwardCriteria {
    pub fn new(counter: Counter, threshold: i64) -> Self {
        Self {
            counter_name: counter.as_str().to_string(),
            threshold,
        }
    }

    /// Resolve the counter name, rejecting unknown counters and non-positive thresholds
    pub fn resolve(&self, badge_id: &str) -> Result<Counter, RewardsError> {
        let counter = Counter::parse(&self.counter_name).ok_or_else(|| RewardsError::CriteriaEvaluation {
            badge_id: badge_id.to_string(),
            reason: format!("unknown counter '{}'", self.counter_name),
        })?;
        if self.threshold <= 0 {
            return Err(RewardsError::CriteriaEvaluation {
                badge_id: badge_id.to_string(),
                reason: format!("threshold must be positive, got {}", self.threshold),
            });
        }
        Ok(counter)
    }
}

/// A badge users can earn once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BadgeDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rarity: BadgeRarity,
    /// None for badges only granted through a rule's `badge_ref`
    #[serde(default)]
    pub award_criteria: Option<AwardCriteria>,
    /// Bonus points appended to the ledger on award
    #[serde(default)]
    pub points_value: i64,
}

impl BadgeDefinition {
    pub fn new(id: &str, name: &str, rarity: BadgeRarity) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            rarity,
            award_criteria: None,
            points_value: 0,
        }
    }

    pub fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_criteria(mut self, counter: Counter, threshold: i64) -> Self {
        self.award_criteria = Some(AwardCriteria::new(counter, threshold));
        self
    }

    pub fn with_points(mut self, points: i64) -> Self {
        self.points_value = points;
        self
    }
}

/// In-memory badge lookup, ordered as configured
#[derive(Debug, Clone, Default)]
pub struct BadgeCatalog {
    badges: Vec<BadgeDefinition>,
    index: HashMap<String, usize>,
}

impl BadgeCatalog {
    pub fn new(badges: Vec<BadgeDefinition>) -> Result<Self, RewardsError> {
        let mut index = HashMap::with_capacity(badges.len());
        for (i, badge) in badges.iter().enumerate() {
            if badge.id.trim().is_empty() {
                return Err(RewardsError::Config(format!("badge #{} has an empty id", i)));
            }
            if badge.points_value < 0 {
                return Err(RewardsError::Config(format!(
                    "badge {} has negative points_value {}",
                    badge.id, badge.points_value
                )));
            }
            if index.insert(badge.id.clone(), i).is_some() {
                return Err(RewardsError::Config(format!("duplicate badge id: {}", badge.id)));
            }
        }
        Ok(Self { badges, index })
    }

    pub fn get(&self, id: &str) -> Option<&BadgeDefinition> {
        self.index.get(id).map(|&i| &self.badges[i])
    }

    pub fn all(&self) -> &[BadgeDefinition] {
        &self.badges
    }

    pub fn len(&self) -> usize {
        self.badges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.badges.is_empty()
    }
}

/// Badges shipped with the default configuration
pub fn default_badges() -> Vec<BadgeDefinition> {
    vec![
        BadgeDefinition::new("first_event", "First Event", BadgeRarity::Common)
            .described("Attend your first event")
            .with_criteria(Counter::EventsAttended, 1)
            .with_points(10),
        BadgeDefinition::new("regular_attendee", "Regular Attendee", BadgeRarity::Rare)
            .described("Attend 10 events")
            .with_criteria(Counter::EventsAttended, 10)
            .with_points(50),
        BadgeDefinition::new("streak_3", "3-Day Streak", BadgeRarity::Uncommon)
            .described("Attend events three days in a row")
            .with_criteria(Counter::StreakDays, 3)
            .with_points(25),
        BadgeDefinition::new("streak_7", "Week Warrior", BadgeRarity::Epic)
            .described("Attend events seven days in a row")
            .with_criteria(Counter::StreakDays, 7)
            .with_points(75),
        BadgeDefinition::new("feedback_5", "Voice of the Crowd", BadgeRarity::Uncommon)
            .described("Submit feedback five times")
            .with_criteria(Counter::FeedbackSubmitted, 5)
            .with_points(20),
        BadgeDefinition::new("generous_5", "Generous Spirit", BadgeRarity::Uncommon)
            .described("Recognize colleagues five times")
            .with_criteria(Counter::RecognitionsSent, 5)
            .with_points(20),
        BadgeDefinition::new("recognized_5", "Team Favorite", BadgeRarity::Rare)
            .described("Receive five recognitions")
            .with_criteria(Counter::RecognitionsReceived, 5)
            .with_points(30),
        BadgeDefinition::new("survey_3", "Pulse Checker", BadgeRarity::Common)
            .described("Complete three surveys")
            .with_criteria(Counter::SurveysCompleted, 3)
            .with_points(15),
        BadgeDefinition::new("team_player", "Team Player", BadgeRarity::Common)
            .described("Join a team")
            .with_criteria(Counter::TeamsJoined, 1)
            .with_points(10),
        BadgeDefinition::new("learner_10", "Lifelong Learner", BadgeRarity::Rare)
            .described("Complete ten learning activities")
            .with_criteria(Counter::ActivitiesCompleted, 10)
            .with_points(40),
        BadgeDefinition::new("profile_complete", "All About Me", BadgeRarity::Common)
            .described("Complete your profile")
            .with_points(10),
        BadgeDefinition::new("rising_star", "Rising Star", BadgeRarity::Rare)
            .described("Reach 500 points")
            .with_criteria(Counter::TotalPoints, 500),
        BadgeDefinition::new("collector_5", "Collector", BadgeRarity::Legendary)
            .described("Earn five badges")
            .with_criteria(Counter::BadgesEarned, 5)
            .with_points(50),
    ]
}
