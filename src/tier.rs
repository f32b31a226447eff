//! Level and tier calculation
//!
//! Pure functions of a user's total points. Levels advance every 100
//! points; tiers come from an ascending threshold table.

use serde::{Deserialize, Serialize};

use crate::error::RewardsError;

/// Points needed per level
pub const POINTS_PER_LEVEL: i64 = 100;

/// Lower bound of a tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierThreshold {
    pub name: String,
    pub min_points: i64,
}

impl TierThreshold {
    pub fn new(name: &str, min_points: i64) -> Self {
        Self {
            name: name.to_string(),
            min_points,
        }
    }
}

/// Level and tier derived from a point total
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standing {
    pub level: i64,
    pub tier: String,
}

/// Position inside the current level and towards the next tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelProgress {
    pub level: i64,
    pub points_in_level: i64,
    pub points_per_level: i64,
    pub percentage: f64,
    pub next_tier: Option<String>,
    pub points_to_next_tier: Option<i64>,
}

/// `floor(total / 100) + 1`, with negative totals held at level 1
pub fn level_for(total_points: i64) -> i64 {
    total_points.max(0) / POINTS_PER_LEVEL + 1
}

/// Ascending tier thresholds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<TierThreshold>,
}

impl TierTable {
    /// Validate a strictly ascending table whose first tier starts at or below 0
    pub fn new(tiers: Vec<TierThreshold>) -> Result<Self, RewardsError> {
        let first = tiers
            .first()
            .ok_or_else(|| RewardsError::Config("tier table is empty".into()))?;
        if first.min_points > 0 {
            return Err(RewardsError::Config(format!(
                "first tier {} must start at 0 points or below, got {}",
                first.name, first.min_points
            )));
        }
        for pair in tiers.windows(2) {
            if pair[1].min_points <= pair[0].min_points {
                return Err(RewardsError::Config(format!(
                    "tier {} ({}) must be above tier {} ({})",
                    pair[1].name, pair[1].min_points, pair[0].name, pair[0].min_points
                )));
            }
        }
        Ok(Self { tiers })
    }

    /// Tier a new user starts in
    pub fn lowest(&self) -> &str {
        &self.tiers[0].name
    }

    /// Highest threshold not exceeding `total_points`; totals below every
    /// threshold fall back to the lowest tier
    pub fn tier_for(&self, total_points: i64) -> &str {
        self.tiers
            .iter()
            .rev()
            .find(|t| t.min_points <= total_points)
            .map(|t| t.name.as_str())
            .unwrap_or_else(|| self.lowest())
    }

    pub fn standing(&self, total_points: i64) -> Standing {
        Standing {
            level: level_for(total_points),
            tier: self.tier_for(total_points).to_string(),
        }
    }

    pub fn progress(&self, total_points: i64) -> LevelProgress {
        let points_in_level = total_points.max(0) % POINTS_PER_LEVEL;
        let next = self.tiers.iter().find(|t| t.min_points > total_points);
        LevelProgress {
            level: level_for(total_points),
            points_in_level,
            points_per_level: POINTS_PER_LEVEL,
            percentage: points_in_level as f64 / POINTS_PER_LEVEL as f64 * 100.0,
            next_tier: next.map(|t| t.name.clone()),
            points_to_next_tier: next.map(|t| t.min_points - total_points),
        }
    }

    pub fn thresholds(&self) -> &[TierThreshold] {
        &self.tiers
    }
}

/// Bronze, Silver, Gold, Platinum
pub fn default_tiers() -> Vec<TierThreshold> {
    vec![
        TierThreshold::new("Bronze", 0),
        TierThreshold::new("Silver", 500),
        TierThreshold::new("Gold", 1500),
        TierThreshold::new("Platinum", 5000),
    ]
}

impl Default for TierTable {
    fn default() -> Self {
        Self { tiers: default_tiers() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        assert_eq!(level_for(0), 1);
        assert_eq!(level_for(99), 1);
        assert_eq!(level_for(100), 2);
        assert_eq!(level_for(250), 3);
        assert_eq!(level_for(-40), 1);
    }

    #[test]
    fn test_tier_for() {
        let table = TierTable::default();
        assert_eq!(table.tier_for(0), "Bronze");
        assert_eq!(table.tier_for(499), "Bronze");
        assert_eq!(table.tier_for(500), "Silver");
        assert_eq!(table.tier_for(1500), "Gold");
        assert_eq!(table.tier_for(1_000_000), "Platinum");
        assert_eq!(table.tier_for(-10), "Bronze");
    }

    #[test]
    fn test_standing() {
        let table = TierTable::default();
        assert_eq!(
            table.standing(520),
            Standing {
                level: 6,
                tier: "Silver".into()
            }
        );
    }

    #[test]
    fn test_progress() {
        let table = TierTable::default();
        let progress = table.progress(450);
        assert_eq!(progress.level, 5);
        assert_eq!(progress.points_in_level, 50);
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.next_tier.as_deref(), Some("Silver"));
        assert_eq!(progress.points_to_next_tier, Some(50));

        let top = table.progress(6000);
        assert_eq!(top.next_tier, None);
        assert_eq!(top.points_to_next_tier, None);
    }

    #[test]
    fn test_table_validation() {
        assert!(TierTable::new(vec![]).is_err());
        assert!(TierTable::new(vec![TierThreshold::new("Starter", 10)]).is_err());
        assert!(TierTable::new(vec![
            TierThreshold::new("A", 0),
            TierThreshold::new("B", 100),
            TierThreshold::new("C", 100),
        ])
        .is_err());
        assert!(TierTable::new(default_tiers()).is_ok());
    }
}
