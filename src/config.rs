//! Configuration for rewards-engine

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::catalog::{
    default_badges, default_rules, default_streak_triggers, BadgeDefinition, Catalog, RuleDefinition, TriggerKind,
};
use crate::engine::EngineSettings;
use crate::error::RewardsError;
use crate::tier::{default_tiers, TierTable, TierThreshold};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rewards-engine")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// SQLite connections; users are spread across them by id
    #[serde(default = "default_db_connections")]
    pub db_connections: usize,

    /// Trigger types that drive the streak
    #[serde(default = "default_streak_triggers")]
    pub streak_triggers: Vec<TriggerKind>,

    #[serde(default)]
    pub engine: EngineSettings,

    /// Ascending tier thresholds
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierThreshold>,

    #[serde(default = "default_rules")]
    pub rules: Vec<RuleDefinition>,

    #[serde(default = "default_badges")]
    pub badges: Vec<BadgeDefinition>,
}

fn default_http_port() -> u16 {
    8095
}

fn default_db_connections() -> usize {
    4
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            http_port: default_http_port(),
            db_connections: default_db_connections(),
            streak_triggers: default_streak_triggers(),
            engine: EngineSettings::default(),
            tiers: default_tiers(),
            rules: default_rules(),
            badges: default_badges(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Build the validated rule and badge catalog
    pub fn catalog(&self) -> Result<Catalog, RewardsError> {
        Catalog::new(self.rules.clone(), &self.streak_triggers, self.badges.clone())
    }

    /// Build the validated tier table
    pub fn tier_table(&self) -> Result<TierTable, RewardsError> {
        TierTable::new(self.tiers.clone())
    }

    /// Check everything that can be wrong without touching storage
    pub fn validate(&self) -> Result<(), RewardsError> {
        self.catalog()?;
        self.tier_table()?;
        if self.engine.max_badge_passes == 0 {
            return Err(RewardsError::Config("engine.max_badge_passes must be at least 1".into()));
        }
        if self.engine.retry.max_attempts == 0 {
            return Err(RewardsError::Config("engine.retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("http_port = 9000\n").unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.db_connections, 4);
        assert_eq!(config.engine.max_badge_passes, 5);
        assert_eq!(config.engine.retry.max_attempts, 3);
        assert_eq!(config.streak_triggers, vec![TriggerKind::EventAttendance]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.storage_dir = dir.path().to_path_buf();
        config.engine.max_badge_passes = 2;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.engine.max_badge_passes, 2);
        assert_eq!(loaded.rules, config.rules);
        assert_eq!(loaded.badges, config.badges);
        assert_eq!(loaded.tiers, config.tiers);
    }

    #[test]
    fn test_rules_from_toml() {
        let config: Config = toml::from_str(
            r#"
            streak_triggers = ["event_attendance", "activity_completion"]

            [[rules]]
            id = "attend"
            trigger_type = "event_attendance"
            point_amount = 20
            reference_type = "participation"

            [[rules]]
            id = "long_session"
            trigger_type = "activity_completion"
            point_amount = 5
            reference_type = "long_activity"
            dedup_scope = ["activity_id", "reference_id"]
            condition = { op = "at_least", field = "minutes", value = 60.0 }
            "#,
        )
        .unwrap();

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.rules.rules_for(TriggerKind::EventAttendance)[0].point_amount, 20);
        assert!(catalog.rules.is_streak_trigger(TriggerKind::ActivityCompletion));
        assert_eq!(
            catalog.rules.rules_for(TriggerKind::ActivityCompletion)[0].dedup_scope,
            vec!["activity_id".to_string(), "reference_id".to_string()]
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.engine.max_badge_passes = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tiers = vec![TierThreshold::new("Gold", 1500), TierThreshold::new("Bronze", 0)];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rules.push(RuleDefinition::new("dup", TriggerKind::TeamJoin, "team_membership", 1));
        assert!(config.validate().is_err());
    }
}
