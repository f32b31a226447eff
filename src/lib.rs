//! Rewards Engine - Trigger-driven points, streaks, badges and tiers
//!
//! Callers report things users did (attended an event, gave recognition,
//! joined a team). The engine turns each trigger into ledger entries,
//! keeps a per-user aggregate in step with the ledger, tracks attendance
//! streaks, awards badges and moves users between tiers.
//!
//! ## Guarantees
//!
//! - A trigger is applied at most once per dedup key; retries replay the
//!   original result instead of awarding again
//! - Ledger insert and aggregate update commit together
//! - Reward failures never surface as errors to the caller's own write;
//!   they come back in-band in the [`TriggerResult`]
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/rewards-engine/
//! ├── rewards.db             # SQLite ledger, aggregates, badges
//! └── config.toml            # Rules, badges, tiers, engine settings
//! ```

pub mod catalog;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod http;
pub mod repository;
pub mod services;
pub mod streak;
pub mod tier;

// Re-exports
pub use catalog::{BadgeDefinition, Catalog, Counter, RuleDefinition, TriggerKind, TriggerRequest};
pub use config::Config;
pub use db::SqliteRepository;
pub use engine::{
    EngineSettings, ReconciliationReport, RetryPolicy, RewardsEngine, TriggerResult, TriggerStatus, UserSummary,
    VerifyReport,
};
pub use error::{ErrorKind, RewardsError};
pub use http::HttpServer;
pub use repository::RewardsRepository;
pub use services::{EventBus, RewardEvent};
pub use tier::{TierTable, TierThreshold};
