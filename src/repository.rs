//! Storage seam for the rewards engine
//!
//! The engine only talks to storage through [`RewardsRepository`]. Each
//! write method is one unit of work: it either commits completely or
//! leaves no trace.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{BadgeDefinition, Counter, TriggerKind};
use crate::db::models::{BadgeAward, LeaderboardEntry, PendingReconciliation, PointsTransaction, UserAggregate};
use crate::error::RewardsError;
use crate::tier::TierTable;

/// `(user, trigger_type, reference_type, reference_id)`, the ledger's unique key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub user_id: String,
    pub trigger_type: TriggerKind,
    pub reference_type: String,
    pub reference_id: String,
}

/// One ledger row a matched rule wants to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub rule_id: String,
    pub reference_type: String,
    pub reference_id: String,
    pub amount: i64,
}

/// Everything one trigger occurrence writes
#[derive(Debug, Clone)]
pub struct LedgerBatch {
    pub user_id: String,
    pub trigger_type: TriggerKind,
    pub entries: Vec<LedgerEntry>,
    /// Occurrence counter to bump when the occurrence is new
    pub counter: Counter,
    /// Activity time, used for the streak when `streak_relevant` is set
    pub occurred_at: DateTime<Utc>,
    pub utc_offset_minutes: Option<i32>,
    pub streak_relevant: bool,
}

impl LedgerBatch {
    pub fn keys(&self) -> Vec<DedupKey> {
        self.entries
            .iter()
            .map(|e| DedupKey {
                user_id: self.user_id.clone(),
                trigger_type: self.trigger_type,
                reference_type: e.reference_type.clone(),
                reference_id: e.reference_id.clone(),
            })
            .collect()
    }
}

/// What a ledger batch changed
#[derive(Debug, Clone)]
pub struct LedgerOutcome {
    /// Rows this call inserted; empty when every key already existed
    pub inserted: Vec<PointsTransaction>,
    /// Whether the occurrence counter was bumped
    pub counted: bool,
    pub streak_updated: bool,
    pub previous_tier: String,
    /// Aggregate as committed by this unit of work
    pub aggregate: UserAggregate,
}

impl LedgerOutcome {
    pub fn is_duplicate(&self) -> bool {
        self.inserted.is_empty()
    }

    pub fn points_delta(&self) -> i64 {
        self.inserted.iter().map(|t| t.amount).sum()
    }
}

/// A badge award to record, with its optional ledger bonus
#[derive(Debug, Clone)]
pub struct BadgeGrant {
    pub user_id: String,
    pub badge_id: String,
    pub reason: String,
    pub source_transaction_id: Option<String>,
    pub bonus_points: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Result of a badge grant that was not already held
#[derive(Debug, Clone)]
pub struct GrantOutcome {
    pub award: BadgeAward,
    pub bonus: Option<PointsTransaction>,
    pub previous_tier: String,
    pub aggregate: UserAggregate,
}

/// The ledger as it stood right after a given set of rows was written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerPrefix {
    pub total_points: i64,
    /// Stored streak days (`YYYY-MM-DD`) credited up to that point
    pub activity_dates: Vec<String>,
}

/// Before/after view of a rebuilt aggregate
#[derive(Debug, Clone, Serialize)]
pub struct RebuildOutcome {
    pub before: Option<UserAggregate>,
    pub after: UserAggregate,
}

/// Everything the engine needs from storage
pub trait RewardsRepository: Send + Sync {
    /// Insert the batch's ledger rows, skipping any whose dedup key exists,
    /// and apply the resulting increments, streak and standing to the
    /// aggregate in the same unit of work.
    fn apply_ledger_batch(&self, batch: &LedgerBatch, tiers: &TierTable) -> Result<LedgerOutcome, RewardsError>;

    /// Record a badge award and its bonus entry. Returns None when the user
    /// already holds the badge.
    fn grant_badge(&self, grant: &BadgeGrant, tiers: &TierTable) -> Result<Option<GrantOutcome>, RewardsError>;

    fn aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>, RewardsError>;

    fn transactions_for_keys(&self, keys: &[DedupKey]) -> Result<Vec<PointsTransaction>, RewardsError>;

    fn awards_for_sources(&self, user_id: &str, source_ids: &[String]) -> Result<Vec<BadgeAward>, RewardsError>;

    fn transactions_for_user(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<PointsTransaction>, RewardsError>;

    /// Ledger totals through the latest of `transaction_ids`. None when none
    /// of them exist.
    fn ledger_through(&self, user_id: &str, transaction_ids: &[String]) -> Result<Option<LedgerPrefix>, RewardsError>;

    /// Every rule-written ledger row of a user, oldest first
    fn rule_transactions(&self, user_id: &str) -> Result<Vec<PointsTransaction>, RewardsError>;

    fn awards_for_user(&self, user_id: &str) -> Result<Vec<BadgeAward>, RewardsError>;

    fn ledger_total(&self, user_id: &str) -> Result<i64, RewardsError>;

    fn leaderboard(&self, limit: u32) -> Result<Vec<LeaderboardEntry>, RewardsError>;

    /// Upsert badge definitions into the badge table
    fn sync_badges(&self, badges: &[BadgeDefinition]) -> Result<(), RewardsError>;

    /// Recompute a user's aggregate from the ledger and badge awards
    fn rebuild_aggregate(&self, user_id: &str, tiers: &TierTable) -> Result<RebuildOutcome, RewardsError>;

    /// Queue a user for reconciliation, replacing any earlier entry
    fn flag_reconciliation(&self, entry: &PendingReconciliation) -> Result<(), RewardsError>;

    fn clear_reconciliation(&self, user_id: &str) -> Result<(), RewardsError>;

    fn pending_reconciliations(&self) -> Result<Vec<PendingReconciliation>, RewardsError>;
}
