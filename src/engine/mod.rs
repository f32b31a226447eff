//! Rewards engine
//!
//! Converts triggers into ledger entries, aggregate updates, streaks,
//! badge awards and tier changes, and reports one [`TriggerResult`] per
//! call.
//!
//! ## Flow
//!
//! ```text
//! intake::plan ──► apply_ledger_batch ──► BadgeEvaluator ──► TriggerResult
//!   (validate)      (dedup, points,        (bounded passes,
//!                    counter, streak,       bonus entries)
//!                    standing)
//! ```
//!
//! `process_trigger` never fails: every error is recovered here and
//! reported in-band, so the caller's own write is never held up.

pub mod badges;
pub mod intake;
pub mod result;
pub mod retry;

use std::sync::{Arc, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::catalog::{BadgeDefinition, Catalog, Counter, RuleDefinition, TriggerKind, TriggerRequest};
use crate::db::models::{current_timestamp, BadgeAward, LeaderboardEntry, PointsTransaction, UserAggregate};
use crate::error::{ErrorKind, RewardsError};
use crate::repository::RewardsRepository;
use crate::services::events::{EventBus, RewardEvent};
use crate::tier::{LevelProgress, TierTable};

pub use crate::db::models::PendingReconciliation;
pub use badges::{BadgeEvaluator, Evaluation};
pub use intake::RuleBadge;
pub use result::{AwardSummary, AwardedBadge, TriggerResult, TriggerStatus};
pub use retry::RetryPolicy;

/// Largest page the read operations return
pub const MAX_PAGE_SIZE: u32 = 500;

/// Tunables of the engine itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Cap on badge evaluation passes per trigger
    #[serde(default = "default_max_badge_passes")]
    pub max_badge_passes: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_badge_passes() -> u32 {
    5
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_badge_passes: default_max_badge_passes(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Aggregate, progress and badges of one user
#[derive(Debug, Clone, Serialize)]
pub struct UserSummary {
    pub aggregate: UserAggregate,
    pub progress: LevelProgress,
    pub badges: Vec<BadgeAward>,
}

/// Outcome of a ledger rebuild
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub user_id: String,
    /// Whether any rebuilt column differed from the stored aggregate
    pub drift: bool,
    pub total_points_before: Option<i64>,
    pub aggregate: UserAggregate,
    pub badges_awarded: Vec<AwardedBadge>,
}

/// Aggregate total against ledger sum
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub user_id: String,
    pub aggregate_total: Option<i64>,
    pub ledger_total: i64,
    pub consistent: bool,
}

/// The trigger-driven rewards engine
pub struct RewardsEngine {
    repo: Arc<dyn RewardsRepository>,
    catalog: RwLock<Arc<Catalog>>,
    tiers: TierTable,
    settings: EngineSettings,
    events: Arc<EventBus>,
    pending: DashMap<String, PendingReconciliation>,
}

impl RewardsEngine {
    /// Create an engine, sync the catalog's badges into storage and load
    /// the persisted reconciliation queue
    pub fn new(
        repo: Arc<dyn RewardsRepository>,
        catalog: Catalog,
        tiers: TierTable,
        settings: EngineSettings,
        events: Arc<EventBus>,
    ) -> Result<Self, RewardsError> {
        repo.sync_badges(catalog.badges.all())?;

        let pending = DashMap::new();
        for entry in repo.pending_reconciliations()? {
            pending.insert(entry.user_id.clone(), entry);
        }
        info!(
            rules = catalog.rules.all_rules().count(),
            badges = catalog.badges.len(),
            tiers = tiers.thresholds().len(),
            pending = pending.len(),
            "Rewards engine ready"
        );

        Ok(Self {
            repo,
            catalog: RwLock::new(Arc::new(catalog)),
            tiers,
            settings,
            events,
            pending,
        })
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    fn catalog(&self) -> Arc<Catalog> {
        match self.catalog.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn evaluator<'a>(&'a self, catalog: &'a Catalog) -> BadgeEvaluator<'a> {
        BadgeEvaluator {
            repo: self.repo.as_ref(),
            badges: &catalog.badges,
            tiers: &self.tiers,
            retry: &self.settings.retry,
            max_passes: self.settings.max_badge_passes,
        }
    }

    // ========================================================================
    // Trigger processing
    // ========================================================================

    /// Process one trigger call. Never fails; errors are reported in the result.
    pub fn process_trigger(&self, request: &TriggerRequest) -> TriggerResult {
        let catalog = self.catalog();

        let plan = match intake::plan(request, &catalog.rules, Utc::now()) {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                debug!(user_id = %request.user_id, trigger_type = %request.trigger_type, "No matching rule");
                return self.unmatched(request.user_id.trim());
            }
            Err(e) => {
                debug!(
                    user_id = %request.user_id,
                    trigger_type = %request.trigger_type,
                    error = %e,
                    "Trigger not processed"
                );
                return TriggerResult::from_error(&e, AwardSummary::empty(self.tiers.lowest()));
            }
        };

        let kind = plan.kind();
        let batch = plan.batch();

        let outcome = match self
            .settings
            .retry
            .run("apply ledger batch", || self.repo.apply_ledger_batch(&batch, &self.tiers))
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(user_id = %plan.user_id, trigger_type = %kind, error = %e, "Trigger failed, nothing recorded");
                let mut result = TriggerResult::from_error(&e, AwardSummary::empty(self.tiers.lowest()));
                result.needs_reconciliation = self.flag_for_reconciliation(&plan.user_id, &e.to_string());
                return result;
            }
        };

        if outcome.is_duplicate() {
            debug!(user_id = %plan.user_id, trigger_type = %kind, "Duplicate trigger, replaying prior result");
            return match result::replay(self.repo.as_ref(), &catalog.badges, &batch, &self.tiers) {
                Ok(summary) => TriggerResult::new(TriggerStatus::Duplicate, summary),
                Err(e) => {
                    warn!(user_id = %plan.user_id, error = %e, "Could not rebuild prior result");
                    let mut result =
                        TriggerResult::from_error(&e, AwardSummary::snapshot(&outcome.aggregate));
                    result.status = TriggerStatus::Duplicate;
                    result
                }
            };
        }

        let points = outcome.points_delta();
        info!(
            user_id = %plan.user_id,
            trigger_type = %kind,
            points,
            total = outcome.aggregate.total_points,
            counted = outcome.counted,
            "Points awarded"
        );
        self.events.emit(RewardEvent::PointsAwarded {
            user_id: plan.user_id.clone(),
            trigger_type: kind.to_string(),
            points,
            total_points: outcome.aggregate.total_points,
        });
        self.emit_tier_change(&plan.user_id, &outcome.previous_tier, &outcome.aggregate.tier);

        // Rule badges only for rules whose rows this call wrote
        let rule_badges: Vec<_> = plan
            .rule_badges
            .iter()
            .filter_map(|rb| {
                let row = outcome
                    .inserted
                    .iter()
                    .find(|t| t.rule_id.as_deref() == Some(rb.rule_id.as_str()))?;
                Some(RuleBadge {
                    source_transaction_id: Some(row.id.clone()),
                    ..rb.clone()
                })
            })
            .collect();
        let source = outcome.inserted.first().map(|t| t.id.as_str());

        let evaluation =
            self.evaluator(&catalog)
                .evaluate(outcome.aggregate.clone(), &rule_badges, source, plan.timing.occurred_at);

        let mut summary = AwardSummary::snapshot(&evaluation.aggregate);
        summary.points_delta = points + evaluation.granted.iter().filter_map(|g| g.bonus.as_ref()).map(|b| b.amount).sum::<i64>();
        summary.badges_awarded = self.publish_awards(&plan.user_id, &evaluation, &catalog);

        let mut result = TriggerResult::new(TriggerStatus::Applied, summary);
        result.badges_deferred = evaluation.deferred;

        if let Some(e) = evaluation.failure {
            error!(user_id = %plan.user_id, error = %e, "Badge evaluation failed after ledger commit");
            result.error = Some(ErrorKind::TransientPersistenceError);
            result.message = Some(e.to_string());
            result.needs_reconciliation = self.flag_for_reconciliation(&plan.user_id, &e.to_string());
        }

        result
    }

    /// Zero-effect result carrying the user's current standing when readable
    fn unmatched(&self, user_id: &str) -> TriggerResult {
        let summary = match self.repo.aggregate(user_id) {
            Ok(Some(aggregate)) => AwardSummary::snapshot(&aggregate),
            Ok(None) => AwardSummary::empty(self.tiers.lowest()),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Could not read aggregate");
                AwardSummary::empty(self.tiers.lowest())
            }
        };
        TriggerResult::new(TriggerStatus::Ignored, summary)
    }

    /// Emit events for granted badges and list them for the result
    fn publish_awards(&self, user_id: &str, evaluation: &Evaluation, catalog: &Catalog) -> Vec<AwardedBadge> {
        let mut awarded = Vec::with_capacity(evaluation.granted.len());
        for grant in &evaluation.granted {
            let badge = AwardedBadge::from_award(&grant.award, &catalog.badges);
            self.events.emit(RewardEvent::BadgeAwarded {
                user_id: user_id.to_string(),
                badge_id: badge.badge_id.clone(),
                name: badge.name.clone(),
            });
            self.emit_tier_change(user_id, &grant.previous_tier, &grant.aggregate.tier);
            awarded.push(badge);
        }
        awarded
    }

    fn emit_tier_change(&self, user_id: &str, from: &str, to: &str) {
        if from != to {
            info!(user_id = %user_id, from = %from, to = %to, "Tier changed");
            self.events.emit(RewardEvent::TierChanged {
                user_id: user_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    fn flag_for_reconciliation(&self, user_id: &str, reason: &str) -> bool {
        let entry = PendingReconciliation {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
            flagged_at: current_timestamp(),
        };
        // Storage may be the thing that is failing; the in-memory entry still holds
        if let Err(e) = self.repo.flag_reconciliation(&entry) {
            warn!(user_id = %user_id, error = %e, "Could not persist reconciliation flag");
        }
        self.pending.insert(user_id.to_string(), entry);
        self.events.emit(RewardEvent::ReconciliationFlagged {
            user_id: user_id.to_string(),
            reason: reason.to_string(),
        });
        true
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Users queued by failed triggers, oldest first
    pub fn pending_reconciliations(&self) -> Vec<PendingReconciliation> {
        let mut pending: Vec<_> = self.pending.iter().map(|e| e.value().clone()).collect();
        pending.sort_by(|a, b| a.flagged_at.cmp(&b.flagged_at).then_with(|| a.user_id.cmp(&b.user_id)));
        pending
    }

    /// Rebuild a user's aggregate from the ledger, then award any badges
    /// the rebuilt counters qualify for.
    pub fn reconcile_user(&self, user_id: &str) -> Result<ReconciliationReport, RewardsError> {
        let catalog = self.catalog();

        let rebuilt = self
            .settings
            .retry
            .run("rebuild aggregate", || self.repo.rebuild_aggregate(user_id, &self.tiers))?;

        let before_total = rebuilt.before.as_ref().map(|b| b.total_points);
        let drift = match &rebuilt.before {
            Some(before) => !same_derived_state(before, &rebuilt.after),
            None => rebuilt.after.total_points != 0,
        };
        if drift {
            warn!(user_id = %user_id, before = ?before_total, after = rebuilt.after.total_points, "Aggregate drift repaired");
        } else {
            debug!(user_id = %user_id, "Aggregate consistent with ledger");
        }
        if let Some(before) = &rebuilt.before {
            self.emit_tier_change(user_id, &before.tier, &rebuilt.after.tier);
        }

        let rule_badges = self.owed_rule_badges(&catalog, &rebuilt.after)?;
        let evaluation = self
            .evaluator(&catalog)
            .evaluate(rebuilt.after, &rule_badges, None, Utc::now());
        let badges_awarded = self.publish_awards(user_id, &evaluation, &catalog);
        if let Some(e) = evaluation.failure {
            return Err(e);
        }

        self.repo.clear_reconciliation(user_id)?;
        self.pending.remove(user_id);

        Ok(ReconciliationReport {
            user_id: user_id.to_string(),
            drift,
            total_points_before: before_total,
            aggregate: evaluation.aggregate,
            badges_awarded,
        })
    }

    /// Badges referenced by rules whose rows are in the ledger but which the
    /// user does not hold, each sourced from the first such row
    fn owed_rule_badges(&self, catalog: &Catalog, aggregate: &UserAggregate) -> Result<Vec<RuleBadge>, RewardsError> {
        let mut owed: Vec<RuleBadge> = Vec::new();
        for row in self.repo.rule_transactions(&aggregate.user_id)? {
            let Some(rule_id) = row.rule_id.as_deref() else {
                continue;
            };
            let Some(badge_id) = catalog
                .rules
                .all_rules()
                .find(|r| r.id == rule_id)
                .and_then(|r| r.badge_ref.as_ref())
            else {
                continue;
            };
            if aggregate.badges_earned.contains(badge_id) || owed.iter().any(|rb| &rb.badge_id == badge_id) {
                continue;
            }
            owed.push(RuleBadge {
                rule_id: rule_id.to_string(),
                badge_id: badge_id.clone(),
                source_transaction_id: Some(row.id.clone()),
            });
        }
        Ok(owed)
    }

    /// Compare the aggregate total with the ledger sum
    pub fn verify_user(&self, user_id: &str) -> Result<VerifyReport, RewardsError> {
        let aggregate_total = self.repo.aggregate(user_id)?.map(|a| a.total_points);
        let ledger_total = self.repo.ledger_total(user_id)?;
        Ok(VerifyReport {
            user_id: user_id.to_string(),
            aggregate_total,
            ledger_total,
            consistent: aggregate_total.unwrap_or(0) == ledger_total,
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Summary for a user; users without activity get the zero aggregate
    pub fn summary(&self, user_id: &str) -> Result<UserSummary, RewardsError> {
        let aggregate = self
            .repo
            .aggregate(user_id)?
            .unwrap_or_else(|| UserAggregate::empty(user_id, self.tiers.lowest()));
        let badges = self.repo.awards_for_user(user_id)?;
        Ok(UserSummary {
            progress: self.tiers.progress(aggregate.total_points),
            aggregate,
            badges,
        })
    }

    /// Ledger rows for a user, newest first
    pub fn history(&self, user_id: &str, limit: u32, offset: u32) -> Result<Vec<PointsTransaction>, RewardsError> {
        self.repo.transactions_for_user(user_id, limit.clamp(1, MAX_PAGE_SIZE), offset)
    }

    pub fn user_badges(&self, user_id: &str) -> Result<Vec<BadgeAward>, RewardsError> {
        self.repo.awards_for_user(user_id)
    }

    pub fn badge_catalog(&self) -> Vec<BadgeDefinition> {
        self.catalog().badges.all().to_vec()
    }

    pub fn leaderboard(&self, limit: u32) -> Result<Vec<LeaderboardEntry>, RewardsError> {
        self.repo.leaderboard(limit.clamp(1, MAX_PAGE_SIZE))
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Validate and swap in a new catalog. In-flight triggers finish with
    /// the catalog they started with.
    pub fn reload_catalog(
        &self,
        rules: Vec<RuleDefinition>,
        streak_triggers: &[TriggerKind],
        badges: Vec<BadgeDefinition>,
    ) -> Result<(), RewardsError> {
        let catalog = Catalog::new(rules, streak_triggers, badges)?;
        self.repo.sync_badges(catalog.badges.all())?;

        let mut guard = self
            .catalog
            .write()
            .map_err(|e| RewardsError::Internal(format!("Lock poisoned: {}", e)))?;
        *guard = Arc::new(catalog);
        info!("Catalog reloaded");
        Ok(())
    }
}

/// Columns a ledger rebuild recomputes
fn same_derived_state(a: &UserAggregate, b: &UserAggregate) -> bool {
    a.total_points == b.total_points
        && a.level == b.level
        && a.tier == b.tier
        && a.streak_days == b.streak_days
        && a.best_streak == b.best_streak
        && a.last_activity_date == b.last_activity_date
        && Counter::ALL
            .iter()
            .filter(|c| c.increment_column().is_some())
            .all(|c| a.counter_value(*c) == b.counter_value(*c))
}
