//! Badge evaluation
//!
//! Runs after the ledger batch commits, outside its transaction. Awards
//! are idempotent on `(user_id, badge_id)`, so evaluating the same
//! aggregate twice never awards a badge twice.
//!
//! A badge bonus can push another counter over a threshold, so evaluation
//! repeats until nothing new qualifies or the pass limit is hit. The first
//! pass checks every badge, which also picks up criteria deferred by an
//! earlier call; later passes only look at counters the previous pass
//! changed.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::intake::RuleBadge;
use super::retry::RetryPolicy;
use crate::catalog::{BadgeCatalog, BadgeDefinition, Counter};
use crate::db::models::UserAggregate;
use crate::error::RewardsError;
use crate::repository::{BadgeGrant, GrantOutcome, RewardsRepository};
use crate::tier::TierTable;

/// Shared inputs of one evaluation
pub struct BadgeEvaluator<'a> {
    pub repo: &'a dyn RewardsRepository,
    pub badges: &'a BadgeCatalog,
    pub tiers: &'a TierTable,
    pub retry: &'a RetryPolicy,
    pub max_passes: u32,
}

/// Awards made by one evaluation
#[derive(Debug)]
pub struct Evaluation {
    pub granted: Vec<GrantOutcome>,
    /// Latest committed aggregate seen during evaluation
    pub aggregate: UserAggregate,
    /// Criteria were still met when the pass limit was reached
    pub deferred: bool,
    /// Storage failure that stopped evaluation early
    pub failure: Option<RewardsError>,
}

struct Candidate<'b> {
    badge: &'b BadgeDefinition,
    reason: String,
    /// Overrides the evaluation-wide source transaction
    source: Option<String>,
}

impl<'a> BadgeEvaluator<'a> {
    /// Evaluate badges for `aggregate`, first granting any badges the
    /// matched rules reference.
    pub fn evaluate(
        &self,
        aggregate: UserAggregate,
        rule_badges: &[RuleBadge],
        source_transaction_id: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Evaluation {
        let mut evaluation = Evaluation {
            granted: Vec::new(),
            aggregate,
            deferred: false,
            failure: None,
        };
        let mut warned = HashSet::new();
        let mut scope: Option<BTreeSet<Counter>> = None;

        for pass in 0..self.max_passes.max(1) {
            let mut candidates = if pass == 0 {
                self.rule_candidates(&evaluation.aggregate, rule_badges)
            } else {
                Vec::new()
            };
            for candidate in self.criteria_candidates(&evaluation.aggregate, scope.as_ref(), &mut warned) {
                if !candidates.iter().any(|c| c.badge.id == candidate.badge.id) {
                    candidates.push(candidate);
                }
            }

            if candidates.is_empty() {
                return evaluation;
            }

            let mut changed = BTreeSet::new();
            for candidate in candidates {
                let grant = BadgeGrant {
                    user_id: evaluation.aggregate.user_id.clone(),
                    badge_id: candidate.badge.id.clone(),
                    reason: candidate.reason,
                    source_transaction_id: candidate
                        .source
                        .or_else(|| source_transaction_id.map(str::to_string)),
                    bonus_points: candidate.badge.points_value,
                    occurred_at,
                };

                match self.retry.run("grant badge", || self.repo.grant_badge(&grant, self.tiers)) {
                    Ok(Some(outcome)) => {
                        info!(
                            user_id = %grant.user_id,
                            badge_id = %grant.badge_id,
                            bonus = grant.bonus_points,
                            pass,
                            "Badge awarded"
                        );
                        changed.insert(Counter::BadgesEarned);
                        if outcome.bonus.is_some() {
                            changed.insert(Counter::TotalPoints);
                        }
                        evaluation.aggregate = outcome.aggregate.clone();
                        evaluation.granted.push(outcome);
                    }
                    Ok(None) => {
                        // Awarded concurrently by another call
                        debug!(user_id = %grant.user_id, badge_id = %grant.badge_id, "Badge already held");
                        evaluation.aggregate.badges_earned.insert(grant.badge_id.clone());
                    }
                    Err(e) => {
                        evaluation.failure = Some(e);
                        return evaluation;
                    }
                }
            }
            scope = Some(changed);
        }

        let remaining = self.criteria_candidates(&evaluation.aggregate, scope.as_ref(), &mut warned);
        if !remaining.is_empty() {
            let ids: Vec<&str> = remaining.iter().map(|c| c.badge.id.as_str()).collect();
            debug!(
                user_id = %evaluation.aggregate.user_id,
                badges = ?ids,
                max_passes = self.max_passes,
                "Badge pass limit reached, deferring remaining criteria"
            );
            evaluation.deferred = true;
        }
        evaluation
    }

    fn rule_candidates(&self, aggregate: &UserAggregate, rule_badges: &[RuleBadge]) -> Vec<Candidate<'a>> {
        let mut out: Vec<Candidate<'a>> = Vec::new();
        for rb in rule_badges {
            if aggregate.badges_earned.contains(&rb.badge_id) || out.iter().any(|c| c.badge.id == rb.badge_id) {
                continue;
            }
            match self.badges.get(&rb.badge_id) {
                Some(badge) => out.push(Candidate {
                    badge,
                    reason: format!("rule {}", rb.rule_id),
                    source: rb.source_transaction_id.clone(),
                }),
                None => warn!(badge_id = %rb.badge_id, rule_id = %rb.rule_id, "Rule references unknown badge"),
            }
        }
        out
    }

    /// Unearned badges whose threshold is met. `scope` limits the check to
    /// badges over the given counters.
    fn criteria_candidates(
        &self,
        aggregate: &UserAggregate,
        scope: Option<&BTreeSet<Counter>>,
        warned: &mut HashSet<String>,
    ) -> Vec<Candidate<'a>> {
        let mut out = Vec::new();
        for badge in self.badges.all() {
            let Some(criteria) = &badge.award_criteria else {
                continue;
            };
            if aggregate.badges_earned.contains(&badge.id) {
                continue;
            }
            let counter = match criteria.resolve(&badge.id) {
                Ok(counter) => counter,
                Err(e) => {
                    if warned.insert(badge.id.clone()) {
                        warn!(badge_id = %badge.id, error = %e, "Skipping badge with malformed criteria");
                    }
                    continue;
                }
            };
            if scope.is_some_and(|s| !s.contains(&counter)) {
                continue;
            }
            if aggregate.counter_value(counter) >= criteria.threshold {
                out.push(Candidate {
                    badge,
                    reason: format!("{} >= {}", counter, criteria.threshold),
                    source: None,
                });
            }
        }
        out
    }
}
