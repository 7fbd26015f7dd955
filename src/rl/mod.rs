//! Reinforcement-learning refinement of impact scores
//!
//! [`RlRefiner::start_rl_test_session`] nudges each test's score by the
//! learned adjustments of the changes that reached it, optionally with a small
//! exploratory perturbation. [`RlRefiner::record_outcomes`] feeds observed test
//! results back into the policy and reports edges whose tests have saturated
//! their adjustment, so the graph itself can learn.
//!
//! Refinement never blocks test selection: any error or panic inside a
//! session yields the unrefined impacts.

pub mod policy;
pub mod reward;

pub use policy::{InMemoryPolicyStore, PairPolicy, PolicyLease, PolicyManager, PolicyState, PolicyStore};
pub use reward::{RewardContext, RewardFunction, ThresholdReward};

use crate::config::{PrioritizationConfig, RlConfig};
use crate::graph::GraphStore;
use crate::impact::SCORE_DIGITS;
use crate::model::{
    ImpactMap, NodeId, RelationKind, SemanticChange, SemanticChangeType, TestImpact, TestRunResult,
    TestStatus,
};
use crate::util::round_to;
use anyhow::{Result, bail};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Kind biases learn at this fraction of the pair learning rate.
const KIND_RATE: f64 = 0.25;

/// Learned edge weights never drop below this, so structural edges are not
/// mistaken for aged-out historical ones.
const MIN_LEARNED_WEIGHT: f64 = 0.01;

/// A structural weight change proposed from saturated test policies.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeWeightUpdate {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: RelationKind,
    pub old_weight: f64,
    pub new_weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeSummary {
    pub observations: usize,
    pub rewarded: usize,
    pub edge_updates: Vec<EdgeWeightUpdate>,
}

pub struct RlRefiner {
    config: RlConfig,
    reward: Box<dyn RewardFunction>,
    policy: PolicyManager,
    rng: Mutex<ChaCha8Rng>,
}

impl RlRefiner {
    /// Build a refiner with the default [`ThresholdReward`] derived from the
    /// prioritization thresholds.
    pub fn new(config: RlConfig, thresholds: &PrioritizationConfig, policy: PolicyManager) -> Self {
        let reward = ThresholdReward {
            low: thresholds.low_impact_threshold,
            high: thresholds.high_impact_threshold,
            consistent_pass_runs: config.consistent_pass_runs,
        };
        let seed = config.seed.unwrap_or_else(rand::random);
        Self {
            config,
            reward: Box::new(reward),
            policy,
            rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        }
    }

    pub fn with_reward(mut self, reward: Box<dyn RewardFunction>) -> Self {
        self.reward = reward;
        self
    }

    pub fn config(&self) -> &RlConfig {
        &self.config
    }

    pub fn policy(&self) -> &PolicyManager {
        &self.policy
    }

    /// Refine `original` with the learned policy.
    ///
    /// Returns `original` unchanged when refinement is disabled, fails, or
    /// panics.
    pub fn start_rl_test_session(&self, changes: &[SemanticChange], original: &ImpactMap) -> ImpactMap {
        if !self.config.enabled {
            return original.clone();
        }
        self.fail_closed(original, || self.enhance(changes, original, true))
    }

    /// Like [`start_rl_test_session`](Self::start_rl_test_session) but
    /// applies only the learned policy, never exploration noise.
    pub fn exploit(&self, changes: &[SemanticChange], original: &ImpactMap) -> ImpactMap {
        if !self.config.enabled {
            return original.clone();
        }
        self.fail_closed(original, || self.enhance(changes, original, false))
    }

    fn fail_closed(&self, original: &ImpactMap, session: impl FnOnce() -> Result<ImpactMap>) -> ImpactMap {
        match catch_unwind(AssertUnwindSafe(session)) {
            Ok(Ok(enhanced)) => enhanced,
            Ok(Err(err)) => {
                warn!(error = %err, "RL refinement failed; using unrefined impacts");
                original.clone()
            }
            Err(_) => {
                warn!("RL refinement panicked; using unrefined impacts");
                original.clone()
            }
        }
    }

    fn enhance(&self, changes: &[SemanticChange], original: &ImpactMap, exploring: bool) -> Result<ImpactMap> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let explore = if exploring { self.config.exploration_rate } else { 0.0 };
        let noise = self.config.exploration_noise;

        let enhanced = self.policy.with_state(|state| -> Result<ImpactMap> {
            let mut enhanced = ImpactMap::with_capacity(original.len());
            for (test_id, impact) in original {
                let mut delta = learned_delta(state, test_id, impact);
                if explore > 0.0 && noise > 0.0 && rng.r#gen::<f64>() < explore {
                    delta += rng.gen_range(-noise..=noise);
                }
                let score = round_to((impact.impact_score + delta).clamp(0.0, 1.0), SCORE_DIGITS);
                if !score.is_finite() {
                    bail!("refined score for test {} is not finite", test_id);
                }
                let mut refined = impact.clone();
                refined.impact_score = score;
                enhanced.insert(test_id.clone(), refined);
            }
            Ok(enhanced)
        })?;

        debug!(changes = changes.len(), tests = enhanced.len(), "RL refinement applied");
        Ok(enhanced)
    }

    /// Learn from executed tests.
    ///
    /// Each non-skipped result is attributed to the changes that reached the
    /// test in `predictions`, or to every change in the batch when the test
    /// was not predicted at all (a missed failure). The policy update is
    /// committed atomically.
    pub fn record_outcomes(
        &self,
        graph: &GraphStore,
        changes: &[SemanticChange],
        predictions: &ImpactMap,
        results: &[TestRunResult],
    ) -> Result<OutcomeSummary> {
        let rate = self.config.learning_rate;
        let bound = self.config.max_adjustment;
        let mut summary = OutcomeSummary::default();
        let mut saturated: Vec<(NodeId, f64)> = Vec::new();

        let mut lease = self.policy.acquire();
        let state = lease.state_mut();
        state.runs += 1;

        for result in results {
            if result.status == TestStatus::Skipped {
                continue;
            }
            let impact = predictions.get(&result.test_id);
            let predicted = impact.map(|impact| impact.impact_score).unwrap_or(0.0);

            for (node_id, semantic_type, via) in attributions(impact, changes) {
                summary.observations += 1;
                let reward = {
                    let pair = state.pair_mut(&node_id, &result.test_id);
                    pair.observations += 1;
                    pair.pass_streak = match result.status {
                        TestStatus::Passed => pair.pass_streak.saturating_add(1),
                        _ => 0,
                    };
                    let reward = self.reward.reward(&RewardContext {
                        predicted,
                        status: result.status,
                        pass_streak: pair.pass_streak,
                    });
                    pair.adjustment = (pair.adjustment + rate * reward).clamp(-bound, bound);
                    if reward != 0.0 && bound > 0.0 && pair.adjustment.abs() >= bound {
                        saturated.push((result.test_id.clone(), pair.adjustment.signum()));
                    }
                    reward
                };
                if reward == 0.0 {
                    continue;
                }
                summary.rewarded += 1;
                if let Some(via) = via {
                    let bias = state.kind_bias_mut(semantic_type, via);
                    *bias = (*bias + rate * KIND_RATE * reward).clamp(-bound, bound);
                }
            }
        }

        lease.commit()?;
        summary.edge_updates = self.edge_updates(graph, &saturated);
        info!(
            observations = summary.observations,
            rewarded = summary.rewarded,
            edge_updates = summary.edge_updates.len(),
            "RL policy updated"
        );
        Ok(summary)
    }

    fn edge_updates(&self, graph: &GraphStore, saturated: &[(NodeId, f64)]) -> Vec<EdgeWeightUpdate> {
        let step = self.config.learning_rate * self.config.max_adjustment;
        let mut seen = HashSet::new();
        let mut updates = Vec::new();
        for (test_id, direction) in saturated {
            if !seen.insert(test_id.as_str()) {
                continue;
            }
            for edge in graph.incoming_edges(test_id) {
                let new_weight = round_to(
                    (edge.weight + direction * step).clamp(MIN_LEARNED_WEIGHT, 1.0),
                    SCORE_DIGITS,
                );
                if edge.weight > 0.0 && new_weight != edge.weight {
                    updates.push(EdgeWeightUpdate {
                        source: edge.source.clone(),
                        target: edge.target.clone(),
                        kind: edge.kind,
                        old_weight: edge.weight,
                        new_weight,
                    });
                }
            }
        }
        updates
    }
}

/// `Σ share_c * (pair_adjustment + kind_bias)` over the test's contributions.
fn learned_delta(state: &PolicyState, test_id: &str, impact: &TestImpact) -> f64 {
    let total: f64 = impact
        .contributing_changes
        .iter()
        .map(|contribution| contribution.contribution)
        .sum();
    if total <= 0.0 {
        return 0.0;
    }
    impact
        .contributing_changes
        .iter()
        .map(|contribution| {
            let share = contribution.contribution / total;
            let pair = state.pair(&contribution.node_id, test_id).adjustment;
            let bias = contribution
                .via
                .map(|via| state.kind_bias(contribution.semantic_type, via))
                .unwrap_or(0.0);
            share * (pair + bias)
        })
        .sum()
}

fn attributions(
    impact: Option<&TestImpact>,
    changes: &[SemanticChange],
) -> Vec<(NodeId, SemanticChangeType, Option<RelationKind>)> {
    match impact {
        Some(impact) if !impact.contributing_changes.is_empty() => impact
            .contributing_changes
            .iter()
            .map(|c| (c.node_id.clone(), c.semantic_type, c.via))
            .collect(),
        _ => {
            let mut seen = HashSet::new();
            changes
                .iter()
                .filter(|change| seen.insert(change.node_id.as_str()))
                .map(|change| (change.node_id.clone(), change.semantic_type, None))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContributingChange, Edge};

    fn rl_config(exploration_rate: f64) -> RlConfig {
        RlConfig {
            exploration_rate,
            seed: Some(7),
            ..RlConfig::default()
        }
    }

    fn impact(test_id: &str, score: f64, change: &str) -> TestImpact {
        TestImpact {
            test_id: test_id.to_string(),
            impact_score: score,
            contributing_changes: vec![ContributingChange {
                node_id: change.to_string(),
                semantic_type: SemanticChangeType::BugFix,
                contribution: score,
                via: Some(RelationKind::Tests),
            }],
        }
    }

    fn impacts(entries: &[(&str, f64)]) -> ImpactMap {
        entries
            .iter()
            .map(|(test, score)| (test.to_string(), impact(test, *score, "c")))
            .collect()
    }

    fn refiner(exploration_rate: f64) -> RlRefiner {
        RlRefiner::new(
            rl_config(exploration_rate),
            &PrioritizationConfig::default(),
            PolicyManager::in_memory(),
        )
    }

    fn failed(test_id: &str) -> TestRunResult {
        TestRunResult {
            test_id: test_id.to_string(),
            status: TestStatus::Failed,
            timestamp: 0,
            commit_hash: None,
        }
    }

    fn passed(test_id: &str) -> TestRunResult {
        TestRunResult {
            status: TestStatus::Passed,
            ..failed(test_id)
        }
    }

    #[test]
    fn fresh_policy_without_exploration_is_identity() {
        let refiner = refiner(0.0);
        let original = impacts(&[("t1", 1.0), ("t2", 0.25)]);
        assert_eq!(refiner.start_rl_test_session(&[], &original), original);
    }

    #[test]
    fn disabled_refiner_returns_original() {
        let config = RlConfig {
            enabled: false,
            ..rl_config(1.0)
        };
        let refiner = RlRefiner::new(config, &PrioritizationConfig::default(), PolicyManager::in_memory());
        let original = impacts(&[("t1", 0.5)]);
        assert_eq!(refiner.start_rl_test_session(&[], &original), original);
    }

    #[test]
    fn exploration_is_bounded_and_seeded() {
        let original = impacts(&[("t1", 0.5), ("t2", 0.2), ("t3", 1.0)]);
        let a = refiner(1.0).start_rl_test_session(&[], &original);
        let b = refiner(1.0).start_rl_test_session(&[], &original);
        assert_eq!(a, b);
        for (test_id, refined) in &a {
            let delta = (refined.impact_score - original[test_id].impact_score).abs();
            assert!(delta <= 0.05 + 1e-4, "{test_id} moved by {delta}");
            assert!((0.0..=1.0).contains(&refined.impact_score));
        }
    }

    #[test]
    fn exploit_skips_exploration_noise() {
        let original = impacts(&[("t1", 0.5), ("t2", 0.2), ("t3", 1.0)]);
        let refiner = refiner(1.0);
        assert_eq!(refiner.exploit(&[], &original), original);
        assert_ne!(refiner.start_rl_test_session(&[], &original), original);
    }

    #[test]
    fn missed_failure_raises_future_score() {
        let refiner = refiner(0.0);
        let graph = GraphStore::new();
        let predictions = impacts(&[("t1", 0.1)]);
        let change = SemanticChange::new("c", SemanticChangeType::BugFix, 1.0);

        let summary = refiner
            .record_outcomes(&graph, std::slice::from_ref(&change), &predictions, &[failed("t1")])
            .unwrap();
        assert_eq!(summary.rewarded, 1);

        refiner.policy().with_state(|state| {
            let pair = state.pair("c", "t1");
            assert!((pair.adjustment - 0.09).abs() < 1e-12);
            assert_eq!(pair.pass_streak, 0);
            let bias = state.kind_bias(SemanticChangeType::BugFix, RelationKind::Tests);
            assert!((bias - 0.0225).abs() < 1e-12);
        });

        let refined = refiner.start_rl_test_session(&[change], &predictions);
        assert!(refined["t1"].impact_score > 0.1);
    }

    #[test]
    fn unpredicted_failure_is_attributed_to_batch() {
        let refiner = refiner(0.0);
        let graph = GraphStore::new();
        let changes = [
            SemanticChange::new("c1", SemanticChangeType::FeatureAddition, 1.0),
            SemanticChange::new("c2", SemanticChangeType::BugFix, 1.0),
        ];
        let summary = refiner
            .record_outcomes(&graph, &changes, &ImpactMap::new(), &[failed("t9")])
            .unwrap();
        assert_eq!(summary.observations, 2);
        refiner.policy().with_state(|state| {
            assert!(state.pair("c1", "t9").adjustment > 0.0);
            assert!(state.pair("c2", "t9").adjustment > 0.0);
            assert_eq!(state.runs, 1);
        });
    }

    #[test]
    fn consistent_passes_lower_over_selected_tests() {
        let refiner = refiner(0.0);
        let graph = GraphStore::new();
        let predictions = impacts(&[("t1", 0.9)]);
        for _ in 0..2 {
            refiner.record_outcomes(&graph, &[], &predictions, &[passed("t1")]).unwrap();
        }
        refiner.policy().with_state(|state| assert_eq!(state.pair("c", "t1").adjustment, 0.0));

        refiner.record_outcomes(&graph, &[], &predictions, &[passed("t1")]).unwrap();
        refiner.policy().with_state(|state| {
            let pair = state.pair("c", "t1");
            assert_eq!(pair.pass_streak, 3);
            assert!(pair.adjustment < 0.0);
        });
    }

    #[test]
    fn saturated_pairs_propose_edge_updates() {
        let refiner = refiner(0.0);
        let mut graph = GraphStore::new();
        graph.upsert_edge(Edge::new("c", "t1", RelationKind::Tests, 0.5)).unwrap();
        let predictions = impacts(&[("t1", 0.0)]);

        let mut last = OutcomeSummary::default();
        for _ in 0..4 {
            last = refiner
                .record_outcomes(&graph, &[], &predictions, &[failed("t1")])
                .unwrap();
        }
        // 0.1 per round against a 0.3 bound: saturated from the third round on
        assert_eq!(last.edge_updates.len(), 1);
        let update = &last.edge_updates[0];
        assert_eq!(update.old_weight, 0.5);
        assert_eq!(update.new_weight, 0.53);
        refiner.policy().with_state(|state| assert_eq!(state.pair("c", "t1").adjustment, 0.3));
    }

    #[test]
    fn non_finite_scores_fail_closed() {
        let mut state = PolicyState::new();
        state.pair_mut("c", "t1").adjustment = f64::NAN;
        let manager = PolicyManager::new(Box::new(InMemoryPolicyStore::with_state(state))).unwrap();
        let refiner = RlRefiner::new(rl_config(0.0), &PrioritizationConfig::default(), manager);

        let original = impacts(&[("t1", 0.4), ("t2", 0.8)]);
        assert_eq!(refiner.start_rl_test_session(&[], &original), original);
    }

    #[test]
    fn panics_fail_closed() {
        let refiner = refiner(0.0);
        let original = impacts(&[("t1", 0.4)]);
        let result = refiner.fail_closed(&original, || panic!("policy corrupted"));
        assert_eq!(result, original);
    }
}
