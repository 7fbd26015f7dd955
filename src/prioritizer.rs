//! Test prioritization
//!
//! Thin orchestration over the engine: propagate, try to refine, rank and
//! bucket. Feedback from executed tests flows back into history and the RL
//! policy, and learned edge weights are written through the shared graph.

use crate::config::{ConfigError, PrioritizationConfig, SikgConfig};
use crate::graph::SharedGraph;
use crate::history::{FaultObservation, HistoricalWeights, RecalibrationSummary};
use crate::impact::{HistoricalBoost, ImpactPropagator};
use crate::model::{ImpactMap, NodeId, SemanticChange, TestImpact, TestRunResult};
use crate::rl::{EdgeWeightUpdate, OutcomeSummary, RlRefiner};
use anyhow::Result;
use serde::Serialize;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactCategory {
    High,
    Medium,
    Low,
}

impl ImpactCategory {
    pub fn for_score(score: f64, thresholds: &PrioritizationConfig) -> Self {
        if score >= thresholds.high_impact_threshold {
            ImpactCategory::High
        } else if score < thresholds.low_impact_threshold {
            ImpactCategory::Low
        } else {
            ImpactCategory::Medium
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrioritizedTest {
    /// 1-based.
    pub rank: usize,
    pub test_id: NodeId,
    pub impact_score: f64,
    pub category: ImpactCategory,
}

/// Test ids per bucket, each sorted by descending score.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImpactCategories {
    pub high: Vec<NodeId>,
    pub medium: Vec<NodeId>,
    pub low: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub observations_recorded: usize,
    pub rl: Option<OutcomeSummary>,
    pub edges_updated: usize,
}

pub struct TestPrioritizer {
    thresholds: PrioritizationConfig,
    graph: SharedGraph,
    propagator: ImpactPropagator,
    history: RwLock<HistoricalWeights>,
    refiner: Option<RlRefiner>,
}

impl TestPrioritizer {
    /// Rejects an invalid `config` before anything is propagated.
    pub fn new(config: &SikgConfig, graph: SharedGraph, history: HistoricalWeights) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            thresholds: config.prioritization.clone(),
            graph,
            propagator: ImpactPropagator::new(config.propagation.clone()),
            history: RwLock::new(history),
            refiner: None,
        })
    }

    pub fn with_refiner(mut self, refiner: RlRefiner) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn refiner(&self) -> Option<&RlRefiner> {
        self.refiner.as_ref()
    }

    /// Propagate `changes` over a graph snapshot, then refine with RL when a
    /// refiner is configured. Refinement falls back to the propagated result
    /// on failure.
    pub fn calculate_test_impact(&self, changes: &[SemanticChange]) -> ImpactMap {
        let impacts = self.propagate(changes);
        match &self.refiner {
            Some(refiner) => refiner.start_rl_test_session(changes, &impacts),
            None => impacts,
        }
    }

    /// Scores from propagation and the learned policy alone, without
    /// exploration noise. Use when reconstructing the predictions a test run
    /// was selected with.
    pub fn calculate_expected_impact(&self, changes: &[SemanticChange]) -> ImpactMap {
        let impacts = self.propagate(changes);
        match &self.refiner {
            Some(refiner) => refiner.exploit(changes, &impacts),
            None => impacts,
        }
    }

    fn propagate(&self, changes: &[SemanticChange]) -> ImpactMap {
        let graph = self.graph.snapshot();
        let history = self.history.read().unwrap_or_else(PoisonError::into_inner);
        let boost: &dyn HistoricalBoost = &*history;
        self.propagator.propagate(&graph, changes, boost)
    }

    /// Stable descending sort by score; ties keep iteration order.
    pub fn get_prioritized_tests(&self, impacts: &ImpactMap, limit: Option<usize>) -> Vec<PrioritizedTest> {
        let mut ranked: Vec<&TestImpact> = impacts.values().collect();
        ranked.sort_by(|a, b| b.impact_score.total_cmp(&a.impact_score));
        ranked
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .enumerate()
            .map(|(index, impact)| PrioritizedTest {
                rank: index + 1,
                test_id: impact.test_id.clone(),
                impact_score: impact.impact_score,
                category: ImpactCategory::for_score(impact.impact_score, &self.thresholds),
            })
            .collect()
    }

    pub fn categorize_tests_by_impact(&self, impacts: &ImpactMap) -> ImpactCategories {
        let mut categories = ImpactCategories::default();
        for test in self.get_prioritized_tests(impacts, None) {
            match test.category {
                ImpactCategory::High => categories.high.push(test.test_id),
                ImpactCategory::Medium => categories.medium.push(test.test_id),
                ImpactCategory::Low => categories.low.push(test.test_id),
            }
        }
        categories
    }

    /// Feed executed test results back into history and the RL policy.
    ///
    /// `predictions` are the impacts the tests were selected with. RL failures
    /// are logged and do not fail the call; history is always recorded.
    pub fn record_test_results(
        &self,
        changes: &[SemanticChange],
        predictions: &ImpactMap,
        results: &[TestRunResult],
    ) -> Result<(FeedbackSummary, Vec<FaultObservation>)> {
        let observations = self
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record_test_run(changes, results);
        let mut summary = FeedbackSummary {
            observations_recorded: observations.len(),
            ..FeedbackSummary::default()
        };

        if let Some(refiner) = &self.refiner {
            let graph = self.graph.snapshot();
            match refiner.record_outcomes(&graph, changes, predictions, results) {
                Ok(outcome) => {
                    summary.edges_updated = self.apply_edge_updates(&outcome.edge_updates)?;
                    summary.rl = Some(outcome);
                }
                Err(err) => warn!(error = %err, "failed to record RL outcomes"),
            }
        }
        Ok((summary, observations))
    }

    /// Recalibrate historical weights against the shared graph.
    pub fn recalibrate(&self, now: i64) -> Result<RecalibrationSummary> {
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        self.graph.update(|graph| history.recalibrate(now, graph))
    }

    fn apply_edge_updates(&self, updates: &[EdgeWeightUpdate]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let applied = self.graph.update(|graph| -> Result<usize> {
            let mut applied = 0;
            for update in updates {
                if graph.set_edge_weight(&update.source, update.kind, &update.target, update.new_weight)? {
                    applied += 1;
                }
            }
            Ok(applied)
        })?;
        info!(applied, "learned edge weights applied");
        Ok(applied)
    }
}
