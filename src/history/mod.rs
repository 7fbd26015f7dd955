//! Historical weight subsystem
//!
//! Keeps two append-only record sets and turns them into graph weights:
//!
//! - commits (file lists) feed the co-change estimator, which writes
//!   `DEPENDS_ON` historical weights into the graph
//! - fault observations (change node, test, pass/fail) feed the fault
//!   correlation, which becomes the additive per-hop boost
//!
//! Nothing is derived on the fly. [`HistoricalWeights::recalibrate`]
//! materializes both for a given `now`, and only evidence inside
//! `historical_window_days` counts, so old records age out without ever being
//! deleted.

pub mod cochange;
pub mod git;

pub use cochange::{CoChangePair, CoChangeStats, estimate_cochanges};
pub use git::{mine_git_history, parse_git_log};

use crate::config::HistoryConfig;
use crate::graph::GraphStore;
use crate::impact::HistoricalBoost;
use crate::model::{NodeId, RelationKind, SemanticChange, SemanticChangeType, TestRunResult, TestStatus};
use crate::util::normalize_path_str;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Share of the boost driven by failure recency; the rest is failure rate.
const RECENCY_SHARE: f64 = 0.6;
const FREQUENCY_SHARE: f64 = 0.4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub hash: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub files: Vec<String>,
}

/// One test outcome attributed to one changed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultObservation {
    pub change_node_id: NodeId,
    pub test_id: NodeId,
    pub failed: bool,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

/// Windowed fault statistics for a (change node, test) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FaultCorrelation {
    pub failures: u32,
    pub observations: u32,
    /// Sum of `exp(-days_since / half_life)` over failures.
    pub recency: f64,
}

impl FaultCorrelation {
    /// Unscaled boost in `[0, 1]`.
    pub fn strength(&self) -> f64 {
        if self.failures == 0 || self.observations == 0 {
            return 0.0;
        }
        let recency = 1.0 - (-self.recency).exp();
        let frequency = self.failures as f64 / self.observations as f64;
        (RECENCY_SHARE * recency + FREQUENCY_SHARE * frequency).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecalibrationSummary {
    pub now: i64,
    pub window_start: i64,
    pub commits_in_window: usize,
    pub commits_skipped: usize,
    pub cochange_pairs: usize,
    pub edges_weighted: usize,
    pub edges_pruned: usize,
    pub fault_pairs: usize,
}

/// How strongly a change type leans on past failures.
pub fn semantic_factor(kind: SemanticChangeType) -> f64 {
    match kind {
        SemanticChangeType::BugFix => 1.0,
        SemanticChangeType::DependencyUpdate | SemanticChangeType::RefactoringSignature => 0.9,
        SemanticChangeType::FeatureAddition => 0.8,
        SemanticChangeType::RefactoringLogic => 0.7,
        SemanticChangeType::PerformanceOpt => 0.6,
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoricalWeights {
    config: HistoryConfig,
    commits: Vec<CommitRecord>,
    known_commits: HashSet<String>,
    observations: Vec<FaultObservation>,
    /// change node -> test -> correlation, rebuilt by `recalibrate`
    correlations: HashMap<NodeId, HashMap<NodeId, FaultCorrelation>>,
}

impl HistoricalWeights {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Rebuild from persisted records. Boosts stay at zero until the next
    /// [`recalibrate`](Self::recalibrate).
    pub fn from_records(
        config: HistoryConfig,
        commits: Vec<CommitRecord>,
        observations: Vec<FaultObservation>,
    ) -> Self {
        let mut history = Self::new(config);
        history.ingest_commits(commits);
        history.observations = observations;
        history
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    pub fn commits(&self) -> &[CommitRecord] {
        &self.commits
    }

    pub fn observations(&self) -> &[FaultObservation] {
        &self.observations
    }

    /// Append commits, ignoring hashes already seen. Returns how many were new.
    pub fn ingest_commits(&mut self, commits: impl IntoIterator<Item = CommitRecord>) -> usize {
        let mut added = 0;
        for mut commit in commits {
            if !self.known_commits.insert(commit.hash.clone()) {
                continue;
            }
            for file in &mut commit.files {
                *file = normalize_path_str(file);
            }
            self.commits.push(commit);
            added += 1;
        }
        added
    }

    /// Attribute every non-skipped result to every changed node in the batch.
    ///
    /// Returns the new observations; they are also appended to the record set.
    pub fn record_test_run(
        &mut self,
        changes: &[SemanticChange],
        results: &[TestRunResult],
    ) -> Vec<FaultObservation> {
        let mut seen = HashSet::new();
        let change_nodes: Vec<&str> = changes
            .iter()
            .map(|change| change.node_id.as_str())
            .filter(|id| seen.insert(*id))
            .collect();

        let mut added = Vec::new();
        for result in results {
            if result.status == TestStatus::Skipped {
                continue;
            }
            for change_node in &change_nodes {
                added.push(FaultObservation {
                    change_node_id: change_node.to_string(),
                    test_id: result.test_id.clone(),
                    failed: result.status == TestStatus::Failed,
                    timestamp: result.timestamp,
                    commit_hash: result.commit_hash.clone(),
                });
            }
        }
        self.observations.extend(added.iter().cloned());
        added
    }

    pub fn fault_correlation(&self, change_node_id: &str, test_id: &str) -> Option<FaultCorrelation> {
        self.correlations.get(change_node_id)?.get(test_id).copied()
    }

    /// Rewrite the graph's historical weights and the boost table from the
    /// records inside the window ending at `now`.
    ///
    /// Idempotent for a fixed `now` and record set: historical weights are
    /// reset first, then rebuilt in a deterministic order.
    pub fn recalibrate(&mut self, now: i64, graph: &mut GraphStore) -> Result<RecalibrationSummary> {
        let window_start = now - i64::from(self.config.historical_window_days) * 86_400;
        let in_window = |ts: i64| ts >= window_start && ts <= now;

        let mut summary = RecalibrationSummary {
            now,
            window_start,
            ..RecalibrationSummary::default()
        };

        graph.reset_historical_weights();

        let (pairs, stats) = estimate_cochanges(
            self.commits.iter().filter(|commit| in_window(commit.timestamp)),
            &self.config,
        );
        summary.commits_in_window = stats.commits_considered + stats.commits_skipped;
        summary.commits_skipped = stats.commits_skipped;
        summary.cochange_pairs = pairs.len();

        let cap = self.config.max_nodes_per_file;
        for pair in &pairs {
            let sources: Vec<NodeId> = graph.nodes_in_file(&pair.file_a).iter().take(cap).cloned().collect();
            let targets: Vec<NodeId> = graph.nodes_in_file(&pair.file_b).iter().take(cap).cloned().collect();
            for source in &sources {
                for target in &targets {
                    if source == target {
                        continue;
                    }
                    graph.set_historical_weight(source, RelationKind::DependsOn, target, pair.confidence)?;
                    summary.edges_weighted += 1;
                }
            }
        }
        summary.edges_pruned = graph.prune_weightless_edges();

        self.correlations = self.correlate_faults(now, in_window);
        summary.fault_pairs = self.correlations.values().map(HashMap::len).sum();

        info!(
            commits = summary.commits_in_window,
            cochange_pairs = summary.cochange_pairs,
            edges_weighted = summary.edges_weighted,
            edges_pruned = summary.edges_pruned,
            fault_pairs = summary.fault_pairs,
            "historical recalibration finished"
        );
        Ok(summary)
    }

    fn correlate_faults(
        &self,
        now: i64,
        in_window: impl Fn(i64) -> bool,
    ) -> HashMap<NodeId, HashMap<NodeId, FaultCorrelation>> {
        let half_life = self.config.half_life_days;
        let mut by_pair: BTreeMap<(&str, &str), FaultCorrelation> = BTreeMap::new();

        for observation in self.observations.iter().filter(|o| in_window(o.timestamp)) {
            let entry = by_pair
                .entry((observation.change_node_id.as_str(), observation.test_id.as_str()))
                .or_default();
            entry.observations += 1;
            if observation.failed {
                entry.failures += 1;
                let days = (now - observation.timestamp).max(0) as f64 / SECONDS_PER_DAY;
                entry.recency += (-days / half_life).exp();
            }
        }

        let mut correlations: HashMap<NodeId, HashMap<NodeId, FaultCorrelation>> = HashMap::new();
        for ((change, test), correlation) in by_pair {
            if correlation.failures == 0 {
                continue;
            }
            correlations
                .entry(change.to_string())
                .or_default()
                .insert(test.to_string(), correlation);
        }
        debug!(pairs = correlations.len(), "fault correlations rebuilt");
        correlations
    }
}

impl HistoricalBoost for HistoricalWeights {
    fn historical_boost(&self, change: &SemanticChange, target: &str) -> f64 {
        let Some(correlation) = self.fault_correlation(&change.node_id, target) else {
            return 0.0;
        };
        self.config.max_historical_boost * semantic_factor(change.semantic_type) * correlation.strength()
    }
}
