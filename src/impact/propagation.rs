//! Breadth-first impact propagation
//!
//! Each change is propagated on its own: a FIFO queue seeded with the changed
//! node walks outgoing edges, attenuating the score per hop and stopping at the
//! depth limit or when the score drops to the threshold. Test nodes reached on
//! the way accumulate the score. Results from all changes are summed per test
//! and finally normalized so the strongest test scores 1.0.

use crate::config::PropagationConfig;
use crate::graph::GraphStore;
use crate::impact::HistoricalBoost;
use crate::impact::attenuation::attenuation;
use crate::model::{ContributingChange, ImpactMap, RelationKind, SemanticChange, TestImpact};
use crate::util::round_to;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, warn};

/// Output scores and contributions are rounded to this many decimals.
pub const SCORE_DIGITS: i32 = 4;

struct QueueItem<'g> {
    node_id: &'g str,
    score: f64,
    depth: usize,
    via: Option<RelationKind>,
}

pub struct ImpactPropagator {
    config: PropagationConfig,
}

impl ImpactPropagator {
    pub fn new(config: PropagationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Propagate a batch of changes and return normalized test impacts.
    ///
    /// Uses `config.workers` threads when there is more than one change; the
    /// result is identical to the sequential run either way.
    pub fn propagate(
        &self,
        graph: &GraphStore,
        changes: &[SemanticChange],
        boost: &dyn HistoricalBoost,
    ) -> ImpactMap {
        let start = Instant::now();
        let mut impacts = if self.config.workers > 1 && changes.len() > 1 {
            self.propagate_parallel(graph, changes, boost, self.config.workers)
        } else {
            self.propagate_raw(graph, changes, boost)
        };
        normalize_impacts(&mut impacts);
        debug!(
            changes = changes.len(),
            tests = impacts.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "propagation finished"
        );
        impacts
    }

    /// Sequential propagation without normalization.
    pub fn propagate_raw(
        &self,
        graph: &GraphStore,
        changes: &[SemanticChange],
        boost: &dyn HistoricalBoost,
    ) -> ImpactMap {
        let mut impacts = ImpactMap::new();
        for change in changes {
            self.propagate_change(graph, change, boost, &mut impacts);
        }
        impacts
    }

    /// Propagate changes across `workers` scoped threads without normalization.
    ///
    /// Every change gets its own map and the maps are merged back in change
    /// order, so accumulation order (and therefore every float) matches
    /// [`propagate_raw`](Self::propagate_raw).
    pub fn propagate_parallel(
        &self,
        graph: &GraphStore,
        changes: &[SemanticChange],
        boost: &dyn HistoricalBoost,
        workers: usize,
    ) -> ImpactMap {
        if changes.is_empty() {
            return ImpactMap::new();
        }
        let chunk_size = changes.len().div_ceil(workers.max(1));

        std::thread::scope(|scope| {
            let handles: Vec<_> = changes
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|change| {
                                let mut local = ImpactMap::new();
                                self.propagate_change(graph, change, boost, &mut local);
                                local
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut merged = ImpactMap::new();
            for handle in handles {
                match handle.join() {
                    Ok(maps) => {
                        for map in maps {
                            merge_into(&mut merged, map);
                        }
                    }
                    Err(payload) => std::panic::resume_unwind(payload),
                }
            }
            merged
        })
    }

    fn propagate_change<'g>(
        &self,
        graph: &'g GraphStore,
        change: &SemanticChange,
        boost: &dyn HistoricalBoost,
        impacts: &mut ImpactMap,
    ) {
        let seed_score = change.initial_impact_score;
        if !seed_score.is_finite() || seed_score < 0.0 {
            warn!(
                node_id = %change.node_id,
                score = seed_score,
                "ignoring change with invalid initial impact score"
            );
            return;
        }
        let Some(seed) = graph.get_node(&change.node_id) else {
            debug!(node_id = %change.node_id, "change references unknown node");
            return;
        };

        let max_depth = self.config.max_traversal_depth;
        let threshold = self.config.min_impact_threshold;

        let mut visited: HashSet<&'g str> = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(seed.id.as_str());
        queue.push_back(QueueItem {
            node_id: seed.id.as_str(),
            score: seed_score,
            depth: 0,
            via: None,
        });

        while let Some(item) = queue.pop_front() {
            if graph.get_node(item.node_id).is_some_and(|node| node.is_test()) {
                record_hit(impacts, item.node_id, change, &item);
            }
            if item.depth >= max_depth {
                continue;
            }

            for edge in graph.get_outgoing_edges(item.node_id) {
                let target = edge.target.as_str();
                if visited.contains(target) {
                    continue;
                }
                let propagated = item.score
                    * edge.effective_weight()
                    * attenuation(item.depth, edge.kind)
                    + boost.historical_boost(change, target);
                if propagated > threshold {
                    visited.insert(target);
                    queue.push_back(QueueItem {
                        node_id: target,
                        score: propagated,
                        depth: item.depth + 1,
                        via: Some(edge.kind),
                    });
                }
            }
        }
    }
}

fn record_hit(impacts: &mut ImpactMap, test_id: &str, change: &SemanticChange, item: &QueueItem<'_>) {
    let entry = impacts
        .entry(test_id.to_string())
        .or_insert_with(|| TestImpact::new(test_id));
    entry.impact_score += item.score;
    upsert_contribution(
        &mut entry.contributing_changes,
        ContributingChange {
            node_id: change.node_id.clone(),
            semantic_type: change.semantic_type,
            contribution: item.score / (item.depth as f64 + 1.0),
            via: item.via,
        },
    );
}

/// At most one contribution per `(node_id, semantic_type)`; the larger wins.
fn upsert_contribution(contributions: &mut Vec<ContributingChange>, candidate: ContributingChange) {
    match contributions.iter_mut().find(|existing| {
        existing.node_id == candidate.node_id && existing.semantic_type == candidate.semantic_type
    }) {
        Some(existing) => {
            if candidate.contribution > existing.contribution {
                *existing = candidate;
            }
        }
        None => contributions.push(candidate),
    }
}

fn merge_into(merged: &mut ImpactMap, partial: ImpactMap) {
    for (test_id, impact) in partial {
        let entry = merged
            .entry(test_id)
            .or_insert_with_key(|key| TestImpact::new(key));
        entry.impact_score += impact.impact_score;
        for contribution in impact.contributing_changes {
            upsert_contribution(&mut entry.contributing_changes, contribution);
        }
    }
}

/// Scale scores so the maximum becomes 1.0, then round scores and
/// contributions to [`SCORE_DIGITS`].
///
/// Skips the division when the maximum is zero or already one.
pub fn normalize_impacts(impacts: &mut ImpactMap) {
    let max = impacts
        .values()
        .map(|impact| impact.impact_score)
        .fold(0.0_f64, f64::max);

    let scale = max > 0.0 && max != 1.0;
    for impact in impacts.values_mut() {
        if scale {
            impact.impact_score /= max;
        }
        impact.impact_score = round_to(impact.impact_score, SCORE_DIGITS);
        for contribution in &mut impact.contributing_changes {
            contribution.contribution = round_to(contribution.contribution, SCORE_DIGITS);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impact::NoHistory;
    use crate::model::{Edge, Node, NodeKind, SemanticChangeType};

    fn config(depth: usize, threshold: f64) -> PropagationConfig {
        PropagationConfig {
            max_traversal_depth: depth,
            min_impact_threshold: threshold,
            workers: 1,
        }
    }

    /// A -CALLS(0.8)-> B -TESTS(1.0)-> T
    fn chain() -> (GraphStore, Node, Node, Node) {
        let mut graph = GraphStore::new();
        let a = Node::new(NodeKind::CodeElement, "a", "src/a.rs");
        let b = Node::new(NodeKind::CodeElement, "b", "src/b.rs");
        let t = Node::new(NodeKind::TestCase, "t", "tests/t.rs");
        for node in [&a, &b, &t] {
            graph.upsert_node(node.clone()).unwrap();
        }
        graph.upsert_edge(Edge::new(&a.id, &b.id, RelationKind::Calls, 0.8)).unwrap();
        graph.upsert_edge(Edge::new(&b.id, &t.id, RelationKind::Tests, 1.0)).unwrap();
        (graph, a, b, t)
    }

    #[test]
    fn chain_raw_score_and_contribution() {
        let (graph, a, _, t) = chain();
        let propagator = ImpactPropagator::new(config(5, 0.05));
        let changes = [SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0)];
        let raw = propagator.propagate_raw(&graph, &changes, &NoHistory);

        let impact = &raw[&t.id];
        assert!((impact.impact_score - 0.36).abs() < 1e-9);
        assert_eq!(impact.contributing_changes.len(), 1);
        let contribution = &impact.contributing_changes[0];
        assert!((contribution.contribution - 0.12).abs() < 1e-9);
        assert_eq!(contribution.via, Some(RelationKind::Tests));
    }

    #[test]
    fn chain_normalizes_to_one() {
        let (graph, a, _, t) = chain();
        let propagator = ImpactPropagator::new(config(5, 0.05));
        let changes = [SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0)];
        let impacts = propagator.propagate(&graph, &changes, &NoHistory);
        assert_eq!(impacts[&t.id].impact_score, 1.0);
        assert_eq!(impacts[&t.id].contributing_changes[0].contribution, 0.12);
    }

    #[test]
    fn depth_limit_stops_before_test() {
        let (graph, a, _, _) = chain();
        let propagator = ImpactPropagator::new(config(1, 0.05));
        let changes = [SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0)];
        assert!(propagator.propagate(&graph, &changes, &NoHistory).is_empty());
    }

    #[test]
    fn threshold_prunes_weak_paths() {
        let (graph, a, _, _) = chain();
        // 0.72 at B passes, 0.36 at T does not
        let propagator = ImpactPropagator::new(config(5, 0.4));
        let changes = [SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0)];
        assert!(propagator.propagate(&graph, &changes, &NoHistory).is_empty());
    }

    #[test]
    fn changed_test_counts_itself() {
        let (graph, _, _, t) = chain();
        let propagator = ImpactPropagator::new(config(5, 0.05));
        let changes = [SemanticChange::new(&t.id, SemanticChangeType::RefactoringLogic, 0.4)];
        let raw = propagator.propagate_raw(&graph, &changes, &NoHistory);
        assert!((raw[&t.id].impact_score - 0.4).abs() < 1e-12);
        assert_eq!(raw[&t.id].contributing_changes[0].via, None);
    }

    #[test]
    fn unknown_and_invalid_changes_are_skipped() {
        let (graph, a, _, _) = chain();
        let propagator = ImpactPropagator::new(config(5, 0.05));
        let changes = [
            SemanticChange::new("sikg_missing", SemanticChangeType::BugFix, 1.0),
            SemanticChange::new(&a.id, SemanticChangeType::BugFix, f64::NAN),
            SemanticChange::new(&a.id, SemanticChangeType::BugFix, -1.0),
        ];
        assert!(propagator.propagate(&graph, &changes, &NoHistory).is_empty());
    }

    #[test]
    fn cycles_terminate() {
        let (mut graph, a, b, t) = chain();
        graph.upsert_edge(Edge::new(&b.id, &a.id, RelationKind::Calls, 1.0)).unwrap();
        graph.upsert_edge(Edge::new(&t.id, &a.id, RelationKind::Uses, 1.0)).unwrap();
        let propagator = ImpactPropagator::new(config(50, 0.0));
        let changes = [SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0)];
        let impacts = propagator.propagate(&graph, &changes, &NoHistory);
        assert_eq!(impacts.len(), 1);
    }

    #[test]
    fn duplicate_changes_sum_scores_but_keep_one_contribution() {
        let (graph, a, _, t) = chain();
        let propagator = ImpactPropagator::new(config(5, 0.05));
        let changes = [
            SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0),
            SemanticChange::new(&a.id, SemanticChangeType::BugFix, 0.5),
        ];
        let raw = propagator.propagate_raw(&graph, &changes, &NoHistory);
        assert!((raw[&t.id].impact_score - 0.54).abs() < 1e-9);
        assert_eq!(raw[&t.id].contributing_changes.len(), 1);
        assert!((raw[&t.id].contributing_changes[0].contribution - 0.12).abs() < 1e-9);
    }

    #[test]
    fn historical_boost_is_added_per_hop() {
        struct Flat(f64);
        impl HistoricalBoost for Flat {
            fn historical_boost(&self, _: &SemanticChange, _: &str) -> f64 {
                self.0
            }
        }

        let (graph, a, _, t) = chain();
        let propagator = ImpactPropagator::new(config(5, 0.05));
        let changes = [SemanticChange::new(&a.id, SemanticChangeType::BugFix, 1.0)];
        let raw = propagator.propagate_raw(&graph, &changes, &Flat(0.01));
        // B: 0.72 + 0.01, T: 0.73 * 0.5 + 0.01
        assert!((raw[&t.id].impact_score - 0.375).abs() < 1e-9);
    }

    #[test]
    fn normalize_skips_zero_and_unit_maxima() {
        let mut impacts = ImpactMap::new();
        let mut a = TestImpact::new("a");
        a.impact_score = 0.123456;
        impacts.insert("a".into(), a);
        let mut b = TestImpact::new("b");
        b.impact_score = 1.0;
        impacts.insert("b".into(), b);
        normalize_impacts(&mut impacts);
        assert_eq!(impacts["a"].impact_score, 0.1235);
        assert_eq!(impacts["b"].impact_score, 1.0);

        let mut zeros = ImpactMap::new();
        zeros.insert("z".into(), TestImpact::new("z"));
        normalize_impacts(&mut zeros);
        assert_eq!(zeros["z"].impact_score, 0.0);
    }
}
