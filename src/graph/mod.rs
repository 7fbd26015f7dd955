//! Graph store for the semantic impact knowledge graph
//!
//! Holds nodes and directed weighted edges. Lookups are O(1) through hash
//! indexes and edge iteration is O(out-degree) in insertion order, which is
//! what keeps propagation deterministic.
//!
//! The store does not guard against cycles; traversals own their visited
//! sets.

pub mod shared;
pub mod stable_id;

pub use shared::SharedGraph;

use crate::model::{Edge, Node, NodeId, RelationKind};
use anyhow::{Result, bail};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A batch of node and edge upserts, as produced by a parser for one file or
/// as the serialized form of a whole graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphFragment {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FragmentStats {
    pub nodes_inserted: usize,
    pub nodes_updated: usize,
    pub edges_inserted: usize,
    pub edges_merged: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: IndexMap<NodeId, Node>,
    outgoing: IndexMap<NodeId, Vec<Edge>>,
    incoming: HashMap<NodeId, Vec<NodeId>>,
    files: HashMap<String, Vec<NodeId>>,
}

fn validate_weight(value: f64, what: &str, edge: &Edge) -> Result<()> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        bail!(
            "{} {} out of range [0,1] for {} {} -> {}",
            what,
            value,
            edge.kind,
            edge.source,
            edge.target
        );
    }
    Ok(())
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fragment(fragment: GraphFragment) -> Result<Self> {
        let mut graph = Self::new();
        graph.apply_fragment(fragment)?;
        Ok(graph)
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Outgoing edges of `node_id` in insertion order.
    pub fn get_outgoing_edges(&self, node_id: &str) -> &[Edge] {
        self.outgoing
            .get(node_id)
            .map(|edges| edges.as_slice())
            .unwrap_or(&[])
    }

    pub fn incoming_edges(&self, node_id: &str) -> Vec<&Edge> {
        let Some(sources) = self.incoming.get(node_id) else {
            return Vec::new();
        };
        sources
            .iter()
            .flat_map(|source| self.get_outgoing_edges(source))
            .filter(|edge| edge.target == node_id)
            .collect()
    }

    pub fn get_test_nodes(&self) -> Vec<&Node> {
        self.nodes.values().filter(|node| node.is_test()).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.outgoing.values().flatten()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.outgoing.values().map(Vec::len).sum()
    }

    pub fn nodes_in_file(&self, file_path: &str) -> &[NodeId] {
        let normalized = crate::util::normalize_path_str(file_path);
        self.files
            .get(&normalized)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Insert a node or update it in place. Returns `true` when the node is new.
    ///
    /// Updating keeps the id (and therefore every edge and historical record
    /// that references it); only name, path and location are refreshed.
    pub fn upsert_node(&mut self, mut node: Node) -> Result<bool> {
        if node.id.trim().is_empty() {
            bail!("node '{}' in {} has an empty id", node.name, node.file_path);
        }
        node.file_path = crate::util::normalize_path_str(&node.file_path);

        if let Some(existing) = self.nodes.get_mut(&node.id) {
            if existing.file_path != node.file_path {
                if let Some(ids) = self.files.get_mut(&existing.file_path) {
                    ids.retain(|id| id != &node.id);
                }
                self.files
                    .entry(node.file_path.clone())
                    .or_default()
                    .push(node.id.clone());
            }
            *existing = node;
            return Ok(false);
        }

        self.files
            .entry(node.file_path.clone())
            .or_default()
            .push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(true)
    }

    /// Insert an edge, or merge it into an existing `(source, kind, target)`
    /// edge keeping the maximum weight. Returns `true` when the edge is new.
    pub fn upsert_edge(&mut self, edge: Edge) -> Result<bool> {
        validate_weight(edge.weight, "weight", &edge)?;
        validate_weight(edge.historical_weight, "historical weight", &edge)?;

        let edges = self.outgoing.entry(edge.source.clone()).or_default();
        if let Some(existing) = edges
            .iter_mut()
            .find(|e| e.kind == edge.kind && e.target == edge.target)
        {
            existing.weight = existing.weight.max(edge.weight);
            existing.historical_weight = existing.historical_weight.max(edge.historical_weight);
            return Ok(false);
        }

        let sources = self.incoming.entry(edge.target.clone()).or_default();
        if !sources.contains(&edge.source) {
            sources.push(edge.source.clone());
        }
        edges.push(edge);
        Ok(true)
    }

    /// Overwrite the structural weight of an existing edge.
    pub fn set_edge_weight(
        &mut self,
        source: &str,
        kind: RelationKind,
        target: &str,
        weight: f64,
    ) -> Result<bool> {
        if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
            bail!("weight {} out of range [0,1]", weight);
        }
        let Some(edge) = self.find_edge_mut(source, kind, target) else {
            return Ok(false);
        };
        edge.weight = weight;
        Ok(true)
    }

    /// Set the historical component of an edge, creating a purely historical
    /// edge (structural weight 0) when none exists.
    pub fn set_historical_weight(
        &mut self,
        source: &str,
        kind: RelationKind,
        target: &str,
        weight: f64,
    ) -> Result<()> {
        if let Some(edge) = self.find_edge_mut(source, kind, target) {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                bail!("historical weight {} out of range [0,1]", weight);
            }
            edge.historical_weight = weight;
            return Ok(());
        }
        let mut edge = Edge::new(source, target, kind, 0.0);
        edge.historical_weight = weight;
        self.upsert_edge(edge)?;
        Ok(())
    }

    pub fn reset_historical_weights(&mut self) {
        for edge in self.outgoing.values_mut().flatten() {
            edge.historical_weight = 0.0;
        }
    }

    /// Drop edges that carry no weight at all (historical edges whose
    /// evidence has aged out). Returns the number removed.
    pub fn prune_weightless_edges(&mut self) -> usize {
        let mut removed = Vec::new();
        for edges in self.outgoing.values_mut() {
            edges.retain(|edge| {
                let keep = edge.weight > 0.0 || edge.historical_weight > 0.0;
                if !keep {
                    removed.push((edge.source.clone(), edge.target.clone()));
                }
                keep
            });
        }
        for (source, target) in &removed {
            self.unlink_incoming_if_orphaned(source, target);
        }
        removed.len()
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> Option<Node> {
        let node = self.nodes.shift_remove(id)?;
        if let Some(ids) = self.files.get_mut(&node.file_path) {
            ids.retain(|other| other != id);
            if ids.is_empty() {
                self.files.remove(&node.file_path);
            }
        }

        if let Some(edges) = self.outgoing.shift_remove(id) {
            for edge in edges {
                if let Some(sources) = self.incoming.get_mut(&edge.target) {
                    sources.retain(|source| source != id);
                }
            }
        }

        if let Some(sources) = self.incoming.remove(id) {
            for source in sources {
                if let Some(edges) = self.outgoing.get_mut(&source) {
                    edges.retain(|edge| edge.target != id);
                }
            }
        }

        Some(node)
    }

    /// Remove every node that lives in `file_path`. Returns the number removed.
    pub fn remove_file(&mut self, file_path: &str) -> usize {
        let ids: Vec<NodeId> = self.nodes_in_file(file_path).to_vec();
        ids.iter()
            .filter(|id| self.remove_node(id).is_some())
            .count()
    }

    /// Apply a parser batch: nodes first, then edges.
    pub fn apply_fragment(&mut self, fragment: GraphFragment) -> Result<FragmentStats> {
        let mut stats = FragmentStats::default();
        for node in fragment.nodes {
            if self.upsert_node(node)? {
                stats.nodes_inserted += 1;
            } else {
                stats.nodes_updated += 1;
            }
        }
        for edge in fragment.edges {
            if self.upsert_edge(edge)? {
                stats.edges_inserted += 1;
            } else {
                stats.edges_merged += 1;
            }
        }
        Ok(stats)
    }

    pub fn to_fragment(&self) -> GraphFragment {
        GraphFragment {
            nodes: self.nodes.values().cloned().collect(),
            edges: self.edges().cloned().collect(),
        }
    }

    fn find_edge_mut(&mut self, source: &str, kind: RelationKind, target: &str) -> Option<&mut Edge> {
        self.outgoing
            .get_mut(source)?
            .iter_mut()
            .find(|edge| edge.kind == kind && edge.target == target)
    }

    fn unlink_incoming_if_orphaned(&mut self, source: &str, target: &str) {
        let still_linked = self
            .get_outgoing_edges(source)
            .iter()
            .any(|edge| edge.target == target);
        if !still_linked {
            if let Some(sources) = self.incoming.get_mut(target) {
                sources.retain(|s| s != source);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NodeKind;

    fn code(name: &str, path: &str) -> Node {
        Node::new(NodeKind::CodeElement, name, path)
    }

    fn test_node(name: &str, path: &str) -> Node {
        Node::new(NodeKind::TestCase, name, path)
    }

    #[test]
    fn duplicate_edges_keep_max_weight() {
        let mut graph = GraphStore::new();
        let a = code("a", "src/a.rs");
        let b = code("b", "src/b.rs");
        graph.upsert_node(a.clone()).unwrap();
        graph.upsert_node(b.clone()).unwrap();

        assert!(graph.upsert_edge(Edge::new(&a.id, &b.id, RelationKind::Calls, 0.4)).unwrap());
        assert!(!graph.upsert_edge(Edge::new(&a.id, &b.id, RelationKind::Calls, 0.9)).unwrap());
        assert!(!graph.upsert_edge(Edge::new(&a.id, &b.id, RelationKind::Calls, 0.2)).unwrap());
        // different kind is a different edge
        assert!(graph.upsert_edge(Edge::new(&a.id, &b.id, RelationKind::Uses, 0.1)).unwrap());

        let edges = graph.get_outgoing_edges(&a.id);
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].weight, 0.9);
        assert_eq!(edges[1].kind, RelationKind::Uses);
    }

    #[test]
    fn rejects_out_of_range_weights() {
        let mut graph = GraphStore::new();
        assert!(graph.upsert_edge(Edge::new("a", "b", RelationKind::Calls, 1.5)).is_err());
        assert!(graph.upsert_edge(Edge::new("a", "b", RelationKind::Calls, -0.1)).is_err());
        assert!(graph.upsert_edge(Edge::new("a", "b", RelationKind::Calls, f64::NAN)).is_err());
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn upsert_node_updates_in_place() {
        let mut graph = GraphStore::new();
        let node = code("a", "src/a.rs");
        assert!(graph.upsert_node(node.clone()).unwrap());
        assert!(!graph.upsert_node(node.clone().with_location(10, 20)).unwrap());
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.get_node(&node.id).unwrap().location.unwrap().start_line, 10);
    }

    #[test]
    fn test_nodes_in_insertion_order() {
        let mut graph = GraphStore::new();
        graph.upsert_node(test_node("t2", "tests/x.rs")).unwrap();
        graph.upsert_node(code("a", "src/a.rs")).unwrap();
        graph.upsert_node(test_node("t1", "tests/x.rs")).unwrap();
        let names: Vec<&str> = graph.get_test_nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["t2", "t1"]);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut graph = GraphStore::new();
        let a = code("a", "src/a.rs");
        let b = code("b", "src/b.rs");
        let t = test_node("t", "tests/t.rs");
        for n in [&a, &b, &t] {
            graph.upsert_node(n.clone()).unwrap();
        }
        graph.upsert_edge(Edge::new(&a.id, &b.id, RelationKind::Calls, 0.8)).unwrap();
        graph.upsert_edge(Edge::new(&b.id, &t.id, RelationKind::Tests, 1.0)).unwrap();

        assert!(graph.remove_node(&b.id).is_some());
        assert!(graph.get_outgoing_edges(&a.id).is_empty());
        assert!(graph.incoming_edges(&t.id).is_empty());
        assert_eq!(graph.edge_count(), 0);
        assert!(graph.remove_node(&b.id).is_none());
    }

    #[test]
    fn remove_file_removes_all_nodes_in_file() {
        let mut graph = GraphStore::new();
        graph.upsert_node(code("a", "src/a.rs")).unwrap();
        graph.upsert_node(code("a2", "./src/a.rs")).unwrap();
        graph.upsert_node(code("b", "src/b.rs")).unwrap();
        assert_eq!(graph.nodes_in_file("src/a.rs").len(), 2);
        assert_eq!(graph.remove_file("src/a.rs"), 2);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.nodes_in_file("src/a.rs").is_empty());
    }

    #[test]
    fn incoming_edges_lists_all_sources() {
        let mut graph = GraphStore::new();
        let t = test_node("t", "tests/t.rs");
        graph.upsert_node(t.clone()).unwrap();
        graph.upsert_edge(Edge::new("x", &t.id, RelationKind::Tests, 1.0)).unwrap();
        graph.upsert_edge(Edge::new("y", &t.id, RelationKind::Tests, 0.5)).unwrap();
        graph.upsert_edge(Edge::new("y", &t.id, RelationKind::Tests, 0.7)).unwrap();
        let incoming = graph.incoming_edges(&t.id);
        assert_eq!(incoming.len(), 2);
        assert_eq!(incoming[1].weight, 0.7);
    }

    #[test]
    fn historical_weights_reset_and_prune() {
        let mut graph = GraphStore::new();
        graph.upsert_edge(Edge::new("a", "b", RelationKind::DependsOn, 0.3)).unwrap();
        graph.set_historical_weight("a", RelationKind::DependsOn, "b", 0.6).unwrap();
        graph.set_historical_weight("a", RelationKind::DependsOn, "c", 0.5).unwrap();
        assert_eq!(graph.get_outgoing_edges("a")[0].effective_weight(), 0.6);
        assert_eq!(graph.edge_count(), 2);

        graph.reset_historical_weights();
        assert_eq!(graph.prune_weightless_edges(), 1);
        let edges = graph.get_outgoing_edges("a");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].effective_weight(), 0.3);
        assert!(graph.incoming_edges("c").is_empty());
    }

    #[test]
    fn fragment_roundtrip_preserves_order() {
        let mut graph = GraphStore::new();
        let a = code("a", "src/a.rs");
        let t = test_node("t", "tests/t.rs");
        graph.upsert_node(a.clone()).unwrap();
        graph.upsert_node(t.clone()).unwrap();
        graph.upsert_edge(Edge::new(&a.id, &t.id, RelationKind::IsTestedBy, 0.9)).unwrap();

        let json = serde_json::to_string(&graph.to_fragment()).unwrap();
        let fragment: GraphFragment = serde_json::from_str(&json).unwrap();
        let restored = GraphStore::from_fragment(fragment).unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.get_outgoing_edges(&a.id), graph.get_outgoing_edges(&a.id));
        assert_eq!(restored.nodes().next().unwrap().id, a.id);
    }
}
