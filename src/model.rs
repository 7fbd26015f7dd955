use crate::graph::stable_id::compute_node_id;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content-addressed node identifier (see [`compute_node_id`]).
pub type NodeId = String;

/// Impact results keyed by test id, in first-touch order.
pub type ImpactMap = IndexMap<NodeId, TestImpact>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeKind {
    CodeElement,
    TestCase,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::CodeElement => "CodeElement",
            NodeKind::TestCase => "TestCase",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub start_line: i64,
    pub end_line: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl Node {
    /// Build a node whose id is derived from `(kind, name, normalized path)`.
    pub fn new(kind: NodeKind, name: &str, file_path: &str) -> Self {
        let file_path = crate::util::normalize_path_str(file_path);
        Self {
            id: compute_node_id(kind, name, &file_path),
            kind,
            name: name.to_string(),
            file_path,
            location: None,
        }
    }

    pub fn with_location(mut self, start_line: i64, end_line: i64) -> Self {
        self.location = Some(Location {
            start_line,
            end_line,
        });
        self
    }

    pub fn is_test(&self) -> bool {
        self.kind == NodeKind::TestCase
    }
}

/// Relationship carried by a directed edge.
///
/// Unrecognized kinds coming from a parser deserialize to `Unknown`
/// instead of failing the whole fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationKind {
    Calls,
    Uses,
    InheritsFrom,
    DependsOn,
    BelongsTo,
    Imports,
    Tests,
    IsTestedBy,
    Modifies,
    Unknown,
}

impl RelationKind {
    pub const ALL: [RelationKind; 10] = [
        RelationKind::Calls,
        RelationKind::Uses,
        RelationKind::InheritsFrom,
        RelationKind::DependsOn,
        RelationKind::BelongsTo,
        RelationKind::Imports,
        RelationKind::Tests,
        RelationKind::IsTestedBy,
        RelationKind::Modifies,
        RelationKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Calls => "CALLS",
            RelationKind::Uses => "USES",
            RelationKind::InheritsFrom => "INHERITS_FROM",
            RelationKind::DependsOn => "DEPENDS_ON",
            RelationKind::BelongsTo => "BELONGS_TO",
            RelationKind::Imports => "IMPORTS",
            RelationKind::Tests => "TESTS",
            RelationKind::IsTestedBy => "IS_TESTED_BY",
            RelationKind::Modifies => "MODIFIES",
            RelationKind::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim().to_uppercase().as_str() {
            "CALLS" => RelationKind::Calls,
            "USES" => RelationKind::Uses,
            "INHERITS_FROM" => RelationKind::InheritsFrom,
            "DEPENDS_ON" => RelationKind::DependsOn,
            "BELONGS_TO" => RelationKind::BelongsTo,
            "IMPORTS" => RelationKind::Imports,
            "TESTS" => RelationKind::Tests,
            "IS_TESTED_BY" => RelationKind::IsTestedBy,
            "MODIFIES" => RelationKind::Modifies,
            _ => RelationKind::Unknown,
        }
    }
}

impl From<String> for RelationKind {
    fn from(value: String) -> Self {
        RelationKind::parse(&value)
    }
}

impl From<RelationKind> for String {
    fn from(kind: RelationKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// Directed weighted edge.
///
/// `weight` is the structural weight supplied by the parser. `historical_weight`
/// is owned by recalibration and rewritten on every pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: RelationKind,
    pub weight: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub historical_weight: f64,
}

impl Edge {
    pub fn new(source: &str, target: &str, kind: RelationKind, weight: f64) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            weight,
            historical_weight: 0.0,
        }
    }

    pub fn effective_weight(&self) -> f64 {
        self.weight.max(self.historical_weight)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SemanticChangeType {
    BugFix,
    FeatureAddition,
    RefactoringSignature,
    RefactoringLogic,
    DependencyUpdate,
    PerformanceOpt,
}

impl SemanticChangeType {
    pub const ALL: [SemanticChangeType; 6] = [
        SemanticChangeType::BugFix,
        SemanticChangeType::FeatureAddition,
        SemanticChangeType::RefactoringSignature,
        SemanticChangeType::RefactoringLogic,
        SemanticChangeType::DependencyUpdate,
        SemanticChangeType::PerformanceOpt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticChangeType::BugFix => "BUG_FIX",
            SemanticChangeType::FeatureAddition => "FEATURE_ADDITION",
            SemanticChangeType::RefactoringSignature => "REFACTORING_SIGNATURE",
            SemanticChangeType::RefactoringLogic => "REFACTORING_LOGIC",
            SemanticChangeType::DependencyUpdate => "DEPENDENCY_UPDATE",
            SemanticChangeType::PerformanceOpt => "PERFORMANCE_OPT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        SemanticChangeType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for SemanticChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified code modification used as a propagation seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChange {
    pub node_id: NodeId,
    pub semantic_type: SemanticChangeType,
    pub initial_impact_score: f64,
}

impl SemanticChange {
    pub fn new(node_id: &str, semantic_type: SemanticChangeType, initial_impact_score: f64) -> Self {
        Self {
            node_id: node_id.to_string(),
            semantic_type,
            initial_impact_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributingChange {
    pub node_id: NodeId,
    pub semantic_type: SemanticChangeType,
    pub contribution: f64,
    /// Relation of the final hop into the test; `None` when the test was the seed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<RelationKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestImpact {
    pub test_id: NodeId,
    pub impact_score: f64,
    pub contributing_changes: Vec<ContributingChange>,
}

impl TestImpact {
    pub fn new(test_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            impact_score: 0.0,
            contributing_changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "passed" | "pass" => Some(TestStatus::Passed),
            "failed" | "fail" => Some(TestStatus::Failed),
            "skipped" | "skip" => Some(TestStatus::Skipped),
            _ => None,
        }
    }
}

/// Post-hoc outcome of one test execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub test_id: NodeId,
    pub status: TestStatus,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_kind_wire_names() {
        let json = serde_json::to_string(&RelationKind::IsTestedBy).unwrap();
        assert_eq!(json, "\"IS_TESTED_BY\"");
        let parsed: RelationKind = serde_json::from_str("\"INHERITS_FROM\"").unwrap();
        assert_eq!(parsed, RelationKind::InheritsFrom);
    }

    #[test]
    fn unrecognized_relation_is_unknown() {
        let parsed: RelationKind = serde_json::from_str("\"OVERRIDES\"").unwrap();
        assert_eq!(parsed, RelationKind::Unknown);
    }

    #[test]
    fn semantic_type_wire_names() {
        let json = serde_json::to_string(&SemanticChangeType::RefactoringSignature).unwrap();
        assert_eq!(json, "\"REFACTORING_SIGNATURE\"");
        assert_eq!(
            SemanticChangeType::parse("performance_opt"),
            Some(SemanticChangeType::PerformanceOpt)
        );
        assert_eq!(SemanticChangeType::parse("rewrite"), None);
    }

    #[test]
    fn node_new_normalizes_path() {
        let a = Node::new(NodeKind::CodeElement, "parse", "./src\\lib.rs");
        let b = Node::new(NodeKind::CodeElement, "parse", "src/lib.rs");
        assert_eq!(a.file_path, "src/lib.rs");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn effective_weight_takes_max() {
        let mut edge = Edge::new("a", "b", RelationKind::DependsOn, 0.2);
        assert_eq!(edge.effective_weight(), 0.2);
        edge.historical_weight = 0.6;
        assert_eq!(edge.effective_weight(), 0.6);
    }

    #[test]
    fn test_status_accepts_short_forms() {
        assert_eq!(TestStatus::parse("FAIL"), Some(TestStatus::Failed));
        assert_eq!(TestStatus::parse("pass"), Some(TestStatus::Passed));
        assert_eq!(TestStatus::parse("flaky"), None);
    }
}
