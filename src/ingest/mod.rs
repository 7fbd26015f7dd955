//! Graph ingestion from parser output
//!
//! Source parsing lives outside this crate. Parsers hand over
//! [`GraphFragment`]s through the [`FragmentParser`] capability interface, and
//! a [`ParserRegistry`] picks the first registered parser that can handle a
//! file. The graph never depends on which parser populated it.

use crate::graph::{FragmentStats, GraphFragment, GraphStore};
use crate::util::read_to_string;
use anyhow::{Context, Result};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub trait FragmentParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, path: &Path) -> bool;
    fn parse(&self, path: &Path, contents: &str) -> Result<GraphFragment>;
}

/// Reads fragments already serialized as JSON (`*.json`, including
/// `*.sikg.json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFragmentParser;

impl FragmentParser for JsonFragmentParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_handle(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
    }

    fn parse(&self, path: &Path, contents: &str) -> Result<GraphFragment> {
        serde_json::from_str(contents)
            .with_context(|| format!("invalid graph fragment in {}", path.display()))
    }
}

#[derive(Default)]
pub struct ParserRegistry {
    parsers: Vec<Box<dyn FragmentParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in JSON parser.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(JsonFragmentParser));
        registry
    }

    /// Later registrations are consulted after earlier ones.
    pub fn register(&mut self, parser: Box<dyn FragmentParser>) {
        self.parsers.push(parser);
    }

    pub fn parser_for(&self, path: &Path) -> Option<&dyn FragmentParser> {
        self.parsers
            .iter()
            .find(|parser| parser.can_handle(path))
            .map(|parser| parser.as_ref())
    }

    pub fn parse_file(&self, path: &Path) -> Result<Option<GraphFragment>> {
        let Some(parser) = self.parser_for(path) else {
            return Ok(None);
        };
        let contents = read_to_string(path)?;
        let fragment = parser.parse(path, &contents)?;
        debug!(
            path = %path.display(),
            parser = parser.name(),
            nodes = fragment.nodes.len(),
            edges = fragment.edges.len(),
            "parsed fragment"
        );
        Ok(Some(fragment))
    }

    /// Apply every file at `path` to `graph`. Directories are walked
    /// recursively in file-name order, skipping hidden and gitignored entries.
    pub fn load_into(&self, graph: &mut GraphStore, path: &Path) -> Result<FragmentStats> {
        let mut total = FragmentStats::default();
        for file in collect_files(path)? {
            let Some(fragment) = self.parse_file(&file)? else {
                if path.is_file() {
                    warn!(path = %file.display(), "no parser can handle file");
                }
                continue;
            };
            let stats = graph
                .apply_fragment(fragment)
                .with_context(|| format!("failed to apply fragment from {}", file.display()))?;
            total.nodes_inserted += stats.nodes_inserted;
            total.nodes_updated += stats.nodes_updated;
            total.edges_inserted += stats.edges_inserted;
            total.edges_merged += stats.edges_merged;
        }
        Ok(total)
    }

    pub fn load_graph(&self, path: &Path) -> Result<GraphStore> {
        let mut graph = GraphStore::new();
        self.load_into(&mut graph, path)?;
        Ok(graph)
    }
}

fn collect_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut builder = WalkBuilder::new(path);
    builder
        .hidden(true)
        .git_ignore(true)
        .require_git(false)
        .sort_by_file_name(|a, b| a.cmp(b));

    let mut files = Vec::new();
    for entry in builder.build() {
        let entry = entry.with_context(|| format!("walk {}", path.display()))?;
        if entry.file_type().is_some_and(|ft| ft.is_file()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}
