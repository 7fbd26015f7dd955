//! Co-change estimation
//!
//! Two files that keep landing in the same commit are treated as an implicit
//! dependency. Raw pair counts favour hub files that change in every commit,
//! so each direction is scored as a conditional probability:
//!
//! `P(B | A) = co_changes(A, B) / changes(A)`
//!
//! Commits touching more than `max_files_per_commit` files (bulk renames,
//! vendored updates, merges) are skipped entirely.

use crate::config::HistoryConfig;
use crate::history::CommitRecord;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Directed co-change evidence: when `file_a` changed, `file_b` changed too
/// with probability `confidence`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoChangePair {
    pub file_a: String,
    pub file_b: String,
    pub co_changes: u32,
    pub changes_a: u32,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoChangeStats {
    pub commits_considered: usize,
    pub commits_skipped: usize,
}

/// Estimate directed co-change pairs from `commits`.
///
/// Pairs come back sorted by `(file_a, file_b)` so that anything built from
/// them (edge insertion order in particular) is deterministic.
pub fn estimate_cochanges<'a>(
    commits: impl IntoIterator<Item = &'a CommitRecord>,
    config: &HistoryConfig,
) -> (Vec<CoChangePair>, CoChangeStats) {
    let mut stats = CoChangeStats::default();
    let mut changes: HashMap<String, u32> = HashMap::new();
    let mut together: BTreeMap<(String, String), u32> = BTreeMap::new();

    for commit in commits {
        let files: BTreeSet<&str> = commit.files.iter().map(String::as_str).collect();
        if files.len() > config.max_files_per_commit {
            stats.commits_skipped += 1;
            continue;
        }
        stats.commits_considered += 1;

        for file in &files {
            *changes.entry((*file).to_string()).or_insert(0) += 1;
        }
        let files: Vec<&str> = files.into_iter().collect();
        for (i, a) in files.iter().enumerate() {
            for b in &files[i + 1..] {
                *together.entry((a.to_string(), b.to_string())).or_insert(0) += 1;
            }
        }
    }

    let mut pairs = Vec::new();
    for ((a, b), co) in together {
        if (co as usize) < config.min_cochange_count {
            continue;
        }
        for (from, to) in [(&a, &b), (&b, &a)] {
            let total = changes.get(from).copied().unwrap_or(0).max(1);
            let confidence = (co as f64 / total as f64).min(1.0);
            if confidence >= config.min_cochange_confidence {
                pairs.push(CoChangePair {
                    file_a: from.clone(),
                    file_b: to.clone(),
                    co_changes: co,
                    changes_a: total,
                    confidence,
                });
            }
        }
    }
    pairs.sort_by(|x, y| (&x.file_a, &x.file_b).cmp(&(&y.file_a, &y.file_b)));
    (pairs, stats)
}
