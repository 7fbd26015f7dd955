//! Commit history mining
//!
//! Runs `git log --numstat` and turns the output into [`CommitRecord`]s for
//! the co-change estimator. Merge commits are left out by git itself; oversized
//! commits are filtered later, at estimation time.

use crate::history::CommitRecord;
use crate::util::normalize_path_str;
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Read up to `max_commits` non-merge commits from the last `since_days` days
/// of the repository at `repo_root`.
pub fn mine_git_history(repo_root: &Path, max_commits: usize, since_days: u32) -> Result<Vec<CommitRecord>> {
    let args = [
        "log".to_string(),
        "--no-merges".to_string(),
        "--numstat".to_string(),
        "--format=%H %at".to_string(),
        format!("--since={since_days}.days"),
        format!("--max-count={max_commits}"),
    ];
    let output = Command::new("git")
        .args(&args)
        .current_dir(repo_root)
        .output()
        .with_context(|| format!("spawn git in {}", repo_root.display()))?;

    if !output.status.success() {
        bail!(
            "git log exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let commits = parse_git_log(&String::from_utf8_lossy(&output.stdout))?;
    debug!(repo = %repo_root.display(), commits = commits.len(), "git history mined");
    Ok(commits)
}

/// `HASH UNIX_SECONDS` header line emitted by `--format=%H %at`.
fn commit_header(line: &str) -> Option<(&str, &str)> {
    let (hash, timestamp) = line.split_once(' ')?;
    let is_hash = matches!(hash.len(), 40 | 64) && hash.bytes().all(|b| b.is_ascii_hexdigit());
    let is_time = !timestamp.is_empty() && timestamp.bytes().all(|b| b.is_ascii_digit() || b == b'-');
    (is_hash && is_time).then_some((hash, timestamp))
}

/// Resolve numstat rename notation to the post-rename path.
///
/// Handles both `old => new` and `dir/{old => new}/file`.
fn resolve_rename(path: &str) -> String {
    if let (Some(open), Some(close)) = (path.find('{'), path.find('}')) {
        if open < close {
            if let Some((_, new)) = path[open + 1..close].split_once(" => ") {
                return normalize_path_str(&format!("{}{}{}", &path[..open], new, &path[close + 1..]));
            }
        }
    }
    let post = path.split_once(" => ").map_or(path, |(_, new)| new);
    normalize_path_str(post)
}

/// Parse the output of `git log --numstat --format='%H %at'`: a header line
/// per commit followed by tab-separated `added deleted path` lines. Commits
/// that list no files are dropped.
pub fn parse_git_log(output: &str) -> Result<Vec<CommitRecord>> {
    let mut commits: Vec<CommitRecord> = Vec::new();

    for line in output.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some((hash, timestamp)) = commit_header(line) {
            let timestamp = timestamp
                .parse()
                .with_context(|| format!("bad commit timestamp in {line:?}"))?;
            commits.push(CommitRecord {
                hash: hash.to_string(),
                timestamp,
                files: Vec::new(),
            });
            continue;
        }
        let mut fields = line.splitn(3, '\t');
        if let (Some(_), Some(_), Some(path), Some(commit)) =
            (fields.next(), fields.next(), fields.next(), commits.last_mut())
        {
            commit.files.push(resolve_rename(path));
        }
    }

    commits.retain(|commit| !commit.files.is_empty());
    Ok(commits)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "0123456789abcdef0123456789abcdef01234567";
    const B: &str = "fedcba9876543210fedcba9876543210fedcba98";

    #[test]
    fn numstat_lines_attach_to_preceding_commit() {
        let log = format!("{A} 1700000000\n\n4\t1\tsrc/graph.rs\n2\t0\t./src/model.rs\n\n{B} 1700000100\n\n1\t1\tsrc/graph.rs\n");
        let commits = parse_git_log(&log).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, A);
        assert_eq!(commits[0].timestamp, 1_700_000_000);
        assert_eq!(commits[0].files, vec!["src/graph.rs", "src/model.rs"]);
        assert_eq!(commits[1].files, vec!["src/graph.rs"]);
    }

    #[test]
    fn commits_without_files_are_dropped() {
        let log = format!("{A} 1700000000\n\n{B} 1700000100\n\n-\t-\tdocs/diagram.png\n");
        let commits = parse_git_log(&log).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].hash, B);
        assert_eq!(commits[0].files, vec!["docs/diagram.png"]);
    }

    #[test]
    fn stray_lines_before_first_header_are_ignored() {
        let log = format!("1\t1\torphan.rs\nnot a header\n{A} 1700000000\n1\t1\tsrc/a.rs\n");
        let commits = parse_git_log(&log).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].files, vec!["src/a.rs"]);
    }

    #[test]
    fn rename_notation_resolves_to_new_path() {
        assert_eq!(resolve_rename("src/{old => new}/mod.rs"), "src/new/mod.rs");
        assert_eq!(resolve_rename("old.rs => new.rs"), "new.rs");
        assert_eq!(resolve_rename("src/{ => nested}/a.rs"), "src/nested/a.rs");
        assert_eq!(resolve_rename("src/lib.rs"), "src/lib.rs");
    }
}
