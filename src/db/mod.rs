use crate::config::HistoryConfig;
use crate::history::{CommitRecord, FaultObservation, HistoricalWeights};
use crate::model::{RelationKind, SemanticChangeType, TestRunResult, TestStatus};
use crate::rl::{PairPolicy, PolicyState, PolicyStore};
use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

mod migrations;

pub use migrations::SCHEMA_VERSION;

const POLICY_RUNS_KEY: &str = "policy_runs";

/// SQLite storage for historical records and learned policy.
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct Db {
    db_path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    pub fn new(db_path: &Path) -> Result<Self> {
        crate::util::ensure_parent_dir(db_path)?;

        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db at {}", db_path.display()))?;
        conn.busy_timeout(Duration::from_secs(30))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        migrations::migrate(&conn)?;
        debug!(path = %db_path.display(), "database ready");

        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get_meta_i64(&self, key: &str) -> Result<Option<i64>> {
        let value: Option<String> = self
            .conn()
            .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse::<i64>().ok()))
    }

    pub fn set_meta_i64(&self, key: &str, value: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value.to_string()],
        )?;
        Ok(())
    }

    /// Append commits; hashes already stored are skipped. Returns how many
    /// were inserted.
    pub fn insert_commits(&self, commits: &[CommitRecord]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut insert_commit =
                tx.prepare("INSERT OR IGNORE INTO commits (hash, timestamp) VALUES (?, ?)")?;
            let mut insert_file =
                tx.prepare("INSERT INTO commit_files (commit_id, position, path) VALUES (?, ?, ?)")?;
            for commit in commits {
                if insert_commit.execute(params![commit.hash, commit.timestamp])? == 0 {
                    continue;
                }
                let commit_id = tx.last_insert_rowid();
                for (position, path) in commit.files.iter().enumerate() {
                    insert_file.execute(params![commit_id, position as i64, path])?;
                }
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Commits in insertion order.
    pub fn load_commits(&self) -> Result<Vec<CommitRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.hash, c.timestamp, f.path
             FROM commits c
             LEFT JOIN commit_files f ON f.commit_id = c.id
             ORDER BY c.id, f.position",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut commits: Vec<CommitRecord> = Vec::new();
        let mut last_id = None;
        for row in rows {
            let (id, hash, timestamp, path) = row?;
            if last_id != Some(id) {
                last_id = Some(id);
                commits.push(CommitRecord {
                    hash,
                    timestamp,
                    files: Vec::new(),
                });
            }
            if let (Some(path), Some(commit)) = (path, commits.last_mut()) {
                commit.files.push(path);
            }
        }
        Ok(commits)
    }

    pub fn insert_test_runs(&self, results: &[TestRunResult]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO test_runs (test_id, status, timestamp, commit_hash) VALUES (?, ?, ?, ?)",
            )?;
            for result in results {
                stmt.execute(params![
                    result.test_id,
                    result.status.as_str(),
                    result.timestamp,
                    result.commit_hash
                ])?;
            }
        }
        tx.commit()?;
        Ok(results.len())
    }

    pub fn load_test_runs(&self) -> Result<Vec<TestRunResult>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT test_id, status, timestamp, commit_hash FROM test_runs ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (test_id, status, timestamp, commit_hash) = row?;
            let Some(status) = TestStatus::parse(&status) else {
                warn!(test_id = %test_id, status = %status, "skipping test run with unknown status");
                continue;
            };
            results.push(TestRunResult {
                test_id,
                status,
                timestamp,
                commit_hash,
            });
        }
        Ok(results)
    }

    pub fn insert_fault_observations(&self, observations: &[FaultObservation]) -> Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO fault_observations
                 (change_node_id, test_id, failed, timestamp, commit_hash)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            for observation in observations {
                stmt.execute(params![
                    observation.change_node_id,
                    observation.test_id,
                    observation.failed,
                    observation.timestamp,
                    observation.commit_hash
                ])?;
            }
        }
        tx.commit()?;
        Ok(observations.len())
    }

    pub fn load_fault_observations(&self) -> Result<Vec<FaultObservation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT change_node_id, test_id, failed, timestamp, commit_hash
             FROM fault_observations ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(FaultObservation {
                change_node_id: row.get(0)?,
                test_id: row.get(1)?,
                failed: row.get(2)?,
                timestamp: row.get(3)?,
                commit_hash: row.get(4)?,
            })
        })?;

        let mut observations = Vec::new();
        for row in rows {
            observations.push(row?);
        }
        Ok(observations)
    }

    /// Rebuild the historical subsystem from stored records.
    pub fn load_history(&self, config: HistoryConfig) -> Result<HistoricalWeights> {
        let commits = self.load_commits()?;
        let observations = self.load_fault_observations()?;
        Ok(HistoricalWeights::from_records(config, commits, observations))
    }
}

impl PolicyStore for Db {
    fn load_policy(&self) -> Result<PolicyState> {
        let mut state = PolicyState::new();
        state.runs = self.get_meta_i64(POLICY_RUNS_KEY)?.unwrap_or(0).max(0) as u64;

        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT change_node_id, test_id, adjustment, pass_streak, observations FROM policy_pairs",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                PairPolicy {
                    adjustment: row.get(2)?,
                    pass_streak: row.get(3)?,
                    observations: row.get(4)?,
                },
            ))
        })?;
        for row in rows {
            let (change, test, policy) = row?;
            state.set_pair(&change, &test, policy);
        }

        let mut stmt = conn.prepare("SELECT semantic_type, relation, bias FROM policy_kinds")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
            ))
        })?;
        for row in rows {
            let (semantic_type, relation, bias) = row?;
            let Some(kind) = SemanticChangeType::parse(&semantic_type) else {
                warn!(semantic_type = %semantic_type, "skipping policy bias for unknown change type");
                continue;
            };
            state.set_kind_bias(kind, RelationKind::parse(&relation), bias);
        }
        Ok(state)
    }

    fn save_policy(&mut self, state: &PolicyState) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM policy_pairs", [])?;
        tx.execute("DELETE FROM policy_kinds", [])?;
        {
            let mut insert_pair = tx.prepare(
                "INSERT INTO policy_pairs
                 (change_node_id, test_id, adjustment, pass_streak, observations)
                 VALUES (?, ?, ?, ?, ?)",
            )?;
            for (change, test, policy) in state.pairs() {
                insert_pair.execute(params![
                    change,
                    test,
                    policy.adjustment,
                    policy.pass_streak,
                    policy.observations
                ])?;
            }
            let mut insert_kind = tx.prepare(
                "INSERT INTO policy_kinds (semantic_type, relation, bias) VALUES (?, ?, ?)",
            )?;
            for (semantic_type, relation, bias) in state.kind_biases() {
                insert_kind.execute(params![semantic_type.as_str(), relation.as_str(), bias])?;
            }
        }
        tx.execute(
            "INSERT INTO meta (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![POLICY_RUNS_KEY, state.runs.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }
}
