use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i64 = 2;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;

    let existing: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .and_then(|value| value.parse().ok())
        .unwrap_or(0);

    if existing > SCHEMA_VERSION {
        anyhow::bail!(
            "database schema version {} is newer than supported version {}",
            existing,
            SCHEMA_VERSION
        );
    }

    if existing < 1 {
        // Append-only history: commits with their files, raw test runs, and
        // the per-change fault observations derived from them
        conn.execute_batch(
            "
            BEGIN;
            CREATE TABLE IF NOT EXISTS commits (
                id INTEGER PRIMARY KEY,
                hash TEXT NOT NULL UNIQUE,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_commits_timestamp ON commits(timestamp);

            CREATE TABLE IF NOT EXISTS commit_files (
                commit_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                path TEXT NOT NULL,
                PRIMARY KEY(commit_id, position),
                FOREIGN KEY(commit_id) REFERENCES commits(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS test_runs (
                id INTEGER PRIMARY KEY,
                test_id TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                commit_hash TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_test_runs_test ON test_runs(test_id);

            CREATE TABLE IF NOT EXISTS fault_observations (
                id INTEGER PRIMARY KEY,
                change_node_id TEXT NOT NULL,
                test_id TEXT NOT NULL,
                failed INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                commit_hash TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_fault_observations_pair
                ON fault_observations(change_node_id, test_id);
            COMMIT;
            ",
        )?;
    }

    if existing < 2 {
        // Learned RL policy, rewritten as a whole on every commit
        conn.execute_batch(
            "
            BEGIN;
            CREATE TABLE IF NOT EXISTS policy_pairs (
                change_node_id TEXT NOT NULL,
                test_id TEXT NOT NULL,
                adjustment REAL NOT NULL,
                pass_streak INTEGER NOT NULL,
                observations INTEGER NOT NULL,
                PRIMARY KEY(change_node_id, test_id)
            );

            CREATE TABLE IF NOT EXISTS policy_kinds (
                semantic_type TEXT NOT NULL,
                relation TEXT NOT NULL,
                bias REAL NOT NULL,
                PRIMARY KEY(semantic_type, relation)
            );
            COMMIT;
            ",
        )?;
    }

    if existing < SCHEMA_VERSION {
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('schema_version', ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [SCHEMA_VERSION.to_string()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|row| row.unwrap())
            .collect()
    }

    #[test]
    fn migrate_creates_all_tables_and_is_repeatable() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        let names = tables(&conn);
        for table in [
            "commit_files",
            "commits",
            "fault_observations",
            "meta",
            "policy_kinds",
            "policy_pairs",
            "test_runs",
        ] {
            assert!(names.iter().any(|name| name == table), "missing {table}");
        }
        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        conn.execute("UPDATE meta SET value = '99' WHERE key = 'schema_version'", [])
            .unwrap();
        assert!(migrate(&conn).is_err());
    }
}
