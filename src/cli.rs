use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "sikg",
    version,
    about = "Semantic impact knowledge graph for regression test selection",
    after_help = r#"Examples:
  sikg impact --graph graph.sikg.json --changes changes.json --limit 20
  sikg impact --graph fragments/ --changes changes.json --db .sikg/sikg.db --categorize
  sikg mine-history --repo . --db .sikg/sikg.db
  sikg record-results --graph graph.sikg.json --changes changes.json --results results.json --db .sikg/sikg.db
  sikg recalibrate --graph graph.sikg.json --db .sikg/sikg.db --out graph.sikg.json

Set SIKG_LOG=debug for verbose logs on stderr.
"#
)]
pub struct Args {
    /// YAML configuration file; SIKG_* environment variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Propagate changes and print prioritized tests as JSON.
    Impact {
        /// Graph fragment file or directory of fragments.
        #[arg(long)]
        graph: PathBuf,
        /// JSON array of semantic changes.
        #[arg(long)]
        changes: PathBuf,
        /// History and policy database; without it only structural weights are used.
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        limit: Option<usize>,
        /// Print high/medium/low buckets instead of a ranked list.
        #[arg(long)]
        categorize: bool,
        /// Unix seconds used as "now" for the history window.
        #[arg(long)]
        now: Option<i64>,
    },
    /// Mine git history into the database.
    MineHistory {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long, default_value_t = 1000)]
        max_commits: usize,
        /// Defaults to the configured historical window.
        #[arg(long)]
        since_days: Option<u32>,
    },
    /// Record executed test results into history and the learned policy.
    RecordResults {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long)]
        changes: PathBuf,
        /// JSON array of test run results.
        #[arg(long)]
        results: PathBuf,
        #[arg(long)]
        db: PathBuf,
        /// Impacts the tests were selected with (JSON map); recomputed when absent.
        #[arg(long)]
        predictions: Option<PathBuf>,
        /// Write the graph with learned edge weights here.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Recalibrate historical edge weights and write the resulting graph.
    Recalibrate {
        #[arg(long)]
        graph: PathBuf,
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        now: Option<i64>,
    },
}
