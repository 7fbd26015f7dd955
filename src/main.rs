use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde_json::json;
use sikg::config::SikgConfig;
use sikg::db::Db;
use sikg::graph::{GraphStore, SharedGraph};
use sikg::history::{HistoricalWeights, mine_git_history};
use sikg::ingest::ParserRegistry;
use sikg::model::{ImpactMap, SemanticChange, TestRunResult};
use sikg::prioritizer::TestPrioritizer;
use sikg::rl::{PolicyManager, RlRefiner};
use sikg::{cli, util};
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("SIKG_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = util::read_to_string(path)?;
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn load_graph(path: &Path) -> Result<GraphStore> {
    let graph = ParserRegistry::with_defaults().load_graph(path)?;
    info!(
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "graph loaded"
    );
    Ok(graph)
}

fn write_graph(graph: &GraphStore, path: &Path) -> Result<()> {
    util::ensure_parent_dir(path)?;
    let raw = serde_json::to_string_pretty(&graph.to_fragment())?;
    std::fs::write(path, raw).with_context(|| format!("write graph {}", path.display()))
}

/// Prioritizer wired to the database, with history recalibrated at `now`.
fn prioritizer_with_db(config: &SikgConfig, graph: GraphStore, db: &Db, now: i64) -> Result<TestPrioritizer> {
    let history = db.load_history(config.history.clone())?;
    let mut prioritizer = TestPrioritizer::new(config, SharedGraph::new(graph), history)?;
    if config.rl.enabled {
        let policy = PolicyManager::new(Box::new(db.clone()))?;
        prioritizer = prioritizer.with_refiner(RlRefiner::new(config.rl.clone(), &config.prioritization, policy));
    }
    prioritizer.recalibrate(now)?;
    Ok(prioritizer)
}

fn main() -> Result<()> {
    init_logging();
    let args = cli::Args::parse();
    let config = SikgConfig::load(args.config.as_deref())?;

    match args.command {
        cli::Command::Impact {
            graph,
            changes,
            db,
            limit,
            categorize,
            now,
        } => {
            let graph = load_graph(&graph)?;
            let changes: Vec<SemanticChange> = read_json(&changes)?;
            let now = now.unwrap_or_else(util::unix_now);
            let prioritizer = match db {
                Some(db_path) => prioritizer_with_db(&config, graph, &Db::new(&db_path)?, now)?,
                // without a database there is no learned policy to refine with
                None => TestPrioritizer::new(
                    &config,
                    SharedGraph::new(graph),
                    HistoricalWeights::new(config.history.clone()),
                )?,
            };

            let impacts = prioritizer.calculate_test_impact(&changes);
            let output = if categorize {
                serde_json::to_value(prioritizer.categorize_tests_by_impact(&impacts))?
            } else {
                json!({
                    "tests": prioritizer.get_prioritized_tests(&impacts, limit),
                    "impacts": impacts,
                })
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        cli::Command::MineHistory {
            repo,
            db,
            max_commits,
            since_days,
        } => {
            let since_days = since_days.unwrap_or(config.history.historical_window_days);
            let commits = mine_git_history(&repo, max_commits, since_days)?;
            let db = Db::new(&db)?;
            let inserted = db.insert_commits(&commits)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "mined": commits.len(), "inserted": inserted }))?
            );
            Ok(())
        }
        cli::Command::RecordResults {
            graph,
            changes,
            results,
            db,
            predictions,
            out,
        } => {
            let graph = load_graph(&graph)?;
            let changes: Vec<SemanticChange> = read_json(&changes)?;
            let results: Vec<TestRunResult> = read_json(&results)?;
            let db = Db::new(&db)?;
            let prioritizer = prioritizer_with_db(&config, graph, &db, util::unix_now())?;

            let predictions: ImpactMap = match predictions {
                Some(path) => read_json(&path)?,
                None => prioritizer.calculate_expected_impact(&changes),
            };
            db.insert_test_runs(&results)?;
            let (summary, observations) = prioritizer.record_test_results(&changes, &predictions, &results)?;
            db.insert_fault_observations(&observations)?;

            if let Some(out) = out {
                write_graph(&prioritizer.graph().snapshot(), &out)?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        cli::Command::Recalibrate { graph, db, out, now } => {
            let graph = load_graph(&graph)?;
            let db = Db::new(&db)?;
            let history = db.load_history(config.history.clone())?;
            let prioritizer = TestPrioritizer::new(&config, SharedGraph::new(graph), history)?;
            let summary = prioritizer.recalibrate(now.unwrap_or_else(util::unix_now))?;
            write_graph(&prioritizer.graph().snapshot(), &out)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}
