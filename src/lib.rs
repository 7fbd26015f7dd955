pub mod cli;
pub mod config;
pub mod db;
pub mod graph;
pub mod history;
pub mod impact;
pub mod ingest;
pub mod model;
pub mod prioritizer;
pub mod rl;
pub mod util;
