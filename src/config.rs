//! Engine configuration
//!
//! Reads an optional YAML file, applies `SIKG_*` environment overrides, then
//! validates. Out-of-range values are fatal; nothing is clamped.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: String, value: String },

    #[error("{field} = {value} is out of range ({expected})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },

    #[error("low_impact_threshold ({low}) must be below high_impact_threshold ({high})")]
    ThresholdOrder { low: f64, high: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropagationConfig {
    pub max_traversal_depth: usize,
    pub min_impact_threshold: f64,
    /// Worker threads for batch propagation; 1 keeps it on the caller's thread.
    pub workers: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            max_traversal_depth: 5,
            min_impact_threshold: 0.05,
            workers: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrioritizationConfig {
    pub high_impact_threshold: f64,
    pub low_impact_threshold: f64,
}

impl Default for PrioritizationConfig {
    fn default() -> Self {
        Self {
            high_impact_threshold: 0.7,
            low_impact_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub historical_window_days: u32,
    pub half_life_days: f64,
    /// Minimum commits in which two files changed together.
    pub min_cochange_count: usize,
    /// Minimum conditional co-change probability P(B|A).
    pub min_cochange_confidence: f64,
    pub max_historical_boost: f64,
    /// Commits touching more files than this are skipped (bulk reformatting, merges).
    pub max_files_per_commit: usize,
    pub max_nodes_per_file: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            historical_window_days: 180,
            half_life_days: 90.0,
            min_cochange_count: 2,
            min_cochange_confidence: 0.3,
            max_historical_boost: 0.05,
            max_files_per_commit: 50,
            max_nodes_per_file: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    pub enabled: bool,
    pub learning_rate: f64,
    pub exploration_rate: f64,
    pub exploration_noise: f64,
    pub max_adjustment: f64,
    /// Consecutive passes before a high-impact prediction is penalized.
    pub consistent_pass_runs: u32,
    /// Fixed seed for the exploration RNG; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_rate: 0.1,
            exploration_rate: 0.1,
            exploration_noise: 0.05,
            max_adjustment: 0.3,
            consistent_pass_runs: 3,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SikgConfig {
    pub propagation: PropagationConfig,
    pub prioritization: PrioritizationConfig,
    pub history: HistoryConfig,
    pub rl: RlConfig,
}

fn check_range(
    field: &'static str,
    value: f64,
    min: f64,
    max: f64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if !value.is_finite() || value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            expected,
        });
    }
    Ok(())
}

fn env_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(var) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.clone(),
        })?;
    }
    Ok(())
}

impl SikgConfig {
    /// Load from an optional YAML file plus environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&|var| env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml_ng::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw, path)
    }

    /// Apply `SIKG_*` overrides. `lookup` is injected so tests do not touch
    /// the process environment.
    pub fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        env_override(lookup, "SIKG_MAX_TRAVERSAL_DEPTH", &mut self.propagation.max_traversal_depth)?;
        env_override(lookup, "SIKG_MIN_IMPACT_THRESHOLD", &mut self.propagation.min_impact_threshold)?;
        env_override(lookup, "SIKG_WORKERS", &mut self.propagation.workers)?;
        env_override(lookup, "SIKG_HIGH_IMPACT_THRESHOLD", &mut self.prioritization.high_impact_threshold)?;
        env_override(lookup, "SIKG_LOW_IMPACT_THRESHOLD", &mut self.prioritization.low_impact_threshold)?;
        env_override(lookup, "SIKG_HISTORICAL_WINDOW_DAYS", &mut self.history.historical_window_days)?;
        env_override(lookup, "SIKG_HALF_LIFE_DAYS", &mut self.history.half_life_days)?;
        env_override(lookup, "SIKG_RL_ENABLED", &mut self.rl.enabled)?;
        env_override(lookup, "SIKG_LEARNING_RATE", &mut self.rl.learning_rate)?;
        env_override(lookup, "SIKG_EXPLORATION_RATE", &mut self.rl.exploration_rate)?;
        if let Some(value) = lookup("SIKG_RL_SEED") {
            let seed = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                var: "SIKG_RL_SEED".to_string(),
                value: value.clone(),
            })?;
            self.rl.seed = Some(seed);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.propagation;
        check_range("min_impact_threshold", p.min_impact_threshold, 0.0, 1.0, "0 <= x < 1")?;
        if p.min_impact_threshold == 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "min_impact_threshold",
                value: 1.0,
                expected: "0 <= x < 1",
            });
        }
        if p.workers == 0 {
            return Err(ConfigError::OutOfRange {
                field: "workers",
                value: 0.0,
                expected: ">= 1",
            });
        }

        let t = &self.prioritization;
        check_range("high_impact_threshold", t.high_impact_threshold, 0.0, 1.0, "0 <= x <= 1")?;
        check_range("low_impact_threshold", t.low_impact_threshold, 0.0, 1.0, "0 <= x <= 1")?;
        if t.low_impact_threshold >= t.high_impact_threshold {
            return Err(ConfigError::ThresholdOrder {
                low: t.low_impact_threshold,
                high: t.high_impact_threshold,
            });
        }

        let h = &self.history;
        if !h.half_life_days.is_finite() || h.half_life_days <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "half_life_days",
                value: h.half_life_days,
                expected: "> 0",
            });
        }
        check_range("min_cochange_confidence", h.min_cochange_confidence, 0.0, 1.0, "0 <= x <= 1")?;
        check_range("max_historical_boost", h.max_historical_boost, 0.0, 0.05, "0 <= x <= 0.05")?;

        let r = &self.rl;
        check_range("learning_rate", r.learning_rate, 0.0, 1.0, "0 <= x <= 1")?;
        check_range("exploration_rate", r.exploration_rate, 0.0, 1.0, "0 <= x <= 1")?;
        check_range("exploration_noise", r.exploration_noise, 0.0, 1.0, "0 <= x <= 1")?;
        check_range("max_adjustment", r.max_adjustment, 0.0, 1.0, "0 <= x <= 1")?;
        Ok(())
    }
}
