//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! config:
//!
//! ```toml
//! suite = "Benchmark"
//! repo_url = "https://github.com/rune-rs/rune"
//!
//! [store]
//! backfill = false
//!
//! [analyzer]
//! min_samples = 2
//! baseline = { mode = "rolling_mean", window = 5 }
//! confidence_multiplier = 2.0
//! relative_floor = 0.05
//! gross_change = 10.0
//! distinct_baselines_only = true
//!
//! [directions]
//! requests_per_sec = "higher_is_better"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalyzerConfig, BaselineMode};
use crate::catalog::DEFAULT_SUITE;
use crate::error::{BenchError, Result};
use crate::history::BackfillPolicy;
use crate::model::Direction;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Re-sort late runs into place instead of rejecting them.
    pub backfill: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suite runs are ingested into when the caller names none.
    pub suite: String,
    /// Written to the persisted document's `repoUrl` when non-empty.
    pub repo_url: String,
    pub store: StoreConfig,
    pub analyzer: AnalyzerConfig,
    /// Per-benchmark direction overrides.
    pub directions: BTreeMap<String, Direction>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            suite: DEFAULT_SUITE.to_string(),
            repo_url: String::new(),
            store: StoreConfig::default(),
            analyzer: AnalyzerConfig::default(),
            directions: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| BenchError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BenchError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Config from `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.suite.trim().is_empty() {
            return Err(BenchError::config("suite must not be empty"));
        }
        let a = &self.analyzer;
        if a.min_samples == 0 {
            return Err(BenchError::config("analyzer.min_samples must be at least 1"));
        }
        match a.baseline {
            BaselineMode::RollingMean { window } | BaselineMode::RollingMedian { window }
                if window == 0 =>
            {
                return Err(BenchError::config("analyzer.baseline.window must be at least 1"));
            }
            _ => {}
        }
        for (key, value) in [
            ("confidence_multiplier", a.confidence_multiplier),
            ("relative_floor", a.relative_floor),
            ("gross_change", a.gross_change),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(BenchError::config(format!(
                    "analyzer.{} must be a finite non-negative number, got {}",
                    key, value
                )));
            }
        }
        Ok(())
    }

    pub fn backfill_policy(&self) -> BackfillPolicy {
        if self.store.backfill {
            BackfillPolicy::Resort
        } else {
            BackfillPolicy::Reject
        }
    }

    /// Explicit override for `name`, else whatever `tool` implies.
    pub fn direction_for(&self, name: &str, tool: &str) -> Direction {
        self.directions
            .get(name)
            .copied()
            .unwrap_or_else(|| Direction::for_tool(tool))
    }
}
