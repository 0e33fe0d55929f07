//! Crate-level error types.
//!
//! [`BenchError`] covers whole-operation failures (a rejected run, a failed
//! save, a bad config file). [`AppendError`] is the per-benchmark failure that
//! ingestion collects into a report instead of aborting sibling benchmarks.

use chrono::{DateTime, FixedOffset};
use thiserror::Error;

/// A single benchmark's append was refused. The history is left untouched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppendError {
    /// The record's unit differs from the unit the history was started with.
    #[error("unit conflict for `{name}`: history uses `{expected}`, got `{found}`")]
    UnitConflict {
        name: String,
        expected: String,
        found: String,
    },

    /// The record is older than the newest entry and backfill is disabled.
    #[error("out-of-order insert for `{name}`: {found} is older than latest entry {latest}")]
    OutOfOrderInsert {
        name: String,
        latest: DateTime<FixedOffset>,
        found: DateTime<FixedOffset>,
    },
}

impl AppendError {
    /// Benchmark the failure belongs to.
    pub fn benchmark(&self) -> &str {
        match self {
            AppendError::UnitConflict { name, .. } => name,
            AppendError::OutOfOrderInsert { name, .. } => name,
        }
    }
}

/// Whole-operation failure surfaced to the host.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Malformed or empty run; nothing was stored.
    #[error("validation error: {0}")]
    Validation(String),

    /// Every measurement of the run was refused; the run was not recorded.
    #[error("run `{commit}` rejected: all {count} appends failed", count = .failures.len())]
    Rejected {
        commit: String,
        failures: Vec<AppendError>,
    },

    /// The catalog could not be made durable; the run was not ingested.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document format error: {0}")]
    Format(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl BenchError {
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        BenchError::Validation(msg.into())
    }

    pub fn persistence<T: Into<String>>(msg: T) -> Self {
        BenchError::Persistence(msg.into())
    }

    pub fn config<T: Into<String>>(msg: T) -> Self {
        BenchError::Config(msg.into())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BenchError>;
