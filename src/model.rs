//! # Stage: Data Model
//!
//! ## Responsibility
//! The closed record shapes the engine works with: the commit a run was
//! measured at ([`Commit`], [`Identity`]), the shared per-run metadata
//! ([`RunMetadata`]), the wire-level run the external runner hands in
//! ([`Run`], [`Measurement`]) and the validated, stored form of one
//! benchmark result ([`MeasurementRecord`]).
//!
//! Unknown fields are kept in a flattened `extra` bag on every wire type so a
//! producing tool can add fields without breaking ingestion or round trips.
//!
//! ## Guarantees
//! - A [`MeasurementRecord`] always has a finite, non-negative value and error
//! - Records of one run share a single `Arc<RunMetadata>`; it is never mutated
//!
//! ## NOT Responsible For
//! - Ordering or unit consistency across runs (that is the history store)

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Opaque bag of fields the closed schema does not model.
pub type ExtraFields = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Commit metadata
// ---------------------------------------------------------------------------

/// Author or committer of a commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            username: None,
            extra: ExtraFields::new(),
        }
    }
}

/// The commit a run was measured at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub author: Identity,
    #[serde(default)]
    pub committer: Identity,
    /// `false` for re-runs of an existing history point (merge commits, CI retries).
    #[serde(default = "default_distinct")]
    pub distinct: bool,
    /// Opaque commit identifier, e.g. a content hash.
    pub id: String,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub tree_id: String,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

fn default_distinct() -> bool {
    true
}

impl Commit {
    /// Minimal commit with only an id and a timestamp.
    pub fn new(id: impl Into<String>, timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            author: Identity::default(),
            committer: Identity::default(),
            distinct: true,
            id: id.into(),
            message: String::new(),
            timestamp,
            tree_id: String::new(),
            url: String::new(),
            extra: ExtraFields::new(),
        }
    }
}

/// Everything about a run except its measurements. One instance is shared by
/// all records of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub commit: Commit,
    /// When the run was measured, unix milliseconds.
    pub date: u64,
    /// Identifier of the producing harness (`cargo`, `go`, `pytest`, ...).
    pub tool: String,
    pub extra: ExtraFields,
}

impl RunMetadata {
    pub fn commit_id(&self) -> &str {
        &self.commit.id
    }

    /// Ordering key for histories.
    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.commit.timestamp
    }

    pub fn is_distinct(&self) -> bool {
        self.commit.distinct
    }
}

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Which way a metric improves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Time-like metrics: a larger value is a regression.
    #[default]
    LowerIsBetter,
    /// Throughput-like metrics: a smaller value is a regression.
    HigherIsBetter,
}

impl Direction {
    /// Direction implied by the producing tool's output.
    pub fn for_tool(tool: &str) -> Self {
        match tool {
            "benchmarkjs" | "pytest" | "customBiggerIsBetter" => Direction::HigherIsBetter,
            _ => Direction::LowerIsBetter,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::LowerIsBetter => write!(f, "lower-is-better"),
            Direction::HigherIsBetter => write!(f, "higher-is-better"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire-level run
// ---------------------------------------------------------------------------

/// One benchmark result as produced by the external runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    /// Error estimate rendered as `"± N"`. Missing means zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
    pub unit: String,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Measurement {
    pub fn new(name: impl Into<String>, value: f64, error: f64, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value,
            range: Some(format_range(error)),
            unit: unit.into(),
            extra: ExtraFields::new(),
        }
    }

    /// Parsed error estimate.
    pub fn error_estimate(&self) -> Result<f64> {
        match &self.range {
            Some(range) => parse_range(range),
            None => Ok(0.0),
        }
    }
}

/// One ingestion event: a commit plus zero or more measurements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub commit: Commit,
    pub date: u64,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub benches: Vec<Measurement>,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

impl Run {
    pub fn new(commit: Commit, date: u64, tool: impl Into<String>) -> Self {
        Self {
            commit,
            date,
            tool: tool.into(),
            benches: Vec::new(),
            extra: ExtraFields::new(),
        }
    }

    pub fn with_bench(mut self, bench: Measurement) -> Self {
        self.benches.push(bench);
        self
    }

    /// Split off the shared metadata.
    pub fn metadata(&self) -> RunMetadata {
        RunMetadata {
            commit: self.commit.clone(),
            date: self.date,
            tool: self.tool.clone(),
            extra: self.extra.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// MeasurementRecord
// ---------------------------------------------------------------------------

/// One benchmark's validated result for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    pub name: String,
    pub value: f64,
    /// Measurement noise in the same unit as `value`.
    pub error: f64,
    pub unit: String,
    pub run: Arc<RunMetadata>,
    pub extra: ExtraFields,
}

impl MeasurementRecord {
    /// Validate a wire measurement and bind it to its run.
    pub fn from_measurement(bench: &Measurement, run: Arc<RunMetadata>) -> Result<Self> {
        let error = bench.error_estimate()?;
        let record = Self {
            name: bench.name.clone(),
            value: bench.value,
            error,
            unit: bench.unit.clone(),
            run,
            extra: bench.extra.clone(),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BenchError::validation("benchmark name must not be empty"));
        }
        if !self.value.is_finite() || self.value < 0.0 {
            return Err(BenchError::validation(format!(
                "benchmark `{}` has invalid value {}",
                self.name, self.value
            )));
        }
        if !self.error.is_finite() || self.error < 0.0 {
            return Err(BenchError::validation(format!(
                "benchmark `{}` has invalid error estimate {}",
                self.name, self.error
            )));
        }
        if self.unit.trim().is_empty() {
            return Err(BenchError::validation(format!(
                "benchmark `{}` has no unit",
                self.name
            )));
        }
        Ok(())
    }

    pub fn commit_id(&self) -> &str {
        self.run.commit_id()
    }

    pub fn timestamp(&self) -> DateTime<FixedOffset> {
        self.run.timestamp()
    }

    /// Wire form, as persisted in a run's `benches` array.
    pub fn to_measurement(&self) -> Measurement {
        Measurement {
            name: self.name.clone(),
            value: self.value,
            range: Some(format_range(self.error)),
            unit: self.unit.clone(),
            extra: self.extra.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Range strings
// ---------------------------------------------------------------------------

/// Parse `"± 64930"`, `"±64930"`, `"+/- 64930"` or a bare number.
/// An empty string is a zero error estimate.
pub fn parse_range(range: &str) -> Result<f64> {
    let trimmed = range.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    let number = ["±", "+/-", "+-"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed)
        .trim()
        .replace(',', "");
    let value: f64 = number
        .parse()
        .map_err(|_| BenchError::validation(format!("unparsable range `{}`", range)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(BenchError::validation(format!("invalid range `{}`", range)));
    }
    Ok(value)
}

/// Render an error estimate the way producers write it.
pub fn format_range(error: f64) -> String {
    format!("± {}", error)
}
