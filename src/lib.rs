//! Continuous benchmark tracking.
//!
//! Every code change produces a run: named measurements (value, error
//! estimate, unit) tied to a commit. `benchwatch` appends runs to
//! per-benchmark histories, compares each new value against its prior window
//! with a noise-tolerant threshold and reports regressions.
//!
//! ```text
//! Run ──► IngestionPipeline ──► HistoryStore.append ──► RegressionAnalyzer.evaluate
//!                 │                                               │
//!                 └──► CatalogPersistence.save      Report ◄──────┘ ──► ReportSink
//! ```
//!
//! ```rust,ignore
//! use benchwatch::{Config, IngestionPipeline, FilePersistence};
//!
//! let pipeline = IngestionPipeline::open(Config::default(), Box::new(FilePersistence::new("data.js")))?;
//! let report = pipeline.ingest(run)?;
//! for alert in report.alerts() {
//!     println!("{} regressed: {}", alert.name, alert.status());
//! }
//! ```

pub mod analyzer;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod model;
pub mod persist;
pub mod pipeline;
pub mod sink;

pub use analyzer::{AnalyzerConfig, Baseline, BaselineMode, RegressionAnalyzer, Status, Verdict};
pub use catalog::{Catalog, DEFAULT_SUITE};
pub use config::Config;
pub use error::{AppendError, BenchError, Result};
pub use history::{BackfillPolicy, BenchmarkHistory, HistoryStore, Window};
pub use model::{Commit, Direction, Identity, Measurement, MeasurementRecord, Run, RunMetadata};
pub use persist::{
    CatalogPersistence, FilePersistence, MemoryPersistence, PersistedCatalog, SqlitePersistence,
};
pub use pipeline::{AppendFailure, BenchmarkResult, IngestOutcome, IngestStage, IngestionPipeline, Report};
pub use sink::{CollectingSink, LogSink, MarkdownSink, ReportSink};
