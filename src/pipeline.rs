//! # Stage: Ingestion Pipeline
//!
//! ## Responsibility
//! Turn one run into stored history, per-benchmark verdicts and a report:
//!
//! ```text
//! Validating ──► Appending ──► Analyzing ──► Committing ──► Reporting ──► Done
//!     │              │                           │
//!     └──────────────┴───────────► Rejected ◄────┘
//! ```
//!
//! - **Validating**: the run must carry at least one measurement, every
//!   measurement must be well formed and names must be unique. A commit the
//!   suite already holds is a no-op success (`AlreadyIngested`) so retried CI
//!   callbacks are harmless.
//! - **Appending**: each record goes to its history; a refused record is
//!   collected as an [`AppendFailure`] and its siblings proceed.
//! - **Analyzing**: every appended record is compared against its prior window.
//! - **Committing**: the catalog is saved. A failed save retracts the run from
//!   memory (and drops the suite if this call created it) and fails the call;
//!   nothing partial stays durable.
//! - **Reporting**: the report is handed to every registered sink. A failing
//!   sink is logged, never fatal: the run is already durable.
//!
//! ## Guarantees
//! - Idempotent: re-ingesting a commit leaves the catalog unchanged
//! - Per-benchmark isolation: one bad benchmark never aborts the others
//! - Thread-safe: `ingest` takes `&self`; one run's duplicate check, appends,
//!   analysis and save are serialized by the ingestion mutex, readers are not
//!
//! ## NOT Responsible For
//! - Retrying failed runs (caller)
//! - Producing measurements (external benchmark runner)

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::analyzer::{RegressionAnalyzer, Status, Verdict};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::{AppendError, BenchError, Result};
use crate::history::HistoryStore;
use crate::model::{Direction, MeasurementRecord, Run};
use crate::persist::{load_catalog, CatalogPersistence, PersistedCatalog};
use crate::sink::ReportSink;

// ---------------------------------------------------------------------------
// Stages and outcomes
// ---------------------------------------------------------------------------

/// Position of one `ingest` call in the ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Validating,
    Appending,
    Analyzing,
    Committing,
    Reporting,
    Done,
    Rejected,
}

impl IngestStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestStage::Done | IngestStage::Rejected)
    }
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestStage::Validating => "validating",
            IngestStage::Appending => "appending",
            IngestStage::Analyzing => "analyzing",
            IngestStage::Committing => "committing",
            IngestStage::Reporting => "reporting",
            IngestStage::Done => "done",
            IngestStage::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Ingested,
    /// The suite already held this commit; nothing changed.
    AlreadyIngested,
}

impl std::fmt::Display for IngestOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestOutcome::Ingested => write!(f, "ingested"),
            IngestOutcome::AlreadyIngested => write!(f, "already ingested"),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Analysis of one appended benchmark.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkResult {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub error: f64,
    pub verdict: Verdict,
}

impl BenchmarkResult {
    pub fn status(&self) -> Status {
        self.verdict.status
    }

    pub fn delta(&self) -> Option<f64> {
        self.verdict.delta
    }

    pub fn relative_change(&self) -> Option<f64> {
        self.verdict.relative_change
    }

    pub fn direction(&self) -> Direction {
        self.verdict.direction
    }
}

/// A benchmark whose record the store refused.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendFailure {
    pub name: String,
    pub error: AppendError,
}

/// Everything one `ingest` call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub commit: String,
    pub suite: String,
    pub outcome: IngestOutcome,
    /// Appended benchmarks, in run order.
    pub results: Vec<BenchmarkResult>,
    pub append_failures: Vec<AppendFailure>,
}

impl Report {
    fn already_ingested(suite: &str, commit: &str) -> Self {
        Self {
            commit: commit.to_string(),
            suite: suite.to_string(),
            outcome: IngestOutcome::AlreadyIngested,
            results: Vec::new(),
            append_failures: Vec::new(),
        }
    }

    pub fn is_already_ingested(&self) -> bool {
        self.outcome == IngestOutcome::AlreadyIngested
    }

    /// Benchmarks that regressed.
    pub fn alerts(&self) -> Vec<&BenchmarkResult> {
        self.results.iter().filter(|r| r.status().is_alert()).collect()
    }

    pub fn has_alerts(&self) -> bool {
        self.results.iter().any(|r| r.status().is_alert())
    }

    pub fn result(&self, name: &str) -> Option<&BenchmarkResult> {
        self.results.iter().find(|r| r.name == name)
    }

    /// One-line summary for logs and terminals.
    pub fn summary(&self) -> String {
        if self.is_already_ingested() {
            return format!("{} [{}]: already ingested", short_id(&self.commit), self.suite);
        }
        let count = |s: fn(&Status) -> bool| self.results.iter().filter(|r| s(&r.verdict.status)).count();
        format!(
            "{} [{}]: {} benchmarks, {} regressed, {} improved, {} within noise, {} insufficient data, {} append failures",
            short_id(&self.commit),
            self.suite,
            self.results.len(),
            count(|s| matches!(s, Status::Regressed { .. })),
            count(|s| matches!(s, Status::Improved)),
            count(|s| matches!(s, Status::WithinNoise)),
            count(|s| matches!(s, Status::InsufficientData)),
            self.append_failures.len(),
        )
    }
}

/// First seven characters of a commit id.
pub fn short_id(commit: &str) -> &str {
    match commit.char_indices().nth(7) {
        Some((idx, _)) => &commit[..idx],
        None => commit,
    }
}

// ---------------------------------------------------------------------------
// IngestionPipeline
// ---------------------------------------------------------------------------

/// Owns the catalog for the lifetime of the process and ingests runs into it.
pub struct IngestionPipeline {
    catalog: Arc<Catalog>,
    config: Config,
    analyzer: RegressionAnalyzer,
    persistence: Box<dyn CatalogPersistence>,
    sinks: Vec<Box<dyn ReportSink>>,
    ingest_lock: Mutex<()>,
}

impl IngestionPipeline {
    /// Pipeline over an already-built catalog.
    pub fn new(catalog: Arc<Catalog>, config: Config, persistence: Box<dyn CatalogPersistence>) -> Self {
        let analyzer = RegressionAnalyzer::new(config.analyzer.clone());
        Self {
            catalog,
            config,
            analyzer,
            persistence,
            sinks: Vec::new(),
            ingest_lock: Mutex::new(()),
        }
    }

    /// Load the catalog from `persistence` (or start empty) and wrap it.
    pub fn open(config: Config, persistence: Box<dyn CatalogPersistence>) -> Result<Self> {
        config.validate()?;
        let catalog = load_catalog(&*persistence, config.backfill_policy(), &config.repo_url)?;
        tracing::info!(
            target: "benchwatch::pipeline",
            store = %persistence.describe(),
            suites = catalog.suite_names().len(),
            runs = catalog.run_count(),
            "catalog loaded"
        );
        Ok(Self::new(Arc::new(catalog), config, persistence))
    }

    /// Register a sink. Sinks receive reports in registration order.
    pub fn add_sink(&mut self, sink: Box<dyn ReportSink>) {
        self.sinks.push(sink);
    }

    pub fn with_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn analyzer(&self) -> &RegressionAnalyzer {
        &self.analyzer
    }

    /// Ingest `run` into the configured default suite.
    pub fn ingest(&self, run: Run) -> Result<Report> {
        let suite = self.config.suite.clone();
        self.ingest_into(&suite, run)
    }

    /// Ingest `run` into `suite`, creating the suite on first use.
    pub fn ingest_into(&self, suite: &str, run: Run) -> Result<Report> {
        let commit = run.commit.id.clone();

        stage(&commit, IngestStage::Validating);
        let records = match validate(&run) {
            Ok(records) => records,
            Err(e) => return Err(reject(&commit, IngestStage::Validating, e)),
        };

        let txn = self.ingest_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let created_suite = self.catalog.suite(suite).is_none();
        let store = self.catalog.suite_or_create(suite);
        if store.contains_commit(&commit) {
            tracing::info!(
                target: "benchwatch::pipeline",
                suite = %suite,
                commit = %commit,
                "commit already ingested"
            );
            return Ok(Report::already_ingested(suite, &commit));
        }

        stage(&commit, IngestStage::Appending);
        let (appended, append_failures) = append_all(&store, records);
        if appended.is_empty() {
            let failures = append_failures.into_iter().map(|f| f.error).collect();
            return Err(reject(
                &commit,
                IngestStage::Appending,
                BenchError::Rejected { commit: commit.clone(), failures },
            ));
        }

        stage(&commit, IngestStage::Analyzing);
        let results: Vec<BenchmarkResult> =
            appended.iter().map(|record| self.analyze(&store, record)).collect();

        stage(&commit, IngestStage::Committing);
        if let Err(e) = self.persistence.save(&PersistedCatalog::from_catalog(&self.catalog)) {
            store.retract_uncommitted(&commit);
            if created_suite {
                self.catalog.remove_empty_suite(suite);
            }
            tracing::error!(
                target: "benchwatch::pipeline",
                suite = %suite,
                commit = %commit,
                store = %self.persistence.describe(),
                error = %e,
                "catalog save failed, run retracted"
            );
            return Err(reject(&commit, IngestStage::Committing, e));
        }
        drop(txn);

        let report = Report {
            commit: commit.clone(),
            suite: suite.to_string(),
            outcome: IngestOutcome::Ingested,
            results,
            append_failures,
        };

        stage(&commit, IngestStage::Reporting);
        for sink in &self.sinks {
            if let Err(e) = sink.publish(&report, &store) {
                tracing::warn!(
                    target: "benchwatch::pipeline",
                    sink = %sink.name(),
                    commit = %commit,
                    error = %e,
                    "report sink failed"
                );
            }
        }

        stage(&commit, IngestStage::Done);
        tracing::info!(target: "benchwatch::pipeline", "{}", report.summary());
        Ok(report)
    }

    fn analyze(&self, store: &HistoryStore, record: &MeasurementRecord) -> BenchmarkResult {
        let direction = self.config.direction_for(&record.name, &record.run.tool);
        let prior = store.prior_window(
            &record.name,
            record.commit_id(),
            self.analyzer.window_size(),
            |r| self.analyzer.is_baseline_candidate(r),
        );
        let verdict = self.analyzer.evaluate(record, &prior, direction);
        match verdict.status {
            Status::Regressed { delta, relative_change } => tracing::warn!(
                target: "benchwatch::analyzer",
                benchmark = %record.name,
                commit = %record.commit_id(),
                delta,
                relative_change,
                "performance regression"
            ),
            status => tracing::debug!(
                target: "benchwatch::analyzer",
                benchmark = %record.name,
                commit = %record.commit_id(),
                status = %status,
                window = prior.len(),
                "analyzed"
            ),
        }
        BenchmarkResult {
            name: record.name.clone(),
            unit: record.unit.clone(),
            value: record.value,
            error: record.error,
            verdict,
        }
    }
}

fn stage(commit: &str, stage: IngestStage) {
    tracing::debug!(target: "benchwatch::pipeline", commit = %commit, stage = %stage, "stage");
}

fn reject(commit: &str, at: IngestStage, error: BenchError) -> BenchError {
    tracing::warn!(
        target: "benchwatch::pipeline",
        commit = %commit,
        stage = %at,
        error = %error,
        "run rejected"
    );
    stage(commit, IngestStage::Rejected);
    error
}

/// Boundary validation: nothing is stored unless the whole run passes.
fn validate(run: &Run) -> Result<Vec<MeasurementRecord>> {
    if run.commit.id.trim().is_empty() {
        return Err(BenchError::validation("run has no commit id"));
    }
    if run.benches.is_empty() {
        return Err(BenchError::validation(format!(
            "run `{}` has no measurements",
            run.commit.id
        )));
    }
    let mut seen = HashSet::new();
    for bench in &run.benches {
        if !seen.insert(bench.name.as_str()) {
            return Err(BenchError::validation(format!(
                "run `{}` measures `{}` more than once",
                run.commit.id, bench.name
            )));
        }
    }
    let meta = Arc::new(run.metadata());
    run.benches
        .iter()
        .map(|bench| MeasurementRecord::from_measurement(bench, Arc::clone(&meta)))
        .collect()
}

fn append_all(
    store: &HistoryStore,
    records: Vec<MeasurementRecord>,
) -> (Vec<MeasurementRecord>, Vec<AppendFailure>) {
    let mut appended = Vec::with_capacity(records.len());
    let mut failures = Vec::new();
    for record in records {
        match store.append(record.clone()) {
            Ok(_) => appended.push(record),
            Err(error) => {
                tracing::warn!(
                    target: "benchwatch::pipeline",
                    benchmark = %record.name,
                    commit = %record.commit_id(),
                    error = %error,
                    "append refused"
                );
                failures.push(AppendFailure { name: error.benchmark().to_string(), error });
            }
        }
    }
    (appended, failures)
}
