//! # Stage: Report Sinks
//!
//! ## Responsibility
//! Receive finished ingestion reports, together with the suite's updated
//! history, for rendering or notification.
//!
//! ## Guarantees
//! - Sinks only read; they cannot change the catalog
//! - A sink error never un-ingests a run (the pipeline logs it and moves on)
//!
//! ## NOT Responsible For
//! - Charts, commit comments, chat notifications (hosts build those on top)

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use crate::analyzer::Status;
use crate::error::Result;
use crate::history::HistoryStore;
use crate::pipeline::{short_id, Report};

/// Destination for ingestion reports.
pub trait ReportSink: Send + Sync {
    /// Human-readable name used in logs.
    fn name(&self) -> &str;

    /// Handle one report. `history` is the suite the run was ingested into.
    fn publish(&self, report: &Report, history: &HistoryStore) -> Result<()>;
}

impl<T: ReportSink + ?Sized> ReportSink for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn publish(&self, report: &Report, history: &HistoryStore) -> Result<()> {
        (**self).publish(report, history)
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Emits one tracing event per regression and per append failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn publish(&self, report: &Report, _history: &HistoryStore) -> Result<()> {
        for result in report.alerts() {
            tracing::warn!(
                target: "benchwatch::sink",
                suite = %report.suite,
                commit = %report.commit,
                benchmark = %result.name,
                status = %result.status(),
                "regression alert"
            );
        }
        for failure in &report.append_failures {
            tracing::warn!(
                target: "benchwatch::sink",
                suite = %report.suite,
                commit = %report.commit,
                benchmark = %failure.name,
                error = %failure.error,
                "benchmark not recorded"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MarkdownSink
// ---------------------------------------------------------------------------

/// Renders a report as a Markdown comparison table.
///
/// ```text
/// # :warning: Performance Alert :warning:
///
/// Possible performance regression was detected for benchmark suite **Benchmark**.
///
/// | Benchmark | Previous | Current | Ratio | Status |
/// |-|-|-|-|-|
/// | `fib_20` | 5266871 ± 945604 ns/iter | 7012345 ± 102000 ns/iter | 1.33 | regressed (+33.1%) |
/// ```
pub fn render_markdown(report: &Report, history: &HistoryStore) -> String {
    let mut out = String::new();
    if report.has_alerts() {
        out.push_str("# :warning: Performance Alert :warning:\n\n");
        out.push_str(&format!(
            "Possible performance regression was detected for benchmark suite **{}** at commit `{}`.\n\n",
            report.suite,
            short_id(&report.commit)
        ));
    } else {
        out.push_str(&format!(
            "# {} benchmark result\n\nCommit `{}`: no regression detected.\n\n",
            report.suite,
            short_id(&report.commit)
        ));
    }

    if !report.results.is_empty() {
        out.push_str("| Benchmark | Previous | Current | Ratio | Status |\n");
        out.push_str("|-|-|-|-|-|\n");
        for result in &report.results {
            let previous = match result.verdict.baseline {
                Some(b) => format!("{} ± {} {}", b.value, b.error, result.unit),
                None => "-".to_string(),
            };
            let ratio = match result.verdict.ratio() {
                Some(r) if r.is_finite() => format!("{:.2}", r),
                _ => "-".to_string(),
            };
            let status = match result.status() {
                Status::Regressed { .. } => format!("**{}**", result.status()),
                other => other.to_string(),
            };
            out.push_str(&format!(
                "| `{}` | {} | {} ± {} {} | {} | {} |\n",
                result.name, previous, result.value, result.error, result.unit, ratio, status
            ));
        }
    }

    if !report.append_failures.is_empty() {
        out.push_str("\n**Not recorded:**\n\n");
        for failure in &report.append_failures {
            out.push_str(&format!("- `{}`: {}\n", failure.name, failure.error));
        }
    }

    let tracked = history.names().len();
    out.push_str(&format!("\n_{} benchmarks tracked in this suite._\n", tracked));
    out
}

enum Target {
    Path(PathBuf),
    Writer(Mutex<Box<dyn Write + Send>>),
}

/// Writes [`render_markdown`] output to a file (replaced on every report) or
/// to any writer (appended).
pub struct MarkdownSink {
    target: Target,
    alerts_only: bool,
}

impl MarkdownSink {
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self { target: Target::Path(path.into()), alerts_only: false }
    }

    pub fn to_writer(writer: Box<dyn Write + Send>) -> Self {
        Self { target: Target::Writer(Mutex::new(writer)), alerts_only: false }
    }

    /// Skip reports without a regression.
    pub fn alerts_only(mut self, alerts_only: bool) -> Self {
        self.alerts_only = alerts_only;
        self
    }
}

impl ReportSink for MarkdownSink {
    fn name(&self) -> &str {
        "markdown"
    }

    fn publish(&self, report: &Report, history: &HistoryStore) -> Result<()> {
        if self.alerts_only && !report.has_alerts() {
            return Ok(());
        }
        let text = render_markdown(report, history);
        match &self.target {
            Target::Path(path) => {
                let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
                file.write_all(text.as_bytes())?;
            }
            Target::Writer(writer) => {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                writer.write_all(text.as_bytes())?;
                writer.flush()?;
            }
        }
        tracing::debug!(
            target: "benchwatch::sink",
            commit = %report.commit,
            bytes = text.len(),
            "markdown report written"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CollectingSink
// ---------------------------------------------------------------------------

/// Keeps every report it receives. Share it with `Arc` to inspect afterwards.
#[derive(Debug, Default)]
pub struct CollectingSink {
    reports: Mutex<Vec<Report>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReportSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    fn publish(&self, report: &Report, _history: &HistoryStore) -> Result<()> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Baseline, Verdict};
    use crate::error::AppendError;
    use crate::model::Direction;
    use crate::pipeline::{AppendFailure, BenchmarkResult, IngestOutcome};

    fn result(name: &str, status: Status, baseline: Option<f64>) -> BenchmarkResult {
        BenchmarkResult {
            name: name.into(),
            unit: "ns/iter".into(),
            value: 200.0,
            error: 5.0,
            verdict: Verdict {
                status,
                direction: Direction::LowerIsBetter,
                baseline: baseline.map(|value| Baseline { value, error: 4.0, samples: 1 }),
                delta: baseline.map(|b| 200.0 - b),
                relative_change: baseline.map(|b| (200.0 - b) / b),
                noise_band: baseline.map(|_| 10.0),
            },
        }
    }

    fn report(results: Vec<BenchmarkResult>) -> Report {
        Report {
            commit: "e4af457a3bb7eb0b".into(),
            suite: "Benchmark".into(),
            outcome: IngestOutcome::Ingested,
            results,
            append_failures: Vec::new(),
        }
    }

    #[test]
    fn test_markdown_alert_heading_and_row() {
        let r = report(vec![result(
            "fib_20",
            Status::Regressed { delta: 100.0, relative_change: 1.0 },
            Some(100.0),
        )]);
        let md = render_markdown(&r, &HistoryStore::default());
        assert!(md.starts_with("# :warning: Performance Alert"));
        assert!(md.contains("`e4af457`"));
        assert!(md.contains("| `fib_20` | 100 ± 4 ns/iter | 200 ± 5 ns/iter | 2.00 | **regressed (+100.0%)** |"));
    }

    #[test]
    fn test_markdown_without_alert() {
        let r = report(vec![result("x", Status::InsufficientData, None)]);
        let md = render_markdown(&r, &HistoryStore::default());
        assert!(md.contains("no regression detected"));
        assert!(md.contains("| `x` | - | 200 ± 5 ns/iter | - | insufficient-data |"));
    }

    #[test]
    fn test_markdown_lists_append_failures() {
        let mut r = report(vec![result("x", Status::WithinNoise, Some(199.0))]);
        r.append_failures.push(AppendFailure {
            name: "y".into(),
            error: AppendError::UnitConflict {
                name: "y".into(),
                expected: "ns/iter".into(),
                found: "ms/iter".into(),
            },
        });
        let md = render_markdown(&r, &HistoryStore::default());
        assert!(md.contains("**Not recorded:**"));
        assert!(md.contains("- `y`: unit conflict"));
    }

    #[test]
    fn test_markdown_sink_alerts_only_skips_clean_reports() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert.md");
        let sink = MarkdownSink::to_path(&path).alerts_only(true);
        sink.publish(&report(vec![result("x", Status::WithinNoise, Some(199.0))]), &HistoryStore::default())
            .unwrap();
        assert!(!path.exists());
        sink.publish(
            &report(vec![result("x", Status::Regressed { delta: 100.0, relative_change: 1.0 }, Some(100.0))]),
            &HistoryStore::default(),
        )
        .unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("Performance Alert"));
    }

    #[test]
    fn test_collecting_sink_through_arc() {
        let sink = Arc::new(CollectingSink::new());
        let shared: Box<dyn ReportSink> = Box::new(Arc::clone(&sink));
        shared.publish(&report(Vec::new()), &HistoryStore::default()).unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(shared.name(), "collecting");
    }

    #[test]
    fn test_log_sink_never_fails() {
        let r = report(vec![result("x", Status::Regressed { delta: 1.0, relative_change: 0.5 }, Some(2.0))]);
        assert!(LogSink.publish(&r, &HistoryStore::default()).is_ok());
    }
}
