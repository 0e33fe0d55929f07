//! # Stage: Regression Analyzer
//!
//! ## Responsibility
//! Decide, for one incoming record against its benchmark's prior window,
//! whether performance regressed, improved, or moved within noise.
//!
//! Tolerant-threshold comparison:
//!
//! 1. Fewer than `min_samples` prior records → `InsufficientData`.
//! 2. Baseline from the window: the previous record (default), or the rolling
//!    mean / median of the last `window` records.
//! 3. Noise band = `max(current.error, baseline.error) * confidence_multiplier`.
//!    Each run's *reported* error is used, never an absolute tolerance, so the
//!    band scales with the benchmark's own unit and magnitude. When both
//!    errors are zero the band is `relative_floor * baseline`.
//! 4. `delta = current - baseline`, oriented by [`Direction`]. Worse by more
//!    than the band is a regression candidate, better by more than the band
//!    is `Improved`, anything else is `WithinNoise`.
//! 5. A candidate becomes `Regressed` only if its relative change also
//!    exceeds `relative_floor`. A relative change at or above `gross_change`
//!    is `Regressed` even inside the band: a single run reporting an enormous
//!    error must not hide a 1000x spike.
//!
//! ## Guarantees
//! - Pure: no I/O, no shared state, same inputs give the same verdict
//! - Non-panicking: degenerate baselines (zero, empty window) are handled
//!
//! ## NOT Responsible For
//! - Fetching the window (history store)
//! - Acting on a regression (report sinks, host)

use serde::{Deserialize, Serialize};

use crate::history::Window;
use crate::model::{Direction, MeasurementRecord};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How the baseline central value is derived from the prior window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BaselineMode {
    /// The immediately preceding record.
    #[default]
    Previous,
    /// Mean value and mean error of the last `window` records.
    RollingMean { window: usize },
    /// Median value and median error of the last `window` records.
    RollingMedian { window: usize },
}

impl BaselineMode {
    /// Records the baseline needs to look at.
    pub fn span(&self) -> usize {
        match self {
            BaselineMode::Previous => 1,
            BaselineMode::RollingMean { window } | BaselineMode::RollingMedian { window } => {
                (*window).max(1)
            }
        }
    }
}

impl std::fmt::Display for BaselineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaselineMode::Previous => write!(f, "previous"),
            BaselineMode::RollingMean { window } => write!(f, "rolling_mean({})", window),
            BaselineMode::RollingMedian { window } => write!(f, "rolling_median({})", window),
        }
    }
}

/// Thresholds for the tolerant comparison. All are defaults, not law.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Prior records required before any verdict other than `InsufficientData`.
    pub min_samples: usize,
    pub baseline: BaselineMode,
    /// Error estimates are widened by this factor (2.0 ≈ 2σ).
    pub confidence_multiplier: f64,
    /// Relative change a regression must exceed to alert (0.05 = 5%; exactly
    /// 5% stays within noise).
    pub relative_floor: f64,
    /// Relative change that alerts regardless of the noise band (10.0 = +1000%).
    pub gross_change: f64,
    /// Baseline only on distinct commits; re-runs are stored but never compared against.
    pub distinct_baselines_only: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_samples: 2,
            baseline: BaselineMode::Previous,
            confidence_multiplier: 2.0,
            relative_floor: 0.05,
            gross_change: 10.0,
            distinct_baselines_only: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// Analysis outcome for one benchmark.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    InsufficientData,
    WithinNoise,
    Improved,
    /// `delta` is `current - baseline`; `relative_change` is `delta / baseline`.
    Regressed { delta: f64, relative_change: f64 },
}

impl Status {
    pub fn is_alert(&self) -> bool {
        matches!(self, Status::Regressed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Status::InsufficientData => "insufficient-data",
            Status::WithinNoise => "within-noise",
            Status::Improved => "improved",
            Status::Regressed { .. } => "regressed",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Regressed { relative_change, .. } => {
                write!(f, "regressed ({:+.1}%)", relative_change * 100.0)
            }
            other => write!(f, "{}", other.label()),
        }
    }
}

/// Baseline the current value was compared against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub value: f64,
    pub error: f64,
    /// Records that contributed.
    pub samples: usize,
}

/// Full result of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub status: Status,
    pub direction: Direction,
    pub baseline: Option<Baseline>,
    pub delta: Option<f64>,
    pub relative_change: Option<f64>,
    pub noise_band: Option<f64>,
}

impl Verdict {
    fn insufficient(direction: Direction) -> Self {
        Self {
            status: Status::InsufficientData,
            direction,
            baseline: None,
            delta: None,
            relative_change: None,
            noise_band: None,
        }
    }

    /// `current / baseline`, the ratio the markdown report shows.
    pub fn ratio(&self) -> Option<f64> {
        self.relative_change.map(|r| 1.0 + r)
    }
}

// ---------------------------------------------------------------------------
// RegressionAnalyzer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RegressionAnalyzer {
    config: AnalyzerConfig,
}

impl RegressionAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// How many prior records the caller should fetch.
    pub fn window_size(&self) -> usize {
        self.config.min_samples.max(self.config.baseline.span())
    }

    /// Whether `record` may serve as a baseline.
    pub fn is_baseline_candidate(&self, record: &MeasurementRecord) -> bool {
        !self.config.distinct_baselines_only || record.run.is_distinct()
    }

    /// Compare `current` against `prior` (oldest first, `current` excluded).
    pub fn evaluate(&self, current: &MeasurementRecord, prior: &Window, direction: Direction) -> Verdict {
        let prior: Vec<&MeasurementRecord> =
            prior.iter().filter(|r| self.is_baseline_candidate(r)).collect();
        if prior.is_empty() || prior.len() < self.config.min_samples {
            return Verdict::insufficient(direction);
        }

        let baseline = self.baseline(&prior);
        let delta = current.value - baseline.value;
        let relative_change = relative(delta, baseline.value);

        let error = current.error.max(baseline.error);
        let noise_band = if error > 0.0 {
            error * self.config.confidence_multiplier
        } else {
            self.config.relative_floor * baseline.value.abs()
        };

        // Positive means worse, whatever the direction.
        let (worse, relative_worse) = match direction {
            Direction::LowerIsBetter => (delta, relative_change),
            Direction::HigherIsBetter => (-delta, -relative_change),
        };

        let regressed = Status::Regressed { delta, relative_change };
        let status = if worse > noise_band {
            if relative_worse > self.config.relative_floor {
                regressed
            } else {
                Status::WithinNoise
            }
        } else if relative_worse >= self.config.gross_change {
            regressed
        } else if worse < -noise_band {
            Status::Improved
        } else {
            Status::WithinNoise
        };

        Verdict {
            status,
            direction,
            baseline: Some(baseline),
            delta: Some(delta),
            relative_change: Some(relative_change),
            noise_band: Some(noise_band),
        }
    }

    fn baseline(&self, prior: &[&MeasurementRecord]) -> Baseline {
        let span = self.config.baseline.span().min(prior.len());
        let recent = &prior[prior.len() - span..];
        let values: Vec<f64> = recent.iter().map(|r| r.value).collect();
        let errors: Vec<f64> = recent.iter().map(|r| r.error).collect();
        let (value, error) = match self.config.baseline {
            BaselineMode::Previous => (values[values.len() - 1], errors[errors.len() - 1]),
            BaselineMode::RollingMean { .. } => (mean(&values), mean(&errors)),
            BaselineMode::RollingMedian { .. } => (median(values), median(errors)),
        };
        Baseline { value, error, samples: span }
    }
}

fn relative(delta: f64, baseline: f64) -> f64 {
    if baseline > 0.0 {
        delta / baseline
    } else if delta == 0.0 {
        0.0
    } else {
        f64::INFINITY.copysign(delta)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Commit, Measurement, Run, RunMetadata};
    use chrono::{DateTime, Duration};
    use rstest::rstest;
    use std::sync::Arc;

    fn meta(i: i64, distinct: bool) -> Arc<RunMetadata> {
        let ts = DateTime::parse_from_rfc3339("2020-12-03T12:00:00+01:00").unwrap()
            + Duration::minutes(i);
        let mut commit = Commit::new(format!("c{i}"), ts);
        commit.distinct = distinct;
        Arc::new(Run::new(commit, 0, "cargo").metadata())
    }

    fn rec(i: i64, value: f64, error: f64) -> MeasurementRecord {
        let m = Measurement::new("bench", value, error, "ns/iter");
        MeasurementRecord::from_measurement(&m, meta(i, true)).unwrap()
    }

    fn window(points: &[(f64, f64)]) -> Window {
        Window::from(
            points
                .iter()
                .enumerate()
                .map(|(i, (v, e))| rec(i as i64, *v, *e))
                .collect::<Vec<_>>(),
        )
    }

    fn with_min(min_samples: usize) -> RegressionAnalyzer {
        RegressionAnalyzer::new(AnalyzerConfig { min_samples, ..Default::default() })
    }

    #[test]
    fn test_empty_window_is_insufficient() {
        let v = RegressionAnalyzer::default().evaluate(&rec(9, 1.0, 0.1), &Window::default(), Direction::LowerIsBetter);
        assert_eq!(v.status, Status::InsufficientData);
        assert!(v.baseline.is_none());
    }

    #[test]
    fn test_single_prior_is_insufficient_by_default() {
        let v = RegressionAnalyzer::default().evaluate(
            &rec(9, 999_999.0, 1.0),
            &window(&[(1.0, 0.1)]),
            Direction::LowerIsBetter,
        );
        assert_eq!(v.status, Status::InsufficientData);
    }

    #[test]
    fn test_single_prior_within_band_is_within_noise() {
        // v0 ± e0 = 1000 ± 100; new value inside 1000 ± 2 * max(100, 80)
        let v = with_min(1).evaluate(&rec(9, 1150.0, 80.0), &window(&[(1000.0, 100.0)]), Direction::LowerIsBetter);
        assert_eq!(v.status, Status::WithinNoise);
        assert_eq!(v.noise_band, Some(200.0));
    }

    #[test]
    fn test_thousandfold_spike_with_huge_error_still_regresses() {
        let v = with_min(1).evaluate(
            &rec(9, 1_400_000_000.0, 700_000_000.0),
            &window(&[(1_000_000.0, 50_000.0)]),
            Direction::LowerIsBetter,
        );
        match v.status {
            Status::Regressed { relative_change, .. } => assert!(relative_change > 1000.0),
            other => panic!("expected regression, got {other:?}"),
        }
    }

    #[test]
    fn test_regression_beyond_band_and_floor() {
        let v = RegressionAnalyzer::default().evaluate(
            &rec(9, 1500.0, 10.0),
            &window(&[(1000.0, 10.0), (1000.0, 10.0)]),
            Direction::LowerIsBetter,
        );
        assert_eq!(v.status, Status::Regressed { delta: 500.0, relative_change: 0.5 });
        assert!(v.status.is_alert());
    }

    #[test]
    fn test_candidate_below_relative_floor_is_noise() {
        // delta 30 beats the band (2 * 1 = 2) but is only 3%
        let v = RegressionAnalyzer::default().evaluate(
            &rec(9, 1030.0, 1.0),
            &window(&[(1000.0, 1.0), (1000.0, 1.0)]),
            Direction::LowerIsBetter,
        );
        assert_eq!(v.status, Status::WithinNoise);
    }

    #[test]
    fn test_change_equal_to_relative_floor_is_noise() {
        let a = RegressionAnalyzer::default();
        let prior = window(&[(1000.0, 1.0), (1000.0, 1.0)]);
        let at_floor = a.evaluate(&rec(9, 1050.0, 1.0), &prior, Direction::LowerIsBetter);
        assert_eq!(at_floor.status, Status::WithinNoise);
        let past_floor = a.evaluate(&rec(9, 1051.0, 1.0), &prior, Direction::LowerIsBetter);
        assert!(past_floor.status.is_alert());
    }

    #[test]
    fn test_zero_error_falls_back_to_relative_floor() {
        let a = RegressionAnalyzer::default();
        let prior = window(&[(100.0, 0.0), (100.0, 0.0)]);
        let small = a.evaluate(&rec(9, 104.0, 0.0), &prior, Direction::LowerIsBetter);
        assert_eq!(small.status, Status::WithinNoise);
        assert_eq!(small.noise_band, Some(5.0));
        let big = a.evaluate(&rec(9, 106.0, 0.0), &prior, Direction::LowerIsBetter);
        assert!(big.status.is_alert());
        let faster = a.evaluate(&rec(9, 90.0, 0.0), &prior, Direction::LowerIsBetter);
        assert_eq!(faster.status, Status::Improved);
    }

    #[test]
    fn test_higher_is_better_flips_direction() {
        let a = RegressionAnalyzer::default();
        let prior = window(&[(1000.0, 10.0), (1000.0, 10.0)]);
        let drop = a.evaluate(&rec(9, 500.0, 10.0), &prior, Direction::HigherIsBetter);
        assert_eq!(drop.status, Status::Regressed { delta: -500.0, relative_change: -0.5 });
        let rise = a.evaluate(&rec(9, 1500.0, 10.0), &prior, Direction::HigherIsBetter);
        assert_eq!(rise.status, Status::Improved);
    }

    #[test]
    fn test_non_distinct_priors_are_not_baselines() {
        let rerun = {
            let m = Measurement::new("bench", 5000.0, 10.0, "ns/iter");
            MeasurementRecord::from_measurement(&m, meta(2, false)).unwrap()
        };
        let prior = Window::from(vec![rec(0, 1000.0, 10.0), rec(1, 1000.0, 10.0), rerun]);
        let v = RegressionAnalyzer::default().evaluate(&rec(9, 1000.0, 10.0), &prior, Direction::LowerIsBetter);
        assert_eq!(v.status, Status::WithinNoise);
        assert_eq!(v.baseline.unwrap().value, 1000.0);
    }

    #[test]
    fn test_non_distinct_priors_used_when_mode_disabled() {
        let rerun = {
            let m = Measurement::new("bench", 5000.0, 10.0, "ns/iter");
            MeasurementRecord::from_measurement(&m, meta(2, false)).unwrap()
        };
        let prior = Window::from(vec![rec(0, 1000.0, 10.0), rec(1, 1000.0, 10.0), rerun]);
        let a = RegressionAnalyzer::new(AnalyzerConfig {
            distinct_baselines_only: false,
            ..Default::default()
        });
        let v = a.evaluate(&rec(9, 1000.0, 10.0), &prior, Direction::LowerIsBetter);
        assert_eq!(v.status, Status::Improved);
    }

    #[test]
    fn test_zero_baseline_does_not_panic() {
        let v = with_min(1).evaluate(&rec(9, 5.0, 0.0), &window(&[(0.0, 0.0)]), Direction::LowerIsBetter);
        assert!(v.status.is_alert());
        assert_eq!(v.relative_change, Some(f64::INFINITY));
    }

    #[rstest]
    #[case::previous(BaselineMode::Previous, 300.0)]
    #[case::mean(BaselineMode::RollingMean { window: 3 }, 200.0)]
    #[case::median(BaselineMode::RollingMedian { window: 4 }, 150.0)]
    fn test_baseline_modes(#[case] mode: BaselineMode, #[case] expected: f64) {
        let a = RegressionAnalyzer::new(AnalyzerConfig { baseline: mode, ..Default::default() });
        let prior = window(&[(50.0, 1.0), (100.0, 1.0), (200.0, 1.0), (300.0, 1.0)]);
        let v = a.evaluate(&rec(9, 300.0, 1.0), &prior, Direction::LowerIsBetter);
        assert_eq!(v.baseline.unwrap().value, expected);
    }

    #[rstest]
    #[case(1)]
    #[case(2)]
    #[case(7)]
    fn test_window_size_covers_min_samples(#[case] min_samples: usize) {
        let a = with_min(min_samples);
        assert_eq!(a.window_size(), min_samples);
        let rolling = RegressionAnalyzer::new(AnalyzerConfig {
            min_samples,
            baseline: BaselineMode::RollingMean { window: 5 },
            ..Default::default()
        });
        assert_eq!(rolling.window_size(), min_samples.max(5));
    }

    #[rstest]
    #[case(Status::InsufficientData, "insufficient-data")]
    #[case(Status::WithinNoise, "within-noise")]
    #[case(Status::Improved, "improved")]
    #[case(Status::Regressed { delta: 1.0, relative_change: 0.25 }, "regressed (+25.0%)")]
    fn test_status_display(#[case] status: Status, #[case] expected: &str) {
        assert_eq!(status.to_string(), expected);
    }

    #[test]
    fn test_verdict_ratio() {
        let v = RegressionAnalyzer::default().evaluate(
            &rec(9, 2000.0, 1.0),
            &window(&[(1000.0, 1.0), (1000.0, 1.0)]),
            Direction::LowerIsBetter,
        );
        assert_eq!(v.ratio(), Some(2.0));
    }

    #[test]
    fn test_analyzer_config_deserializes_partial_toml() {
        let cfg: AnalyzerConfig = toml::from_str(
            "min_samples = 3\nbaseline = { mode = \"rolling_median\", window = 5 }\n",
        )
        .unwrap();
        assert_eq!(cfg.min_samples, 3);
        assert_eq!(cfg.baseline, BaselineMode::RollingMedian { window: 5 });
        assert_eq!(cfg.relative_floor, 0.05);
    }
}
