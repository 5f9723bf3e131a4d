//! `mp_drift` - Statistical drift detection for ModelPilot
//!
//! This crate compares current feature distributions against a stored
//! baseline using KL divergence, the population stability index, and
//! mean shift in baseline standard deviations. Detections produce a
//! persisted report plus at most one alert, with deterministic
//! recommendations operators can act on.

use chrono::{DateTime, Utc};
use mp_config::DriftConfig;
use mp_store::{timestamp_slug, DocStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, instrument, warn};

const BASELINE_FILE: &str = "drift/baseline_stats.json";
const ALERTS_FILE: &str = "drift/alerts.json";
const REPORTS_DIR: &str = "drift/reports";

/// Epsilon added to histogram bins before normalization
const EPSILON: f64 = 1e-10;

/// Severity cut points on the normalized drift score
const SEVERITY_LOW: f64 = 0.05;
const SEVERITY_MEDIUM: f64 = 0.1;
const SEVERITY_HIGH: f64 = 0.2;
const SEVERITY_CRITICAL: f64 = 0.3;

/// Columnar sample matrix: feature name to cells, `None` marking a
/// missing value
pub type FeatureMatrix = BTreeMap<String, Vec<Option<f64>>>;

/// Drift detection errors
#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Baseline statistics not set; call set_baseline first")]
    BaselineNotSet,

    #[error("Alert not found: {alert_id}")]
    AlertNotFound { alert_id: String },

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
}

/// Severity grades for drift findings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl DriftSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftSeverity::None => "none",
            DriftSeverity::Low => "low",
            DriftSeverity::Medium => "medium",
            DriftSeverity::High => "high",
            DriftSeverity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for DriftSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DriftSeverity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "none" => Ok(DriftSeverity::None),
            "low" => Ok(DriftSeverity::Low),
            "medium" => Ok(DriftSeverity::Medium),
            "high" => Ok(DriftSeverity::High),
            "critical" => Ok(DriftSeverity::Critical),
            other => Err(format!("unknown drift severity: {other}")),
        }
    }
}

/// Descriptive statistics for one feature column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureStats {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
    pub missing_rate: f64,
    pub unique_count: usize,
    pub histogram_bins: Vec<f64>,
    pub histogram_counts: Vec<u64>,
}

impl FeatureStats {
    /// Compute statistics from a column of optionally-missing values.
    ///
    /// `None` and NaN cells count as missing. An empty or all-missing
    /// column yields zeroed statistics with `missing_rate` 1.0, never an
    /// error. The standard deviation is the sample deviation (n - 1),
    /// 0.0 for fewer than two values; quartiles use linear interpolation.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_values(name: &str, values: &[Option<f64>], bins: usize) -> Self {
        let mut clean: Vec<f64> = values
            .iter()
            .filter_map(|v| v.filter(|x| !x.is_nan()))
            .collect();

        if clean.is_empty() {
            return Self {
                name: name.to_string(),
                mean: 0.0,
                std: 0.0,
                min: 0.0,
                max: 0.0,
                median: 0.0,
                q1: 0.0,
                q3: 0.0,
                missing_rate: 1.0,
                unique_count: 0,
                histogram_bins: Vec::new(),
                histogram_counts: Vec::new(),
            };
        }

        clean.sort_by(f64::total_cmp);
        let n = clean.len();
        let mean = clean.iter().sum::<f64>() / n as f64;
        let std = if n < 2 {
            0.0
        } else {
            let variance =
                clean.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            variance.sqrt()
        };

        let mut unique_count = 1;
        for pair in clean.windows(2) {
            if pair[0] != pair[1] {
                unique_count += 1;
            }
        }

        let missing_rate = (values.len() - n) as f64 / values.len() as f64;
        let (histogram_bins, histogram_counts) = histogram(&clean, bins.max(1));

        Self {
            name: name.to_string(),
            mean,
            std,
            min: clean[0],
            max: clean[n - 1],
            median: quantile(&clean, 0.5),
            q1: quantile(&clean, 0.25),
            q3: quantile(&clean, 0.75),
            missing_rate,
            unique_count,
            histogram_bins,
            histogram_counts,
        }
    }
}

/// Drift evaluation for one feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDrift {
    pub feature_name: String,
    /// Normalized score: max of each metric over its threshold
    pub drift_score: f64,
    pub has_drift: bool,
    pub severity: DriftSeverity,
    pub kl_divergence: f64,
    pub psi: f64,
    /// Signed shift of the current mean, in baseline standard deviations
    pub mean_shift_sigmas: f64,
    pub baseline_mean: f64,
    pub baseline_std: f64,
    pub current_mean: f64,
    pub current_std: f64,
    pub detail: String,
}

/// Complete detection report across all baseline features
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub report_id: String,
    pub generated_at: DateTime<Utc>,
    pub model_type: String,
    pub model_version: String,
    pub has_drift: bool,
    pub overall_severity: DriftSeverity,
    /// Max of the per-feature normalized scores, 0.0 when no feature
    /// could be evaluated
    pub drift_score: f64,
    pub features: Vec<FeatureDrift>,
    pub drifted_features: Vec<String>,
    pub recommendations: Vec<String>,
    pub baseline_sample_size: u64,
    pub current_sample_size: u64,
    pub monitoring_window_hours: u64,
}

/// Alert raised when a report flags drift
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftAlert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub model_type: String,
    pub model_version: String,
    pub severity: DriftSeverity,
    pub message: String,
    pub affected_features: Vec<String>,
    pub recommended_action: String,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Reference distribution captured from training data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub captured_at: DateTime<Utc>,
    pub sample_size: u64,
    pub features: BTreeMap<String, FeatureStats>,
}

#[derive(Debug, Default)]
struct DetectorState {
    baseline: Option<Baseline>,
    alerts: Vec<DriftAlert>,
    reports: Vec<DriftReport>,
}

/// Drift detector handle.
///
/// The baseline is scoped to the detector instance: one baseline
/// document, replaced wholesale by [`DriftDetector::set_baseline`].
pub struct DriftDetector {
    store: Arc<DocStore>,
    config: DriftConfig,
    state: Mutex<DetectorState>,
}

impl DriftDetector {
    /// Open the detector, reloading any persisted baseline, alerts, and
    /// reports
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if persisted drift documents cannot be read.
    pub fn new(store: Arc<DocStore>, config: DriftConfig) -> Result<Self, DriftError> {
        let baseline: Option<Baseline> = store.read_doc(BASELINE_FILE)?;
        let alerts: Vec<DriftAlert> = store.read_log(ALERTS_FILE)?;

        let mut reports = Vec::new();
        for name in store.list_docs(REPORTS_DIR)? {
            if let Some(report) = store.read_doc::<DriftReport>(&format!("{REPORTS_DIR}/{name}"))? {
                reports.push(report);
            }
        }
        reports.sort_by(|a, b| a.generated_at.cmp(&b.generated_at));

        info!(
            baseline_features = baseline.as_ref().map_or(0, |b| b.features.len()),
            alerts = alerts.len(),
            reports = reports.len(),
            "Opened drift detector"
        );

        Ok(Self {
            store,
            config,
            state: Mutex::new(DetectorState {
                baseline,
                alerts,
                reports,
            }),
        })
    }

    /// Capture a new baseline from training data, replacing any prior one
    ///
    /// # Errors
    ///
    /// Returns [`DriftError`] if the baseline cannot be persisted.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[instrument(skip(self, samples))]
    pub fn set_baseline(&self, samples: &FeatureMatrix) -> Result<Baseline, DriftError> {
        let sample_size = matrix_rows(samples);
        info!(samples = sample_size, "Computing baseline statistics");

        let features: BTreeMap<String, FeatureStats> = samples
            .iter()
            .map(|(name, column)| {
                (
                    name.clone(),
                    FeatureStats::from_values(name, column, self.config.histogram_bins),
                )
            })
            .collect();

        let baseline = Baseline {
            captured_at: Utc::now(),
            sample_size,
            features,
        };
        let mut state = self.state.lock().unwrap();
        self.store.write_doc(BASELINE_FILE, &baseline)?;
        state.baseline = Some(baseline.clone());
        drop(state);

        info!(features = baseline.features.len(), "Baseline captured");
        Ok(baseline)
    }

    /// The current baseline
    ///
    /// # Errors
    ///
    /// Returns [`DriftError::BaselineNotSet`] when none has been captured.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    pub fn baseline(&self) -> Result<Baseline, DriftError> {
        self.state
            .lock()
            .unwrap()
            .baseline
            .clone()
            .ok_or(DriftError::BaselineNotSet)
    }

    /// Evaluate current data against the baseline.
    ///
    /// Every baseline feature present in `current` is scored; features
    /// missing from `current` are skipped with a warning. The report is
    /// persisted, and when any feature drifts, exactly one alert is
    /// appended.
    ///
    /// # Errors
    ///
    /// Returns [`DriftError::BaselineNotSet`] when no baseline exists, or
    /// a store error if persistence fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[instrument(skip(self, current))]
    pub fn detect_drift(
        &self,
        current: &FeatureMatrix,
        model_type: &str,
        model_version: &str,
    ) -> Result<DriftReport, DriftError> {
        let mut state = self.state.lock().unwrap();
        let baseline = state.baseline.as_ref().ok_or(DriftError::BaselineNotSet)?;

        let mut features: Vec<FeatureDrift> = Vec::new();
        let mut drifted_features: Vec<String> = Vec::new();

        for (feature_name, base) in &baseline.features {
            let Some(column) = current.get(feature_name) else {
                warn!(feature = %feature_name, "Feature not found in current data");
                continue;
            };
            let cur = FeatureStats::from_values(feature_name, column, self.config.histogram_bins);

            let kl = kl_divergence(&base.histogram_counts, &cur.histogram_counts);
            let psi = population_stability_index(&base.histogram_counts, &cur.histogram_counts);
            let shift = mean_shift_sigmas(base.mean, base.std, cur.mean);

            let has_drift = kl > self.config.kl_threshold
                || psi > self.config.psi_threshold
                || shift.abs() > self.config.mean_shift_threshold;
            let drift_score = (kl / self.config.kl_threshold)
                .max(psi / self.config.psi_threshold)
                .max(shift.abs() / self.config.mean_shift_threshold);

            features.push(FeatureDrift {
                feature_name: feature_name.clone(),
                drift_score,
                has_drift,
                severity: severity_for(drift_score),
                kl_divergence: kl,
                psi,
                mean_shift_sigmas: shift,
                baseline_mean: base.mean,
                baseline_std: base.std,
                current_mean: cur.mean,
                current_std: cur.std,
                detail: format!("KL={kl:.4}, PSI={psi:.4}, MeanShift={shift:.2}σ"),
            });

            if has_drift {
                drifted_features.push(feature_name.clone());
            }
        }

        let drift_score = features.iter().map(|f| f.drift_score).fold(0.0, f64::max);
        let overall_severity = severity_for(drift_score);
        let has_drift = !drifted_features.is_empty();
        let recommendations =
            build_recommendations(&features, &drifted_features, self.config.systematic_ratio);

        let now = Utc::now();
        let report = DriftReport {
            report_id: format!("drift_{}", timestamp_slug(&now)),
            generated_at: now,
            model_type: model_type.to_string(),
            model_version: model_version.to_string(),
            has_drift,
            overall_severity,
            drift_score,
            features,
            drifted_features,
            recommendations,
            baseline_sample_size: baseline.sample_size,
            current_sample_size: matrix_rows(current),
            monitoring_window_hours: self.config.monitoring_window_hours,
        };

        self.store
            .write_doc(&format!("{REPORTS_DIR}/{}.json", report.report_id), &report)?;
        state.reports.push(report.clone());

        if has_drift {
            let alert = DriftAlert {
                alert_id: format!("alert_{}", timestamp_slug(&now)),
                timestamp: now,
                model_type: report.model_type.clone(),
                model_version: report.model_version.clone(),
                severity: report.overall_severity,
                message: format!(
                    "Drift detected in {} features",
                    report.drifted_features.len()
                ),
                affected_features: report.drifted_features.clone(),
                recommended_action: report
                    .recommendations
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "Investigate drift".to_string()),
                acknowledged: false,
                acknowledged_by: None,
                acknowledged_at: None,
            };
            warn!(
                alert_id = %alert.alert_id,
                severity = %alert.severity,
                "{}", alert.message
            );
            state.alerts.push(alert);
            if state.alerts.len() > self.config.alert_retention {
                let excess = state.alerts.len() - self.config.alert_retention;
                state.alerts.drain(..excess);
            }
            self.store.write_doc(ALERTS_FILE, &state.alerts)?;
        }

        info!(
            has_drift,
            severity = %report.overall_severity,
            "Drift detection complete"
        );
        Ok(report)
    }

    /// Recent reports, oldest first, optionally filtered by model type
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn reports(&self, model_type: Option<&str>, limit: usize) -> Vec<DriftReport> {
        let state = self.state.lock().unwrap();
        let matching: Vec<DriftReport> = state
            .reports
            .iter()
            .filter(|r| model_type.is_none_or(|t| r.model_type == t))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Alerts, optionally filtered by acknowledgement state and severity
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn alerts(
        &self,
        acknowledged: Option<bool>,
        severity: Option<DriftSeverity>,
    ) -> Vec<DriftAlert> {
        self.state
            .lock()
            .unwrap()
            .alerts
            .iter()
            .filter(|a| acknowledged.is_none_or(|ack| a.acknowledged == ack))
            .filter(|a| severity.is_none_or(|s| a.severity == s))
            .cloned()
            .collect()
    }

    /// Mark an alert acknowledged; acknowledgement never deletes
    ///
    /// # Errors
    ///
    /// Returns [`DriftError::AlertNotFound`] for an unknown id, or a store
    /// error if the alert log cannot be rewritten.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    pub fn acknowledge_alert(&self, alert_id: &str, user: &str) -> Result<DriftAlert, DriftError> {
        let mut state = self.state.lock().unwrap();
        let Some(alert) = state.alerts.iter_mut().find(|a| a.alert_id == alert_id) else {
            return Err(DriftError::AlertNotFound {
                alert_id: alert_id.to_string(),
            });
        };
        alert.acknowledged = true;
        alert.acknowledged_by = Some(user.to_string());
        alert.acknowledged_at = Some(Utc::now());
        let acknowledged = alert.clone();

        self.store.write_doc(ALERTS_FILE, &state.alerts)?;
        info!(alert_id, user, "Alert acknowledged");
        Ok(acknowledged)
    }
}

/// Number of rows in a column matrix (longest column)
fn matrix_rows(matrix: &FeatureMatrix) -> u64 {
    matrix.values().map(Vec::len).max().unwrap_or(0) as u64
}

/// Linearly interpolated quantile over a sorted slice
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    let frac = pos - pos.floor();
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Equal-width histogram over [min, max]; a single-valued column widens
/// the range by ±0.5 so it still lands in a bucket
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn histogram(sorted: &[f64], bins: usize) -> (Vec<f64>, Vec<u64>) {
    let mut lo = sorted[0];
    let mut hi = sorted[sorted.len() - 1];
    if lo == hi {
        lo -= 0.5;
        hi += 0.5;
    }

    let edges: Vec<f64> = (0..=bins)
        .map(|i| lo + (hi - lo) * i as f64 / bins as f64)
        .collect();

    let mut counts = vec![0u64; bins];
    for &value in sorted {
        let scaled = (value - lo) / (hi - lo) * bins as f64;
        let idx = (scaled as usize).min(bins - 1);
        counts[idx] += 1;
    }
    (edges, counts)
}

/// Resample a series onto `target` points by linear interpolation over a
/// unit grid
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn resample(values: &[f64], target: usize) -> Vec<f64> {
    if values.len() == target {
        return values.to_vec();
    }
    if values.len() == 1 || target == 1 {
        return vec![values[0]; target];
    }
    (0..target)
        .map(|i| {
            let pos = i as f64 / (target - 1) as f64 * (values.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(values.len() - 1);
            let frac = pos - pos.floor();
            values[lo] + (values[hi] - values[lo]) * frac
        })
        .collect()
}

/// Bring two histograms onto a common length (shorter of the two)
#[allow(clippy::cast_precision_loss)]
fn align(p_counts: &[u64], q_counts: &[u64]) -> (Vec<f64>, Vec<f64>) {
    let p: Vec<f64> = p_counts.iter().map(|&c| c as f64).collect();
    let q: Vec<f64> = q_counts.iter().map(|&c| c as f64).collect();
    if p.len() == q.len() {
        return (p, q);
    }
    let target = p.len().min(q.len());
    (resample(&p, target), resample(&q, target))
}

/// KL divergence between two histogram distributions; degenerate inputs
/// (either histogram empty) score 0.0
#[must_use]
pub fn kl_divergence(p_counts: &[u64], q_counts: &[u64]) -> f64 {
    if p_counts.is_empty() || q_counts.is_empty() {
        return 0.0;
    }
    let (mut p, mut q) = align(p_counts, q_counts);
    for v in &mut p {
        *v += EPSILON;
    }
    for v in &mut q {
        *v += EPSILON;
    }
    let p_sum: f64 = p.iter().sum();
    let q_sum: f64 = q.iter().sum();
    p.iter()
        .zip(&q)
        .map(|(pi, qi)| {
            let pi = pi / p_sum;
            let qi = qi / q_sum;
            pi * (pi / qi).ln()
        })
        .sum()
}

/// Population stability index between two histogram distributions;
/// degenerate inputs score 0.0
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn population_stability_index(p_counts: &[u64], q_counts: &[u64]) -> f64 {
    if p_counts.is_empty() || q_counts.is_empty() {
        return 0.0;
    }
    let (p, q) = align(p_counts, q_counts);
    let p_sum: f64 = p.iter().sum();
    let q_sum: f64 = q.iter().sum();
    let p_denom = p_sum + EPSILON * p.len() as f64;
    let q_denom = q_sum + EPSILON * q.len() as f64;
    p.iter()
        .zip(&q)
        .map(|(pi, qi)| {
            let pi = (pi + EPSILON) / p_denom;
            let qi = (qi + EPSILON) / q_denom;
            (qi - pi) * (qi / pi).ln()
        })
        .sum()
}

/// Signed shift of the current mean in baseline standard deviations;
/// 0.0 when the baseline deviation is zero
#[must_use]
pub fn mean_shift_sigmas(baseline_mean: f64, baseline_std: f64, current_mean: f64) -> f64 {
    if baseline_std == 0.0 {
        return 0.0;
    }
    (current_mean - baseline_mean) / baseline_std
}

/// Map a normalized drift score onto a severity grade
#[must_use]
pub fn severity_for(drift_score: f64) -> DriftSeverity {
    if drift_score >= SEVERITY_CRITICAL {
        DriftSeverity::Critical
    } else if drift_score >= SEVERITY_HIGH {
        DriftSeverity::High
    } else if drift_score >= SEVERITY_MEDIUM {
        DriftSeverity::Medium
    } else if drift_score >= SEVERITY_LOW {
        DriftSeverity::Low
    } else {
        DriftSeverity::None
    }
}

#[allow(clippy::cast_precision_loss)]
fn build_recommendations(
    features: &[FeatureDrift],
    drifted: &[String],
    systematic_ratio: f64,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if drifted.is_empty() {
        recommendations.push("No significant drift detected. Continue monitoring.".to_string());
        return recommendations;
    }

    let high_severity = features
        .iter()
        .filter(|f| matches!(f.severity, DriftSeverity::High | DriftSeverity::Critical))
        .count();
    if high_severity > 0 {
        recommendations.push(format!(
            "URGENT: {high_severity} features show high/critical drift. \
             Consider increasing human oversight and investigating data quality."
        ));
    }

    if drifted.len() as f64 > features.len() as f64 * systematic_ratio {
        recommendations.push(
            "Multiple features drifting suggests systematic data change. \
             Investigate upstream data sources."
                .to_string(),
        );
    }

    if drifted.len() <= 3 {
        recommendations.push(format!(
            "Investigate specific features: {}",
            drifted.join(", ")
        ));
    }

    recommendations
        .push("Consider retraining the model with recent data if drift persists.".to_string());
    recommendations
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_detector() -> (TempDir, DriftDetector) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocStore::open(dir.path()).unwrap());
        let detector = DriftDetector::new(store, DriftConfig::default()).unwrap();
        (dir, detector)
    }

    fn column(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn matrix(name: &str, values: &[f64]) -> FeatureMatrix {
        let mut m = FeatureMatrix::new();
        m.insert(name.to_string(), column(values));
        m
    }

    // ========================================================================
    // Feature statistics
    // ========================================================================

    #[test]
    fn test_feature_stats_basic() {
        // mean 24, sample std 6, quartiles by interpolation
        let stats = FeatureStats::from_values(
            "hours",
            &column(&[18.0, 18.0, 24.0, 30.0, 30.0]),
            20,
        );
        assert!((stats.mean - 24.0).abs() < 1e-9);
        assert!((stats.std - 6.0).abs() < 1e-9);
        assert_eq!(stats.min, 18.0);
        assert_eq!(stats.max, 30.0);
        assert_eq!(stats.median, 24.0);
        assert_eq!(stats.q1, 18.0);
        assert_eq!(stats.q3, 30.0);
        assert_eq!(stats.unique_count, 3);
        assert_eq!(stats.missing_rate, 0.0);
        assert_eq!(stats.histogram_bins.len(), 21);
        assert_eq!(stats.histogram_counts.iter().sum::<u64>(), 5);
    }

    #[test]
    fn test_feature_stats_empty_is_zeroed() {
        let stats = FeatureStats::from_values("empty", &[], 20);
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.missing_rate, 1.0);
        assert_eq!(stats.unique_count, 0);
        assert!(stats.histogram_counts.is_empty());
    }

    #[test]
    fn test_feature_stats_all_missing_is_zeroed() {
        let stats = FeatureStats::from_values("gaps", &[None, Some(f64::NAN), None], 20);
        assert_eq!(stats.missing_rate, 1.0);
        assert_eq!(stats.unique_count, 0);
    }

    #[test]
    fn test_feature_stats_missing_rate() {
        let stats =
            FeatureStats::from_values("partial", &[Some(1.0), None, Some(3.0), None], 20);
        assert!((stats.missing_rate - 0.5).abs() < 1e-9);
        assert!((stats.mean - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_feature_stats_constant_column() {
        let stats = FeatureStats::from_values("flat", &column(&[5.0, 5.0, 5.0]), 20);
        assert_eq!(stats.std, 0.0);
        assert_eq!(stats.unique_count, 1);
        // Degenerate range widens to [4.5, 5.5] so the histogram still bins
        assert_eq!(stats.histogram_bins.first().copied(), Some(4.5));
        assert_eq!(stats.histogram_bins.last().copied(), Some(5.5));
        assert_eq!(stats.histogram_counts.iter().sum::<u64>(), 3);
    }

    // ========================================================================
    // Drift math
    // ========================================================================

    #[test]
    fn test_kl_divergence_identical_is_zero() {
        let counts = vec![3, 5, 8, 5, 3];
        assert!(kl_divergence(&counts, &counts).abs() < 1e-9);
        assert!(population_stability_index(&counts, &counts).abs() < 1e-9);
    }

    #[test]
    fn test_kl_divergence_shifted_is_positive() {
        let base = vec![10, 20, 40, 20, 10];
        let shifted = vec![40, 30, 20, 7, 3];
        assert!(kl_divergence(&base, &shifted) > 0.0);
        assert!(population_stability_index(&base, &shifted) > 0.0);
    }

    #[test]
    fn test_kl_divergence_empty_histogram_is_zero() {
        assert_eq!(kl_divergence(&[], &[1, 2, 3]), 0.0);
        assert_eq!(kl_divergence(&[1, 2, 3], &[]), 0.0);
        assert_eq!(population_stability_index(&[], &[]), 0.0);
    }

    #[test]
    fn test_mismatched_histogram_lengths_resample() {
        let short = vec![10, 20, 10];
        let long = vec![5, 10, 10, 10, 5];
        let kl = kl_divergence(&short, &long);
        assert!(kl.is_finite());
        let psi = population_stability_index(&long, &short);
        assert!(psi.is_finite());
    }

    #[test]
    fn test_mean_shift_signed_and_zero_std() {
        let shift = mean_shift_sigmas(24.0, 6.0, 40.0);
        assert!((shift - 16.0 / 6.0).abs() < 1e-9);
        assert!(mean_shift_sigmas(24.0, 6.0, 12.0) < 0.0);
        assert_eq!(mean_shift_sigmas(24.0, 0.0, 40.0), 0.0);
    }

    #[test]
    fn test_severity_cut_points() {
        assert_eq!(severity_for(0.0), DriftSeverity::None);
        assert_eq!(severity_for(0.049), DriftSeverity::None);
        assert_eq!(severity_for(0.05), DriftSeverity::Low);
        assert_eq!(severity_for(0.1), DriftSeverity::Medium);
        assert_eq!(severity_for(0.2), DriftSeverity::High);
        assert_eq!(severity_for(0.3), DriftSeverity::Critical);
        assert_eq!(severity_for(1.33), DriftSeverity::Critical);
    }

    // ========================================================================
    // Detection
    // ========================================================================

    #[test]
    fn test_detect_without_baseline_fails() {
        let (_dir, detector) = temp_detector();
        let err = detector
            .detect_drift(&matrix("hours", &[1.0, 2.0]), "completion", "v1")
            .unwrap_err();
        assert!(matches!(err, DriftError::BaselineNotSet));
    }

    #[test]
    fn test_baseline_as_current_shows_no_drift() {
        let (_dir, detector) = temp_detector();
        let data = matrix("hours", &[18.0, 18.0, 24.0, 30.0, 30.0]);
        detector.set_baseline(&data).unwrap();

        let report = detector.detect_drift(&data, "completion", "v1").unwrap();
        assert!(!report.has_drift);
        assert_eq!(report.overall_severity, DriftSeverity::None);
        assert!(report.drift_score.abs() < 1e-6);
        assert_eq!(
            report.recommendations,
            vec!["No significant drift detected. Continue monitoring.".to_string()]
        );
        // No alert for a clean report
        assert!(detector.alerts(None, None).is_empty());
    }

    #[test]
    fn test_mean_shift_flags_drift() {
        let (_dir, detector) = temp_detector();
        // Baseline mean 24, std 6; current mean 40 shifts (40-24)/6 ≈ 2.67σ
        detector
            .set_baseline(&matrix("hours", &[18.0, 18.0, 24.0, 30.0, 30.0]))
            .unwrap();
        let report = detector
            .detect_drift(
                &matrix("hours", &[34.0, 34.0, 40.0, 46.0, 46.0]),
                "time_to_complete",
                "v2",
            )
            .unwrap();

        assert!(report.has_drift);
        assert_eq!(report.drifted_features, vec!["hours".to_string()]);
        let feature = &report.features[0];
        assert!(feature.has_drift);
        assert!((feature.mean_shift_sigmas - 16.0 / 6.0).abs() < 1e-9);
        assert!(feature.drift_score >= 16.0 / 6.0 / 2.0);
        assert_eq!(report.overall_severity, DriftSeverity::Critical);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Investigate specific features: hours")));
        assert!(report
            .recommendations
            .last()
            .unwrap()
            .contains("Consider retraining"));
    }

    #[test]
    fn test_drift_raises_exactly_one_alert() {
        let (_dir, detector) = temp_detector();
        detector
            .set_baseline(&matrix("hours", &[18.0, 18.0, 24.0, 30.0, 30.0]))
            .unwrap();
        let report = detector
            .detect_drift(
                &matrix("hours", &[34.0, 34.0, 40.0, 46.0, 46.0]),
                "completion",
                "v1",
            )
            .unwrap();

        let alerts = detector.alerts(None, None);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.message, "Drift detected in 1 features");
        assert_eq!(alert.affected_features, report.drifted_features);
        assert_eq!(alert.recommended_action, report.recommendations[0]);
        assert_eq!(alert.severity, report.overall_severity);
        assert!(!alert.acknowledged);
    }

    #[test]
    fn test_missing_feature_is_skipped() {
        let (_dir, detector) = temp_detector();
        let mut base = matrix("hours", &[1.0, 2.0, 3.0]);
        base.insert("score".to_string(), column(&[0.1, 0.2, 0.3]));
        detector.set_baseline(&base).unwrap();

        // Current data only carries one of the two baseline features
        let report = detector
            .detect_drift(&matrix("hours", &[1.0, 2.0, 3.0]), "completion", "v1")
            .unwrap();
        assert_eq!(report.features.len(), 1);
        assert_eq!(report.features[0].feature_name, "hours");
    }

    #[test]
    fn test_report_persisted_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocStore::open(dir.path()).unwrap());
        {
            let detector =
                DriftDetector::new(Arc::clone(&store), DriftConfig::default()).unwrap();
            let data = matrix("hours", &[1.0, 2.0, 3.0, 4.0]);
            detector.set_baseline(&data).unwrap();
            detector.detect_drift(&data, "completion", "v1").unwrap();
        }

        let reopened = DriftDetector::new(store, DriftConfig::default()).unwrap();
        assert!(reopened.baseline().is_ok());
        let reports = reopened.reports(None, 10);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].report_id.starts_with("drift_"));
        assert_eq!(reports[0].model_type, "completion");
    }

    #[test]
    fn test_reports_filter_by_model_type() {
        let (_dir, detector) = temp_detector();
        let data = matrix("hours", &[1.0, 2.0, 3.0]);
        detector.set_baseline(&data).unwrap();
        detector.detect_drift(&data, "completion", "v1").unwrap();
        detector.detect_drift(&data, "rework_risk", "v1").unwrap();

        assert_eq!(detector.reports(None, 10).len(), 2);
        assert_eq!(detector.reports(Some("completion"), 10).len(), 1);
        assert_eq!(detector.reports(Some("satisfaction"), 10).len(), 0);
    }

    // ========================================================================
    // Alerts
    // ========================================================================

    #[test]
    fn test_acknowledge_alert() {
        let (_dir, detector) = temp_detector();
        detector
            .set_baseline(&matrix("hours", &[18.0, 18.0, 24.0, 30.0, 30.0]))
            .unwrap();
        detector
            .detect_drift(
                &matrix("hours", &[34.0, 34.0, 40.0, 46.0, 46.0]),
                "completion",
                "v1",
            )
            .unwrap();

        let alert_id = detector.alerts(None, None)[0].alert_id.clone();
        let acked = detector.acknowledge_alert(&alert_id, "oncall").unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("oncall"));
        assert!(acked.acknowledged_at.is_some());

        // The alert stays in the log, filterable either way
        assert_eq!(detector.alerts(Some(true), None).len(), 1);
        assert!(detector.alerts(Some(false), None).is_empty());
    }

    #[test]
    fn test_acknowledge_unknown_alert_fails() {
        let (_dir, detector) = temp_detector();
        let err = detector
            .acknowledge_alert("alert_20990101_000000", "oncall")
            .unwrap_err();
        assert!(matches!(err, DriftError::AlertNotFound { .. }));
    }

    #[test]
    fn test_alerts_filter_by_severity() {
        let (_dir, detector) = temp_detector();
        detector
            .set_baseline(&matrix("hours", &[18.0, 18.0, 24.0, 30.0, 30.0]))
            .unwrap();
        detector
            .detect_drift(
                &matrix("hours", &[34.0, 34.0, 40.0, 46.0, 46.0]),
                "completion",
                "v1",
            )
            .unwrap();

        assert_eq!(
            detector.alerts(None, Some(DriftSeverity::Critical)).len(),
            1
        );
        assert!(detector.alerts(None, Some(DriftSeverity::Low)).is_empty());
    }
}
