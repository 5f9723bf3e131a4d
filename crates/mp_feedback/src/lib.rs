//! `mp_feedback` - Human feedback capture and training-dataset assembly
//!
//! This crate records operator overrides and actual job outcomes, then
//! compiles them into weighted training datasets (features + labels +
//! metadata) for retraining pipelines. Overrides carry a higher sample
//! weight than outcomes; datasets can be merged into existing training
//! data with a caller-controlled weight multiplier.

use chrono::{DateTime, Duration, Utc};
use mp_config::FeedbackConfig;
use mp_store::{timestamp_slug, DocStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, instrument, warn};

const OVERRIDES_FILE: &str = "feedback/overrides.json";
const OUTCOMES_FILE: &str = "feedback/outcomes.json";
const DATASETS_FILE: &str = "feedback/datasets.json";
const DATASETS_DIR: &str = "feedback/datasets";

/// Column layout of the combined sample table. Override rows fill the
/// first half, outcome rows the second; both share ids, targets, and the
/// sample weight.
const TABLE_COLUMNS: [&str; 16] = [
    "job_id",
    "vendor_id",
    "original_score",
    "selected_score",
    "confidence",
    "override_category",
    "was_low_confidence",
    "target_completion",
    "target_time",
    "target_rework",
    "sample_weight",
    "predicted_completion_prob",
    "predicted_time_to_complete",
    "predicted_rework_risk",
    "was_ai_recommended",
    "was_overridden",
];

const LABEL_COLUMNS: [&str; 3] = ["target_completion", "target_time", "target_rework"];

/// Feedback processing errors
#[derive(Error, Debug)]
pub enum FeedbackError {
    #[error("Unsupported file format: {path}")]
    UnsupportedFormat { path: String },

    #[error("Invalid data in {path}: {reason}")]
    InvalidData { path: String, reason: String },

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Why an operator overrode the recommendation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverrideCategory {
    Preference,
    Availability,
    Relationship,
    Performance,
    Cost,
    Other,
}

impl OverrideCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideCategory::Preference => "preference",
            OverrideCategory::Availability => "availability",
            OverrideCategory::Relationship => "relationship",
            OverrideCategory::Performance => "performance",
            OverrideCategory::Cost => "cost",
            OverrideCategory::Other => "other",
        }
    }
}

impl std::fmt::Display for OverrideCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OverrideCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "preference" => Ok(OverrideCategory::Preference),
            "availability" => Ok(OverrideCategory::Availability),
            "relationship" => Ok(OverrideCategory::Relationship),
            "performance" => Ok(OverrideCategory::Performance),
            "cost" => Ok(OverrideCategory::Cost),
            "other" => Ok(OverrideCategory::Other),
            other => Err(format!("unknown override category: {other}")),
        }
    }
}

/// A recorded human override decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub override_id: String,
    pub job_id: String,
    pub original_vendor_id: String,
    pub selected_vendor_id: String,
    pub operator_id: String,
    pub override_reason: String,
    pub override_category: OverrideCategory,
    pub original_score: f64,
    pub selected_score: f64,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub job_type: Option<String>,
    pub urgency_level: Option<String>,
    pub customer_tier: Option<String>,
    pub model_version: Option<String>,
    pub was_low_confidence: bool,
}

/// Caller-supplied fields of an override; id and timestamp are assigned
/// on record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverrideInput {
    pub job_id: String,
    pub original_vendor_id: String,
    pub selected_vendor_id: String,
    pub operator_id: String,
    pub override_reason: String,
    pub override_category: OverrideCategory,
    pub original_score: f64,
    pub selected_score: f64,
    pub confidence: f64,
    pub job_type: Option<String>,
    pub urgency_level: Option<String>,
    pub customer_tier: Option<String>,
    pub model_version: Option<String>,
    pub was_low_confidence: bool,
}

/// A recorded actual job outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub outcome_id: String,
    pub job_id: String,
    pub vendor_id: String,
    pub completed_successfully: bool,
    pub time_to_completion_hours: f64,
    pub required_rework: bool,
    pub customer_satisfaction: Option<f64>,
    pub predicted_completion_prob: Option<f64>,
    pub predicted_time_to_complete: Option<f64>,
    pub predicted_rework_risk: Option<f64>,
    pub was_ai_recommended: bool,
    pub was_overridden: bool,
    pub model_version: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Caller-supplied fields of an outcome; id and timestamp are assigned
/// on record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeInput {
    pub job_id: String,
    pub vendor_id: String,
    pub completed_successfully: bool,
    pub time_to_completion_hours: f64,
    pub required_rework: bool,
    pub customer_satisfaction: Option<f64>,
    pub predicted_completion_prob: Option<f64>,
    pub predicted_time_to_complete: Option<f64>,
    pub predicted_rework_risk: Option<f64>,
    pub was_ai_recommended: bool,
    pub was_overridden: bool,
    pub model_version: Option<String>,
}

/// Metadata of a prepared training dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackDataset {
    pub dataset_id: String,
    pub created_at: DateTime<Utc>,
    pub total_samples: u64,
    pub override_samples: u64,
    pub outcome_samples: u64,
    /// Share of non-missing cells in the combined sample table
    pub completeness_score: f64,
    pub recency_days: i64,
    pub features_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
}

/// Result of merging feedback into existing training data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeSummary {
    pub path: PathBuf,
    pub total_rows: u64,
    pub existing_rows: u64,
    pub feedback_rows: u64,
}

/// Aggregate view over recorded overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverrideStatistics {
    pub total_overrides: u64,
    pub by_category: BTreeMap<String, u64>,
    pub by_job_type: BTreeMap<String, u64>,
    pub avg_original_score: f64,
    pub avg_selected_score: f64,
    pub avg_confidence: f64,
    pub low_confidence_rate: f64,
}

/// Aggregate view over recorded outcomes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutcomeStatistics {
    pub total_outcomes: u64,
    pub completion_rate: f64,
    pub rework_rate: f64,
    pub avg_time_to_completion: f64,
    pub ai_recommended_rate: f64,
    pub override_rate: f64,
    pub avg_satisfaction: Option<f64>,
}

/// Prediction quality over outcomes that carried predictions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionAccuracy {
    /// Outcomes carrying a completion prediction
    pub evaluated: u64,
    pub completion_accuracy: Option<f64>,
    pub time_mae_hours: Option<f64>,
    pub rework_accuracy: Option<f64>,
}

#[derive(Debug, Default)]
struct FeedbackState {
    overrides: Vec<OverrideRecord>,
    outcomes: Vec<OutcomeRecord>,
}

type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableFormat {
    Csv,
    Json,
}

/// Feedback processor handle
pub struct FeedbackProcessor {
    store: Arc<DocStore>,
    config: FeedbackConfig,
    state: Mutex<FeedbackState>,
}

impl FeedbackProcessor {
    /// Open the processor, reloading persisted records
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError`] if existing feedback documents cannot be
    /// read.
    pub fn new(store: Arc<DocStore>, config: FeedbackConfig) -> Result<Self, FeedbackError> {
        let overrides: Vec<OverrideRecord> = store.read_log(OVERRIDES_FILE)?;
        let outcomes: Vec<OutcomeRecord> = store.read_log(OUTCOMES_FILE)?;
        info!(
            overrides = overrides.len(),
            outcomes = outcomes.len(),
            "Opened feedback processor"
        );
        Ok(Self {
            store,
            config,
            state: Mutex::new(FeedbackState {
                overrides,
                outcomes,
            }),
        })
    }

    /// Record a human override decision
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError`] if the override log cannot be persisted.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    pub fn record_override(&self, input: OverrideInput) -> Result<OverrideRecord, FeedbackError> {
        let record = OverrideRecord {
            override_id: format!("override_{}", short_id()),
            job_id: input.job_id,
            original_vendor_id: input.original_vendor_id,
            selected_vendor_id: input.selected_vendor_id,
            operator_id: input.operator_id,
            override_reason: input.override_reason,
            override_category: input.override_category,
            original_score: input.original_score,
            selected_score: input.selected_score,
            confidence: input.confidence,
            timestamp: Utc::now(),
            job_type: input.job_type,
            urgency_level: input.urgency_level,
            customer_tier: input.customer_tier,
            model_version: input.model_version,
            was_low_confidence: input.was_low_confidence,
        };

        let mut state = self.state.lock().unwrap();
        state.overrides.push(record.clone());
        self.store.write_doc(OVERRIDES_FILE, &state.overrides)?;

        info!(override_id = %record.override_id, job_id = %record.job_id, "Recorded override");
        Ok(record)
    }

    /// Record an actual job outcome
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError`] if the outcome log cannot be persisted.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    pub fn record_outcome(&self, input: OutcomeInput) -> Result<OutcomeRecord, FeedbackError> {
        let record = OutcomeRecord {
            outcome_id: format!("outcome_{}", short_id()),
            job_id: input.job_id,
            vendor_id: input.vendor_id,
            completed_successfully: input.completed_successfully,
            time_to_completion_hours: input.time_to_completion_hours,
            required_rework: input.required_rework,
            customer_satisfaction: input.customer_satisfaction,
            predicted_completion_prob: input.predicted_completion_prob,
            predicted_time_to_complete: input.predicted_time_to_complete,
            predicted_rework_risk: input.predicted_rework_risk,
            was_ai_recommended: input.was_ai_recommended,
            was_overridden: input.was_overridden,
            model_version: input.model_version,
            timestamp: Utc::now(),
        };

        let mut state = self.state.lock().unwrap();
        state.outcomes.push(record.clone());
        self.store.write_doc(OUTCOMES_FILE, &state.outcomes)?;

        info!(outcome_id = %record.outcome_id, job_id = %record.job_id, "Recorded outcome");
        Ok(record)
    }

    /// Compile recent feedback into a training dataset.
    ///
    /// Overrides become samples labeled as if the operator was right
    /// (completion 1.0, rework 0.0, completion time unknown) at the
    /// override sample weight; outcomes carry their actual labels at the
    /// outcome weight. Zero eligible records is a success: the returned
    /// dataset has `total_samples` 0 and no files.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError`] if dataset files cannot be written.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[instrument(skip(self))]
    pub fn prepare_training_dataset(
        &self,
        include_overrides: bool,
        include_outcomes: bool,
        min_recency_days: Option<i64>,
    ) -> Result<FeedbackDataset, FeedbackError> {
        info!("Preparing training dataset from feedback data");
        let recency_days = min_recency_days.unwrap_or(self.config.min_recency_days);
        let cutoff = Utc::now() - Duration::days(recency_days);
        let now = Utc::now();

        let mut rows: Vec<Row> = Vec::new();
        let mut override_samples = 0u64;
        let mut outcome_samples = 0u64;
        {
            let state = self.state.lock().unwrap();
            if include_overrides {
                for record in &state.overrides {
                    if record.timestamp >= cutoff {
                        rows.push(override_row(record, self.config.override_weight));
                        override_samples += 1;
                    }
                }
            }
            if include_outcomes {
                for record in &state.outcomes {
                    if record.timestamp >= cutoff {
                        rows.push(outcome_row(record, self.config.outcome_weight));
                        outcome_samples += 1;
                    }
                }
            }
        }

        let dataset_id = format!("dataset_{}", timestamp_slug(&now));
        if rows.is_empty() {
            warn!("No samples found for training dataset");
            return Ok(FeedbackDataset {
                dataset_id,
                created_at: now,
                total_samples: 0,
                override_samples: 0,
                outcome_samples: 0,
                completeness_score: 0.0,
                recency_days,
                features_path: None,
                labels_path: None,
                metadata_path: None,
            });
        }

        let feature_columns: Vec<String> = TABLE_COLUMNS
            .iter()
            .filter(|c| !LABEL_COLUMNS.contains(c) && **c != "job_id")
            .map(|c| (*c).to_string())
            .collect();
        let label_columns: Vec<String> =
            LABEL_COLUMNS.iter().map(|c| (*c).to_string()).collect();

        let features_rel = format!("{DATASETS_DIR}/{dataset_id}/features.csv");
        let labels_rel = format!("{DATASETS_DIR}/{dataset_id}/labels.csv");
        let metadata_rel = format!("{DATASETS_DIR}/{dataset_id}/metadata.json");

        let features_path = self
            .store
            .put_blob(&features_rel, write_csv(&feature_columns, &rows).as_bytes())?;
        let labels_path = self
            .store
            .put_blob(&labels_rel, write_csv(&label_columns, &rows).as_bytes())?;

        let dataset = FeedbackDataset {
            dataset_id,
            created_at: now,
            total_samples: override_samples + outcome_samples,
            override_samples,
            outcome_samples,
            completeness_score: completeness(&rows),
            recency_days,
            features_path: Some(features_path),
            labels_path: Some(labels_path),
            metadata_path: Some(self.store.root().join(&metadata_rel)),
        };
        self.store
            .put_blob(&metadata_rel, &serde_json::to_vec_pretty(&dataset).map_err(StoreError::SerializationError)?)?;

        self.store.append_log(DATASETS_FILE, &dataset, usize::MAX)?;

        info!(
            total = dataset.total_samples,
            overrides = override_samples,
            outcomes = outcome_samples,
            "Prepared training dataset"
        );
        Ok(dataset)
    }

    /// Merge fresh feedback samples into an existing training table.
    ///
    /// Feedback sample weights are multiplied by `feedback_weight`;
    /// existing rows without a `sample_weight` column default to 1.0. With
    /// no eligible feedback the existing file is returned untouched.
    ///
    /// # Errors
    ///
    /// Returns [`FeedbackError::UnsupportedFormat`] unless both paths end
    /// in `.csv` or `.json` (checked before any I/O), or an I/O error if
    /// either file cannot be read or written.
    #[instrument(skip(self))]
    pub fn merge_with_training_data(
        &self,
        existing_path: &Path,
        output_path: &Path,
        feedback_weight: f64,
    ) -> Result<MergeSummary, FeedbackError> {
        let existing_format = table_format(existing_path)?;
        let output_format = table_format(output_path)?;
        info!(existing = %existing_path.display(), "Merging feedback with existing data");

        let (mut columns, mut existing_rows) = load_table(existing_path, existing_format)?;
        let existing_count = existing_rows.len() as u64;

        let dataset = self.prepare_training_dataset(true, true, None)?;
        if dataset.total_samples == 0 {
            warn!("No feedback data to merge");
            return Ok(MergeSummary {
                path: existing_path.to_path_buf(),
                total_rows: existing_count,
                existing_rows: existing_count,
                feedback_rows: 0,
            });
        }

        let features_path = dataset
            .features_path
            .as_deref()
            .ok_or_else(|| FeedbackError::InvalidData {
                path: dataset.dataset_id.clone(),
                reason: "dataset has samples but no features file".to_string(),
            })?;
        let (feedback_columns, mut feedback_rows) = load_table(features_path, TableFormat::Csv)?;

        for row in &mut feedback_rows {
            let weight = row
                .get("sample_weight")
                .and_then(Value::as_f64)
                .map_or(feedback_weight, |w| w * feedback_weight);
            row.insert("sample_weight".to_string(), Value::from(weight));
        }

        if !columns.iter().any(|c| c == "sample_weight") {
            columns.push("sample_weight".to_string());
        }
        for row in &mut existing_rows {
            row.entry("sample_weight".to_string())
                .or_insert_with(|| Value::from(1.0));
        }
        for column in &feedback_columns {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }

        let feedback_count = feedback_rows.len() as u64;
        existing_rows.append(&mut feedback_rows);
        write_table(output_path, output_format, &columns, &existing_rows)?;

        info!(
            path = %output_path.display(),
            rows = existing_rows.len(),
            "Merged dataset saved"
        );
        Ok(MergeSummary {
            path: output_path.to_path_buf(),
            total_rows: existing_count + feedback_count,
            existing_rows: existing_count,
            feedback_rows: feedback_count,
        })
    }

    /// Aggregate statistics over recorded overrides; zeroed when none
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_override_statistics(&self) -> OverrideStatistics {
        let state = self.state.lock().unwrap();
        let overrides = &state.overrides;
        if overrides.is_empty() {
            return OverrideStatistics::default();
        }

        let n = overrides.len() as f64;
        let mut by_category: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_job_type: BTreeMap<String, u64> = BTreeMap::new();
        for record in overrides {
            *by_category
                .entry(record.override_category.as_str().to_string())
                .or_insert(0) += 1;
            if let Some(job_type) = &record.job_type {
                *by_job_type.entry(job_type.clone()).or_insert(0) += 1;
            }
        }

        OverrideStatistics {
            total_overrides: overrides.len() as u64,
            by_category,
            by_job_type,
            avg_original_score: overrides.iter().map(|o| o.original_score).sum::<f64>() / n,
            avg_selected_score: overrides.iter().map(|o| o.selected_score).sum::<f64>() / n,
            avg_confidence: overrides.iter().map(|o| o.confidence).sum::<f64>() / n,
            low_confidence_rate: overrides.iter().filter(|o| o.was_low_confidence).count()
                as f64
                / n,
        }
    }

    /// Aggregate statistics over recorded outcomes; zeroed when none
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_outcome_statistics(&self) -> OutcomeStatistics {
        let state = self.state.lock().unwrap();
        let outcomes = &state.outcomes;
        if outcomes.is_empty() {
            return OutcomeStatistics::default();
        }

        let n = outcomes.len() as f64;
        let satisfaction: Vec<f64> = outcomes
            .iter()
            .filter_map(|o| o.customer_satisfaction)
            .collect();
        let avg_satisfaction = (!satisfaction.is_empty())
            .then(|| satisfaction.iter().sum::<f64>() / satisfaction.len() as f64);

        OutcomeStatistics {
            total_outcomes: outcomes.len() as u64,
            completion_rate: outcomes.iter().filter(|o| o.completed_successfully).count() as f64
                / n,
            rework_rate: outcomes.iter().filter(|o| o.required_rework).count() as f64 / n,
            avg_time_to_completion: outcomes
                .iter()
                .map(|o| o.time_to_completion_hours)
                .sum::<f64>()
                / n,
            ai_recommended_rate: outcomes.iter().filter(|o| o.was_ai_recommended).count() as f64
                / n,
            override_rate: outcomes.iter().filter(|o| o.was_overridden).count() as f64 / n,
            avg_satisfaction,
        }
    }

    /// Prediction accuracy over outcomes that carried predictions; all
    /// fields are `None` when no outcome had a completion prediction
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_prediction_accuracy(&self) -> PredictionAccuracy {
        let state = self.state.lock().unwrap();
        let with_predictions: Vec<&OutcomeRecord> = state
            .outcomes
            .iter()
            .filter(|o| o.predicted_completion_prob.is_some())
            .collect();
        if with_predictions.is_empty() {
            return PredictionAccuracy::default();
        }

        let n = with_predictions.len() as f64;
        let completion_correct = with_predictions
            .iter()
            .filter(|o| {
                o.predicted_completion_prob
                    .is_some_and(|p| (p > 0.5) == o.completed_successfully)
            })
            .count();

        let time_errors: Vec<f64> = with_predictions
            .iter()
            .filter_map(|o| {
                o.predicted_time_to_complete
                    .map(|p| (p - o.time_to_completion_hours).abs())
            })
            .collect();
        let time_mae_hours = (!time_errors.is_empty())
            .then(|| time_errors.iter().sum::<f64>() / time_errors.len() as f64);

        let rework_checks: Vec<bool> = with_predictions
            .iter()
            .filter_map(|o| {
                o.predicted_rework_risk
                    .map(|p| (p > 0.5) == o.required_rework)
            })
            .collect();
        let rework_accuracy = (!rework_checks.is_empty()).then(|| {
            rework_checks.iter().filter(|c| **c).count() as f64 / rework_checks.len() as f64
        });

        PredictionAccuracy {
            evaluated: with_predictions.len() as u64,
            completion_accuracy: Some(completion_correct as f64 / n),
            time_mae_hours,
            rework_accuracy,
        }
    }

    /// Override records matching the filters, last `limit` in record order
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn get_overrides(
        &self,
        job_id: Option<&str>,
        operator_id: Option<&str>,
        category: Option<OverrideCategory>,
        limit: usize,
    ) -> Vec<OverrideRecord> {
        let state = self.state.lock().unwrap();
        let matching: Vec<OverrideRecord> = state
            .overrides
            .iter()
            .filter(|o| job_id.is_none_or(|id| o.job_id == id))
            .filter(|o| operator_id.is_none_or(|id| o.operator_id == id))
            .filter(|o| category.is_none_or(|c| o.override_category == c))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Outcome records matching the filters, last `limit` in record order
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn get_outcomes(
        &self,
        job_id: Option<&str>,
        vendor_id: Option<&str>,
        limit: usize,
    ) -> Vec<OutcomeRecord> {
        let state = self.state.lock().unwrap();
        let matching: Vec<OutcomeRecord> = state
            .outcomes
            .iter()
            .filter(|o| job_id.is_none_or(|id| o.job_id == id))
            .filter(|o| vendor_id.is_none_or(|id| o.vendor_id == id))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }
}

fn short_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    simple[..12].to_string()
}

/// An override asserts the operator's pick was right: full completion,
/// no rework, completion time unknown
fn override_row(record: &OverrideRecord, weight: f64) -> Row {
    let mut row = Row::new();
    row.insert("job_id".into(), Value::from(record.job_id.clone()));
    row.insert(
        "vendor_id".into(),
        Value::from(record.selected_vendor_id.clone()),
    );
    row.insert("original_score".into(), Value::from(record.original_score));
    row.insert("selected_score".into(), Value::from(record.selected_score));
    row.insert("confidence".into(), Value::from(record.confidence));
    row.insert(
        "override_category".into(),
        Value::from(record.override_category.as_str()),
    );
    row.insert(
        "was_low_confidence".into(),
        Value::from(u8::from(record.was_low_confidence)),
    );
    row.insert("target_completion".into(), Value::from(1.0));
    row.insert("target_rework".into(), Value::from(0.0));
    row.insert("sample_weight".into(), Value::from(weight));
    row
}

fn outcome_row(record: &OutcomeRecord, weight: f64) -> Row {
    let mut row = Row::new();
    row.insert("job_id".into(), Value::from(record.job_id.clone()));
    row.insert("vendor_id".into(), Value::from(record.vendor_id.clone()));
    if let Some(p) = record.predicted_completion_prob {
        row.insert("predicted_completion_prob".into(), Value::from(p));
    }
    if let Some(p) = record.predicted_time_to_complete {
        row.insert("predicted_time_to_complete".into(), Value::from(p));
    }
    if let Some(p) = record.predicted_rework_risk {
        row.insert("predicted_rework_risk".into(), Value::from(p));
    }
    row.insert(
        "was_ai_recommended".into(),
        Value::from(u8::from(record.was_ai_recommended)),
    );
    row.insert(
        "was_overridden".into(),
        Value::from(u8::from(record.was_overridden)),
    );
    row.insert(
        "target_completion".into(),
        Value::from(if record.completed_successfully { 1.0 } else { 0.0 }),
    );
    row.insert(
        "target_time".into(),
        Value::from(record.time_to_completion_hours),
    );
    row.insert(
        "target_rework".into(),
        Value::from(if record.required_rework { 1.0 } else { 0.0 }),
    );
    row.insert("sample_weight".into(), Value::from(weight));
    row
}

/// Share of filled cells over the full sample table
#[allow(clippy::cast_precision_loss)]
fn completeness(rows: &[Row]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let total = rows.len() * TABLE_COLUMNS.len();
    let present: usize = rows
        .iter()
        .map(|row| {
            TABLE_COLUMNS
                .iter()
                .filter(|c| row.contains_key(**c))
                .count()
        })
        .sum();
    present as f64 / total as f64
}

fn table_format(path: &Path) -> Result<TableFormat, FeedbackError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => Ok(TableFormat::Csv),
        Some("json") => Ok(TableFormat::Json),
        _ => Err(FeedbackError::UnsupportedFormat {
            path: path.display().to_string(),
        }),
    }
}

fn load_table(path: &Path, format: TableFormat) -> Result<(Vec<String>, Vec<Row>), FeedbackError> {
    let text = std::fs::read_to_string(path)?;
    match format {
        TableFormat::Csv => Ok(parse_csv(&text)),
        TableFormat::Json => {
            let raw: Vec<BTreeMap<String, Value>> =
                serde_json::from_str(&text).map_err(|err| FeedbackError::InvalidData {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                })?;
            let mut columns: Vec<String> = Vec::new();
            for row in &raw {
                for key in row.keys() {
                    if !columns.contains(key) {
                        columns.push(key.clone());
                    }
                }
            }
            let rows = raw
                .into_iter()
                .map(|row| row.into_iter().filter(|(_, v)| !v.is_null()).collect())
                .collect();
            Ok((columns, rows))
        }
    }
}

fn write_table(
    path: &Path,
    format: TableFormat,
    columns: &[String],
    rows: &[Row],
) -> Result<(), FeedbackError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    match format {
        TableFormat::Csv => std::fs::write(path, write_csv(columns, rows))?,
        TableFormat::Json => {
            let array: Vec<&Row> = rows.iter().collect();
            std::fs::write(path, serde_json::to_string_pretty(&array).map_err(|err| {
                FeedbackError::InvalidData {
                    path: path.display().to_string(),
                    reason: err.to_string(),
                }
            })?)?;
        }
    }
    Ok(())
}

fn write_csv(columns: &[String], rows: &[Row]) -> String {
    let mut out = String::new();
    out.push_str(&columns.join(","));
    out.push('\n');
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(c).map_or_else(String::new, csv_cell))
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => csv_escape(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => csv_escape(&other.to_string()),
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Minimal CSV reader for the table shapes this crate writes: quoted
/// fields with doubled quotes, empty cells as missing, numeric cells
/// parsed as numbers
fn parse_csv(text: &str) -> (Vec<String>, Vec<Row>) {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            if ch == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            } else {
                field.push(ch);
            }
        } else {
            match ch {
                '"' => in_quotes = true,
                ',' => record.push(std::mem::take(&mut field)),
                '\r' => {}
                '\n' => {
                    record.push(std::mem::take(&mut field));
                    records.push(std::mem::take(&mut record));
                }
                _ => field.push(ch),
            }
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    let mut iter = records.into_iter();
    let Some(columns) = iter.next() else {
        return (Vec::new(), Vec::new());
    };

    let rows = iter
        .map(|cells| {
            columns
                .iter()
                .zip(cells)
                .filter(|(_, cell)| !cell.is_empty())
                .map(|(column, cell)| {
                    let value = cell
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map_or(Value::from(cell), Value::from);
                    (column.clone(), value)
                })
                .collect()
        })
        .collect();
    (columns, rows)
}

// ============================================================================
// Tests
// ============================================================================
