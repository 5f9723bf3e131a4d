//! `mp_registry` - Model version registry for ModelPilot
//!
//! This crate provides:
//! - Version bookkeeping per model type with a forward-only lifecycle
//!   (registered → staging → production → archived → deprecated)
//! - Role mappings from "production"/"staging" to concrete versions
//! - Lineage records (parent version, training-data fingerprint,
//!   hyperparameters) created atomically with each version
//! - Promotion, rollback, and version comparison
//! - An append-only audit log of every transition

use chrono::{DateTime, Utc};
use mp_config::RegistryConfig;
use mp_store::{DocStore, LockRegistry, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, instrument, warn};

const REGISTRY_FILE: &str = "registry.json";
const LINEAGE_FILE: &str = "lineage.json";
const HISTORY_FILE: &str = "registry_history.json";

/// Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Model version not found: {model_type}/{version}")]
    NotFound { model_type: String, version: String },

    #[error("Duplicate model version: {model_type}/{version}")]
    DuplicateVersion { model_type: String, version: String },

    #[error("Invalid status transition for {model_type}/{version}: {from} -> {to}")]
    InvalidTransition {
        model_type: String,
        version: String,
        from: ModelStatus,
        to: ModelStatus,
    },

    #[error("No archived version available for rollback: {model_type}")]
    NoRollbackTarget { model_type: String },

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),
}

/// Model families served by the control plane
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Completion,
    TimeToComplete,
    ReworkRisk,
    Satisfaction,
}

impl ModelType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Completion => "completion",
            ModelType::TimeToComplete => "time_to_complete",
            ModelType::ReworkRisk => "rework_risk",
            ModelType::Satisfaction => "satisfaction",
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "completion" => Ok(ModelType::Completion),
            "time_to_complete" => Ok(ModelType::TimeToComplete),
            "rework_risk" => Ok(ModelType::ReworkRisk),
            "satisfaction" => Ok(ModelType::Satisfaction),
            other => Err(format!("unknown model type: {other}")),
        }
    }
}

/// Lifecycle status of a model version
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Registered,
    Staging,
    Production,
    Archived,
    Deprecated,
}

impl ModelStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Registered => "registered",
            ModelStatus::Staging => "staging",
            ModelStatus::Production => "production",
            ModelStatus::Archived => "archived",
            ModelStatus::Deprecated => "deprecated",
        }
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "registered" => Ok(ModelStatus::Registered),
            "staging" => Ok(ModelStatus::Staging),
            "production" => Ok(ModelStatus::Production),
            "archived" => Ok(ModelStatus::Archived),
            "deprecated" => Ok(ModelStatus::Deprecated),
            other => Err(format!("unknown model status: {other}")),
        }
    }
}

/// A registered model version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub version: String,
    pub model_type: ModelType,
    pub status: ModelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub training_data_hash: String,
    pub training_samples: u64,
    pub training_duration_seconds: f64,
    pub metrics: BTreeMap<String, f64>,
    pub parent_version: Option<String>,
    pub training_config: serde_json::Value,
    pub feature_names: Vec<String>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub deployment_environment: Option<String>,
    /// Store-relative path of the model artifact
    pub model_path: String,
    /// Store-relative path of the metadata snapshot
    pub metadata_path: String,
}

/// Lineage record, created atomically with its version and immutable after
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLineage {
    pub version: String,
    pub parent_version: Option<String>,
    pub training_data_sources: Vec<String>,
    pub training_data_hash: String,
    pub feature_engineering_version: String,
    pub hyperparameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// How to select a version when querying the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    /// An explicit version string
    Version(String),
    /// The most recently created version
    Latest,
    /// The version currently mapped to the production role
    Production,
    /// The version currently mapped to the staging role
    Staging,
}

impl std::fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionSelector::Version(v) => f.write_str(v),
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Production => f.write_str("production"),
            VersionSelector::Staging => f.write_str("staging"),
        }
    }
}

impl std::str::FromStr for VersionSelector {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" => Err("empty version selector".to_string()),
            "latest" => Ok(VersionSelector::Latest),
            "production" => Ok(VersionSelector::Production),
            "staging" => Ok(VersionSelector::Staging),
            other => Ok(VersionSelector::Version(other.to_string())),
        }
    }
}

/// Per-metric comparison between two versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDelta {
    pub version_a: f64,
    pub version_b: f64,
    pub diff: f64,
    pub pct_change: f64,
}

/// Result of comparing two model versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionComparison {
    pub model_type: ModelType,
    pub version_a: String,
    pub version_b: String,
    pub metrics: BTreeMap<String, MetricDelta>,
    pub training_samples_diff: i64,
    pub created_at_diff_days: i64,
}

/// Everything needed to register a new version
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub model_type: ModelType,
    pub version: String,
    pub artifact: Vec<u8>,
    pub metrics: BTreeMap<String, f64>,
    pub training_samples: u64,
    pub training_duration_seconds: f64,
    /// Fingerprint of the training data; computed from the artifact when absent
    pub training_data_hash: Option<String>,
    pub training_data_sources: Vec<String>,
    pub feature_names: Vec<String>,
    pub training_config: serde_json::Value,
    pub parent_version: Option<String>,
}

impl RegisterRequest {
    pub fn new(model_type: ModelType, version: impl Into<String>, artifact: Vec<u8>) -> Self {
        Self {
            model_type,
            version: version.into(),
            artifact,
            metrics: BTreeMap::new(),
            training_samples: 0,
            training_duration_seconds: 0.0,
            training_data_hash: None,
            training_data_sources: Vec::new(),
            feature_names: Vec::new(),
            training_config: serde_json::Value::Null,
            parent_version: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: BTreeMap<String, f64>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_version = Some(parent.into());
        self
    }
}

/// Audit event kinds recorded in the registry history log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegistryEventKind {
    Registered,
    PromotedStaging,
    PromotedProduction,
    RolledBack,
}

impl RegistryEventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryEventKind::Registered => "registered",
            RegistryEventKind::PromotedStaging => "promoted_staging",
            RegistryEventKind::PromotedProduction => "promoted_production",
            RegistryEventKind::RolledBack => "rolled_back",
        }
    }
}

/// One entry in the registry audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEvent {
    pub timestamp: DateTime<Utc>,
    pub event: RegistryEventKind,
    pub model_type: ModelType,
    pub version: String,
    pub detail: Option<String>,
}

/// Persisted registry index: all versions plus the role mappings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryDoc {
    /// model type -> version string -> record
    versions: BTreeMap<String, BTreeMap<String, ModelVersion>>,
    /// model type -> production version
    production: BTreeMap<String, String>,
    /// model type -> staging version
    staging: BTreeMap<String, String>,
    updated_at: Option<DateTime<Utc>>,
}

/// Model registry handle.
///
/// Holds an in-memory index backed by an atomically swapped registry
/// document plus an append-only audit log. Mutations for the same model
/// type are serialized by per-type locks; different model types proceed
/// independently, and only the final persist-and-swap of the shared
/// index document is serialized through its write lock.
pub struct ModelRegistry {
    store: Arc<DocStore>,
    config: RegistryConfig,
    locks: LockRegistry,
    index: RwLock<RegistryDoc>,
    lineage: RwLock<BTreeMap<String, ModelLineage>>,
}

impl ModelRegistry {
    /// Open the registry, loading any persisted index
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if existing registry documents cannot be
    /// read.
    pub fn new(store: Arc<DocStore>, config: RegistryConfig) -> Result<Self, RegistryError> {
        let index: RegistryDoc = store.read_doc(REGISTRY_FILE)?.unwrap_or_default();
        let lineage: BTreeMap<String, ModelLineage> =
            store.read_doc(LINEAGE_FILE)?.unwrap_or_default();

        let version_count: usize = index.versions.values().map(BTreeMap::len).sum();
        info!(versions = version_count, "Opened model registry");

        Ok(Self {
            store,
            config,
            locks: LockRegistry::new(),
            index: RwLock::new(index),
            lineage: RwLock::new(lineage),
        })
    }

    /// Register a new model version with status Registered
    ///
    /// Persists the artifact and a metadata snapshot, creates the lineage
    /// record, and appends an audit event.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateVersion`] if (model type, version)
    /// already exists, or a store error if persistence fails.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self, req), fields(model_type = %req.model_type, version = %req.version))]
    pub async fn register(&self, req: RegisterRequest) -> Result<ModelVersion, RegistryError> {
        let lock = self.locks.for_key(req.model_type.as_str());
        let _guard = lock.lock().await;

        let type_key = req.model_type.as_str().to_string();
        {
            let index = self.index.read().unwrap();
            if index
                .versions
                .get(&type_key)
                .is_some_and(|m| m.contains_key(&req.version))
            {
                return Err(RegistryError::DuplicateVersion {
                    model_type: type_key,
                    version: req.version,
                });
            }
        }

        let model_path = format!("models/{}/{}/model.bin", type_key, req.version);
        let metadata_path = format!("models/{}/{}/metadata.json", type_key, req.version);
        self.store.put_blob(&model_path, &req.artifact)?;

        let now = Utc::now();
        let data_hash = req
            .training_data_hash
            .clone()
            .unwrap_or_else(|| mp_store::fingerprint(&req.artifact));

        let record = ModelVersion {
            version: req.version.clone(),
            model_type: req.model_type,
            status: ModelStatus::Registered,
            created_at: now,
            updated_at: now,
            training_data_hash: data_hash.clone(),
            training_samples: req.training_samples,
            training_duration_seconds: req.training_duration_seconds,
            metrics: req.metrics.clone(),
            parent_version: req.parent_version.clone(),
            training_config: req.training_config.clone(),
            feature_names: req.feature_names.clone(),
            deployed_at: None,
            deployment_environment: None,
            model_path,
            metadata_path: metadata_path.clone(),
        };

        let metadata = serde_json::to_vec_pretty(&record)
            .map_err(StoreError::SerializationError)?;
        self.store.put_blob(&metadata_path, &metadata)?;

        {
            let mut index = self.index.write().unwrap();
            let mut doc = index.clone();
            doc.versions
                .entry(type_key.clone())
                .or_default()
                .insert(req.version.clone(), record.clone());
            doc.updated_at = Some(now);
            self.commit(&mut index, doc)?;
        }

        let lineage = ModelLineage {
            version: req.version.clone(),
            parent_version: req.parent_version,
            training_data_sources: req.training_data_sources,
            training_data_hash: data_hash,
            feature_engineering_version: "1.0.0".to_string(),
            hyperparameters: req.training_config,
            created_at: now,
        };
        {
            let mut map = self.lineage.write().unwrap();
            let mut doc = map.clone();
            doc.insert(lineage_key(req.model_type, &req.version), lineage);
            self.store.write_doc(LINEAGE_FILE, &doc)?;
            *map = doc;
        }

        self.append_event(RegistryEventKind::Registered, req.model_type, &req.version, None)?;
        info!(model_type = %req.model_type, version = %req.version, "Registered model version");
        Ok(record)
    }

    /// Look up a version by selector
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when nothing matches.
    ///
    /// # Panics
    ///
    /// Panics if the internal index lock is poisoned.
    pub fn get_version(
        &self,
        model_type: ModelType,
        selector: &VersionSelector,
    ) -> Result<ModelVersion, RegistryError> {
        let index = self.index.read().unwrap();
        let not_found = || RegistryError::NotFound {
            model_type: model_type.as_str().to_string(),
            version: selector.to_string(),
        };

        let versions = index
            .versions
            .get(model_type.as_str())
            .ok_or_else(not_found)?;

        let version_id = match selector {
            VersionSelector::Version(v) => Some(v.clone()),
            VersionSelector::Production => index.production.get(model_type.as_str()).cloned(),
            VersionSelector::Staging => index.staging.get(model_type.as_str()).cloned(),
            VersionSelector::Latest => versions
                .values()
                .max_by_key(|v| v.created_at)
                .map(|v| v.version.clone()),
        };

        version_id
            .and_then(|id| versions.get(&id).cloned())
            .ok_or_else(not_found)
    }

    /// List versions of a model type, newest first, optionally filtered by status
    ///
    /// # Panics
    ///
    /// Panics if the internal index lock is poisoned.
    #[must_use]
    pub fn list_versions(
        &self,
        model_type: ModelType,
        status: Option<ModelStatus>,
    ) -> Vec<ModelVersion> {
        let index = self.index.read().unwrap();
        let Some(versions) = index.versions.get(model_type.as_str()) else {
            return Vec::new();
        };

        let mut listed: Vec<ModelVersion> = versions
            .values()
            .filter(|v| status.is_none_or(|s| v.status == s))
            .cloned()
            .collect();
        listed.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listed
    }

    /// Promote a version to the staging role
    ///
    /// Only Registered (or already Staging) versions may move to Staging.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`], [`RegistryError::InvalidTransition`],
    /// or a store error.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn promote_to_staging(
        &self,
        model_type: ModelType,
        version: &str,
    ) -> Result<ModelVersion, RegistryError> {
        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let promoted = {
            let mut index = self.index.write().unwrap();
            let mut doc = index.clone();
            let record = lookup_mut(&mut doc, model_type, version)?;
            match record.status {
                ModelStatus::Registered | ModelStatus::Staging => {}
                from => {
                    return Err(RegistryError::InvalidTransition {
                        model_type: model_type.as_str().to_string(),
                        version: version.to_string(),
                        from,
                        to: ModelStatus::Staging,
                    })
                }
            }

            record.status = ModelStatus::Staging;
            record.updated_at = Utc::now();
            let promoted = record.clone();
            doc.staging
                .insert(model_type.as_str().to_string(), version.to_string());
            self.commit(&mut index, doc)?;
            promoted
        };

        self.append_event(RegistryEventKind::PromotedStaging, model_type, version, None)?;
        info!(model_type = %model_type, version, "Promoted to staging");
        Ok(promoted)
    }

    /// Promote a version to the production role
    ///
    /// The version currently in production (if any) is archived first, so
    /// exactly one version per model type holds Production and the prior
    /// one remains available for rollback.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`], [`RegistryError::InvalidTransition`],
    /// or a store error.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn promote_to_production(
        &self,
        model_type: ModelType,
        version: &str,
    ) -> Result<ModelVersion, RegistryError> {
        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let promoted = {
            let mut index = self.index.write().unwrap();
            let mut doc = index.clone();
            let type_key = model_type.as_str().to_string();
            let now = Utc::now();

            let current = doc.production.get(&type_key).cloned();
            {
                let record = lookup_mut(&mut doc, model_type, version)?;
                let same_version_refresh = record.status == ModelStatus::Production
                    && current.as_deref() == Some(version);
                match record.status {
                    ModelStatus::Registered | ModelStatus::Staging => {}
                    _ if same_version_refresh => {}
                    from => {
                        return Err(RegistryError::InvalidTransition {
                            model_type: type_key,
                            version: version.to_string(),
                            from,
                            to: ModelStatus::Production,
                        })
                    }
                }
            }

            // Archive whatever currently holds the role
            if let Some(current_version) = current
                && current_version != version
                && let Some(prev) = doc
                    .versions
                    .get_mut(&type_key)
                    .and_then(|m| m.get_mut(&current_version))
            {
                prev.status = ModelStatus::Archived;
                prev.updated_at = now;
            }

            let record = lookup_mut(&mut doc, model_type, version)?;
            record.status = ModelStatus::Production;
            record.deployed_at = Some(now);
            record.deployment_environment = Some("production".to_string());
            record.updated_at = now;
            let promoted = record.clone();

            doc.production.insert(type_key.clone(), version.to_string());
            if doc.staging.get(&type_key).map(String::as_str) == Some(version) {
                doc.staging.remove(&type_key);
            }
            self.commit(&mut index, doc)?;
            promoted
        };

        self.append_event(
            RegistryEventKind::PromotedProduction,
            model_type,
            version,
            None,
        )?;
        info!(model_type = %model_type, version, "Promoted to production");
        Ok(promoted)
    }

    /// Roll production back to the most recently archived version
    ///
    /// The current production version is demoted to Deprecated; the
    /// archived version returns to Production. Deprecated versions are
    /// never rollback candidates.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NoRollbackTarget`] when no archived version
    /// exists, or a store error.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn rollback(&self, model_type: ModelType) -> Result<ModelVersion, RegistryError> {
        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let (restored, target_version) = {
            let mut index = self.index.write().unwrap();
            let mut doc = index.clone();
            let type_key = model_type.as_str().to_string();
            let now = Utc::now();

            let target_version = doc
                .versions
                .get(&type_key)
                .into_iter()
                .flat_map(BTreeMap::values)
                .filter(|v| v.status == ModelStatus::Archived)
                .max_by_key(|v| v.updated_at)
                .map(|v| v.version.clone())
                .ok_or_else(|| RegistryError::NoRollbackTarget {
                    model_type: type_key.clone(),
                })?;

            if let Some(current_version) = doc.production.get(&type_key).cloned()
                && let Some(prev) = doc
                    .versions
                    .get_mut(&type_key)
                    .and_then(|m| m.get_mut(&current_version))
            {
                prev.status = ModelStatus::Deprecated;
                prev.updated_at = now;
            }

            let record = lookup_mut(&mut doc, model_type, &target_version)?;
            record.status = ModelStatus::Production;
            record.deployed_at = Some(now);
            record.updated_at = now;
            let restored = record.clone();

            doc.production.insert(type_key, target_version.clone());
            self.commit(&mut index, doc)?;
            (restored, target_version)
        };

        self.append_event(
            RegistryEventKind::RolledBack,
            model_type,
            &target_version,
            None,
        )?;
        warn!(model_type = %model_type, version = %target_version, "Rolled production back");
        Ok(restored)
    }

    /// Compare metrics and training metadata of two versions
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if either version is missing.
    pub fn compare_versions(
        &self,
        model_type: ModelType,
        version_a: &str,
        version_b: &str,
    ) -> Result<VersionComparison, RegistryError> {
        let a = self.get_version(model_type, &VersionSelector::Version(version_a.to_string()))?;
        let b = self.get_version(model_type, &VersionSelector::Version(version_b.to_string()))?;

        let mut metrics = BTreeMap::new();
        let mut names: Vec<&String> = a.metrics.keys().chain(b.metrics.keys()).collect();
        names.sort();
        names.dedup();
        for name in names {
            let val_a = a.metrics.get(name).copied().unwrap_or(0.0);
            let val_b = b.metrics.get(name).copied().unwrap_or(0.0);
            let diff = val_b - val_a;
            let pct_change = if val_a == 0.0 {
                0.0
            } else {
                diff / val_a * 100.0
            };
            metrics.insert(
                name.clone(),
                MetricDelta {
                    version_a: val_a,
                    version_b: val_b,
                    diff,
                    pct_change,
                },
            );
        }

        #[allow(clippy::cast_possible_wrap)]
        Ok(VersionComparison {
            model_type,
            version_a: a.version,
            version_b: b.version,
            metrics,
            training_samples_diff: b.training_samples as i64 - a.training_samples as i64,
            created_at_diff_days: (b.created_at - a.created_at).num_days(),
        })
    }

    /// Fetch the lineage record for a version
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when absent.
    ///
    /// # Panics
    ///
    /// Panics if the internal lineage lock is poisoned.
    pub fn get_lineage(
        &self,
        model_type: ModelType,
        version: &str,
    ) -> Result<ModelLineage, RegistryError> {
        self.lineage
            .read()
            .unwrap()
            .get(&lineage_key(model_type, version))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                model_type: model_type.as_str().to_string(),
                version: version.to_string(),
            })
    }

    /// Fetch the metrics map for a version
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when the version is missing.
    pub fn get_metrics(
        &self,
        model_type: ModelType,
        version: &str,
    ) -> Result<BTreeMap<String, f64>, RegistryError> {
        Ok(self
            .get_version(model_type, &VersionSelector::Version(version.to_string()))?
            .metrics)
    }

    /// Read back the artifact bytes for a version
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown version, or a
    /// store error if the blob is unreadable.
    pub fn get_artifact(
        &self,
        model_type: ModelType,
        version: &str,
    ) -> Result<Vec<u8>, RegistryError> {
        let record =
            self.get_version(model_type, &VersionSelector::Version(version.to_string()))?;
        Ok(self.store.read_blob(&record.model_path)?)
    }

    /// Recent audit events, oldest first
    ///
    /// # Errors
    ///
    /// Returns a store error if the history log cannot be read.
    pub fn history(&self, limit: usize) -> Result<Vec<RegistryEvent>, RegistryError> {
        let events: Vec<RegistryEvent> = self.store.read_log(HISTORY_FILE)?;
        let skip = events.len().saturating_sub(limit);
        Ok(events.into_iter().skip(skip).collect())
    }

    /// Persist a new index snapshot, then swap it in
    ///
    /// The caller passes the held index write guard, so clone, persist,
    /// and swap form one critical section and commits for different model
    /// types cannot overwrite each other. The swap only happens once the
    /// document is on disk; a failed write leaves the in-memory index
    /// untouched.
    fn commit(&self, index: &mut RegistryDoc, doc: RegistryDoc) -> Result<(), RegistryError> {
        self.store.write_doc(REGISTRY_FILE, &doc)?;
        *index = doc;
        Ok(())
    }

    fn append_event(
        &self,
        event: RegistryEventKind,
        model_type: ModelType,
        version: &str,
        detail: Option<String>,
    ) -> Result<(), RegistryError> {
        let entry = RegistryEvent {
            timestamp: Utc::now(),
            event,
            model_type,
            version: version.to_string(),
            detail,
        };
        self.store
            .append_log(HISTORY_FILE, &entry, self.config.history_retention)?;
        Ok(())
    }
}

fn lineage_key(model_type: ModelType, version: &str) -> String {
    format!("{}:{version}", model_type.as_str())
}

fn lookup_mut<'a>(
    doc: &'a mut RegistryDoc,
    model_type: ModelType,
    version: &str,
) -> Result<&'a mut ModelVersion, RegistryError> {
    doc.versions
        .get_mut(model_type.as_str())
        .and_then(|m| m.get_mut(version))
        .ok_or_else(|| RegistryError::NotFound {
            model_type: model_type.as_str().to_string(),
            version: version.to_string(),
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_registry() -> (TempDir, ModelRegistry) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocStore::open(dir.path()).unwrap());
        let registry = ModelRegistry::new(store, RegistryConfig::default()).unwrap();
        (dir, registry)
    }

    fn request(version: &str, accuracy: f64) -> RegisterRequest {
        let mut metrics = BTreeMap::new();
        metrics.insert("accuracy".to_string(), accuracy);
        RegisterRequest::new(ModelType::Completion, version, b"artifact-bytes".to_vec())
            .with_metrics(metrics)
    }

    // ========================================================================
    // Registration
    // ========================================================================

    #[tokio::test]
    async fn test_register_creates_registered_version() {
        let (_dir, registry) = temp_registry();
        let version = registry.register(request("v1", 0.8)).await.unwrap();

        assert_eq!(version.status, ModelStatus::Registered);
        assert_eq!(version.model_type, ModelType::Completion);
        assert_eq!(version.metrics["accuracy"], 0.8);
        assert_eq!(version.training_data_hash.len(), 16);

        let artifact = registry
            .get_artifact(ModelType::Completion, "v1")
            .unwrap();
        assert_eq!(artifact, b"artifact-bytes");
    }

    #[tokio::test]
    async fn test_register_creates_lineage() {
        let (_dir, registry) = temp_registry();
        registry
            .register(request("v2", 0.85).with_parent("v1"))
            .await
            .unwrap();

        let lineage = registry.get_lineage(ModelType::Completion, "v2").unwrap();
        assert_eq!(lineage.parent_version.as_deref(), Some("v1"));
        assert_eq!(lineage.feature_engineering_version, "1.0.0");
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        let err = registry.register(request("v1", 0.9)).await.unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateVersion { .. }));
    }

    #[tokio::test]
    async fn test_registry_reloads_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DocStore::open(dir.path()).unwrap());
        {
            let registry =
                ModelRegistry::new(Arc::clone(&store), RegistryConfig::default()).unwrap();
            registry.register(request("v1", 0.8)).await.unwrap();
        }

        let reopened = ModelRegistry::new(store, RegistryConfig::default()).unwrap();
        let version = reopened
            .get_version(
                ModelType::Completion,
                &VersionSelector::Version("v1".to_string()),
            )
            .unwrap();
        assert_eq!(version.version, "v1");
    }

    // ========================================================================
    // Selectors
    // ========================================================================

    #[tokio::test]
    async fn test_get_version_selectors() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry.register(request("v2", 0.85)).await.unwrap();

        let latest = registry
            .get_version(ModelType::Completion, &VersionSelector::Latest)
            .unwrap();
        assert_eq!(latest.version, "v2");

        registry
            .promote_to_staging(ModelType::Completion, "v2")
            .await
            .unwrap();
        let staging = registry
            .get_version(ModelType::Completion, &VersionSelector::Staging)
            .unwrap();
        assert_eq!(staging.version, "v2");

        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();
        let production = registry
            .get_version(ModelType::Completion, &VersionSelector::Production)
            .unwrap();
        assert_eq!(production.version, "v1");
    }

    #[tokio::test]
    async fn test_get_version_not_found() {
        let (_dir, registry) = temp_registry();
        let err = registry
            .get_version(ModelType::Completion, &VersionSelector::Latest)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));

        registry.register(request("v1", 0.8)).await.unwrap();
        let err = registry
            .get_version(ModelType::Completion, &VersionSelector::Production)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[test]
    fn test_selector_from_str() {
        assert_eq!(
            "latest".parse::<VersionSelector>().unwrap(),
            VersionSelector::Latest
        );
        assert_eq!(
            "production".parse::<VersionSelector>().unwrap(),
            VersionSelector::Production
        );
        assert_eq!(
            "v1.2".parse::<VersionSelector>().unwrap(),
            VersionSelector::Version("v1.2".to_string())
        );
        assert!("".parse::<VersionSelector>().is_err());
    }

    // ========================================================================
    // Promotion lifecycle
    // ========================================================================

    #[tokio::test]
    async fn test_promote_to_production_archives_previous() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry.register(request("v2", 0.85)).await.unwrap();

        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v2")
            .await
            .unwrap();

        let v1 = registry
            .get_version(
                ModelType::Completion,
                &VersionSelector::Version("v1".to_string()),
            )
            .unwrap();
        let v2 = registry
            .get_version(
                ModelType::Completion,
                &VersionSelector::Version("v2".to_string()),
            )
            .unwrap();
        assert_eq!(v1.status, ModelStatus::Archived);
        assert_eq!(v2.status, ModelStatus::Production);
        assert_eq!(v2.deployment_environment.as_deref(), Some("production"));

        // Exactly one production version for the type
        let in_production =
            registry.list_versions(ModelType::Completion, Some(ModelStatus::Production));
        assert_eq!(in_production.len(), 1);
        assert_eq!(in_production[0].version, "v2");
    }

    #[tokio::test]
    async fn test_promote_clears_stale_staging_pointer() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry
            .promote_to_staging(ModelType::Completion, "v1")
            .await
            .unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();

        let err = registry
            .get_version(ModelType::Completion, &VersionSelector::Staging)
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_promote_nonexistent_version_fails() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        let err = registry
            .promote_to_production(ModelType::Completion, "v9")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_promote_archived_version_is_invalid() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry.register(request("v2", 0.85)).await.unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v2")
            .await
            .unwrap();

        // v1 is archived now; the way back to production is rollback
        let err = registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));

        let err = registry
            .promote_to_staging(ModelType::Completion, "v1")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidTransition { .. }));
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    #[tokio::test]
    async fn test_rollback_restores_previous_production() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry.register(request("v2", 0.85)).await.unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v2")
            .await
            .unwrap();

        let restored = registry.rollback(ModelType::Completion).await.unwrap();
        assert_eq!(restored.version, "v1");
        assert_eq!(restored.status, ModelStatus::Production);

        let v2 = registry
            .get_version(
                ModelType::Completion,
                &VersionSelector::Version("v2".to_string()),
            )
            .unwrap();
        assert_eq!(v2.status, ModelStatus::Deprecated);

        let production = registry
            .get_version(ModelType::Completion, &VersionSelector::Production)
            .unwrap();
        assert_eq!(production.version, "v1");
    }

    #[tokio::test]
    async fn test_rollback_without_archived_version_fails() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();

        let err = registry.rollback(ModelType::Completion).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoRollbackTarget { .. }));
    }

    #[tokio::test]
    async fn test_rollback_never_resurrects_deprecated() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry.register(request("v2", 0.85)).await.unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v2")
            .await
            .unwrap();
        registry.rollback(ModelType::Completion).await.unwrap();

        // v2 is deprecated, not archived, so a second rollback has no target
        let err = registry.rollback(ModelType::Completion).await.unwrap_err();
        assert!(matches!(err, RegistryError::NoRollbackTarget { .. }));
    }

    // ========================================================================
    // Comparison and history
    // ========================================================================

    #[tokio::test]
    async fn test_compare_versions_metric_deltas() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry.register(request("v2", 0.85)).await.unwrap();

        let comparison = registry
            .compare_versions(ModelType::Completion, "v1", "v2")
            .unwrap();
        let delta = &comparison.metrics["accuracy"];
        assert!((delta.diff - 0.05).abs() < 1e-9);
        assert!((delta.pct_change - 6.25).abs() < 1e-9);
        assert_eq!(comparison.training_samples_diff, 0);
    }

    #[tokio::test]
    async fn test_compare_versions_disjoint_metrics_use_zero_default() {
        let (_dir, registry) = temp_registry();
        let mut only_b = BTreeMap::new();
        only_b.insert("f1_score".to_string(), 0.5);
        registry.register(request("v1", 0.8)).await.unwrap();
        registry
            .register(
                RegisterRequest::new(ModelType::Completion, "v2", b"x".to_vec())
                    .with_metrics(only_b),
            )
            .await
            .unwrap();

        let comparison = registry
            .compare_versions(ModelType::Completion, "v1", "v2")
            .unwrap();
        let f1 = &comparison.metrics["f1_score"];
        assert_eq!(f1.version_a, 0.0);
        assert_eq!(f1.version_b, 0.5);
        // pct_change is zero when the base value is zero
        assert_eq!(f1.pct_change, 0.0);
        let accuracy = &comparison.metrics["accuracy"];
        assert_eq!(accuracy.version_b, 0.0);
    }

    #[tokio::test]
    async fn test_compare_versions_missing_version_fails() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        let err = registry
            .compare_versions(ModelType::Completion, "v1", "v9")
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_history_records_transitions() {
        let (_dir, registry) = temp_registry();
        registry.register(request("v1", 0.8)).await.unwrap();
        registry
            .promote_to_staging(ModelType::Completion, "v1")
            .await
            .unwrap();
        registry
            .promote_to_production(ModelType::Completion, "v1")
            .await
            .unwrap();

        let events = registry.history(10).unwrap();
        let kinds: Vec<RegistryEventKind> = events.iter().map(|e| e.event).collect();
        assert_eq!(
            kinds,
            vec![
                RegistryEventKind::Registered,
                RegistryEventKind::PromotedStaging,
                RegistryEventKind::PromotedProduction,
            ]
        );
    }

    // ========================================================================
    // Enum plumbing
    // ========================================================================

    #[test]
    fn test_model_type_round_trip() {
        for model_type in [
            ModelType::Completion,
            ModelType::TimeToComplete,
            ModelType::ReworkRisk,
            ModelType::Satisfaction,
        ] {
            let parsed: ModelType = model_type.as_str().parse().unwrap();
            assert_eq!(parsed, model_type);
        }
        assert!("nonsense".parse::<ModelType>().is_err());
    }

    #[test]
    fn test_model_status_round_trip() {
        for status in [
            ModelStatus::Registered,
            ModelStatus::Staging,
            ModelStatus::Production,
            ModelStatus::Archived,
            ModelStatus::Deprecated,
        ] {
            let parsed: ModelStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
