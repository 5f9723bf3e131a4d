//! `mp_deploy` - Blue-green deployment manager for model serving
//!
//! Each model type owns two serving slots (blue and green). New versions
//! land in the inactive slot, traffic shifts over gradually, and the
//! previous slot stays warm for instant rollback. Slot states and traffic
//! splits are persisted as a single document; every deployment action is
//! recorded in a bounded history log.
//!
//! The actual serving backend sits behind the [`ServingEndpoint`] trait;
//! deployments remain fully tracked even with the [`NullEndpoint`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mp_config::DeploymentConfig;
use mp_registry::{ModelRegistry, ModelType, RegistryError, VersionSelector};
use mp_store::{DocStore, LockRegistry, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

const STATE_FILE: &str = "deployment_state.json";
const HISTORY_FILE: &str = "deployment_history.json";

/// Deployment manager errors
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Registry error: {0}")]
    RegistryError(#[from] RegistryError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("No deployments found for model type: {model_type}")]
    NotFound { model_type: ModelType },

    #[error("Traffic weights must be finite and sum to 1.0: blue={blue}, green={green}")]
    InvalidWeights { blue: f64, green: f64 },

    #[error("No active staging deployment for model type: {model_type}")]
    NoActiveStaging { model_type: ModelType },

    #[error("No valid rollback target for model type: {model_type}")]
    NoValidRollbackTarget { model_type: ModelType },

    #[error("Serving endpoint failure during {op}: {message}")]
    CollaboratorFailure { op: String, message: String },

    #[error("Promotion cancelled for model type: {model_type}")]
    PromotionCancelled { model_type: ModelType },

    #[error("Health gate failed for model type {model_type} in slot {slot}")]
    HealthGateFailed { model_type: ModelType, slot: Slot },
}

/// Error surfaced by a serving endpoint implementation
#[derive(Error, Debug)]
#[error("{0}")]
pub struct EndpointError(pub String);

/// Deployment slot identifiers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Blue,
    Green,
}

impl Slot {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Blue => "blue",
            Slot::Green => "green",
        }
    }

    /// The opposite slot
    #[must_use]
    pub fn other(&self) -> Slot {
        match self {
            Slot::Blue => Slot::Green,
            Slot::Green => Slot::Blue,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Slot {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "blue" => Ok(Slot::Blue),
            "green" => Ok(Slot::Green),
            other => Err(format!("unknown deployment slot: {other}")),
        }
    }
}

/// Lifecycle status of a deployment slot
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Active,
    Draining,
    Inactive,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Active => "active",
            DeploymentStatus::Draining => "draining",
            DeploymentStatus::Inactive => "inactive",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pending" => Ok(DeploymentStatus::Pending),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "active" => Ok(DeploymentStatus::Active),
            "draining" => Ok(DeploymentStatus::Draining),
            "inactive" => Ok(DeploymentStatus::Inactive),
            "failed" => Ok(DeploymentStatus::Failed),
            "rolled_back" => Ok(DeploymentStatus::RolledBack),
            other => Err(format!("unknown deployment status: {other}")),
        }
    }
}

/// Health of a deployment slot as last observed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Pending,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Pending => "pending",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of one deployment slot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotState {
    pub slot: Slot,
    pub model_type: ModelType,
    pub version: String,
    pub status: DeploymentStatus,
    pub traffic_weight: f64,
    pub deployed_at: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Traffic routing between the two slots of a model type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficSplit {
    pub blue_weight: f64,
    pub green_weight: f64,
    pub updated_at: DateTime<Utc>,
}

impl TrafficSplit {
    /// A split sending all traffic to `slot`
    #[must_use]
    pub fn full(slot: Slot) -> Self {
        let (blue_weight, green_weight) = match slot {
            Slot::Blue => (1.0, 0.0),
            Slot::Green => (0.0, 1.0),
        };
        Self {
            blue_weight,
            green_weight,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn weight(&self, slot: Slot) -> f64 {
        match slot {
            Slot::Blue => self.blue_weight,
            Slot::Green => self.green_weight,
        }
    }

    /// Weights must each lie in [0, 1] and sum to 1.0 within a 1e-3
    /// tolerance
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidWeights`] otherwise.
    pub fn validate(&self) -> Result<(), DeployError> {
        let in_range = |w: f64| w.is_finite() && (0.0..=1.0).contains(&w);
        let sum = self.blue_weight + self.green_weight;
        if !in_range(self.blue_weight)
            || !in_range(self.green_weight)
            || (sum - 1.0).abs() > 1e-3
        {
            return Err(DeployError::InvalidWeights {
                blue: self.blue_weight,
                green: self.green_weight,
            });
        }
        Ok(())
    }
}

/// Kind of deployment action recorded in history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentAction {
    DeployStaging,
    ShiftTraffic,
    PromoteProduction,
    Rollback,
}

impl DeploymentAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentAction::DeployStaging => "deploy_staging",
            DeploymentAction::ShiftTraffic => "shift_traffic",
            DeploymentAction::PromoteProduction => "promote_production",
            DeploymentAction::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for DeploymentAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a recorded action ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Success,
    Failed,
    Cancelled,
}

impl ActionOutcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Success => "success",
            ActionOutcome::Failed => "failed",
            ActionOutcome::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the deployment audit history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHistoryEntry {
    pub action: DeploymentAction,
    pub model_type: ModelType,
    pub version: Option<String>,
    pub slot: Option<Slot>,
    pub timestamp: DateTime<Utc>,
    pub outcome: ActionOutcome,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

/// Result of a single endpoint health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub detail: String,
}

/// Interface to the external model serving backend.
///
/// Implementations push slot deployments, traffic splits, and health
/// probes to whatever actually serves the models. Every call made by the
/// deployer is bounded by the configured endpoint timeout.
#[async_trait]
pub trait ServingEndpoint: Send + Sync {
    /// Make `version` servable in `slot`
    async fn deploy(
        &self,
        model_type: ModelType,
        version: &str,
        slot: Slot,
    ) -> Result<(), EndpointError>;

    /// Route traffic according to `split`
    async fn apply_traffic_split(
        &self,
        model_type: ModelType,
        split: &TrafficSplit,
    ) -> Result<(), EndpointError>;

    /// Probe the health of `slot`
    async fn health_check(
        &self,
        model_type: ModelType,
        slot: Slot,
    ) -> Result<HealthReport, EndpointError>;
}

/// Endpoint used when no serving backend is configured. Accepts every
/// operation and reports every slot healthy, so deployment state is still
/// tracked end to end.
pub struct NullEndpoint;

#[async_trait]
impl ServingEndpoint for NullEndpoint {
    async fn deploy(
        &self,
        model_type: ModelType,
        version: &str,
        slot: Slot,
    ) -> Result<(), EndpointError> {
        debug!(model_type = %model_type, version = %version, slot = %slot, "Null endpoint: deploy accepted");
        Ok(())
    }

    async fn apply_traffic_split(
        &self,
        model_type: ModelType,
        split: &TrafficSplit,
    ) -> Result<(), EndpointError> {
        debug!(
            model_type = %model_type,
            blue = split.blue_weight,
            green = split.green_weight,
            "Null endpoint: traffic split accepted"
        );
        Ok(())
    }

    async fn health_check(
        &self,
        _model_type: ModelType,
        _slot: Slot,
    ) -> Result<HealthReport, EndpointError> {
        Ok(HealthReport {
            healthy: true,
            detail: "no serving endpoint configured".to_string(),
        })
    }
}

/// Cancellation handle for an in-flight gradual promotion
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

impl CancelSource {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Signal cancellation to all tokens
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Token checked between promotion steps and during step waits
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation is signalled; pends forever if the
    /// source is dropped without cancelling
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Persisted deployment document: slot states and traffic splits per
/// model type, written atomically as one unit
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeployDoc {
    /// model type -> slot name -> state
    deployments: BTreeMap<String, BTreeMap<String, SlotState>>,
    /// model type -> traffic split
    traffic: BTreeMap<String, TrafficSplit>,
    updated_at: Option<DateTime<Utc>>,
}

/// Inactive slot: Blue for an unseen type, Green while Blue carries
/// traffic, Blue otherwise
fn inactive_slot(doc: &DeployDoc, type_key: &str) -> Slot {
    let Some(slots) = doc.deployments.get(type_key) else {
        return Slot::Blue;
    };
    let blue_in_use = slots
        .get(Slot::Blue.as_str())
        .is_some_and(|state| state.traffic_weight > 0.0);
    if blue_in_use {
        Slot::Green
    } else {
        Slot::Blue
    }
}

/// Active slot: the one carrying more than half the traffic, if any
fn active_slot(doc: &DeployDoc, type_key: &str) -> Option<Slot> {
    let slots = doc.deployments.get(type_key)?;
    for (name, state) in slots {
        if state.traffic_weight > 0.5
            && let Ok(slot) = name.parse::<Slot>()
        {
            return Some(slot);
        }
    }
    None
}

/// Blue-green deployment manager.
///
/// Mutations for the same model type are serialized through a per-type
/// lock; different model types proceed independently. The slot/traffic
/// document is cloned, mutated, persisted, and swapped in one step.
pub struct BlueGreenDeployer {
    store: Arc<DocStore>,
    registry: Arc<ModelRegistry>,
    endpoint: Arc<dyn ServingEndpoint>,
    config: DeploymentConfig,
    state: RwLock<DeployDoc>,
    history: Mutex<Vec<DeploymentHistoryEntry>>,
    locks: LockRegistry,
}

impl BlueGreenDeployer {
    /// Open the deployer, reloading persisted slot states and history
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] if existing deployment documents cannot be
    /// read.
    pub fn new(
        store: Arc<DocStore>,
        registry: Arc<ModelRegistry>,
        endpoint: Arc<dyn ServingEndpoint>,
        config: DeploymentConfig,
    ) -> Result<Self, DeployError> {
        let doc: DeployDoc = store.read_doc(STATE_FILE)?.unwrap_or_default();
        let history: Vec<DeploymentHistoryEntry> = store.read_log(HISTORY_FILE)?;

        info!(
            model_types = doc.deployments.len(),
            history = history.len(),
            "Opened blue-green deployer"
        );

        Ok(Self {
            store,
            registry,
            endpoint,
            config,
            state: RwLock::new(doc),
            history: Mutex::new(history),
            locks: LockRegistry::new(),
        })
    }

    /// Deploy a registered model version to the inactive slot.
    ///
    /// The version must exist in the registry. A failed endpoint call
    /// leaves the slot recorded as Failed with the error message and
    /// re-raises; the traffic split is untouched either way (a fresh
    /// deployment starts at weight 0.0).
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] if the version is unknown, the endpoint
    /// call fails or times out, or state cannot be persisted.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn deploy_to_staging(
        &self,
        model_type: ModelType,
        version: &str,
    ) -> Result<SlotState, DeployError> {
        let started = Instant::now();
        info!(model_type = %model_type, version = %version, "Deploying to staging slot");

        self.registry
            .get_version(model_type, &VersionSelector::Version(version.to_string()))?;

        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let type_key = model_type.as_str().to_string();
        // The per-type lock keeps this type's slots stable while the
        // endpoint call below is in flight, so the choice holds.
        let staging_slot = {
            let doc = self.state.read().unwrap();
            inactive_slot(&doc, &type_key)
        };

        let now = Utc::now();
        let mut slot_state = SlotState {
            slot: staging_slot,
            model_type,
            version: version.to_string(),
            status: DeploymentStatus::Deploying,
            traffic_weight: 0.0,
            deployed_at: now,
            health_status: HealthStatus::Pending,
            last_health_check: None,
            error_message: None,
        };

        let deployed = self
            .endpoint_call(
                "deploy",
                self.endpoint.deploy(model_type, version, staging_slot),
            )
            .await;

        match deployed {
            Ok(()) => {
                slot_state.status = DeploymentStatus::Active;
                slot_state.health_status = HealthStatus::Healthy;
                slot_state.last_health_check = Some(now);
                self.commit_slot_state(&type_key, staging_slot, slot_state.clone())?;
                self.record_history(DeploymentHistoryEntry {
                    action: DeploymentAction::DeployStaging,
                    model_type,
                    version: Some(version.to_string()),
                    slot: Some(staging_slot),
                    timestamp: Utc::now(),
                    outcome: ActionOutcome::Success,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    error: None,
                })?;
                info!(model_type = %model_type, version = %version, slot = %staging_slot, "Deployed to staging");
                Ok(slot_state)
            }
            Err(err) => {
                slot_state.status = DeploymentStatus::Failed;
                slot_state.health_status = HealthStatus::Unhealthy;
                slot_state.error_message = Some(err.to_string());
                self.commit_slot_state(&type_key, staging_slot, slot_state)?;
                self.record_history(DeploymentHistoryEntry {
                    action: DeploymentAction::DeployStaging,
                    model_type,
                    version: Some(version.to_string()),
                    slot: Some(staging_slot),
                    timestamp: Utc::now(),
                    outcome: ActionOutcome::Failed,
                    duration_seconds: started.elapsed().as_secs_f64(),
                    error: Some(err.to_string()),
                })?;
                warn!(model_type = %model_type, version = %version, error = %err, "Staging deployment failed");
                Err(err)
            }
        }
    }

    /// Shift traffic between the blue and green slots.
    ///
    /// The split is validated (when `validate`) and persisted before the
    /// endpoint is told; an endpoint failure is re-raised but the
    /// committed split stands. A history entry is recorded on every call.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::InvalidWeights`] before any effect when
    /// validation fails, [`DeployError::NotFound`] for an undeployed model
    /// type, or a [`DeployError::CollaboratorFailure`] from the endpoint.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn shift_traffic(
        &self,
        model_type: ModelType,
        blue_weight: f64,
        green_weight: f64,
        validate: bool,
    ) -> Result<TrafficSplit, DeployError> {
        let started = Instant::now();
        info!(model_type = %model_type, blue = blue_weight, green = green_weight, "Shifting traffic");

        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let result = self
            .apply_split(model_type, blue_weight, green_weight, validate)
            .await;

        let (outcome, error) = match &result {
            Ok(_) => (ActionOutcome::Success, None),
            Err(err) => (ActionOutcome::Failed, Some(err.to_string())),
        };
        self.record_history(DeploymentHistoryEntry {
            action: DeploymentAction::ShiftTraffic,
            model_type,
            version: None,
            slot: None,
            timestamp: Utc::now(),
            outcome,
            duration_seconds: started.elapsed().as_secs_f64(),
            error,
        })?;

        result
    }

    /// Promote the staging slot to production.
    ///
    /// Gradual promotion walks the traffic ladder i/steps for
    /// i in 1..=steps, pausing `step_wait` between steps. Between steps
    /// the cancel token is honoured and, when the health gate is enabled,
    /// the staging slot must probe healthy. Cancellation or a failed step
    /// leaves the last applied split in place. On completion the staging
    /// slot is Active and the prior production slot is Draining.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::NoActiveStaging`] without an Active staging
    /// slot, [`DeployError::PromotionCancelled`] on cancellation,
    /// [`DeployError::HealthGateFailed`] when the gate trips, or any error
    /// from the underlying traffic shifts.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self, cancel))]
    pub async fn promote_to_production(
        &self,
        model_type: ModelType,
        gradual: bool,
        steps: Option<u32>,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DeployError> {
        let started = Instant::now();
        let steps = steps.unwrap_or(self.config.promotion_steps).max(1);
        info!(model_type = %model_type, gradual, steps, "Promoting staging slot to production");

        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let type_key = model_type.as_str().to_string();
        let (staging_slot, production_slot, staging_version) = {
            let doc = self.state.read().unwrap();
            if !doc.deployments.contains_key(&type_key) {
                return Err(DeployError::NotFound { model_type });
            }
            let staging_slot = inactive_slot(&doc, &type_key);
            let staging_state = doc
                .deployments
                .get(&type_key)
                .and_then(|slots| slots.get(staging_slot.as_str()));
            match staging_state {
                Some(state) if state.status == DeploymentStatus::Active => (
                    staging_slot,
                    active_slot(&doc, &type_key),
                    state.version.clone(),
                ),
                _ => return Err(DeployError::NoActiveStaging { model_type }),
            }
        };

        let result = self
            .run_promotion(model_type, staging_slot, production_slot, gradual, steps, cancel)
            .await;

        let (outcome, error) = match &result {
            Ok(()) => (ActionOutcome::Success, None),
            Err(DeployError::PromotionCancelled { .. }) => (ActionOutcome::Cancelled, None),
            Err(err) => (ActionOutcome::Failed, Some(err.to_string())),
        };
        self.record_history(DeploymentHistoryEntry {
            action: DeploymentAction::PromoteProduction,
            model_type,
            version: Some(staging_version),
            slot: Some(staging_slot),
            timestamp: Utc::now(),
            outcome,
            duration_seconds: started.elapsed().as_secs_f64(),
            error,
        })?;

        match &result {
            Ok(()) => info!(model_type = %model_type, slot = %staging_slot, "Promoted to production"),
            Err(DeployError::PromotionCancelled { .. }) => {
                warn!(model_type = %model_type, "Promotion cancelled");
            }
            Err(err) => warn!(model_type = %model_type, error = %err, "Promotion failed"),
        }
        result
    }

    async fn run_promotion(
        &self,
        model_type: ModelType,
        staging_slot: Slot,
        production_slot: Option<Slot>,
        gradual: bool,
        steps: u32,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DeployError> {
        if gradual {
            for i in 1..=steps {
                let staging_weight = f64::from(i) / f64::from(steps);
                let (blue, green) = match staging_slot {
                    Slot::Blue => (staging_weight, 1.0 - staging_weight),
                    Slot::Green => (1.0 - staging_weight, staging_weight),
                };
                self.apply_split(model_type, blue, green, true).await?;
                info!(step = i, total = steps, staging_weight, "Applied traffic step");

                if i < steps {
                    self.between_steps(model_type, staging_slot, cancel).await?;
                }
            }
        } else {
            let split = TrafficSplit::full(staging_slot);
            self.apply_split(model_type, split.blue_weight, split.green_weight, true)
                .await?;
        }

        let mut state = self.state.write().unwrap();
        let mut doc = state.clone();
        if let Some(slots) = doc.deployments.get_mut(model_type.as_str()) {
            if let Some(slot_state) = slots.get_mut(staging_slot.as_str()) {
                slot_state.status = DeploymentStatus::Active;
            }
            if let Some(prior) = production_slot
                && prior != staging_slot
                && let Some(slot_state) = slots.get_mut(prior.as_str())
            {
                slot_state.status = DeploymentStatus::Draining;
            }
        }
        self.commit(&mut state, doc)?;
        Ok(())
    }

    /// Cancellation check, cooperative pause, and optional health gate
    /// run between ladder steps
    async fn between_steps(
        &self,
        model_type: ModelType,
        staging_slot: Slot,
        cancel: Option<&CancelToken>,
    ) -> Result<(), DeployError> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(DeployError::PromotionCancelled { model_type });
        }

        let wait = self.config.step_wait();
        if !wait.is_zero() {
            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = token.cancelled() => {
                            return Err(DeployError::PromotionCancelled { model_type });
                        }
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }

        if self.config.health_gate {
            let report = self
                .endpoint_call(
                    "health_check",
                    self.endpoint.health_check(model_type, staging_slot),
                )
                .await?;
            if !report.healthy {
                return Err(DeployError::HealthGateFailed {
                    model_type,
                    slot: staging_slot,
                });
            }
        }
        Ok(())
    }

    /// Switch all traffic back to the previous production slot.
    ///
    /// The target is the slot opposite the active one and must still be
    /// Active or Draining. On success the target is Active and the
    /// previously active slot is RolledBack.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::NotFound`] for an undeployed model type or
    /// [`DeployError::NoValidRollbackTarget`] when no slot carries
    /// majority traffic or the other slot cannot serve.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn rollback(&self, model_type: ModelType) -> Result<SlotState, DeployError> {
        let started = Instant::now();
        info!(model_type = %model_type, "Rolling back deployment");

        let lock = self.locks.for_key(model_type.as_str());
        let _guard = lock.lock().await;

        let type_key = model_type.as_str().to_string();
        let (current_slot, target_slot, target_version) = {
            let doc = self.state.read().unwrap();
            if !doc.deployments.contains_key(&type_key) {
                return Err(DeployError::NotFound { model_type });
            }
            let Some(current_slot) = active_slot(&doc, &type_key) else {
                return Err(DeployError::NoValidRollbackTarget { model_type });
            };
            let target_slot = current_slot.other();
            let target_state = doc
                .deployments
                .get(&type_key)
                .and_then(|slots| slots.get(target_slot.as_str()));
            match target_state {
                Some(state)
                    if matches!(
                        state.status,
                        DeploymentStatus::Active | DeploymentStatus::Draining
                    ) =>
                {
                    (current_slot, target_slot, state.version.clone())
                }
                _ => return Err(DeployError::NoValidRollbackTarget { model_type }),
            }
        };

        let result = self.run_rollback(model_type, current_slot, target_slot).await;

        let (outcome, error) = match &result {
            Ok(_) => (ActionOutcome::Success, None),
            Err(err) => (ActionOutcome::Failed, Some(err.to_string())),
        };
        self.record_history(DeploymentHistoryEntry {
            action: DeploymentAction::Rollback,
            model_type,
            version: Some(target_version),
            slot: Some(target_slot),
            timestamp: Utc::now(),
            outcome,
            duration_seconds: started.elapsed().as_secs_f64(),
            error,
        })?;

        match &result {
            Ok(state) => {
                info!(model_type = %model_type, slot = %state.slot, version = %state.version, "Rolled back");
            }
            Err(err) => warn!(model_type = %model_type, error = %err, "Rollback failed"),
        }
        result
    }

    async fn run_rollback(
        &self,
        model_type: ModelType,
        current_slot: Slot,
        target_slot: Slot,
    ) -> Result<SlotState, DeployError> {
        let split = TrafficSplit::full(target_slot);
        self.apply_split(model_type, split.blue_weight, split.green_weight, true)
            .await?;

        let mut state = self.state.write().unwrap();
        let mut doc = state.clone();
        let mut restored = None;
        if let Some(slots) = doc.deployments.get_mut(model_type.as_str()) {
            if let Some(slot_state) = slots.get_mut(target_slot.as_str()) {
                slot_state.status = DeploymentStatus::Active;
                restored = Some(slot_state.clone());
            }
            if let Some(slot_state) = slots.get_mut(current_slot.as_str()) {
                slot_state.status = DeploymentStatus::RolledBack;
            }
        }
        self.commit(&mut state, doc)?;

        restored.ok_or(DeployError::NoValidRollbackTarget { model_type })
    }

    /// Probe every Active slot of a model type.
    ///
    /// An endpoint failure marks that slot Unhealthy and the sweep
    /// continues. Unknown model types yield an empty map.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::StoreError`] only when the updated states cannot
    /// be persisted.
    ///
    /// # Panics
    ///
    /// Panics if an internal lock is poisoned.
    #[instrument(skip(self))]
    pub async fn health_check(
        &self,
        model_type: ModelType,
    ) -> Result<BTreeMap<Slot, HealthStatus>, DeployError> {
        let type_key = model_type.as_str().to_string();
        let lock = self.locks.for_key(&type_key);
        let _guard = lock.lock().await;

        // The per-type lock keeps this type's slots stable while the
        // probes below are in flight.
        let targets: Vec<Slot> = {
            let doc = self.state.read().unwrap();
            doc.deployments
                .get(&type_key)
                .map(|slots| {
                    slots
                        .iter()
                        .filter(|(_, state)| state.status == DeploymentStatus::Active)
                        .filter_map(|(name, _)| name.parse::<Slot>().ok())
                        .collect()
                })
                .unwrap_or_default()
        };
        if targets.is_empty() {
            return Ok(BTreeMap::new());
        }

        let mut outcomes = Vec::new();
        for slot in targets {
            let probe = self
                .endpoint_call(
                    "health_check",
                    self.endpoint.health_check(model_type, slot),
                )
                .await;
            let (health, detail) = match probe {
                Ok(report) if report.healthy => (HealthStatus::Healthy, None),
                Ok(report) => (HealthStatus::Unhealthy, Some(report.detail)),
                Err(err) => (HealthStatus::Unhealthy, Some(err.to_string())),
            };
            outcomes.push((slot, health, detail, Utc::now()));
        }

        let mut results = BTreeMap::new();
        let mut state = self.state.write().unwrap();
        let mut doc = state.clone();
        if let Some(slots) = doc.deployments.get_mut(&type_key) {
            for (slot, health, detail, checked_at) in outcomes {
                if let Some(slot_state) = slots.get_mut(slot.as_str()) {
                    slot_state.health_status = health;
                    if let Some(detail) = detail {
                        slot_state.error_message = Some(detail);
                    }
                    slot_state.last_health_check = Some(checked_at);
                    results.insert(slot, health);
                }
            }
        }
        self.commit(&mut state, doc)?;
        Ok(results)
    }

    /// Slot states recorded for a model type, blue first
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn slot_states(&self, model_type: ModelType) -> Vec<SlotState> {
        let doc = self.state.read().unwrap();
        doc.deployments
            .get(model_type.as_str())
            .map(|slots| slots.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Current traffic split for a model type
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn traffic_split(&self, model_type: ModelType) -> Option<TrafficSplit> {
        let doc = self.state.read().unwrap();
        doc.traffic.get(model_type.as_str()).cloned()
    }

    /// Version serving the majority of traffic, if any
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock is poisoned.
    #[must_use]
    pub fn active_version(&self, model_type: ModelType) -> Option<String> {
        let doc = self.state.read().unwrap();
        let slot = active_slot(&doc, model_type.as_str())?;
        doc.deployments
            .get(model_type.as_str())
            .and_then(|slots| slots.get(slot.as_str()))
            .map(|state| state.version.clone())
    }

    /// Deployment history, optionally filtered by model type, last
    /// `limit` entries in action order
    ///
    /// # Panics
    ///
    /// Panics if the internal history lock is poisoned.
    #[must_use]
    pub fn history(
        &self,
        model_type: Option<ModelType>,
        limit: usize,
    ) -> Vec<DeploymentHistoryEntry> {
        let history = self.history.lock().unwrap();
        let matching: Vec<DeploymentHistoryEntry> = history
            .iter()
            .filter(|entry| model_type.is_none_or(|t| entry.model_type == t))
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).collect()
    }

    /// Persist the split and both slots' weights in one document write,
    /// then tell the endpoint. The committed split stands even when the
    /// endpoint call fails. Callers hold the per-type lock.
    async fn apply_split(
        &self,
        model_type: ModelType,
        blue_weight: f64,
        green_weight: f64,
        validate: bool,
    ) -> Result<TrafficSplit, DeployError> {
        let split = TrafficSplit {
            blue_weight,
            green_weight,
            updated_at: Utc::now(),
        };
        if validate {
            split.validate()?;
        }

        let type_key = model_type.as_str().to_string();
        {
            let mut state = self.state.write().unwrap();
            if !state.deployments.contains_key(&type_key) {
                return Err(DeployError::NotFound { model_type });
            }
            let mut doc = state.clone();
            doc.traffic.insert(type_key.clone(), split.clone());
            if let Some(slots) = doc.deployments.get_mut(&type_key) {
                if let Some(slot_state) = slots.get_mut(Slot::Blue.as_str()) {
                    slot_state.traffic_weight = blue_weight;
                }
                if let Some(slot_state) = slots.get_mut(Slot::Green.as_str()) {
                    slot_state.traffic_weight = green_weight;
                }
            }
            self.commit(&mut state, doc)?;
        }

        self.endpoint_call(
            "apply_traffic_split",
            self.endpoint.apply_traffic_split(model_type, &split),
        )
        .await?;

        Ok(split)
    }

    /// Run an endpoint call under the configured timeout; failures and
    /// timeouts surface as `CollaboratorFailure`
    async fn endpoint_call<T>(
        &self,
        op: &str,
        call: impl Future<Output = Result<T, EndpointError>>,
    ) -> Result<T, DeployError> {
        let timeout = self.config.endpoint_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(DeployError::CollaboratorFailure {
                op: op.to_string(),
                message: err.to_string(),
            }),
            Err(_) => Err(DeployError::CollaboratorFailure {
                op: op.to_string(),
                message: format!("timed out after {timeout:?}"),
            }),
        }
    }

    /// Persist a new state snapshot, then swap it in
    ///
    /// The caller passes the held state write guard, so clone, persist,
    /// and swap form one critical section and commits for different model
    /// types cannot overwrite each other. Guard sections stay free of
    /// await points; endpoint calls happen before or after them.
    fn commit(&self, state: &mut DeployDoc, mut doc: DeployDoc) -> Result<(), DeployError> {
        doc.updated_at = Some(Utc::now());
        self.store.write_doc(STATE_FILE, &doc)?;
        *state = doc;
        Ok(())
    }

    /// Record a staging deployment outcome under the state write lock
    ///
    /// The first deployment of a model type also initializes its traffic
    /// split with all traffic on blue.
    fn commit_slot_state(
        &self,
        type_key: &str,
        slot: Slot,
        slot_state: SlotState,
    ) -> Result<(), DeployError> {
        let mut state = self.state.write().unwrap();
        let mut doc = state.clone();
        if !doc.traffic.contains_key(type_key) {
            doc.traffic.insert(
                type_key.to_string(),
                TrafficSplit {
                    blue_weight: 1.0,
                    green_weight: 0.0,
                    updated_at: Utc::now(),
                },
            );
        }
        doc.deployments
            .entry(type_key.to_string())
            .or_default()
            .insert(slot.as_str().to_string(), slot_state);
        self.commit(&mut state, doc)
    }

    fn record_history(&self, entry: DeploymentHistoryEntry) -> Result<(), DeployError> {
        let mut history = self.history.lock().unwrap();
        history.push(entry);
        let excess = history.len().saturating_sub(self.config.history_retention);
        if excess > 0 {
            history.drain(..excess);
        }
        self.store.write_doc(HISTORY_FILE, &*history)?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
