//! mp_cli - CLI commands for ModelPilot
//!
//! This crate provides:
//! - clap-based command definitions
//! - Registry, deploy, drift, and feedback subcommands
//! - Table and JSON output formatting
//! - A one-screen status summary across all subsystems

use clap::{Parser, Subcommand, ValueEnum};
use mp_config::MpConfig;
use mp_deploy::{BlueGreenDeployer, NullEndpoint, SlotState, TrafficSplit};
use mp_drift::{DriftDetector, DriftReport, DriftSeverity, FeatureMatrix};
use mp_feedback::{FeedbackProcessor, OutcomeInput, OverrideInput};
use mp_registry::{ModelRegistry, ModelStatus, ModelType, RegisterRequest, VersionSelector};
use mp_store::DocStore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// CLI errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] mp_config::ConfigError),

    #[error("Store error: {0}")]
    StoreError(#[from] mp_store::StoreError),

    #[error("Registry error: {0}")]
    RegistryError(#[from] mp_registry::RegistryError),

    #[error("Deployment error: {0}")]
    DeployError(#[from] mp_deploy::DeployError),

    #[error("Drift error: {0}")]
    DriftError(#[from] mp_drift::DriftError),

    #[error("Feedback error: {0}")]
    FeedbackError(#[from] mp_feedback::FeedbackError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Output format for commands
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Aligned human-readable columns
    Table,
    /// Standard JSON output
    Json,
}

/// Main CLI application
#[derive(Parser, Debug)]
#[command(name = "mp")]
#[command(
    author,
    version,
    about = "ModelPilot - ML model lifecycle control plane"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<std::path::PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for commands
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Model version registry
    Registry {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Blue-green deployments and traffic control
    Deploy {
        #[command(subcommand)]
        command: DeployCommands,
    },

    /// Data drift monitoring
    Drift {
        #[command(subcommand)]
        command: DriftCommands,
    },

    /// Human feedback and training datasets
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommands,
    },

    /// One-screen summary across all subsystems
    Status,
}

/// Registry subcommands
#[derive(Subcommand, Debug)]
pub enum RegistryCommands {
    /// Register a new model version
    Register {
        /// Model type (completion, time_to_complete, rework_risk, satisfaction)
        #[arg(long)]
        model_type: String,

        /// Version string, unique per model type
        #[arg(long)]
        version: String,

        /// Path to the model artifact file
        #[arg(long)]
        artifact: PathBuf,

        /// Path to a JSON file of evaluation metrics (name -> value)
        #[arg(long)]
        metrics: Option<PathBuf>,

        /// Version this model was derived from
        #[arg(long)]
        parent: Option<String>,
    },

    /// List versions of a model type, newest first
    List {
        /// Model type to list
        #[arg(long)]
        model_type: String,

        /// Filter by lifecycle status
        #[arg(long)]
        status: Option<String>,
    },

    /// Show a single version
    Show {
        /// Model type to look up
        #[arg(long)]
        model_type: String,

        /// Version string or selector (latest, production, staging)
        #[arg(long, default_value = "latest")]
        version: String,
    },

    /// Promote a version to the staging role
    PromoteStaging {
        /// Model type to promote
        #[arg(long)]
        model_type: String,

        /// Version to promote
        #[arg(long)]
        version: String,
    },

    /// Promote a version to the production role
    PromoteProduction {
        /// Model type to promote
        #[arg(long)]
        model_type: String,

        /// Version to promote
        #[arg(long)]
        version: String,
    },

    /// Restore the previous production version
    Rollback {
        /// Model type to roll back
        #[arg(long)]
        model_type: String,
    },

    /// Compare metrics between two versions
    Compare {
        /// Model type the versions belong to
        #[arg(long)]
        model_type: String,

        /// Baseline version
        #[arg(long)]
        version_a: String,

        /// Candidate version
        #[arg(long)]
        version_b: String,
    },

    /// Show the lineage record of a version
    Lineage {
        /// Model type to look up
        #[arg(long)]
        model_type: String,

        /// Version to look up
        #[arg(long)]
        version: String,
    },
}

/// Deployment subcommands
#[derive(Subcommand, Debug)]
pub enum DeployCommands {
    /// Deploy a registered version to the inactive slot
    Staging {
        /// Model type to deploy
        #[arg(long)]
        model_type: String,

        /// Version to deploy
        #[arg(long)]
        version: String,
    },

    /// Set the blue/green traffic split directly
    Shift {
        /// Model type to shift
        #[arg(long)]
        model_type: String,

        /// Traffic weight for the blue slot (0.0 to 1.0)
        #[arg(long)]
        blue: f64,

        /// Traffic weight for the green slot (0.0 to 1.0)
        #[arg(long)]
        green: f64,

        /// Skip the weight-sum validation
        #[arg(long)]
        no_validate: bool,
    },

    /// Move all traffic to the staging slot
    Promote {
        /// Model type to promote
        #[arg(long)]
        model_type: String,

        /// Switch all traffic at once instead of stepping
        #[arg(long)]
        immediate: bool,

        /// Number of gradual steps (defaults to the configured value)
        #[arg(long)]
        steps: Option<u32>,
    },

    /// Switch all traffic back to the previous slot
    Rollback {
        /// Model type to roll back
        #[arg(long)]
        model_type: String,
    },

    /// Run a health check against active slots
    Health {
        /// Model type to check
        #[arg(long)]
        model_type: String,
    },

    /// Show slot states and the current traffic split
    Status {
        /// Model type to show
        #[arg(long)]
        model_type: String,
    },

    /// Show the deployment action history
    History {
        /// Filter by model type
        #[arg(long)]
        model_type: Option<String>,

        /// Maximum number of entries
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

/// Drift subcommands
#[derive(Subcommand, Debug)]
pub enum DriftCommands {
    /// Capture a new baseline from a feature matrix
    Baseline {
        /// JSON file mapping feature name to an array of values (null = missing)
        #[arg(long)]
        data: PathBuf,
    },

    /// Compare a current feature matrix against the baseline
    Detect {
        /// JSON file mapping feature name to an array of values (null = missing)
        #[arg(long)]
        data: PathBuf,

        /// Model type the data was scored by
        #[arg(long)]
        model_type: String,

        /// Model version the data was scored by
        #[arg(long)]
        model_version: String,
    },

    /// List stored drift reports, oldest first
    Reports {
        /// Filter by model type
        #[arg(long)]
        model_type: Option<String>,

        /// Maximum number of reports
        #[arg(long, default_value = "10")]
        limit: usize,
    },

    /// List drift alerts
    Alerts {
        /// Show only unacknowledged alerts
        #[arg(long)]
        unacknowledged: bool,

        /// Filter by severity (none, low, medium, high, critical)
        #[arg(long)]
        severity: Option<String>,
    },

    /// Acknowledge an alert
    Ack {
        /// Alert id to acknowledge
        #[arg(long)]
        alert_id: String,

        /// Operator acknowledging the alert
        #[arg(long)]
        operator: String,
    },
}

/// Feedback subcommands
#[derive(Subcommand, Debug)]
pub enum FeedbackCommands {
    /// Record a human override decision from a JSON file
    Override {
        /// JSON file with the override fields
        #[arg(long)]
        file: PathBuf,
    },

    /// Record an actual job outcome from a JSON file
    Outcome {
        /// JSON file with the outcome fields
        #[arg(long)]
        file: PathBuf,
    },

    /// Compile recent feedback into a weighted training dataset
    Dataset {
        /// Leave override records out of the dataset
        #[arg(long)]
        exclude_overrides: bool,

        /// Leave outcome records out of the dataset
        #[arg(long)]
        exclude_outcomes: bool,

        /// Only include feedback newer than this many days
        #[arg(long)]
        recency_days: Option<i64>,
    },

    /// Merge recent feedback into an existing training table
    Merge {
        /// Existing training table (.csv or .json)
        #[arg(long)]
        existing: PathBuf,

        /// Output path for the merged table (.csv or .json)
        #[arg(long)]
        output: PathBuf,

        /// Weight multiplier applied to feedback samples
        #[arg(long, default_value = "2.0")]
        weight: f64,
    },

    /// Show override, outcome, and prediction-accuracy statistics
    Stats,
}

impl Cli {
    /// Run the CLI
    ///
    /// # Errors
    ///
    /// Returns a [`CliError`] when the command cannot be completed.
    pub async fn run(self) -> Result<(), CliError> {
        let config = load_config(self.config.as_ref())?;
        match self.command {
            Commands::Registry { command } => run_registry(command, &config, self.format).await,
            Commands::Deploy { command } => run_deploy(command, &config, self.format).await,
            Commands::Drift { command } => run_drift(command, &config, self.format),
            Commands::Feedback { command } => run_feedback(command, &config, self.format),
            Commands::Status => run_status(&config, self.format),
        }
    }
}

async fn run_registry(
    command: RegistryCommands,
    config: &MpConfig,
    format: OutputFormat,
) -> Result<(), CliError> {
    let store = open_store(config)?;
    let registry = build_registry(&store, config)?;

    match command {
        RegistryCommands::Register {
            model_type,
            version,
            artifact,
            metrics,
            parent,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let artifact = std::fs::read(&artifact)?;
            let mut request = RegisterRequest::new(model_type, version, artifact);
            if let Some(path) = metrics {
                request = request.with_metrics(read_json(&path)?);
            }
            if let Some(parent) = parent {
                request = request.with_parent(parent);
            }
            let registered = registry.register(request).await?;
            print_output(&registered, format);
        }
        RegistryCommands::List { model_type, status } => {
            let model_type = parse_model_type(&model_type)?;
            let status = status
                .as_deref()
                .map(str::parse::<ModelStatus>)
                .transpose()
                .map_err(CliError::CommandFailed)?;
            let versions = registry.list_versions(model_type, status);
            match format {
                OutputFormat::Json => print_output(&versions, format),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = versions
                        .iter()
                        .map(|v| {
                            vec![
                                v.version.clone(),
                                v.status.to_string(),
                                v.created_at.format("%Y-%m-%d %H:%M").to_string(),
                                v.training_samples.to_string(),
                                v.parent_version.clone().unwrap_or_else(|| "-".to_string()),
                            ]
                        })
                        .collect();
                    print_table(&["VERSION", "STATUS", "CREATED", "SAMPLES", "PARENT"], &rows);
                }
            }
        }
        RegistryCommands::Show {
            model_type,
            version,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let selector = version
                .parse::<VersionSelector>()
                .map_err(CliError::CommandFailed)?;
            let found = registry.get_version(model_type, &selector)?;
            print_output(&found, format);
        }
        RegistryCommands::PromoteStaging {
            model_type,
            version,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let promoted = registry.promote_to_staging(model_type, &version).await?;
            print_output(&promoted, format);
        }
        RegistryCommands::PromoteProduction {
            model_type,
            version,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let promoted = registry.promote_to_production(model_type, &version).await?;
            print_output(&promoted, format);
        }
        RegistryCommands::Rollback { model_type } => {
            let model_type = parse_model_type(&model_type)?;
            let restored = registry.rollback(model_type).await?;
            print_output(&restored, format);
        }
        RegistryCommands::Compare {
            model_type,
            version_a,
            version_b,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let comparison = registry.compare_versions(model_type, &version_a, &version_b)?;
            match format {
                OutputFormat::Json => print_output(&comparison, format),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = comparison
                        .metrics
                        .iter()
                        .map(|(name, delta)| {
                            vec![
                                name.clone(),
                                format!("{:.4}", delta.version_a),
                                format!("{:.4}", delta.version_b),
                                format!("{:+.4}", delta.diff),
                                format!("{:+.1}%", delta.pct_change),
                            ]
                        })
                        .collect();
                    print_table(
                        &[
                            "METRIC",
                            comparison.version_a.as_str(),
                            comparison.version_b.as_str(),
                            "DIFF",
                            "CHANGE",
                        ],
                        &rows,
                    );
                    println!();
                    println!(
                        "training samples diff: {:+}",
                        comparison.training_samples_diff
                    );
                    println!("created {} days apart", comparison.created_at_diff_days);
                }
            }
        }
        RegistryCommands::Lineage {
            model_type,
            version,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let lineage = registry.get_lineage(model_type, &version)?;
            print_output(&lineage, format);
        }
    }
    Ok(())
}

async fn run_deploy(
    command: DeployCommands,
    config: &MpConfig,
    format: OutputFormat,
) -> Result<(), CliError> {
    let store = open_store(config)?;
    let registry = build_registry(&store, config)?;
    let deployer = build_deployer(&store, &registry, config)?;

    match command {
        DeployCommands::Staging {
            model_type,
            version,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let state = deployer.deploy_to_staging(model_type, &version).await?;
            print_output(&state, format);
        }
        DeployCommands::Shift {
            model_type,
            blue,
            green,
            no_validate,
        } => {
            let model_type = parse_model_type(&model_type)?;
            let split = deployer
                .shift_traffic(model_type, blue, green, !no_validate)
                .await?;
            print_output(&split, format);
        }
        DeployCommands::Promote {
            model_type,
            immediate,
            steps,
        } => {
            let model_type = parse_model_type(&model_type)?;
            deployer
                .promote_to_production(model_type, !immediate, steps, None)
                .await?;
            let states = deployer.slot_states(model_type);
            let split = deployer.traffic_split(model_type);
            print_deployment(&states, split.as_ref(), format);
        }
        DeployCommands::Rollback { model_type } => {
            let model_type = parse_model_type(&model_type)?;
            let restored = deployer.rollback(model_type).await?;
            print_output(&restored, format);
        }
        DeployCommands::Health { model_type } => {
            let model_type = parse_model_type(&model_type)?;
            let health = deployer.health_check(model_type).await?;
            match format {
                OutputFormat::Json => print_output(&health, format),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = health
                        .iter()
                        .map(|(slot, status)| vec![slot.to_string(), status.to_string()])
                        .collect();
                    print_table(&["SLOT", "HEALTH"], &rows);
                }
            }
        }
        DeployCommands::Status { model_type } => {
            let model_type = parse_model_type(&model_type)?;
            let states = deployer.slot_states(model_type);
            let split = deployer.traffic_split(model_type);
            print_deployment(&states, split.as_ref(), format);
        }
        DeployCommands::History { model_type, limit } => {
            let model_type = model_type
                .as_deref()
                .map(str::parse::<ModelType>)
                .transpose()
                .map_err(CliError::CommandFailed)?;
            let entries = deployer.history(model_type, limit);
            match format {
                OutputFormat::Json => print_output(&entries, format),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = entries
                        .iter()
                        .map(|e| {
                            vec![
                                e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                                e.action.to_string(),
                                e.model_type.to_string(),
                                e.version.clone().unwrap_or_else(|| "-".to_string()),
                                e.slot.map_or_else(|| "-".to_string(), |s| s.to_string()),
                                e.outcome.to_string(),
                                format!("{:.2}s", e.duration_seconds),
                            ]
                        })
                        .collect();
                    print_table(
                        &[
                            "TIMESTAMP",
                            "ACTION",
                            "MODEL",
                            "VERSION",
                            "SLOT",
                            "OUTCOME",
                            "DURATION",
                        ],
                        &rows,
                    );
                }
            }
        }
    }
    Ok(())
}

fn run_drift(
    command: DriftCommands,
    config: &MpConfig,
    format: OutputFormat,
) -> Result<(), CliError> {
    let store = open_store(config)?;
    let detector = DriftDetector::new(store, config.drift.clone())?;

    match command {
        DriftCommands::Baseline { data } => {
            let matrix: FeatureMatrix = read_json(&data)?;
            let baseline = detector.set_baseline(&matrix)?;
            match format {
                OutputFormat::Json => print_output(&baseline, format),
                OutputFormat::Table => {
                    println!(
                        "Baseline captured at {}",
                        baseline.captured_at.format("%Y-%m-%d %H:%M:%S")
                    );
                    println!("Samples:  {}", baseline.sample_size);
                    println!("Features: {}", baseline.features.len());
                }
            }
        }
        DriftCommands::Detect {
            data,
            model_type,
            model_version,
        } => {
            let matrix: FeatureMatrix = read_json(&data)?;
            let model_type = parse_model_type(&model_type)?;
            let report = detector.detect_drift(&matrix, model_type.as_str(), &model_version)?;
            match format {
                OutputFormat::Json => print_output(&report, format),
                OutputFormat::Table => print_drift_report(&report),
            }
        }
        DriftCommands::Reports { model_type, limit } => {
            let reports = detector.reports(model_type.as_deref(), limit);
            match format {
                OutputFormat::Json => print_output(&reports, format),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = reports
                        .iter()
                        .map(|r| {
                            vec![
                                r.report_id.clone(),
                                r.generated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                                r.model_type.clone(),
                                r.model_version.clone(),
                                if r.has_drift { "yes" } else { "-" }.to_string(),
                                format!("{:.3}", r.drift_score),
                                r.overall_severity.to_string(),
                            ]
                        })
                        .collect();
                    print_table(
                        &[
                            "REPORT",
                            "GENERATED",
                            "MODEL",
                            "VERSION",
                            "DRIFT",
                            "SCORE",
                            "SEVERITY",
                        ],
                        &rows,
                    );
                }
            }
        }
        DriftCommands::Alerts {
            unacknowledged,
            severity,
        } => {
            let severity = severity
                .as_deref()
                .map(str::parse::<DriftSeverity>)
                .transpose()
                .map_err(CliError::CommandFailed)?;
            let acknowledged = if unacknowledged { Some(false) } else { None };
            let alerts = detector.alerts(acknowledged, severity);
            match format {
                OutputFormat::Json => print_output(&alerts, format),
                OutputFormat::Table => {
                    let rows: Vec<Vec<String>> = alerts
                        .iter()
                        .map(|a| {
                            vec![
                                a.alert_id.clone(),
                                a.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                                a.severity.to_string(),
                                a.model_type.clone(),
                                if a.acknowledged {
                                    a.acknowledged_by.clone().unwrap_or_else(|| "yes".to_string())
                                } else {
                                    "-".to_string()
                                },
                                a.message.clone(),
                            ]
                        })
                        .collect();
                    print_table(
                        &["ALERT", "TIMESTAMP", "SEVERITY", "MODEL", "ACK", "MESSAGE"],
                        &rows,
                    );
                }
            }
        }
        DriftCommands::Ack { alert_id, operator } => {
            let alert = detector.acknowledge_alert(&alert_id, &operator)?;
            print_output(&alert, format);
        }
    }
    Ok(())
}

fn run_feedback(
    command: FeedbackCommands,
    config: &MpConfig,
    format: OutputFormat,
) -> Result<(), CliError> {
    let store = open_store(config)?;
    let processor = FeedbackProcessor::new(store, config.feedback.clone())?;

    match command {
        FeedbackCommands::Override { file } => {
            let input: OverrideInput = read_json(&file)?;
            let record = processor.record_override(input)?;
            print_output(&record, format);
        }
        FeedbackCommands::Outcome { file } => {
            let input: OutcomeInput = read_json(&file)?;
            let record = processor.record_outcome(input)?;
            print_output(&record, format);
        }
        FeedbackCommands::Dataset {
            exclude_overrides,
            exclude_outcomes,
            recency_days,
        } => {
            let dataset = processor.prepare_training_dataset(
                !exclude_overrides,
                !exclude_outcomes,
                recency_days,
            )?;
            print_output(&dataset, format);
        }
        FeedbackCommands::Merge {
            existing,
            output,
            weight,
        } => {
            let summary = processor.merge_with_training_data(&existing, &output, weight)?;
            print_output(&summary, format);
        }
        FeedbackCommands::Stats => {
            let stats = serde_json::json!({
                "overrides": processor.get_override_statistics(),
                "outcomes": processor.get_outcome_statistics(),
                "prediction_accuracy": processor.get_prediction_accuracy(),
            });
            print_output(&stats, format);
        }
    }
    Ok(())
}

/// Per-model row of the `status` summary
#[derive(Debug, Serialize)]
struct ModelSummary {
    model_type: ModelType,
    production: Option<String>,
    staging: Option<String>,
    serving: Option<String>,
    drift_severity: Option<DriftSeverity>,
    drift_checked_at: Option<String>,
}

/// Payload of the `status` summary
#[derive(Debug, Serialize)]
struct StatusSummary {
    models: Vec<ModelSummary>,
    overrides_recorded: u64,
    outcomes_recorded: u64,
    unacknowledged_alerts: usize,
}

const MODEL_TYPES: [ModelType; 4] = [
    ModelType::Completion,
    ModelType::TimeToComplete,
    ModelType::ReworkRisk,
    ModelType::Satisfaction,
];

fn run_status(config: &MpConfig, format: OutputFormat) -> Result<(), CliError> {
    let store = open_store(config)?;
    let registry = build_registry(&store, config)?;
    let deployer = build_deployer(&store, &registry, config)?;
    let detector = DriftDetector::new(Arc::clone(&store), config.drift.clone())?;
    let processor = FeedbackProcessor::new(Arc::clone(&store), config.feedback.clone())?;

    let mut models = Vec::new();
    for model_type in MODEL_TYPES {
        let production = registry
            .get_version(model_type, &VersionSelector::Production)
            .ok()
            .map(|v| v.version);
        let staging = registry
            .get_version(model_type, &VersionSelector::Staging)
            .ok()
            .map(|v| v.version);
        let serving = deployer.active_version(model_type);
        let last_report = detector.reports(Some(model_type.as_str()), 1).pop();
        models.push(ModelSummary {
            model_type,
            production,
            staging,
            serving,
            drift_severity: last_report.as_ref().map(|r| r.overall_severity),
            drift_checked_at: last_report
                .as_ref()
                .map(|r| r.generated_at.format("%Y-%m-%d %H:%M:%S").to_string()),
        });
    }

    let summary = StatusSummary {
        models,
        overrides_recorded: processor.get_override_statistics().total_overrides,
        outcomes_recorded: processor.get_outcome_statistics().total_outcomes,
        unacknowledged_alerts: detector.alerts(Some(false), None).len(),
    };

    match format {
        OutputFormat::Json => print_output(&summary, format),
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = summary
                .models
                .iter()
                .map(|m| {
                    vec![
                        m.model_type.to_string(),
                        m.production.clone().unwrap_or_else(|| "-".to_string()),
                        m.staging.clone().unwrap_or_else(|| "-".to_string()),
                        m.serving.clone().unwrap_or_else(|| "-".to_string()),
                        m.drift_severity
                            .map_or_else(|| "-".to_string(), |s| s.to_string()),
                        m.drift_checked_at.clone().unwrap_or_else(|| "-".to_string()),
                    ]
                })
                .collect();
            print_table(
                &[
                    "MODEL",
                    "PRODUCTION",
                    "STAGING",
                    "SERVING",
                    "DRIFT",
                    "CHECKED",
                ],
                &rows,
            );
            println!();
            println!(
                "Overrides: {}   Outcomes: {}   Unacknowledged alerts: {}",
                summary.overrides_recorded,
                summary.outcomes_recorded,
                summary.unacknowledged_alerts
            );
        }
    }
    Ok(())
}

fn load_config(config_path: Option<&std::path::PathBuf>) -> Result<MpConfig, CliError> {
    let config = match config_path {
        Some(path) => MpConfig::load(path)?,
        None => MpConfig::discover_with_env()?,
    };
    Ok(config)
}

fn open_store(config: &MpConfig) -> Result<Arc<DocStore>, CliError> {
    Ok(Arc::new(DocStore::open(&config.global.data_dir)?))
}

fn build_registry(
    store: &Arc<DocStore>,
    config: &MpConfig,
) -> Result<Arc<ModelRegistry>, CliError> {
    Ok(Arc::new(ModelRegistry::new(
        Arc::clone(store),
        config.registry.clone(),
    )?))
}

fn build_deployer(
    store: &Arc<DocStore>,
    registry: &Arc<ModelRegistry>,
    config: &MpConfig,
) -> Result<BlueGreenDeployer, CliError> {
    if config.endpoint.enabled {
        warn!(
            base_url = %config.endpoint.base_url,
            "endpoint.enabled is set but no serving integration is built in, using the no-op endpoint"
        );
    }
    Ok(BlueGreenDeployer::new(
        Arc::clone(store),
        Arc::clone(registry),
        Arc::new(NullEndpoint),
        config.deployment.clone(),
    )?)
}

fn parse_model_type(value: &str) -> Result<ModelType, CliError> {
    value.parse::<ModelType>().map_err(CliError::CommandFailed)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CliError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|err| {
        CliError::CommandFailed(format!("Invalid JSON in {}: {err}", path.display()))
    })
}

fn print_output<T: Serialize>(value: &T, format: OutputFormat) {
    let json = match format {
        OutputFormat::Json => serde_json::to_string(value),
        OutputFormat::Table => serde_json::to_string_pretty(value),
    }
    .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {e}"}}"#));
    println!("{json}");
}

fn print_table(headers: &[&str], rows: &[Vec<String>]) {
    print!("{}", render_table(headers, rows));
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i)
                && cell.len() > *width
            {
                *width = cell.len();
            }
        }
    }

    let mut out = String::new();
    push_row(&mut out, &widths, headers);
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&mut out, &widths, &cells);
    }
    out
}

fn push_row(out: &mut String, widths: &[usize], cells: &[&str]) {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        let width = widths.get(i).copied().unwrap_or(0);
        line.push_str(&format!("{cell:<width$}"));
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

fn print_deployment(states: &[SlotState], split: Option<&TrafficSplit>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "slots": states,
                "traffic": split,
            });
            print_output(&payload, format);
        }
        OutputFormat::Table => {
            let rows: Vec<Vec<String>> = states
                .iter()
                .map(|s| {
                    vec![
                        s.slot.to_string(),
                        s.version.clone(),
                        s.status.to_string(),
                        format!("{:>5.1}%", s.traffic_weight * 100.0),
                        s.health_status.to_string(),
                        s.deployed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    ]
                })
                .collect();
            print_table(
                &["SLOT", "VERSION", "STATUS", "WEIGHT", "HEALTH", "DEPLOYED"],
                &rows,
            );
            if let Some(split) = split {
                println!();
                println!(
                    "Traffic: blue {:.1}% / green {:.1}%",
                    split.blue_weight * 100.0,
                    split.green_weight * 100.0
                );
            }
        }
    }
}

fn print_drift_report(report: &DriftReport) {
    println!("Report {}", report.report_id);
    println!("Model:    {} {}", report.model_type, report.model_version);
    println!(
        "Drift:    {} (score {:.3}, severity {})",
        if report.has_drift { "yes" } else { "no" },
        report.drift_score,
        report.overall_severity
    );
    println!(
        "Samples:  {} baseline / {} current",
        report.baseline_sample_size, report.current_sample_size
    );
    println!();
    let rows: Vec<Vec<String>> = report
        .features
        .iter()
        .map(|f| {
            vec![
                f.feature_name.clone(),
                format!("{:.3}", f.drift_score),
                f.severity.to_string(),
                format!("{:.4}", f.kl_divergence),
                format!("{:.4}", f.psi),
                format!("{:+.2}", f.mean_shift_sigmas),
                if f.has_drift { "yes" } else { "-" }.to_string(),
            ]
        })
        .collect();
    print_table(
        &["FEATURE", "SCORE", "SEVERITY", "KL", "PSI", "SHIFT", "DRIFT"],
        &rows,
    );
    if !report.recommendations.is_empty() {
        println!();
        for rec in &report.recommendations {
            println!("- {rec}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =============================================================================
    // CliError Tests
    // =============================================================================

    #[test]
    fn cli_error_command_failed_display() {
        let err = CliError::CommandFailed("unknown model type: embedding".to_string());
        assert_eq!(
            err.to_string(),
            "Command failed: unknown model type: embedding"
        );
    }

    #[test]
    fn cli_error_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: CliError = io.into();
        assert!(matches!(err, CliError::IoError(_)));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn parse_model_type_rejects_unknown() {
        let err = parse_model_type("embedding").unwrap_err();
        match err {
            CliError::CommandFailed(msg) => assert!(msg.contains("embedding")),
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    // =============================================================================
    // Argument Parsing Tests
    // =============================================================================

    #[test]
    fn parses_registry_register() {
        let cli = Cli::parse_from([
            "mp",
            "registry",
            "register",
            "--model-type",
            "completion",
            "--version",
            "v1.2.0",
            "--artifact",
            "/tmp/model.bin",
            "--metrics",
            "/tmp/metrics.json",
            "--parent",
            "v1.1.0",
        ]);
        match cli.command {
            Commands::Registry {
                command:
                    RegistryCommands::Register {
                        model_type,
                        version,
                        artifact,
                        metrics,
                        parent,
                    },
            } => {
                assert_eq!(model_type, "completion");
                assert_eq!(version, "v1.2.0");
                assert_eq!(artifact, PathBuf::from("/tmp/model.bin"));
                assert_eq!(metrics, Some(PathBuf::from("/tmp/metrics.json")));
                assert_eq!(parent, Some("v1.1.0".to_string()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn registry_show_version_defaults_to_latest() {
        let cli = Cli::parse_from(["mp", "registry", "show", "--model-type", "rework_risk"]);
        match cli.command {
            Commands::Registry {
                command: RegistryCommands::Show { version, .. },
            } => assert_eq!(version, "latest"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_deploy_shift_with_no_validate() {
        let cli = Cli::parse_from([
            "mp",
            "deploy",
            "shift",
            "--model-type",
            "completion",
            "--blue",
            "0.4",
            "--green",
            "0.6",
            "--no-validate",
        ]);
        match cli.command {
            Commands::Deploy {
                command:
                    DeployCommands::Shift {
                        blue,
                        green,
                        no_validate,
                        ..
                    },
            } => {
                assert!((blue - 0.4).abs() < 1e-9);
                assert!((green - 0.6).abs() < 1e-9);
                assert!(no_validate);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_deploy_promote_flags() {
        let cli = Cli::parse_from([
            "mp",
            "deploy",
            "promote",
            "--model-type",
            "satisfaction",
            "--immediate",
            "--steps",
            "3",
        ]);
        match cli.command {
            Commands::Deploy {
                command:
                    DeployCommands::Promote {
                        immediate, steps, ..
                    },
            } => {
                assert!(immediate);
                assert_eq!(steps, Some(3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn deploy_history_limit_defaults() {
        let cli = Cli::parse_from(["mp", "deploy", "history"]);
        match cli.command {
            Commands::Deploy {
                command: DeployCommands::History { model_type, limit },
            } => {
                assert!(model_type.is_none());
                assert_eq!(limit, 20);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_drift_detect() {
        let cli = Cli::parse_from([
            "mp",
            "drift",
            "detect",
            "--data",
            "/tmp/current.json",
            "--model-type",
            "time_to_complete",
            "--model-version",
            "v2.0.0",
        ]);
        match cli.command {
            Commands::Drift {
                command:
                    DriftCommands::Detect {
                        data,
                        model_type,
                        model_version,
                    },
            } => {
                assert_eq!(data, PathBuf::from("/tmp/current.json"));
                assert_eq!(model_type, "time_to_complete");
                assert_eq!(model_version, "v2.0.0");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_drift_alert_filters() {
        let cli = Cli::parse_from([
            "mp",
            "drift",
            "alerts",
            "--unacknowledged",
            "--severity",
            "critical",
        ]);
        match cli.command {
            Commands::Drift {
                command:
                    DriftCommands::Alerts {
                        unacknowledged,
                        severity,
                    },
            } => {
                assert!(unacknowledged);
                assert_eq!(severity, Some("critical".to_string()));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn feedback_merge_weight_defaults() {
        let cli = Cli::parse_from([
            "mp",
            "feedback",
            "merge",
            "--existing",
            "/tmp/train.csv",
            "--output",
            "/tmp/merged.csv",
        ]);
        match cli.command {
            Commands::Feedback {
                command: FeedbackCommands::Merge { weight, .. },
            } => assert!((weight - 2.0).abs() < 1e-9),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn feedback_dataset_flags_default_off() {
        let cli = Cli::parse_from(["mp", "feedback", "dataset", "--recency-days", "30"]);
        match cli.command {
            Commands::Feedback {
                command:
                    FeedbackCommands::Dataset {
                        exclude_overrides,
                        exclude_outcomes,
                        recency_days,
                    },
            } => {
                assert!(!exclude_overrides);
                assert!(!exclude_outcomes);
                assert_eq!(recency_days, Some(30));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_apply_to_subcommands() {
        let cli = Cli::parse_from([
            "mp",
            "status",
            "--config",
            "/etc/mp.toml",
            "--format",
            "json",
            "--verbose",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/mp.toml")));
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn format_defaults_to_table() {
        let cli = Cli::parse_from(["mp", "status"]);
        assert!(matches!(cli.format, OutputFormat::Table));
    }

    // =============================================================================
    // Table Rendering Tests
    // =============================================================================

    #[test]
    fn render_table_aligns_columns() {
        let rows = vec![
            vec!["v1.0.0".to_string(), "production".to_string()],
            vec!["v2".to_string(), "staging".to_string()],
        ];
        let rendered = render_table(&["VERSION", "STATUS"], &rows);
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "VERSION  STATUS");
        assert_eq!(lines[1], "v1.0.0   production");
        assert_eq!(lines[2], "v2       staging");
    }

    #[test]
    fn render_table_has_no_trailing_spaces() {
        let rows = vec![vec!["a".to_string(), "b".to_string()]];
        let rendered = render_table(&["LONG_HEADER", "X"], &rows);
        for line in rendered.lines() {
            assert_eq!(line, line.trim_end());
        }
    }

    // =============================================================================
    // End-to-End Command Tests
    // =============================================================================

    fn write_config(dir: &std::path::Path) -> PathBuf {
        let data_dir = dir.join("data");
        let config_path = dir.join("mp.toml");
        let content = format!(
            "[global]\ndata_dir = \"{}\"\nlog_level = \"warn\"\n",
            data_dir.display()
        );
        std::fs::write(&config_path, content).unwrap();
        config_path
    }

    async fn run_cli(config: &std::path::Path, args: &[&str]) -> Result<(), CliError> {
        let mut full = vec!["mp", "--config", config.to_str().unwrap(), "--format", "json"];
        full.extend_from_slice(args);
        Cli::parse_from(full).run().await
    }

    #[tokio::test]
    async fn register_list_and_deploy_flow() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = write_config(dir.path());

        let artifact = dir.path().join("model.bin");
        std::fs::write(&artifact, b"weights").unwrap();
        let metrics = dir.path().join("metrics.json");
        std::fs::write(&metrics, r#"{"rmse": 0.42}"#).unwrap();

        run_cli(
            &config,
            &[
                "registry",
                "register",
                "--model-type",
                "completion",
                "--version",
                "v1.0.0",
                "--artifact",
                artifact.to_str().unwrap(),
                "--metrics",
                metrics.to_str().unwrap(),
            ],
        )
        .await
        .unwrap();

        run_cli(&config, &["registry", "list", "--model-type", "completion"])
            .await
            .unwrap();
        run_cli(&config, &["registry", "show", "--model-type", "completion"])
            .await
            .unwrap();

        run_cli(
            &config,
            &[
                "deploy",
                "staging",
                "--model-type",
                "completion",
                "--version",
                "v1.0.0",
            ],
        )
        .await
        .unwrap();
        run_cli(&config, &["deploy", "status", "--model-type", "completion"])
            .await
            .unwrap();
        run_cli(&config, &["status"]).await.unwrap();
    }

    #[tokio::test]
    async fn drift_and_feedback_flow() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = write_config(dir.path());

        let baseline = dir.path().join("baseline.json");
        std::fs::write(&baseline, r#"{"score": [1.0, 2.0, 3.0, 4.0, null]}"#).unwrap();
        run_cli(
            &config,
            &["drift", "baseline", "--data", baseline.to_str().unwrap()],
        )
        .await
        .unwrap();

        run_cli(
            &config,
            &[
                "drift",
                "detect",
                "--data",
                baseline.to_str().unwrap(),
                "--model-type",
                "completion",
                "--model-version",
                "v1.0.0",
            ],
        )
        .await
        .unwrap();
        run_cli(&config, &["drift", "reports"]).await.unwrap();

        let override_file = dir.path().join("override.json");
        std::fs::write(
            &override_file,
            r#"{
                "job_id": "job-1",
                "original_vendor_id": "vendor-a",
                "selected_vendor_id": "vendor-b",
                "operator_id": "op-7",
                "override_reason": "prefers the other crew",
                "override_category": "preference",
                "original_score": 0.82,
                "selected_score": 0.71,
                "confidence": 0.55,
                "was_low_confidence": true
            }"#,
        )
        .unwrap();
        run_cli(
            &config,
            &[
                "feedback",
                "override",
                "--file",
                override_file.to_str().unwrap(),
            ],
        )
        .await
        .unwrap();
        run_cli(&config, &["feedback", "stats"]).await.unwrap();
        run_cli(&config, &["feedback", "dataset"]).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_model_type_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = write_config(dir.path());

        let err = run_cli(
            &config,
            &["registry", "list", "--model-type", "embedding"],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CliError::CommandFailed(_)));
    }
}
