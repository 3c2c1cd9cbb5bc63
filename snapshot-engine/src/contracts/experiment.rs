//! Experiment, Rollout and Dashboard Contracts
//!
//! These entities are owned by the product side of the platform. The engine
//! only reads them, except for the scheduling fields (`next_*`, auto-update
//! flags) which the scheduler advances through whole-record updates.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::common::{AnalysisKind, EntityRef};

/// Prefix that marks a metric reference as a metric group.
pub const METRIC_GROUP_PREFIX: &str = "mg_";

/// Lifecycle status of an experiment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Stopped,
}

/// One variation of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variation {
    pub id: String,
    pub key: String,
    pub name: String,
}

/// A contiguous period of an experiment with a fixed traffic split.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub name: String,
    pub date_started: DateTime<Utc>,
    pub date_ended: Option<DateTime<Utc>>,

    /// Intended traffic share per variation, in variation order
    pub variation_weights: Vec<f64>,

    #[serde(default = "default_coverage")]
    pub coverage: f64,
}

fn default_coverage() -> f64 {
    1.0
}

/// Metric references grouped by role. Any entry may be a metric group id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricRefs {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub secondary: Vec<String>,
    #[serde(default)]
    pub guardrails: Vec<String>,
}

impl MetricRefs {
    /// All references in role order: goals, secondary, guardrails.
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.goals
            .iter()
            .chain(self.secondary.iter())
            .chain(self.guardrails.iter())
    }

    pub fn is_group(reference: &str) -> bool {
        reference.starts_with(METRIC_GROUP_PREFIX)
    }
}

/// Warehouse-side incremental refresh pipeline state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IncrementalRefreshState {
    /// Dimension ids (`exp:<column>`) the pipeline has materialized
    pub materialized_dimensions: Vec<String>,
    pub last_refreshed: Option<DateTime<Utc>>,
}

/// An A/B experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub organization: String,
    pub name: String,
    pub status: ExperimentStatus,
    pub phases: Vec<Phase>,
    pub variations: Vec<Variation>,
    pub datasource: Option<String>,
    pub exposure_query_id: Option<String>,
    #[serde(default)]
    pub metrics: MetricRefs,

    /// Whether the scheduler refreshes results automatically
    #[serde(default)]
    pub auto_update: bool,
    #[serde(default = "default_update_interval_hours")]
    pub update_interval_hours: i64,
    pub next_snapshot_attempt: Option<DateTime<Utc>>,

    pub incremental_refresh: Option<IncrementalRefreshState>,
}

fn default_update_interval_hours() -> i64 {
    6
}

impl Experiment {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::experiment(&self.id, &self.organization)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExperimentStatus::Running
            && self.auto_update
            && self.next_snapshot_attempt.map_or(true, |next| next <= now)
    }

    /// Returns a copy with the next scheduled attempt pushed forward.
    pub fn with_next_attempt(&self, now: DateTime<Utc>) -> Self {
        Self {
            next_snapshot_attempt: Some(now + Duration::hours(self.update_interval_hours.max(1))),
            ..self.clone()
        }
    }
}

/// Status of a safe rollout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SafeRolloutStatus {
    Running,
    RolledBack,
    Released,
    Stopped,
}

/// A feature rollout monitored by guardrail metrics.
///
/// Analysed as a single-phase, two-variation (control vs. rollout) target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SafeRollout {
    pub id: String,
    pub organization: String,
    pub feature_id: String,
    pub status: SafeRolloutStatus,
    pub start_time: DateTime<Utc>,
    pub datasource: Option<String>,
    pub exposure_query_id: Option<String>,
    #[serde(default)]
    pub guardrail_metrics: Vec<String>,
    #[serde(default)]
    pub auto_snapshots: bool,
    pub next_snapshot_update: Option<DateTime<Utc>>,
}

/// Safe rollouts refresh on a fixed cadence.
pub const SAFE_ROLLOUT_UPDATE_INTERVAL_HOURS: i64 = 1;

impl SafeRollout {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::safe_rollout(&self.id, &self.organization)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SafeRolloutStatus::Running
            && self.auto_snapshots
            && self.next_snapshot_update.map_or(true, |next| next <= now)
    }

    pub fn with_next_update(&self, now: DateTime<Utc>) -> Self {
        Self {
            next_snapshot_update: Some(now + Duration::hours(SAFE_ROLLOUT_UPDATE_INTERVAL_HOURS)),
            ..self.clone()
        }
    }
}

/// A results dashboard that keeps its experiment's snapshot fresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dashboard {
    pub id: String,
    pub organization: String,
    pub experiment_id: String,
    #[serde(default)]
    pub enable_auto_updates: bool,
    #[serde(default = "default_update_interval_hours")]
    pub update_interval_hours: i64,
    pub next_update: Option<DateTime<Utc>>,
    /// Optional slice axis the dashboard is built on
    pub dimension: Option<String>,
}

impl Dashboard {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enable_auto_updates && self.next_update.map_or(true, |next| next <= now)
    }

    pub fn with_next_update(&self, now: DateTime<Utc>) -> Self {
        Self {
            next_update: Some(now + Duration::hours(self.update_interval_hours.max(1))),
            ..self.clone()
        }
    }

    pub fn with_auto_updates_disabled(&self) -> Self {
        Self {
            enable_auto_updates: false,
            ..self.clone()
        }
    }
}

/// A feature flag, as far as staleness tracking is concerned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    pub organization: String,
    pub date_updated: DateTime<Utc>,
    #[serde(default)]
    pub never_stale: bool,
    #[serde(default)]
    pub linked_experiments: Vec<String>,
    #[serde(default)]
    pub is_stale: bool,
}

/// Uniform view over anything the orchestrator can analyse.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisTarget {
    pub entity: EntityRef,
    pub status: ExperimentStatus,
    pub phases: Vec<Phase>,
    pub variations: Vec<Variation>,
    pub datasource: Option<String>,
    pub exposure_query_id: Option<String>,
    /// Metric references, possibly including metric groups
    pub metric_refs: Vec<String>,
    pub incremental_refresh: Option<IncrementalRefreshState>,
}

impl From<&Experiment> for AnalysisTarget {
    fn from(experiment: &Experiment) -> Self {
        Self {
            entity: experiment.entity_ref(),
            status: experiment.status,
            phases: experiment.phases.clone(),
            variations: experiment.variations.clone(),
            datasource: experiment.datasource.clone(),
            exposure_query_id: experiment.exposure_query_id.clone(),
            metric_refs: experiment.metrics.all().cloned().collect(),
            incremental_refresh: experiment.incremental_refresh.clone(),
        }
    }
}

impl From<&SafeRollout> for AnalysisTarget {
    fn from(rollout: &SafeRollout) -> Self {
        let status = match rollout.status {
            SafeRolloutStatus::Running => ExperimentStatus::Running,
            SafeRolloutStatus::RolledBack
            | SafeRolloutStatus::Released
            | SafeRolloutStatus::Stopped => ExperimentStatus::Stopped,
        };

        Self {
            entity: rollout.entity_ref(),
            status,
            phases: vec![Phase {
                name: "Rollout".to_string(),
                date_started: rollout.start_time,
                date_ended: None,
                variation_weights: vec![0.5, 0.5],
                coverage: 1.0,
            }],
            variations: vec![
                Variation {
                    id: "0".to_string(),
                    key: "0".to_string(),
                    name: "Control".to_string(),
                },
                Variation {
                    id: "1".to_string(),
                    key: "1".to_string(),
                    name: "Rollout".to_string(),
                },
            ],
            datasource: rollout.datasource.clone(),
            exposure_query_id: rollout.exposure_query_id.clone(),
            metric_refs: rollout.guardrail_metrics.clone(),
            incremental_refresh: None,
        }
    }
}

impl AnalysisTarget {
    pub fn kind(&self) -> AnalysisKind {
        self.entity.kind
    }
}
