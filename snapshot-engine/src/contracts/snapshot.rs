//! Snapshot Contracts
//!
//! A snapshot is the immutable output of one analysis run. It is created in
//! the `running` state before any query is issued, receives progress updates
//! while its queries run, and is finalized exactly once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::common::EntityRef;
use super::organization::StatsEngineKind;
use super::query::QueryStatus;

/// Name of the slice used when no dimension is requested.
pub const ALL_SLICE: &str = "All";

/// Bucket for dimension values outside the enumerated slices.
pub const OTHER_SLICE: &str = "__other__";

/// Aggregate status of a snapshot (and of the query run behind it).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Running,
    Succeeded,
    PartiallySucceeded,
    Failed,
    Cancelled,
}

impl SnapshotStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether statistics are computed for a run ending in this status.
    pub fn has_results(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PartiallySucceeded)
    }
}

impl std::fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::PartiallySucceeded => write!(f, "partially_succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What caused a snapshot to be created.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    Schedule,
    Api,
}

/// Request to analyse an experiment or rollout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateSnapshotRequest {
    #[validate(nested)]
    pub entity: EntityRef,

    /// Phase index into the entity's phase list
    pub phase: usize,

    /// Dimension id to slice by, e.g. `exp:country`
    #[validate(length(min = 1, max = 128))]
    pub dimension: Option<String>,

    pub use_cache: bool,

    pub trigger: SnapshotTrigger,
}

/// Status of one query as seen from its snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPointer {
    pub query_id: Uuid,
    pub name: String,
    pub status: QueryStatus,
}

/// A sub-query whose data is missing from the results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedQuery {
    pub name: String,
    pub error: String,
}

/// Users per variation for one slice of a dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SliceTraffic {
    pub slice: String,
    pub users: Vec<f64>,
    pub srm_p_value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DimensionTraffic {
    pub dimension: String,
    pub slices: Vec<SliceTraffic>,
}

/// Traffic split health of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficHealth {
    pub users: Vec<f64>,
    pub srm_p_value: f64,
    /// Set when the SRM p-value is below the organization's threshold
    pub srm_warning: bool,
    #[serde(default)]
    pub dimensions: Vec<DimensionTraffic>,
}

/// Aggregates and derived statistics for one variation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariationResult {
    pub variation: String,
    pub users: f64,
    pub count: f64,
    pub mean: f64,
    pub variance: f64,
    pub power: Option<f64>,

    // Comparison against the baseline; unset on the baseline itself.
    pub expected_lift: Option<f64>,
    pub ci: Option<[f64; 2]>,
    pub p_value: Option<f64>,
    pub chance_to_win: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SliceResult {
    pub name: String,
    pub variations: Vec<VariationResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricResult {
    pub metric_id: String,
    pub slices: Vec<SliceResult>,
}

/// The outcome of one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub id: Uuid,
    pub entity: EntityRef,
    pub phase: usize,
    pub dimension: Option<String>,
    pub trigger: SnapshotTrigger,
    pub use_cache: bool,
    pub status: SnapshotStatus,
    pub stats_engine: StatsEngineKind,
    pub created_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub queries: Vec<QueryPointer>,

    /// Keyed by metric id
    #[serde(default)]
    pub results: BTreeMap<String, MetricResult>,

    pub health: Option<TrafficHealth>,

    #[serde(default)]
    pub failed_queries: Vec<FailedQuery>,

    pub error: Option<String>,
}

impl Snapshot {
    /// A fresh snapshot in the `running` state.
    pub fn start(request: &CreateSnapshotRequest, stats_engine: StatsEngineKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: request.entity.clone(),
            phase: request.phase,
            dimension: request.dimension.clone(),
            trigger: request.trigger,
            use_cache: request.use_cache,
            status: SnapshotStatus::Running,
            stats_engine,
            created_at: Utc::now(),
            finalized_at: None,
            queries: Vec::new(),
            results: BTreeMap::new(),
            health: None,
            failed_queries: Vec::new(),
            error: None,
        }
    }

    pub fn with_queries(&self, queries: Vec<QueryPointer>) -> Self {
        Self {
            queries,
            ..self.clone()
        }
    }

    pub fn finalized(&self, outcome: SnapshotOutcome) -> Self {
        Self {
            status: outcome.status,
            results: outcome.results,
            health: outcome.health,
            failed_queries: outcome.failed_queries,
            error: outcome.error,
            finalized_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn cancelled(&self) -> Self {
        Self {
            status: SnapshotStatus::Cancelled,
            finalized_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}

/// Everything written onto a snapshot when it is finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotOutcome {
    pub status: SnapshotStatus,
    pub results: BTreeMap<String, MetricResult>,
    pub health: Option<TrafficHealth>,
    pub failed_queries: Vec<FailedQuery>,
    pub error: Option<String>,
}

impl SnapshotOutcome {
    pub fn without_results(status: SnapshotStatus, failed_queries: Vec<FailedQuery>, error: Option<String>) -> Self {
        Self {
            status,
            results: BTreeMap::new(),
            health: None,
            failed_queries,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CreateSnapshotRequest {
        CreateSnapshotRequest {
            entity: EntityRef::experiment("exp_1", "org_1"),
            phase: 0,
            dimension: None,
            use_cache: true,
            trigger: SnapshotTrigger::Manual,
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SnapshotStatus::PartiallySucceeded).unwrap();
        assert_eq!(json, "\"partially_succeeded\"");
        assert!(SnapshotStatus::PartiallySucceeded.has_results());
        assert!(!SnapshotStatus::Cancelled.has_results());
        assert!(!SnapshotStatus::Running.is_terminal());
    }

    #[test]
    fn test_request_validation_rejects_empty_dimension() {
        let mut req = request();
        assert!(req.validate().is_ok());

        req.dimension = Some(String::new());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_finalize_keeps_identity() {
        let snapshot = Snapshot::start(&request(), StatsEngineKind::Bayesian);
        let done = snapshot.finalized(SnapshotOutcome::without_results(
            SnapshotStatus::Failed,
            vec![],
            Some("boom".to_string()),
        ));

        assert_eq!(done.id, snapshot.id);
        assert_eq!(done.status, SnapshotStatus::Failed);
        assert!(done.finalized_at.is_some());
        assert_eq!(snapshot.status, SnapshotStatus::Running);
    }
}
