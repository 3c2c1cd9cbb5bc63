//! Persistent Store
//!
//! Document-style access to the entities the engine reads and the records it
//! owns. Updates always replace a whole value; nothing is patched in place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::contracts::{
    Dashboard, DatasourceConfig, EntityRef, Experiment, FactTable, Feature, MetricDefinition, MetricGroup,
    OrganizationSettings, QueryRecord, SafeRollout, Snapshot,
};

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound { entity, id: id.into() }
    }
}

/// Result of a conditional snapshot write.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotUpdate {
    /// The snapshot was running; this is the stored result of the change
    Applied(Snapshot),
    /// Another writer finalized the snapshot first; it was left untouched
    AlreadyFinal(Snapshot),
}

/// Store operations used by the orchestrator, the runner and the scheduler.
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    // Experiments

    async fn get_experiment(&self, organization: &str, id: &str) -> Result<Option<Experiment>, StoreError>;

    async fn update_experiment(&self, experiment: Experiment) -> Result<(), StoreError>;

    /// Running experiments with auto-update enabled whose next attempt is due.
    async fn find_due_experiments(&self, now: DateTime<Utc>) -> Result<Vec<Experiment>, StoreError>;

    // Safe rollouts

    async fn get_safe_rollout(&self, organization: &str, id: &str) -> Result<Option<SafeRollout>, StoreError>;

    async fn update_safe_rollout(&self, rollout: SafeRollout) -> Result<(), StoreError>;

    async fn find_due_safe_rollouts(&self, now: DateTime<Utc>) -> Result<Vec<SafeRollout>, StoreError>;

    // Dashboards

    async fn get_dashboard(&self, organization: &str, id: &str) -> Result<Option<Dashboard>, StoreError>;

    async fn update_dashboard(&self, dashboard: Dashboard) -> Result<(), StoreError>;

    async fn find_due_dashboards(&self, now: DateTime<Utc>) -> Result<Vec<Dashboard>, StoreError>;

    // Organizations

    async fn list_organizations(&self) -> Result<Vec<String>, StoreError>;

    /// Settings of an organization; defaults when none were saved.
    async fn get_organization_settings(&self, organization: &str) -> Result<OrganizationSettings, StoreError>;

    // Datasources, metrics and fact tables

    async fn get_datasource(&self, organization: &str, id: &str) -> Result<Option<DatasourceConfig>, StoreError>;

    async fn list_datasources(&self, organization: &str) -> Result<Vec<DatasourceConfig>, StoreError>;

    async fn update_datasource(&self, datasource: DatasourceConfig) -> Result<(), StoreError>;

    async fn get_metric(&self, organization: &str, id: &str) -> Result<Option<MetricDefinition>, StoreError>;

    async fn get_metric_group(&self, organization: &str, id: &str) -> Result<Option<MetricGroup>, StoreError>;

    async fn list_fact_tables(&self, organization: &str) -> Result<Vec<FactTable>, StoreError>;

    async fn update_fact_table(&self, fact_table: FactTable) -> Result<(), StoreError>;

    // Features

    async fn list_features(&self, organization: &str) -> Result<Vec<Feature>, StoreError>;

    async fn update_feature(&self, feature: Feature) -> Result<(), StoreError>;

    // Snapshots

    /// Insert a new snapshot; fails with `Conflict` if the id exists.
    async fn create_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>, StoreError>;

    async fn update_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Apply `change` to a snapshot only while it is still running.
    ///
    /// The status check and the write happen atomically, so concurrent
    /// finalize and cancel calls cannot overwrite each other's terminal state.
    async fn update_running_snapshot(
        &self,
        id: Uuid,
        change: &(dyn for<'s> Fn(&'s Snapshot) -> Snapshot + Send + Sync),
    ) -> Result<SnapshotUpdate, StoreError>;

    /// Most recently created whole-population snapshot of an entity.
    async fn find_latest_snapshot(&self, entity: &EntityRef, phase: Option<usize>)
        -> Result<Option<Snapshot>, StoreError>;

    // Queries

    async fn create_query(&self, query: QueryRecord) -> Result<(), StoreError>;

    async fn get_query(&self, id: Uuid) -> Result<Option<QueryRecord>, StoreError>;

    async fn update_query(&self, query: QueryRecord) -> Result<(), StoreError>;

    /// Latest succeeded query of `organization` with this fingerprint that
    /// started at or after `since`.
    async fn find_cached_query(
        &self,
        organization: &str,
        fingerprint: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<QueryRecord>, StoreError>;

    /// Reachability probe.
    async fn ping(&self) -> Result<(), StoreError>;
}
