//! Snapshot Orchestrator
//!
//! Entry point for analysing an experiment or safe rollout. One call to
//! [`SnapshotOrchestrator::create_snapshot`]:
//!
//! 1. checks the entity's preconditions (not draft, has phases, datasource
//!    resolves to a live warehouse) and fails without creating anything when
//!    one is violated
//! 2. resolves eligible dimensions and the metric list
//! 3. creates the snapshot in `running` state
//! 4. runs the planned queries through the [`QueryRunner`]
//! 5. computes health and metric statistics from the succeeded queries
//! 6. finalizes the snapshot with the run's terminal status
//!
//! The call blocks until the snapshot is final, which for large warehouses
//! can take tens of minutes. Runs are bounded by
//! [`OrchestratorConfig::run_timeout`]. A run whose future is dropped before
//! it finalizes (an aborted job, a shutdown) has its snapshot marked failed.
//!
//! Every write that moves a snapshot out of `running` goes through
//! [`AnalysisStore::update_running_snapshot`], so a cancellation and a
//! finalization racing each other leave exactly one of them on the record.

pub mod analysis;
pub mod plan;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::clients::{AnalysisStore, SnapshotUpdate, StoreError, WarehouseError, WarehouseRegistry};
use crate::contracts::{
    AnalysisKind, AnalysisTarget, CreateSnapshotRequest, EntityRef, ExperimentStatus, MetricDefinition, MetricRefs,
    Snapshot, SnapshotOutcome, SnapshotStatus,
};
use crate::dimensions::{DimensionResolver, DEFAULT_MAX_DIMENSION_CELLS};
use crate::query_runner::{QueryRun, QueryRunner, QueryRunnerConfig, RunContext};
use crate::stats::engine_for;
use crate::telemetry::SnapshotTelemetry;

use analysis::{analyze, AnalysisInput};
use plan::{PlanInput, QueryPlanner};

/// Orchestrations may run this long before their queries are abandoned.
///
/// Kept under the scheduler's unit job lock so a run times out and
/// finalizes before its job is aborted.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(29 * 60);

/// Error written onto a snapshot whose run ended without finalizing it.
pub const INTERRUPTED_ERROR: &str = "snapshot run was interrupted";

/// Errors from snapshot operations.
///
/// Everything except `Store` is a precondition failure: no snapshot was
/// created.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Cannot analyse {0}: it is still a draft")]
    EntityDraft(String),

    #[error("Cannot analyse {0}: it has no phases")]
    NoPhases(String),

    #[error("Phase {phase} out of range: entity has {phases} phases")]
    PhaseOutOfRange { phase: usize, phases: usize },

    #[error("Cannot analyse {0}: no datasource selected")]
    DatasourceMissing(String),

    #[error("Datasource not found: {0}")]
    DatasourceNotFound(String),

    #[error("Datasource {datasource} unavailable: {source}")]
    DatasourceUnavailable {
        datasource: String,
        #[source]
        source: WarehouseError,
    },

    #[error("Exposure query not found: {0}")]
    ExposureQueryMissing(String),

    #[error("Unknown dimension: {0}")]
    UnknownDimension(String),

    #[error("Metric not found: {0}")]
    MetricNotFound(String),

    #[error("Snapshot not found: {0}")]
    NotFound(Uuid),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SnapshotError {
    /// Stable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "SNAPSHOT_INVALID_REQUEST",
            Self::EntityNotFound(_) => "SNAPSHOT_ENTITY_NOT_FOUND",
            Self::EntityDraft(_) => "SNAPSHOT_ENTITY_DRAFT",
            Self::NoPhases(_) => "SNAPSHOT_NO_PHASES",
            Self::PhaseOutOfRange { .. } => "SNAPSHOT_PHASE_OUT_OF_RANGE",
            Self::DatasourceMissing(_) => "SNAPSHOT_DATASOURCE_MISSING",
            Self::DatasourceNotFound(_) => "SNAPSHOT_DATASOURCE_NOT_FOUND",
            Self::DatasourceUnavailable { .. } => "SNAPSHOT_DATASOURCE_UNAVAILABLE",
            Self::ExposureQueryMissing(_) => "SNAPSHOT_EXPOSURE_QUERY_MISSING",
            Self::UnknownDimension(_) => "SNAPSHOT_UNKNOWN_DIMENSION",
            Self::MetricNotFound(_) => "SNAPSHOT_METRIC_NOT_FOUND",
            Self::NotFound(_) => "SNAPSHOT_NOT_FOUND",
            Self::Store(_) => "SNAPSHOT_STORE_ERROR",
        }
    }

    pub fn is_precondition(&self) -> bool {
        !matches!(self, Self::Store(_) | Self::NotFound(_))
    }
}

impl From<validator::ValidationErrors> for SnapshotError {
    fn from(err: validator::ValidationErrors) -> Self {
        SnapshotError::InvalidRequest(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ceiling on analysis cells for pre-computed dimensions
    pub max_dimension_cells: usize,

    /// Wall-clock bound on one run's queries
    pub run_timeout: Duration,

    pub runner: QueryRunnerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_dimension_cells: DEFAULT_MAX_DIMENSION_CELLS,
            run_timeout: DEFAULT_RUN_TIMEOUT,
            runner: QueryRunnerConfig::default(),
        }
    }
}

/// Removes a run from the active registry when the orchestration ends, and
/// fails the snapshot if it ends without being finished.
struct ActiveRun {
    registry: Arc<DashMap<Uuid, CancellationToken>>,
    store: Arc<dyn AnalysisStore>,
    snapshot_id: Uuid,
    finished: bool,
}

impl ActiveRun {
    fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        if let Some((_, token)) = self.registry.remove(&self.snapshot_id) {
            token.cancel();
        }
        if self.finished {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(snapshot_id = %self.snapshot_id, "No runtime to fail interrupted snapshot");
            return;
        };
        let store = Arc::clone(&self.store);
        let snapshot_id = self.snapshot_id;
        handle.spawn(async move {
            let interrupted = |s: &Snapshot| {
                s.finalized(SnapshotOutcome::without_results(
                    SnapshotStatus::Failed,
                    Vec::new(),
                    Some(INTERRUPTED_ERROR.to_string()),
                ))
            };
            match store.update_running_snapshot(snapshot_id, &interrupted).await {
                Ok(SnapshotUpdate::Applied(_)) => warn!(snapshot_id = %snapshot_id, "Interrupted snapshot marked failed"),
                Ok(SnapshotUpdate::AlreadyFinal(_)) => {}
                Err(e) => warn!(snapshot_id = %snapshot_id, error = %e, "Failed to mark interrupted snapshot failed"),
            }
        });
    }
}

pub struct SnapshotOrchestrator {
    store: Arc<dyn AnalysisStore>,
    warehouses: Arc<dyn WarehouseRegistry>,
    runner: QueryRunner,
    resolver: DimensionResolver,
    planner: QueryPlanner,
    telemetry: SnapshotTelemetry,
    config: OrchestratorConfig,
    active: Arc<DashMap<Uuid, CancellationToken>>,
}

impl SnapshotOrchestrator {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        warehouses: Arc<dyn WarehouseRegistry>,
        telemetry: SnapshotTelemetry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runner: QueryRunner::new(Arc::clone(&store), telemetry.clone(), config.runner.clone()),
            resolver: DimensionResolver::new(config.max_dimension_cells),
            planner: QueryPlanner,
            store,
            warehouses,
            telemetry,
            config,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn AnalysisStore> {
        &self.store
    }

    /// Number of snapshots currently being computed by this instance.
    pub fn active_runs(&self) -> usize {
        self.active.len()
    }

    /// Analyse an entity and return its finalized snapshot.
    #[instrument(skip(self, request), fields(entity = %request.entity, phase = request.phase))]
    pub async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<Snapshot, SnapshotError> {
        request.validate()?;

        let target = self.load_target(&request.entity).await?;
        let entity_label = request.entity.to_string();

        if target.status == ExperimentStatus::Draft {
            return Err(SnapshotError::EntityDraft(entity_label));
        }
        if target.phases.is_empty() {
            return Err(SnapshotError::NoPhases(entity_label));
        }
        let phase = target
            .phases
            .get(request.phase)
            .ok_or(SnapshotError::PhaseOutOfRange {
                phase: request.phase,
                phases: target.phases.len(),
            })?;

        let datasource_id = target
            .datasource
            .clone()
            .ok_or_else(|| SnapshotError::DatasourceMissing(entity_label.clone()))?;
        let datasource = self
            .store
            .get_datasource(&request.entity.organization, &datasource_id)
            .await?
            .ok_or_else(|| SnapshotError::DatasourceNotFound(datasource_id.clone()))?;
        let warehouse = self
            .warehouses
            .resolve(&datasource)
            .await
            .map_err(|source| SnapshotError::DatasourceUnavailable {
                datasource: datasource_id.clone(),
                source,
            })?;

        let exposure_query = target
            .exposure_query_id
            .as_deref()
            .and_then(|id| datasource.exposure_query(id))
            .ok_or_else(|| {
                SnapshotError::ExposureQueryMissing(target.exposure_query_id.clone().unwrap_or_default())
            })?;

        let eligible = self.resolver.resolve(
            exposure_query,
            target.incremental_refresh.as_ref(),
            target.variations.len(),
        );
        let dimension = match request.dimension.as_deref() {
            Some(id) => Some(
                eligible
                    .find(id)
                    .ok_or_else(|| SnapshotError::UnknownDimension(id.to_string()))?,
            ),
            None => None,
        };

        let metrics = self.resolve_metrics(&request.entity.organization, &target.metric_refs).await?;
        let settings = self
            .store
            .get_organization_settings(&request.entity.organization)
            .await?;

        // Preconditions hold; from here on the snapshot exists.
        let snapshot = Snapshot::start(&request, settings.stats_engine);
        self.store.create_snapshot(snapshot.clone()).await?;
        self.telemetry.snapshot_created(&snapshot);

        info!(snapshot_id = %snapshot.id, metrics = metrics.len(), "Snapshot created");

        let plan = self.planner.plan(&PlanInput {
            exposure_query,
            phase,
            metrics: &metrics,
            dimension,
            precomputed: &eligible.under_max_cells,
        });

        let cancel = CancellationToken::new();
        self.active.insert(snapshot.id, cancel.clone());
        let mut active = ActiveRun {
            registry: Arc::clone(&self.active),
            store: Arc::clone(&self.store),
            snapshot_id: snapshot.id,
            finished: false,
        };

        // The runner sees a child token so a timeout can be told apart from
        // a cancellation request.
        let execution = cancel.child_token();
        let timer = {
            let execution = execution.clone();
            let timeout = self.config.run_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => execution.cancel(),
                    _ = execution.cancelled() => {}
                }
            })
        };

        let ctx = RunContext {
            snapshot_id: snapshot.id,
            organization: request.entity.organization.clone(),
            datasource: datasource.id.clone(),
            use_cache: request.use_cache,
        };
        let run = self.runner.run(&ctx, warehouse, plan, execution.clone()).await;
        timer.abort();

        let run = match run {
            Ok(run) => run,
            Err(e) => {
                warn!(snapshot_id = %snapshot.id, error = %e, "Query run aborted by store failure");
                let message = e.to_string();
                let failed = |s: &Snapshot| {
                    s.finalized(SnapshotOutcome::without_results(
                        SnapshotStatus::Failed,
                        Vec::new(),
                        Some(message.clone()),
                    ))
                };
                match self.store.update_running_snapshot(snapshot.id, &failed).await {
                    Ok(_) => active.finish(),
                    Err(store_err) => warn!(error = %store_err, "Failed to mark snapshot failed"),
                }
                return Err(e.into());
            }
        };

        let timed_out = execution.is_cancelled() && !cancel.is_cancelled();

        let outcome = self.outcome(&run, &target, phase.variation_weights.as_slice(), &metrics, &settings, timed_out);
        let pointers = run.pointers();
        let finalize = |s: &Snapshot| s.with_queries(pointers.clone()).finalized(outcome.clone());

        let update = match self.store.update_running_snapshot(snapshot.id, &finalize).await {
            Ok(update) => update,
            Err(StoreError::NotFound { .. }) => {
                active.finish();
                return Err(SnapshotError::NotFound(snapshot.id));
            }
            Err(e) => return Err(e.into()),
        };
        active.finish();

        match update {
            SnapshotUpdate::Applied(finalized) => {
                self.telemetry.snapshot_finalized(&finalized);
                info!(snapshot_id = %finalized.id, status = %finalized.status, "Snapshot finalized");
                Ok(finalized)
            }
            SnapshotUpdate::AlreadyFinal(current) => {
                info!(snapshot_id = %snapshot.id, status = %current.status, "Snapshot was finalized during the run");
                Ok(current)
            }
        }
    }

    fn outcome(
        &self,
        run: &QueryRun,
        target: &AnalysisTarget,
        weights: &[f64],
        metrics: &[MetricDefinition],
        settings: &crate::contracts::OrganizationSettings,
        timed_out: bool,
    ) -> SnapshotOutcome {
        if timed_out {
            return SnapshotOutcome::without_results(
                SnapshotStatus::Failed,
                run.failed_queries(),
                Some(format!("timed out after {}s", self.config.run_timeout.as_secs())),
            );
        }

        match run.status {
            SnapshotStatus::Succeeded | SnapshotStatus::PartiallySucceeded => {
                let engine = engine_for(settings.stats_engine);
                let analysis = analyze(
                    run,
                    &AnalysisInput {
                        variations: &target.variations,
                        weights,
                        metrics,
                        settings,
                        engine: engine.as_ref(),
                    },
                );

                SnapshotOutcome {
                    status: run.status,
                    results: analysis.results,
                    health: analysis.health,
                    failed_queries: run.failed_queries(),
                    error: None,
                }
            }
            SnapshotStatus::Failed => {
                SnapshotOutcome::without_results(SnapshotStatus::Failed, run.failed_queries(), run.first_error())
            }
            SnapshotStatus::Cancelled | SnapshotStatus::Running => {
                SnapshotOutcome::without_results(SnapshotStatus::Cancelled, run.failed_queries(), None)
            }
        }
    }

    /// Most recent whole-population snapshot of an entity.
    pub async fn get_latest_snapshot(
        &self,
        entity: &EntityRef,
        phase: Option<usize>,
    ) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.store.find_latest_snapshot(entity, phase).await?)
    }

    /// Cancel a running snapshot.
    ///
    /// The record is marked cancelled first; in-flight queries of a run owned
    /// by this instance are then signalled. Finalized snapshots are left as
    /// they are, including one that finalizes between the read and the write.
    #[instrument(skip(self), fields(snapshot_id = %snapshot_id))]
    pub async fn cancel_snapshot(&self, snapshot_id: Uuid) -> Result<(), SnapshotError> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or(SnapshotError::NotFound(snapshot_id))?;

        if snapshot.status.is_terminal() {
            info!(status = %snapshot.status, "Snapshot already final, nothing to cancel");
            return Ok(());
        }

        let update = self
            .store
            .update_running_snapshot(snapshot_id, &|s: &Snapshot| s.cancelled())
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => SnapshotError::NotFound(snapshot_id),
                other => SnapshotError::Store(other),
            })?;

        if let SnapshotUpdate::AlreadyFinal(current) = update {
            debug!(status = %current.status, "Snapshot finalized before it could be cancelled");
            return Ok(());
        }

        match self.active.get(&snapshot_id) {
            Some(token) => token.cancel(),
            None => warn!("Snapshot is not running on this instance; only the record was cancelled"),
        }

        self.telemetry.snapshot_cancelled(snapshot_id, snapshot.status);
        Ok(())
    }

    async fn load_target(&self, entity: &EntityRef) -> Result<AnalysisTarget, SnapshotError> {
        let target = match entity.kind {
            AnalysisKind::Experiment => self
                .store
                .get_experiment(&entity.organization, &entity.id)
                .await?
                .map(|e| AnalysisTarget::from(&e)),
            AnalysisKind::SafeRollout => self
                .store
                .get_safe_rollout(&entity.organization, &entity.id)
                .await?
                .map(|r| AnalysisTarget::from(&r)),
        };

        target.ok_or_else(|| SnapshotError::EntityNotFound(entity.to_string()))
    }

    /// Expand metric groups and load definitions, keeping first-seen order.
    async fn resolve_metrics(
        &self,
        organization: &str,
        references: &[String],
    ) -> Result<Vec<MetricDefinition>, SnapshotError> {
        let mut ids = Vec::new();
        for reference in references {
            if MetricRefs::is_group(reference) {
                let group = self
                    .store
                    .get_metric_group(organization, reference)
                    .await?
                    .ok_or_else(|| SnapshotError::MetricNotFound(reference.clone()))?;
                ids.extend(group.metrics);
            } else {
                ids.push(reference.clone());
            }
        }

        let mut seen = HashSet::new();
        let mut metrics = Vec::new();
        for id in ids.into_iter().filter(|id| seen.insert(id.clone())) {
            let metric = self
                .store
                .get_metric(organization, &id)
                .await?
                .ok_or(SnapshotError::MetricNotFound(id))?;
            metrics.push(metric);
        }

        Ok(metrics)
    }
}
