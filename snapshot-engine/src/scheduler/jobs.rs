//! Sweep and unit job handlers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, instrument, warn};

use super::maintenance::MaintenanceJobs;
use super::{JobError, JobHandler, SchedulerHandle};
use crate::clients::AnalysisStore;
use crate::contracts::{
    CreateSnapshotRequest, EntityKind, EntityRef, JobKind, ScheduledJob, Snapshot, SnapshotTrigger, UnitJobPayload,
};
use crate::snapshots::SnapshotOrchestrator;
use crate::telemetry::SnapshotTelemetry;

/// Dispatches every job kind the engine knows.
pub struct EngineJobHandler {
    store: Arc<dyn AnalysisStore>,
    orchestrator: Arc<SnapshotOrchestrator>,
    maintenance: MaintenanceJobs,
    telemetry: SnapshotTelemetry,
}

impl EngineJobHandler {
    pub fn new(
        orchestrator: Arc<SnapshotOrchestrator>,
        maintenance: MaintenanceJobs,
        telemetry: SnapshotTelemetry,
    ) -> Self {
        Self {
            store: Arc::clone(orchestrator.store()),
            orchestrator,
            maintenance,
            telemetry,
        }
    }

    /// Enqueue one unit job per due entity.
    #[instrument(skip(self, scheduler))]
    async fn sweep(&self, kind: EntityKind, scheduler: &SchedulerHandle) -> Result<(), JobError> {
        let now = Utc::now();
        let due: Vec<UnitJobPayload> = match kind {
            EntityKind::Experiment => self
                .store
                .find_due_experiments(now)
                .await?
                .into_iter()
                .map(|e| UnitJobPayload::new(e.organization, e.id))
                .collect(),
            EntityKind::SafeRollout => self
                .store
                .find_due_safe_rollouts(now)
                .await?
                .into_iter()
                .map(|r| UnitJobPayload::new(r.organization, r.id))
                .collect(),
            EntityKind::Dashboard => self
                .store
                .find_due_dashboards(now)
                .await?
                .into_iter()
                .map(|d| UnitJobPayload::new(d.organization, d.id))
                .collect(),
            EntityKind::StaleFeatures | EntityKind::InformationSchema | EntityKind::FactTableTopValues => self
                .store
                .list_organizations()
                .await?
                .into_iter()
                .map(|org| UnitJobPayload::new(org.clone(), org))
                .collect(),
        };

        let total = due.len();
        let mut failed = 0;
        for payload in &due {
            if let Err(e) = scheduler.queue_unit_job(kind, payload).await {
                warn!(entity = %payload.entity_id, error = %e, "Failed to enqueue unit job");
                failed += 1;
            }
        }

        info!(due = total, failed, "Sweep finished");

        if failed > 0 {
            return Err(JobError::Partial {
                task: "enqueue",
                failed,
                total,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, payload), fields(organization = %payload.organization, experiment = %payload.entity_id))]
    async fn update_experiment(&self, payload: &UnitJobPayload) -> Result<(), JobError> {
        let experiment = self
            .store
            .get_experiment(&payload.organization, &payload.entity_id)
            .await?
            .ok_or_else(|| JobError::EntityNotFound(payload.entity_id.clone()))?;

        // Push the next attempt first so a failing run is not retried every sweep.
        self.store.update_experiment(experiment.with_next_attempt(Utc::now())).await?;

        let snapshot = self
            .orchestrator
            .create_snapshot(scheduled_request(experiment.entity_ref(), latest_phase(experiment.phases.len()), None))
            .await?;

        log_snapshot(&snapshot);
        Ok(())
    }

    #[instrument(skip(self, payload), fields(organization = %payload.organization, rollout = %payload.entity_id))]
    async fn update_safe_rollout(&self, payload: &UnitJobPayload) -> Result<(), JobError> {
        let rollout = self
            .store
            .get_safe_rollout(&payload.organization, &payload.entity_id)
            .await?
            .ok_or_else(|| JobError::EntityNotFound(payload.entity_id.clone()))?;

        self.store.update_safe_rollout(rollout.with_next_update(Utc::now())).await?;

        let snapshot = self
            .orchestrator
            .create_snapshot(scheduled_request(rollout.entity_ref(), 0, None))
            .await?;

        log_snapshot(&snapshot);
        Ok(())
    }

    /// Refresh a dashboard's experiment. Any failure turns the dashboard's
    /// auto updates off.
    #[instrument(skip(self, payload), fields(organization = %payload.organization, dashboard = %payload.entity_id))]
    async fn update_dashboard(&self, payload: &UnitJobPayload) -> Result<(), JobError> {
        let dashboard = self
            .store
            .get_dashboard(&payload.organization, &payload.entity_id)
            .await?
            .ok_or_else(|| JobError::EntityNotFound(payload.entity_id.clone()))?;

        let result = self.refresh_dashboard(&dashboard).await;

        if let Err(e) = &result {
            let reason = e.to_string();
            warn!(error = %reason, "Dashboard refresh failed, disabling auto updates");

            // Re-read so the pushed next update survives.
            let current = match self.store.get_dashboard(&dashboard.organization, &dashboard.id).await {
                Ok(Some(current)) => current,
                Ok(None) => dashboard.clone(),
                Err(store_err) => {
                    error!(error = %store_err, "Failed to reload dashboard");
                    dashboard.clone()
                }
            };

            match self.store.update_dashboard(current.with_auto_updates_disabled()).await {
                Ok(()) => self.telemetry.auto_update_disabled(&current, &reason),
                Err(store_err) => error!(error = %store_err, "Failed to disable dashboard auto updates"),
            }
        }

        result
    }

    async fn refresh_dashboard(&self, dashboard: &crate::contracts::Dashboard) -> Result<(), JobError> {
        self.store.update_dashboard(dashboard.with_next_update(Utc::now())).await?;

        let experiment = self
            .store
            .get_experiment(&dashboard.organization, &dashboard.experiment_id)
            .await?
            .ok_or_else(|| JobError::EntityNotFound(dashboard.experiment_id.clone()))?;

        let snapshot = self
            .orchestrator
            .create_snapshot(scheduled_request(
                experiment.entity_ref(),
                latest_phase(experiment.phases.len()),
                dashboard.dimension.clone(),
            ))
            .await?;

        log_snapshot(&snapshot);
        Ok(())
    }
}

#[async_trait]
impl JobHandler for EngineJobHandler {
    async fn handle(&self, job: &ScheduledJob, scheduler: &SchedulerHandle) -> Result<(), JobError> {
        let kind = match job.kind {
            JobKind::Sweep(kind) => return self.sweep(kind, scheduler).await,
            JobKind::Unit(kind) => kind,
        };

        let payload = job.unit_payload()?;
        match kind {
            EntityKind::Experiment => self.update_experiment(&payload).await,
            EntityKind::SafeRollout => self.update_safe_rollout(&payload).await,
            EntityKind::Dashboard => self.update_dashboard(&payload).await,
            EntityKind::StaleFeatures => self.maintenance.recompute_stale_features(&payload.organization).await,
            EntityKind::InformationSchema => self.maintenance.refresh_information_schemas(&payload.organization).await,
            EntityKind::FactTableTopValues => self.maintenance.refresh_top_values(&payload.organization).await,
        }
    }
}

fn scheduled_request(entity: EntityRef, phase: usize, dimension: Option<String>) -> CreateSnapshotRequest {
    CreateSnapshotRequest {
        entity,
        phase,
        dimension,
        use_cache: true,
        trigger: SnapshotTrigger::Schedule,
    }
}

/// Index of the most recent phase. Entities without phases map to 0 and are
/// rejected by the orchestrator.
fn latest_phase(phases: usize) -> usize {
    phases.saturating_sub(1)
}

fn log_snapshot(snapshot: &Snapshot) {
    info!(snapshot_id = %snapshot.id, status = %snapshot.status, "Scheduled snapshot finished");
}
