//! Scheduler
//!
//! Recurring sweeps find entities whose next update is due and enqueue one
//! unit job per entity. Unit jobs refresh a single experiment, rollout or
//! dashboard, or run an organization-wide maintenance task.
//!
//! Workers claim due jobs from the [`JobQueue`], run them with bounded
//! concurrency and a per-job timeout equal to the job's lock lifetime, and
//! report the outcome back under the attempt they claimed. A failing job is
//! logged and never stops the loop.

pub mod jobs;
pub mod maintenance;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clients::{StoreError, WarehouseError};
use crate::contracts::{
    EntityKind, NewJob, ScheduledJob, UnitJobPayload, DEFAULT_LOCK_LIFETIME, MAINTENANCE_SWEEP_INTERVAL,
    SNAPSHOT_SWEEP_INTERVAL, UNIT_JOB_LOCK_LIFETIME,
};
use crate::snapshots::SnapshotError;
use crate::telemetry::SnapshotTelemetry;

pub use jobs::EngineJobHandler;
pub use maintenance::{MaintenanceJobs, STALE_FEATURE_AGE_DAYS, TOP_VALUES_LIMIT};
pub use queue::{InMemoryJobQueue, JobQueue, JobSelector};

/// Errors from the job queue.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue backend error: {0}")]
    Backend(String),
}

/// Errors from a single job. They are logged and recorded on the job, never
/// propagated out of the worker loop.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("Queue error: {0}")]
    Queue(#[from] SchedulerError),

    #[error("{failed} of {total} {task} steps failed")]
    Partial { task: &'static str, failed: usize, total: usize },

    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    #[error("Job panicked: {0}")]
    Panicked(String),
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::InvalidPayload(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Jobs processed at the same time
    pub concurrency: usize,

    /// Delay between queue polls when idle
    pub poll_interval: Duration,

    /// Sweep interval for experiments, rollouts and dashboards
    pub snapshot_sweep_interval: Duration,

    /// Sweep interval for organization maintenance
    pub maintenance_sweep_interval: Duration,

    /// Lock lifetime of unit jobs that run a snapshot
    pub unit_lock_lifetime: Duration,

    /// Lock lifetime of every other job
    pub default_lock_lifetime: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(1000),
            snapshot_sweep_interval: SNAPSHOT_SWEEP_INTERVAL,
            maintenance_sweep_interval: MAINTENANCE_SWEEP_INTERVAL,
            unit_lock_lifetime: UNIT_JOB_LOCK_LIFETIME,
            default_lock_lifetime: DEFAULT_LOCK_LIFETIME,
        }
    }
}

impl SchedulerConfig {
    pub fn sweep_interval(&self, kind: EntityKind) -> Duration {
        if kind.triggers_snapshots() {
            self.snapshot_sweep_interval
        } else {
            self.maintenance_sweep_interval
        }
    }

    pub fn unit_lock_lifetime(&self, kind: EntityKind) -> Duration {
        if kind.triggers_snapshots() {
            self.unit_lock_lifetime
        } else {
            self.default_lock_lifetime
        }
    }
}

/// Processes claimed jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &ScheduledJob, scheduler: &SchedulerHandle) -> Result<(), JobError>;
}

/// Enqueue side of the scheduler, handed to job handlers so sweeps can fan
/// out unit jobs.
#[derive(Clone)]
pub struct SchedulerHandle {
    queue: Arc<dyn JobQueue>,
    telemetry: SnapshotTelemetry,
    config: SchedulerConfig,
}

impl SchedulerHandle {
    pub fn new(queue: Arc<dyn JobQueue>, telemetry: SnapshotTelemetry, config: SchedulerConfig) -> Self {
        Self {
            queue,
            telemetry,
            config,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Queue processing of one entity. A job already pending for the entity
    /// is moved to now instead of duplicated.
    pub async fn queue_unit_job(
        &self,
        kind: EntityKind,
        payload: &UnitJobPayload,
    ) -> Result<ScheduledJob, SchedulerError> {
        let job = NewJob::unit(kind, payload).with_lock_lifetime(self.config.unit_lock_lifetime(kind));
        let scheduled = self.queue.enqueue(job).await?;
        self.telemetry.job_enqueued(&scheduled);
        Ok(scheduled)
    }

    /// Queue a recurring sweep, running it now.
    pub async fn queue_sweep(&self, kind: EntityKind) -> Result<ScheduledJob, SchedulerError> {
        let job = NewJob::sweep(kind, Some(self.config.sweep_interval(kind)))
            .with_lock_lifetime(self.config.default_lock_lifetime);
        let scheduled = self.queue.schedule_recurring(job).await?;
        self.telemetry.job_enqueued(&scheduled);
        Ok(scheduled)
    }

    pub async fn cancel_job(&self, selector: JobSelector) -> Result<bool, SchedulerError> {
        self.queue.cancel(selector).await
    }
}

pub struct Scheduler {
    handle: SchedulerHandle,
    handler: Arc<dyn JobHandler>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        handler: Arc<dyn JobHandler>,
        telemetry: SnapshotTelemetry,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            handle: SchedulerHandle::new(queue, telemetry, config),
            handler,
        }
    }

    pub fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.handle.config
    }

    pub async fn queue_unit_job(
        &self,
        kind: EntityKind,
        payload: &UnitJobPayload,
    ) -> Result<ScheduledJob, SchedulerError> {
        self.handle.queue_unit_job(kind, payload).await
    }

    pub async fn queue_sweep(&self, kind: EntityKind) -> Result<ScheduledJob, SchedulerError> {
        self.handle.queue_sweep(kind).await
    }

    /// Register the recurring sweep of every entity kind.
    pub async fn register_sweeps(&self) -> Result<(), SchedulerError> {
        for kind in EntityKind::ALL {
            self.queue_sweep(kind).await?;
        }
        info!(sweeps = EntityKind::ALL.len(), "Recurring sweeps registered");
        Ok(())
    }

    /// Claim and run due jobs until `shutdown` fires.
    ///
    /// Jobs still running at shutdown are aborted; their locks expire and
    /// another worker picks them up.
    pub async fn run(&self, shutdown: CancellationToken) {
        let concurrency = self.config().concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks = JoinSet::new();

        info!(concurrency, "Scheduler started");

        loop {
            let free = semaphore.available_permits();
            if free > 0 {
                match self.handle.queue.claim_due(Utc::now(), free).await {
                    Ok(jobs) => {
                        for job in jobs {
                            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                                break;
                            };
                            let handle = self.handle.clone();
                            let handler = Arc::clone(&self.handler);
                            tasks.spawn(async move {
                                process_job(job, handler, handle).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to claim due jobs"),
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config().poll_interval) => {}
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        let in_flight = tasks.len();
        tasks.shutdown().await;
        info!(in_flight, "Scheduler stopped");
    }

    /// Claim and run every job due now, one pass, without the poll loop.
    pub async fn run_due(&self) -> Result<usize, SchedulerError> {
        let limit = self.config().concurrency.max(1);
        let mut processed = 0;

        loop {
            let jobs = self.handle.queue.claim_due(Utc::now(), limit).await?;
            if jobs.is_empty() {
                return Ok(processed);
            }

            let mut batch = JoinSet::new();
            for job in jobs {
                batch.spawn(process_job(job, Arc::clone(&self.handler), self.handle.clone()));
            }
            while batch.join_next().await.is_some() {
                processed += 1;
            }
        }
    }
}

/// Run one job to completion and report the outcome to the queue.
#[instrument(skip(job, handler, handle), fields(job_id = %job.id, kind = %job.kind, attempt = job.attempts))]
async fn process_job(job: ScheduledJob, handler: Arc<dyn JobHandler>, handle: SchedulerHandle) {
    let lock_lifetime = job.lock_lifetime();
    let started = std::time::Instant::now();

    let mut task = {
        let job = job.clone();
        let handle = handle.clone();
        tokio::spawn(async move { handler.handle(&job, &handle).await })
    };

    let result = match tokio::time::timeout(lock_lifetime, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(JobError::Panicked(join_error.to_string())),
        Err(_) => {
            task.abort();
            Err(JobError::Timeout(lock_lifetime))
        }
    };

    let error = match result {
        Ok(()) => {
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Job completed");
            None
        }
        Err(e) => {
            warn!(error = %e, "Job failed");
            handle.telemetry.job_failed(&job, &e.to_string());
            Some(e.to_string())
        }
    };

    if let Err(e) = handle.queue.complete(job.id, job.attempts, error).await {
        error!(error = %e, "Failed to release job");
    }
}
