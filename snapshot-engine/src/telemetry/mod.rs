//! Telemetry Module
//!
//! Typed lifecycle events for snapshots, queries and jobs, emitted as
//! structured `tracing` events. Emission never fails and never blocks the
//! caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contracts::{Dashboard, QueryRecord, ScheduledJob, Snapshot, SnapshotStatus};

/// Telemetry event types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventType {
    SnapshotCreated,
    QueryStarted,
    QuerySucceeded,
    QueryFailed,
    QueryCacheHit,
    SnapshotFinalized,
    SnapshotCancelled,
    JobEnqueued,
    JobFailed,
    AutoUpdateDisabled,
}

impl TelemetryEventType {
    fn is_warning(&self) -> bool {
        matches!(self, Self::QueryFailed | Self::JobFailed | Self::AutoUpdateDisabled)
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_id: Uuid,
    pub event_type: TelemetryEventType,
    pub timestamp: DateTime<Utc>,

    /// Snapshot the event belongs to, if any
    pub snapshot_id: Option<Uuid>,

    /// Entity the event is about, formatted as `kind:organization/id`
    pub entity: Option<String>,

    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    fn new(event_type: TelemetryEventType, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            snapshot_id: None,
            entity: None,
            payload,
        }
    }

    fn for_snapshot(mut self, snapshot_id: Uuid) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }

    fn for_entity(mut self, entity: impl ToString) -> Self {
        self.entity = Some(entity.to_string());
        self
    }
}

/// Emitter for snapshot engine lifecycle events.
#[derive(Debug, Clone)]
pub struct SnapshotTelemetry {
    enabled: bool,

    /// Also log the full event as JSON at debug level
    emit_json: bool,
}

impl Default for SnapshotTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotTelemetry {
    pub fn new() -> Self {
        Self {
            enabled: true,
            emit_json: true,
        }
    }

    /// An emitter that drops every event.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            emit_json: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn snapshot_created(&self, snapshot: &Snapshot) {
        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::SnapshotCreated,
                serde_json::json!({
                    "phase": snapshot.phase,
                    "dimension": snapshot.dimension,
                    "trigger": snapshot.trigger,
                    "use_cache": snapshot.use_cache,
                }),
            )
            .for_snapshot(snapshot.id)
            .for_entity(&snapshot.entity),
        );
    }

    pub fn query_started(&self, query: &QueryRecord) {
        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::QueryStarted,
                serde_json::json!({ "query_id": query.id, "name": query.name, "datasource": query.datasource }),
            )
            .for_snapshot(query.snapshot_id),
        );
    }

    pub fn query_succeeded(&self, query: &QueryRecord) {
        let duration_ms = query
            .finished_at
            .map(|finished| (finished - query.started_at).num_milliseconds());

        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::QuerySucceeded,
                serde_json::json!({
                    "query_id": query.id,
                    "name": query.name,
                    "rows": query.rows.len(),
                    "duration_ms": duration_ms,
                }),
            )
            .for_snapshot(query.snapshot_id),
        );
    }

    pub fn query_failed(&self, query: &QueryRecord) {
        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::QueryFailed,
                serde_json::json!({ "query_id": query.id, "name": query.name, "error": query.error }),
            )
            .for_snapshot(query.snapshot_id),
        );
    }

    pub fn query_cache_hit(&self, query: &QueryRecord, source_query: Uuid) {
        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::QueryCacheHit,
                serde_json::json!({ "query_id": query.id, "name": query.name, "source_query_id": source_query }),
            )
            .for_snapshot(query.snapshot_id),
        );
    }

    pub fn snapshot_finalized(&self, snapshot: &Snapshot) {
        let duration_ms = snapshot
            .finalized_at
            .map(|finished| (finished - snapshot.created_at).num_milliseconds());

        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::SnapshotFinalized,
                serde_json::json!({
                    "status": snapshot.status,
                    "metrics": snapshot.results.len(),
                    "failed_queries": snapshot.failed_queries.len(),
                    "srm_warning": snapshot.health.as_ref().map(|h| h.srm_warning),
                    "duration_ms": duration_ms,
                }),
            )
            .for_snapshot(snapshot.id)
            .for_entity(&snapshot.entity),
        );
    }

    pub fn snapshot_cancelled(&self, snapshot_id: Uuid, previous: SnapshotStatus) {
        self.emit(
            TelemetryEvent::new(
                TelemetryEventType::SnapshotCancelled,
                serde_json::json!({ "previous_status": previous }),
            )
            .for_snapshot(snapshot_id),
        );
    }

    pub fn job_enqueued(&self, job: &ScheduledJob) {
        self.emit(TelemetryEvent::new(
            TelemetryEventType::JobEnqueued,
            serde_json::json!({
                "job_id": job.id,
                "kind": job.kind.to_string(),
                "unique_key": job.unique_key,
                "run_at": job.run_at,
            }),
        ));
    }

    pub fn job_failed(&self, job: &ScheduledJob, error: &str) {
        self.emit(TelemetryEvent::new(
            TelemetryEventType::JobFailed,
            serde_json::json!({
                "job_id": job.id,
                "kind": job.kind.to_string(),
                "unique_key": job.unique_key,
                "attempts": job.attempts,
                "error": error,
            }),
        ));
    }

    pub fn auto_update_disabled(&self, dashboard: &Dashboard, reason: &str) {
        self.emit(TelemetryEvent::new(
            TelemetryEventType::AutoUpdateDisabled,
            serde_json::json!({
                "dashboard_id": dashboard.id,
                "organization": dashboard.organization,
                "experiment_id": dashboard.experiment_id,
                "reason": reason,
            }),
        ));
    }

    fn emit(&self, event: TelemetryEvent) {
        if !self.enabled {
            return;
        }

        if event.event_type.is_warning() {
            warn!(
                event_type = ?event.event_type,
                snapshot_id = ?event.snapshot_id,
                entity = ?event.entity,
                "Telemetry event"
            );
        } else {
            info!(
                event_type = ?event.event_type,
                snapshot_id = ?event.snapshot_id,
                entity = ?event.entity,
                "Telemetry event"
            );
        }

        if self.emit_json {
            if let Ok(json) = serde_json::to_string(&event) {
                debug!(telemetry = %json);
            }
        }
    }
}
