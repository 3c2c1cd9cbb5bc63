//! Scheduled Job Contracts

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default interval between sweeps that trigger snapshots.
pub const SNAPSHOT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Default interval between organization-wide maintenance sweeps.
pub const MAINTENANCE_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock lifetime for unit jobs that run a full snapshot orchestration.
pub const UNIT_JOB_LOCK_LIFETIME: Duration = Duration::from_secs(30 * 60);

/// Lock lifetime for jobs that only touch the store.
pub const DEFAULT_LOCK_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Entity types monitored by the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Experiment,
    SafeRollout,
    Dashboard,
    StaleFeatures,
    InformationSchema,
    FactTableTopValues,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Experiment,
        EntityKind::SafeRollout,
        EntityKind::Dashboard,
        EntityKind::StaleFeatures,
        EntityKind::InformationSchema,
        EntityKind::FactTableTopValues,
    ];

    /// Whether unit jobs of this kind run a snapshot orchestration.
    pub fn triggers_snapshots(&self) -> bool {
        matches!(self, Self::Experiment | Self::SafeRollout | Self::Dashboard)
    }

    pub fn default_sweep_interval(&self) -> Duration {
        if self.triggers_snapshots() {
            SNAPSHOT_SWEEP_INTERVAL
        } else {
            MAINTENANCE_SWEEP_INTERVAL
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Experiment => "experiment",
            Self::SafeRollout => "safe_rollout",
            Self::Dashboard => "dashboard",
            Self::StaleFeatures => "stale_features",
            Self::InformationSchema => "information_schema",
            Self::FactTableTopValues => "fact_table_top_values",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does: scan for due entities, or process one of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "entity", rename_all = "snake_case")]
pub enum JobKind {
    Sweep(EntityKind),
    Unit(EntityKind),
}

impl JobKind {
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            Self::Sweep(kind) | Self::Unit(kind) => *kind,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sweep(kind) => write!(f, "sweep:{}", kind),
            Self::Unit(kind) => write!(f, "unit:{}", kind),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
}

/// Identity of the entity a unit job processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UnitJobPayload {
    pub organization: String,
    pub entity_id: String,
}

impl UnitJobPayload {
    pub fn new(organization: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            entity_id: entity_id.into(),
        }
    }

    /// Uniqueness key: at most one pending or running job per key.
    pub fn unique_key(&self, kind: EntityKind) -> String {
        format!("{}:{}:{}", kind, self.organization, self.entity_id)
    }
}

/// A job as stored by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub unique_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    /// While running, the job is owned by its worker until this instant
    pub lock_until: Option<DateTime<Utc>>,
    pub lock_lifetime_ms: u64,
    /// Set for recurring jobs; they are rescheduled instead of removed
    pub recurring_interval_secs: Option<u64>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn lock_lifetime(&self) -> Duration {
        Duration::from_millis(self.lock_lifetime_ms)
    }

    pub fn recurring_interval(&self) -> Option<Duration> {
        self.recurring_interval_secs.map(Duration::from_secs)
    }

    pub fn unit_payload(&self) -> Result<UnitJobPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub unique_key: Option<String>,
    pub payload: serde_json::Value,
    pub run_at: DateTime<Utc>,
    pub lock_lifetime: Duration,
    pub recurring_interval: Option<Duration>,
}

impl NewJob {
    /// A one-shot unit job keyed by its entity.
    pub fn unit(kind: EntityKind, payload: &UnitJobPayload) -> Self {
        let lock_lifetime = if kind.triggers_snapshots() {
            UNIT_JOB_LOCK_LIFETIME
        } else {
            DEFAULT_LOCK_LIFETIME
        };

        Self {
            kind: JobKind::Unit(kind),
            unique_key: Some(payload.unique_key(kind)),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            run_at: Utc::now(),
            lock_lifetime,
            recurring_interval: None,
        }
    }

    /// A payload-less sweep; recurring when an interval is given.
    pub fn sweep(kind: EntityKind, interval: Option<Duration>) -> Self {
        Self {
            kind: JobKind::Sweep(kind),
            unique_key: Some(format!("sweep:{}", kind)),
            payload: serde_json::Value::Null,
            run_at: Utc::now(),
            lock_lifetime: DEFAULT_LOCK_LIFETIME,
            recurring_interval: interval,
        }
    }

    pub fn with_lock_lifetime(mut self, lock_lifetime: Duration) -> Self {
        self.lock_lifetime = lock_lifetime;
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kind_serialization() {
        let json = serde_json::to_value(JobKind::Unit(EntityKind::SafeRollout)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "unit", "entity": "safe_rollout"}));
        assert_eq!(JobKind::Sweep(EntityKind::Dashboard).to_string(), "sweep:dashboard");
    }

    #[test]
    fn test_unit_job_defaults() {
        let payload = UnitJobPayload::new("org_1", "exp_1");
        let job = NewJob::unit(EntityKind::Experiment, &payload);

        assert_eq!(job.unique_key.as_deref(), Some("experiment:org_1:exp_1"));
        assert_eq!(job.lock_lifetime, UNIT_JOB_LOCK_LIFETIME);
        assert!(job.recurring_interval.is_none());

        let maintenance = NewJob::unit(EntityKind::InformationSchema, &UnitJobPayload::new("org_1", "org_1"));
        assert_eq!(maintenance.lock_lifetime, DEFAULT_LOCK_LIFETIME);
    }

    #[test]
    fn test_sweep_intervals() {
        assert_eq!(EntityKind::Experiment.default_sweep_interval(), Duration::from_secs(600));
        assert_eq!(EntityKind::FactTableTopValues.default_sweep_interval(), Duration::from_secs(86_400));
    }
}
