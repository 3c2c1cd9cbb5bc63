//! Experiment Snapshot Engine
//!
//! Turns warehouse data into immutable analysis snapshots for A/B
//! experiments and safe rollouts, and keeps them fresh on a schedule.
//!
//! # Components
//!
//! - [`stats`]: pure statistics (SRM check, power, frequentist and Bayesian
//!   comparisons)
//! - [`dimensions`]: which slice axes an experiment may be broken down by
//! - [`query_runner`]: concurrent sub-query execution with caching and
//!   cancellation
//! - [`snapshots`]: the orchestrator that validates, plans, runs, analyses
//!   and finalizes a snapshot
//! - [`scheduler`]: job queue, recurring sweeps and per-entity refresh jobs
//!
//! Supporting modules:
//!
//! - [`contracts`]: entity, snapshot, query and job types
//! - [`clients`]: store and warehouse traits with in-memory and HTTP
//!   implementations
//! - [`telemetry`]: structured lifecycle events
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use snapshot_engine::clients::{InMemoryStore, SqlGatewayClient, SqlGatewayConfig, SqlGatewayRegistry};
//! use snapshot_engine::contracts::{CreateSnapshotRequest, EntityRef, SnapshotTrigger};
//! use snapshot_engine::snapshots::{OrchestratorConfig, SnapshotOrchestrator};
//! use snapshot_engine::telemetry::SnapshotTelemetry;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let gateway = SqlGatewayClient::new(SqlGatewayConfig::new(gateway_url))?;
//! let orchestrator = SnapshotOrchestrator::new(
//!     store,
//!     Arc::new(SqlGatewayRegistry::new(gateway)),
//!     SnapshotTelemetry::new(),
//!     OrchestratorConfig::default(),
//! );
//!
//! let snapshot = orchestrator
//!     .create_snapshot(CreateSnapshotRequest {
//!         entity: EntityRef::experiment("exp_1", "org_1"),
//!         phase: 0,
//!         dimension: None,
//!         use_cache: true,
//!         trigger: SnapshotTrigger::Manual,
//!     })
//!     .await?;
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

pub mod clients;
pub mod contracts;
pub mod dimensions;
pub mod query_runner;
pub mod scheduler;
pub mod snapshots;
pub mod stats;
pub mod telemetry;

pub use clients::{AnalysisStore, InMemoryStore, StoreError, Warehouse, WarehouseError, WarehouseRegistry};
pub use dimensions::{DimensionResolver, EligibleDimensions};
pub use query_runner::{QueryRun, QueryRunner, QueryRunnerConfig};
pub use scheduler::{
    EngineJobHandler, InMemoryJobQueue, JobError, JobHandler, JobQueue, MaintenanceJobs, Scheduler, SchedulerConfig,
    SchedulerError,
};
pub use snapshots::{OrchestratorConfig, SnapshotError, SnapshotOrchestrator};
pub use telemetry::SnapshotTelemetry;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
