//! Integration Tests for the Snapshot Engine
//!
//! These tests drive the orchestrator and scheduler end to end against the
//! in-memory store and a scripted warehouse.
//!
//! # Test Categories
//!
//! 1. **Preconditions**: invalid entities fail before anything is persisted
//! 2. **Orchestration**: full, partial and cached runs, cache isolation
//! 3. **Cancellation**: cancelling a running snapshot, cancel racing finalize
//! 4. **Scheduling**: dedupe, sweeps, dashboard auto-update handling and
//!    unit job timeouts

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};

use snapshot_engine::clients::{
    AnalysisStore, InMemoryStore, QueryOutput, Warehouse, WarehouseError, WarehouseRegistry,
};
use snapshot_engine::contracts::{
    CreateSnapshotRequest, Dashboard, DatasourceConfig, DimensionMetadata, EntityKind, EntityRef, Experiment,
    ExperimentStatus, ExposureQuery, MetricDefinition, MetricGroup, MetricRefs, Phase, Row, SnapshotStatus,
    SnapshotTrigger, UnitJobPayload, Variation,
};
use snapshot_engine::scheduler::{EngineJobHandler, InMemoryJobQueue, JobQueue, MaintenanceJobs, Scheduler, SchedulerConfig};
use snapshot_engine::snapshots::{OrchestratorConfig, SnapshotError, SnapshotOrchestrator};
use snapshot_engine::telemetry::SnapshotTelemetry;

// ============================================================================
// TEST FIXTURES
// ============================================================================

const ORG: &str = "org_1";

/// Answers queries by the `-- <name>` marker on their first line.
///
/// Metric ids containing `fail` error out, ids containing `hang` never
/// return.
#[derive(Default)]
struct ScriptedWarehouse {
    calls: AtomicUsize,
}

impl ScriptedWarehouse {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn rows(values: Vec<Value>) -> Vec<Row> {
    values.into_iter().filter_map(|v| v.as_object().cloned()).collect()
}

fn metric_rows(dimension_values: &[&str]) -> Vec<Row> {
    let mut out = Vec::new();
    for dimension in dimension_values {
        out.push(json!({"variation": "0", "dimension": dimension, "users": 500, "count": 200,
                        "main_sum": 500.0, "main_sum_squares": 2500.0}));
        out.push(json!({"variation": "1", "dimension": dimension, "users": 510, "count": 230,
                        "main_sum": 612.0, "main_sum_squares": 3100.0}));
    }
    rows(out)
}

#[async_trait]
impl Warehouse for ScriptedWarehouse {
    async fn run_query(&self, _query_id: &str, sql: &str) -> Result<QueryOutput, WarehouseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let name = sql
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("-- "))
            .unwrap_or_default()
            .to_string();

        if name.contains("hang") {
            std::future::pending::<()>().await;
        }
        if name.contains("fail") {
            return Err(WarehouseError::Query(format!("{} exploded", name)));
        }

        let output = if name == "traffic" {
            rows(vec![
                json!({"variation": "0", "users": 1000}),
                json!({"variation": "1", "users": 1020}),
            ])
        } else if name.starts_with("traffic:") {
            rows(vec![
                json!({"variation": "0", "dimension": "US", "users": 600}),
                json!({"variation": "1", "dimension": "US", "users": 610}),
                json!({"variation": "0", "dimension": "__other__", "users": 400}),
                json!({"variation": "1", "dimension": "__other__", "users": 410}),
            ])
        } else if sql.contains("e.\"country\"") {
            metric_rows(&["US", "DE"])
        } else {
            metric_rows(&["All"])
        };

        Ok(QueryOutput::rows(output))
    }
}

struct FixedRegistry {
    warehouse: Arc<ScriptedWarehouse>,
}

#[async_trait]
impl WarehouseRegistry for FixedRegistry {
    async fn resolve(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn Warehouse>, WarehouseError> {
        if datasource.kind == "offline" {
            return Err(WarehouseError::Connection("warehouse offline".to_string()));
        }
        Ok(self.warehouse.clone())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    warehouse: Arc<ScriptedWarehouse>,
    orchestrator: Arc<SnapshotOrchestrator>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(OrchestratorConfig::default())
    }

    fn with_config(config: OrchestratorConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let warehouse = Arc::new(ScriptedWarehouse::default());
        let orchestrator = Arc::new(SnapshotOrchestrator::new(
            store.clone(),
            Arc::new(FixedRegistry {
                warehouse: warehouse.clone(),
            }),
            SnapshotTelemetry::disabled(),
            config,
        ));

        store.insert_datasource(datasource("ds_1", "postgres"));
        for id in ["met_a", "met_b", "met_fail", "met_hang"] {
            store.insert_metric(metric(id));
        }
        store.insert_metric_group(MetricGroup {
            id: "mg_core".to_string(),
            organization: ORG.to_string(),
            metrics: vec!["met_a".to_string(), "met_b".to_string()],
        });

        Self {
            store,
            warehouse,
            orchestrator,
        }
    }

    fn scheduler(&self) -> (Scheduler, Arc<InMemoryJobQueue>) {
        self.scheduler_with(SchedulerConfig::default())
    }

    fn scheduler_with(&self, config: SchedulerConfig) -> (Scheduler, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(FixedRegistry {
            warehouse: self.warehouse.clone(),
        });
        let handler = EngineJobHandler::new(
            self.orchestrator.clone(),
            MaintenanceJobs::new(self.store.clone(), registry),
            SnapshotTelemetry::disabled(),
        );
        let scheduler = Scheduler::new(
            queue.clone(),
            Arc::new(handler),
            SnapshotTelemetry::disabled(),
            config,
        );
        (scheduler, queue)
    }
}

fn datasource(id: &str, kind: &str) -> DatasourceConfig {
    DatasourceConfig {
        id: id.to_string(),
        organization: ORG.to_string(),
        name: id.to_string(),
        kind: kind.to_string(),
        exposure_queries: vec![ExposureQuery {
            id: "users".to_string(),
            name: "Logged-in users".to_string(),
            user_id_type: "user_id".to_string(),
            sql: "SELECT user_id, timestamp, experiment_id, variation_id, country FROM viewed_experiment".to_string(),
            dimensions: vec!["country".to_string()],
            dimension_metadata: vec![DimensionMetadata {
                dimension: "country".to_string(),
                specified_slices: vec!["US".to_string(), "DE".to_string()],
            }],
        }],
        information_schema: None,
    }
}

fn metric(id: &str) -> MetricDefinition {
    MetricDefinition {
        id: id.to_string(),
        organization: ORG.to_string(),
        name: id.to_string(),
        datasource: "ds_1".to_string(),
        sql: "SELECT user_id, timestamp, amount AS value FROM purchases".to_string(),
        inverse: false,
    }
}

fn experiment(id: &str, status: ExperimentStatus, goals: &[&str]) -> Experiment {
    Experiment {
        id: id.to_string(),
        organization: ORG.to_string(),
        name: id.to_string(),
        status,
        phases: vec![Phase {
            name: "Main".to_string(),
            date_started: Utc::now() - ChronoDuration::days(7),
            date_ended: None,
            variation_weights: vec![0.5, 0.5],
            coverage: 1.0,
        }],
        variations: vec![
            Variation {
                id: "var_0".to_string(),
                key: "0".to_string(),
                name: "Control".to_string(),
            },
            Variation {
                id: "var_1".to_string(),
                key: "1".to_string(),
                name: "Treatment".to_string(),
            },
        ],
        datasource: Some("ds_1".to_string()),
        exposure_query_id: Some("users".to_string()),
        metrics: MetricRefs {
            goals: goals.iter().map(|s| s.to_string()).collect(),
            secondary: vec![],
            guardrails: vec![],
        },
        auto_update: true,
        update_interval_hours: 6,
        next_snapshot_attempt: None,
        incremental_refresh: None,
    }
}

fn request(experiment_id: &str) -> CreateSnapshotRequest {
    CreateSnapshotRequest {
        entity: EntityRef::experiment(experiment_id, ORG),
        phase: 0,
        dimension: None,
        use_cache: false,
        trigger: SnapshotTrigger::Manual,
    }
}

// ============================================================================
// PRECONDITION TESTS
// ============================================================================

mod preconditions {
    use super::*;

    #[tokio::test]
    async fn test_draft_experiment_is_rejected_without_snapshot() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_draft", ExperimentStatus::Draft, &["met_a"]));

        let err = harness
            .orchestrator
            .create_snapshot(request("exp_draft"))
            .await
            .unwrap_err();

        assert!(matches!(err, SnapshotError::EntityDraft(_)));
        assert_eq!(err.code(), "SNAPSHOT_ENTITY_DRAFT");
        assert_eq!(harness.store.snapshot_count(), 0);
        assert_eq!(harness.warehouse.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_phases_and_out_of_range_phase() {
        let harness = Harness::new();
        let mut no_phases = experiment("exp_empty", ExperimentStatus::Running, &["met_a"]);
        no_phases.phases.clear();
        harness.store.insert_experiment(no_phases);
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));

        let err = harness.orchestrator.create_snapshot(request("exp_empty")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::NoPhases(_)));

        let err = harness
            .orchestrator
            .create_snapshot(CreateSnapshotRequest {
                phase: 3,
                ..request("exp_1")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::PhaseOutOfRange { phase: 3, phases: 1 }));
        assert_eq!(harness.store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_datasource_problems() {
        let harness = Harness::new();
        let mut no_datasource = experiment("exp_no_ds", ExperimentStatus::Running, &["met_a"]);
        no_datasource.datasource = None;
        harness.store.insert_experiment(no_datasource);

        harness.store.insert_datasource(datasource("ds_offline", "offline"));
        let mut offline = experiment("exp_offline", ExperimentStatus::Running, &["met_a"]);
        offline.datasource = Some("ds_offline".to_string());
        harness.store.insert_experiment(offline);

        let err = harness.orchestrator.create_snapshot(request("exp_no_ds")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::DatasourceMissing(_)));

        let err = harness.orchestrator.create_snapshot(request("exp_offline")).await.unwrap_err();
        assert_eq!(err.code(), "SNAPSHOT_DATASOURCE_UNAVAILABLE");
        assert_eq!(harness.store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_dimension_is_rejected() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));

        let err = harness
            .orchestrator
            .create_snapshot(CreateSnapshotRequest {
                dimension: Some("exp:browser".to_string()),
                ..request("exp_1")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SnapshotError::UnknownDimension(_)));
        assert_eq!(harness.store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_entity() {
        let harness = Harness::new();
        let err = harness.orchestrator.create_snapshot(request("nope")).await.unwrap_err();
        assert!(matches!(err, SnapshotError::EntityNotFound(_)));
    }
}

// ============================================================================
// ORCHESTRATION TESTS
// ============================================================================

mod orchestration {
    use super::*;

    #[tokio::test]
    async fn test_successful_snapshot_has_results_for_every_metric() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["mg_core", "met_a"]));

        let snapshot = harness.orchestrator.create_snapshot(request("exp_1")).await.unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Succeeded);
        assert!(snapshot.finalized_at.is_some());
        assert_eq!(snapshot.results.len(), 2);
        assert!(snapshot.results.contains_key("met_a"));
        assert!(snapshot.results.contains_key("met_b"));
        assert!(snapshot.failed_queries.is_empty());

        // traffic, traffic:exp:country, two metrics
        assert_eq!(snapshot.queries.len(), 4);
        assert_eq!(harness.warehouse.calls(), 4);

        let health = snapshot.health.as_ref().unwrap();
        assert_eq!(health.users, vec![1000.0, 1020.0]);
        assert!(!health.srm_warning);
        assert_eq!(health.dimensions.len(), 1);

        let treatment = &snapshot.results["met_a"].slices[0].variations[1];
        assert!(treatment.expected_lift.unwrap() > 0.0);
        assert!(treatment.p_value.is_some());

        let stored = harness.store.get_snapshot(snapshot.id).await.unwrap().unwrap();
        assert_eq!(stored, snapshot);

        let latest = harness
            .orchestrator
            .get_latest_snapshot(&EntityRef::experiment("exp_1", ORG), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, snapshot.id);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_results() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a", "met_fail"]));

        let snapshot = harness.orchestrator.create_snapshot(request("exp_1")).await.unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::PartiallySucceeded);
        assert!(snapshot.results.contains_key("met_a"));
        assert!(!snapshot.results.contains_key("met_fail"));
        assert_eq!(snapshot.failed_queries.len(), 1);
        assert_eq!(snapshot.failed_queries[0].name, "metric:met_fail");
        assert!(snapshot.failed_queries[0].error.contains("exploded"));
    }

    #[tokio::test]
    async fn test_dimension_snapshot_slices_results() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));

        let snapshot = harness
            .orchestrator
            .create_snapshot(CreateSnapshotRequest {
                dimension: Some("exp:country".to_string()),
                ..request("exp_1")
            })
            .await
            .unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Succeeded);
        let slices: Vec<&str> = snapshot.results["met_a"].slices.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(slices, vec!["DE", "US"]);

        // Dimension snapshots are not the entity's latest snapshot.
        let latest = harness
            .orchestrator
            .get_latest_snapshot(&EntityRef::experiment("exp_1", ORG), None)
            .await
            .unwrap();
        assert!(latest.is_none());
    }

    #[tokio::test]
    async fn test_cached_queries_skip_the_warehouse() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));

        let cached_request = CreateSnapshotRequest {
            use_cache: true,
            ..request("exp_1")
        };

        let first = harness.orchestrator.create_snapshot(cached_request.clone()).await.unwrap();
        let calls = harness.warehouse.calls();
        let second = harness.orchestrator.create_snapshot(cached_request).await.unwrap();

        assert_eq!(harness.warehouse.calls(), calls);
        assert_ne!(first.id, second.id);
        assert_eq!(second.status, SnapshotStatus::Succeeded);
        assert_eq!(first.results, second.results);
        assert!(harness.store.queries_for(second.id).iter().all(|q| q.cached_result));
    }

    #[tokio::test]
    async fn test_cache_is_scoped_to_organization() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));

        // A second organization with identically named resources and SQL.
        let other = "org_2";
        harness.store.insert_datasource(DatasourceConfig {
            organization: other.to_string(),
            ..datasource("ds_1", "postgres")
        });
        harness.store.insert_metric(MetricDefinition {
            organization: other.to_string(),
            ..metric("met_a")
        });
        harness.store.insert_experiment(Experiment {
            organization: other.to_string(),
            ..experiment("exp_1", ExperimentStatus::Running, &["met_a"])
        });

        let cached_request = CreateSnapshotRequest {
            use_cache: true,
            ..request("exp_1")
        };
        harness.orchestrator.create_snapshot(cached_request.clone()).await.unwrap();
        let calls = harness.warehouse.calls();

        let theirs = harness
            .orchestrator
            .create_snapshot(CreateSnapshotRequest {
                entity: EntityRef::experiment("exp_1", other),
                ..cached_request
            })
            .await
            .unwrap();

        assert_eq!(theirs.status, SnapshotStatus::Succeeded);
        assert_eq!(harness.warehouse.calls(), calls * 2);
        let queries = harness.store.queries_for(theirs.id);
        assert!(!queries.is_empty());
        assert!(queries.iter().all(|q| !q.cached_result && q.organization == other));
    }
}

// ============================================================================
// CANCELLATION TESTS
// ============================================================================

mod cancellation {
    use super::*;

    #[tokio::test]
    async fn test_cancel_running_snapshot() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a", "met_hang"]));
        let entity = EntityRef::experiment("exp_1", ORG);

        let orchestrator = harness.orchestrator.clone();
        let run = tokio::spawn(async move { orchestrator.create_snapshot(request("exp_1")).await });

        let mut snapshot_id = None;
        for _ in 0..200 {
            if let Some(snapshot) = harness.store.snapshots_for(&entity).first() {
                if !snapshot.queries.is_empty() {
                    snapshot_id = Some(snapshot.id);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let snapshot_id = snapshot_id.expect("snapshot never started");
        assert_eq!(harness.orchestrator.active_runs(), 1);

        harness.orchestrator.cancel_snapshot(snapshot_id).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("run did not stop")
            .unwrap()
            .unwrap();

        assert_eq!(snapshot.status, SnapshotStatus::Cancelled);
        assert_eq!(harness.orchestrator.active_runs(), 0);

        let hung = harness
            .store
            .queries_for(snapshot_id)
            .into_iter()
            .find(|q| q.name == "metric:met_hang")
            .unwrap();
        assert_eq!(hung.error.as_deref(), Some("cancelled"));

        // Cancelling again is a no-op.
        harness.orchestrator.cancel_snapshot(snapshot_id).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_racing_finalize_keeps_store_consistent() {
        for _ in 0..20 {
            let harness = Harness::new();
            harness
                .store
                .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));
            let entity = EntityRef::experiment("exp_1", ORG);

            let orchestrator = harness.orchestrator.clone();
            let run = tokio::spawn(async move { orchestrator.create_snapshot(request("exp_1")).await });

            let mut snapshot_id = None;
            for _ in 0..1000 {
                if let Some(snapshot) = harness.store.snapshots_for(&entity).first() {
                    snapshot_id = Some(snapshot.id);
                    break;
                }
                tokio::task::yield_now().await;
            }
            if let Some(id) = snapshot_id {
                harness.orchestrator.cancel_snapshot(id).await.unwrap();
            }

            let returned = run.await.unwrap().unwrap();
            let stored = harness.store.get_snapshot(returned.id).await.unwrap().unwrap();

            assert_eq!(stored.status, returned.status);
            assert!(stored.finalized_at.is_some());
            match stored.status {
                SnapshotStatus::Succeeded => assert!(stored.results.contains_key("met_a")),
                SnapshotStatus::Cancelled => assert!(stored.results.is_empty()),
                other => panic!("unexpected status {:?}", other),
            }
            assert_eq!(harness.orchestrator.active_runs(), 0);
        }
    }

    #[tokio::test]
    async fn test_cancel_unknown_snapshot() {
        let harness = Harness::new();
        let err = harness
            .orchestrator
            .cancel_snapshot(uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::NotFound(_)));
    }
}

// ============================================================================
// SCHEDULER TESTS
// ============================================================================

mod scheduling {
    use super::*;

    #[tokio::test]
    async fn test_unit_jobs_are_deduplicated() {
        let harness = Harness::new();
        let (scheduler, queue) = harness.scheduler();
        let payload = UnitJobPayload::new(ORG, "exp_1");

        let first = scheduler.queue_unit_job(EntityKind::Experiment, &payload).await.unwrap();
        let second = scheduler.queue_unit_job(EntityKind::Experiment, &payload).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(queue.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_enqueues_units_that_create_snapshots() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));
        let mut manual = experiment("exp_manual", ExperimentStatus::Running, &["met_a"]);
        manual.auto_update = false;
        harness.store.insert_experiment(manual);

        let (scheduler, queue) = harness.scheduler();
        scheduler.queue_sweep(EntityKind::Experiment).await.unwrap();

        // sweep, then the unit job it enqueued
        assert_eq!(scheduler.run_due().await.unwrap(), 2);

        let snapshots = harness.store.snapshots_for(&EntityRef::experiment("exp_1", ORG));
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].trigger, SnapshotTrigger::Schedule);
        assert!(snapshots[0].use_cache);
        assert!(harness
            .store
            .snapshots_for(&EntityRef::experiment("exp_manual", ORG))
            .is_empty());

        let updated = harness.store.get_experiment(ORG, "exp_1").await.unwrap().unwrap();
        assert!(updated.next_snapshot_attempt.unwrap() > Utc::now());

        // Only the recurring sweep is left.
        assert_eq!(queue.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dashboard_failure_disables_auto_updates() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_draft", ExperimentStatus::Draft, &["met_a"]));
        harness.store.insert_dashboard(Dashboard {
            id: "dash_1".to_string(),
            organization: ORG.to_string(),
            experiment_id: "exp_draft".to_string(),
            enable_auto_updates: true,
            update_interval_hours: 6,
            next_update: None,
            dimension: None,
        });

        let (scheduler, queue) = harness.scheduler();
        scheduler
            .queue_unit_job(EntityKind::Dashboard, &UnitJobPayload::new(ORG, "dash_1"))
            .await
            .unwrap();

        assert_eq!(scheduler.run_due().await.unwrap(), 1);

        let dashboard = harness.store.get_dashboard(ORG, "dash_1").await.unwrap().unwrap();
        assert!(!dashboard.enable_auto_updates);
        assert!(queue.list().await.unwrap().is_empty());
        assert_eq!(harness.store.snapshot_count(), 0);
    }

    #[tokio::test]
    async fn test_dashboard_refresh_uses_its_dimension() {
        let harness = Harness::new();
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_a"]));
        harness.store.insert_dashboard(Dashboard {
            id: "dash_1".to_string(),
            organization: ORG.to_string(),
            experiment_id: "exp_1".to_string(),
            enable_auto_updates: true,
            update_interval_hours: 6,
            next_update: None,
            dimension: Some("exp:country".to_string()),
        });

        let (scheduler, _queue) = harness.scheduler();
        scheduler.queue_sweep(EntityKind::Dashboard).await.unwrap();
        scheduler.run_due().await.unwrap();

        let snapshots = harness.store.snapshots_for(&EntityRef::experiment("exp_1", ORG));
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].dimension.as_deref(), Some("exp:country"));

        let dashboard = harness.store.get_dashboard(ORG, "dash_1").await.unwrap().unwrap();
        assert!(dashboard.enable_auto_updates);
        assert!(dashboard.next_update.is_some());
    }

    #[tokio::test]
    async fn test_unit_job_timeout_finalizes_snapshot() {
        // The run timeout outlives the job lock, so the job is aborted mid-run.
        let harness = Harness::with_config(OrchestratorConfig {
            run_timeout: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        });
        harness
            .store
            .insert_experiment(experiment("exp_1", ExperimentStatus::Running, &["met_hang"]));

        let (scheduler, queue) = harness.scheduler_with(SchedulerConfig {
            unit_lock_lifetime: Duration::from_millis(300),
            ..SchedulerConfig::default()
        });
        scheduler
            .queue_unit_job(EntityKind::Experiment, &UnitJobPayload::new(ORG, "exp_1"))
            .await
            .unwrap();
        assert_eq!(scheduler.run_due().await.unwrap(), 1);
        assert!(queue.list().await.unwrap().is_empty());

        let entity = EntityRef::experiment("exp_1", ORG);
        let mut snapshot = None;
        for _ in 0..200 {
            snapshot = harness.store.snapshots_for(&entity).into_iter().next();
            if snapshot.as_ref().is_some_and(|s| s.status.is_terminal()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let snapshot = snapshot.expect("unit job never created a snapshot");
        assert_eq!(snapshot.status, SnapshotStatus::Failed);
        assert!(snapshot.finalized_at.is_some());
        assert!(snapshot.error.is_some());
        assert_eq!(harness.orchestrator.active_runs(), 0);
    }
}
