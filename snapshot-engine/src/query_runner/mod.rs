//! Query Runner
//!
//! Executes the sub-queries of one snapshot concurrently against a warehouse
//! and tracks their lifecycle.
//!
//! # State machine
//!
//! Each sub-query starts `running` and moves once to `succeeded` or `failed`.
//! The run's status is [`reduce_status`] over its sub-queries. Every
//! transition is written to the store as it happens, and the owning
//! snapshot's query pointers are refreshed after each one, so an interrupted
//! run leaves an inspectable record behind.
//!
//! # Caching
//!
//! With `use_cache` set, a sub-query whose fingerprint matches a query that
//! succeeded within the cache window reuses that query's rows and never
//! reaches the warehouse.
//!
//! # Cancellation
//!
//! Cancelling the run's token stops waiting on in-flight sub-queries, marks
//! them failed with `cancelled`, and asks the warehouse to stop them without
//! waiting for an answer.

mod state;

pub use state::{reduce_status, QueryRun};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clients::{AnalysisStore, SnapshotUpdate, StoreError, Warehouse};
use crate::contracts::{QueryRecord, QueryStatus, Snapshot};
use crate::telemetry::SnapshotTelemetry;

/// Error recorded on sub-queries stopped by cancellation.
pub const CANCELLED_ERROR: &str = "cancelled";

/// Default validity window for cached query results.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct QueryRunnerConfig {
    /// How old a succeeded query may be and still be reused
    pub cache_ttl: Duration,
}

impl Default for QueryRunnerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// One SQL statement to run for a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedQuery {
    pub name: String,
    pub sql: String,
}

impl PlannedQuery {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }
}

/// Identity shared by every sub-query of a run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub snapshot_id: Uuid,
    pub organization: String,
    pub datasource: String,
    pub use_cache: bool,
}

pub struct QueryRunner {
    store: Arc<dyn AnalysisStore>,
    telemetry: SnapshotTelemetry,
    config: QueryRunnerConfig,
}

impl QueryRunner {
    pub fn new(store: Arc<dyn AnalysisStore>, telemetry: SnapshotTelemetry, config: QueryRunnerConfig) -> Self {
        Self {
            store,
            telemetry,
            config,
        }
    }

    /// Run every planned query to a terminal state and return the aggregate.
    ///
    /// Store failures while creating query records abort the run; failures
    /// while recording later transitions are logged and the run continues.
    #[instrument(skip(self, warehouse, plan, cancel), fields(snapshot_id = %ctx.snapshot_id, queries = plan.len()))]
    pub async fn run(
        &self,
        ctx: &RunContext,
        warehouse: Arc<dyn Warehouse>,
        plan: Vec<PlannedQuery>,
        cancel: CancellationToken,
    ) -> Result<QueryRun, StoreError> {
        let mut records = Vec::with_capacity(plan.len());
        let mut pending = Vec::new();

        for planned in plan {
            let record = QueryRecord::start(
                ctx.snapshot_id,
                &ctx.organization,
                &ctx.datasource,
                planned.name,
                planned.sql,
            );
            self.store.create_query(record.clone()).await?;

            let record = match self.cached(ctx, &record).await {
                Some(cached) => cached,
                None => {
                    pending.push(records.len());
                    record
                }
            };
            records.push(record);
        }

        self.record_progress(ctx.snapshot_id, &records).await;

        let mut tasks = JoinSet::new();
        for index in pending {
            let record = records[index].clone();
            self.telemetry.query_started(&record);

            let store = Arc::clone(&self.store);
            let warehouse = Arc::clone(&warehouse);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let finished = execute(record, warehouse, cancel).await;
                if let Err(e) = store.update_query(finished.clone()).await {
                    warn!(query_id = %finished.id, error = %e, "Failed to record query transition");
                }
                (index, finished)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, finished)) => {
                    match finished.status {
                        QueryStatus::Succeeded => self.telemetry.query_succeeded(&finished),
                        _ => self.telemetry.query_failed(&finished),
                    }
                    records[index] = finished;
                    self.record_progress(ctx.snapshot_id, &records).await;
                }
                Err(e) => warn!(error = %e, "Query task did not complete"),
            }
        }

        // A task that panicked leaves its record running; close it out.
        for record in records.iter_mut().filter(|r| r.status == QueryStatus::Running) {
            let failed = record.failed("query task aborted");
            if let Err(e) = self.store.update_query(failed.clone()).await {
                warn!(query_id = %failed.id, error = %e, "Failed to record query transition");
            }
            self.telemetry.query_failed(&failed);
            *record = failed;
        }

        let statuses: Vec<QueryStatus> = records.iter().map(|r| r.status).collect();
        let status = reduce_status(&statuses, cancel.is_cancelled());

        info!(status = %status, "Query run finished");

        Ok(QueryRun {
            status,
            queries: records,
        })
    }

    /// Reuse the rows of an identical recent query when caching is allowed.
    async fn cached(&self, ctx: &RunContext, record: &QueryRecord) -> Option<QueryRecord> {
        if !ctx.use_cache {
            return None;
        }

        let ttl = chrono::Duration::from_std(self.config.cache_ttl).unwrap_or_else(|_| chrono::Duration::days(1));
        let since = Utc::now() - ttl;

        let source = match self
            .store
            .find_cached_query(&ctx.organization, &record.fingerprint, since)
            .await
        {
            Ok(Some(source)) if source.id != record.id => source,
            Ok(_) => return None,
            Err(e) => {
                warn!(error = %e, "Cache lookup failed, running query");
                return None;
            }
        };

        let cached = record.from_cache(source.rows.clone());
        if let Err(e) = self.store.update_query(cached.clone()).await {
            warn!(query_id = %cached.id, error = %e, "Failed to record cached result");
            return None;
        }

        debug!(name = %cached.name, source_query_id = %source.id, "Reusing cached query result");
        self.telemetry.query_cache_hit(&cached, source.id);
        Some(cached)
    }

    /// Refresh the snapshot's query pointers while it is still running.
    ///
    /// A snapshot finalized or cancelled by someone else is left untouched.
    async fn record_progress(&self, snapshot_id: Uuid, records: &[QueryRecord]) {
        let pointers = state::pointers(records);
        match self
            .store
            .update_running_snapshot(snapshot_id, &|s: &Snapshot| s.with_queries(pointers.clone()))
            .await
        {
            Ok(SnapshotUpdate::Applied(_)) => {}
            Ok(SnapshotUpdate::AlreadyFinal(_)) => debug!("Snapshot already final, progress not recorded"),
            Err(StoreError::NotFound { .. }) => debug!("Snapshot missing, progress not recorded"),
            Err(e) => warn!(error = %e, "Failed to record snapshot progress"),
        }
    }
}

/// Run one statement, racing it against cancellation.
async fn execute(record: QueryRecord, warehouse: Arc<dyn Warehouse>, cancel: CancellationToken) -> QueryRecord {
    let query_id = record.id.to_string();

    // Cancellation wins over a statement that is ready on the same poll.
    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            let warehouse = Arc::clone(&warehouse);
            let id = query_id.clone();
            tokio::spawn(async move {
                if let Err(e) = warehouse.cancel_query(&id).await {
                    debug!(query_id = %id, error = %e, "Warehouse did not cancel query");
                }
            });
            record.failed(CANCELLED_ERROR)
        }
        result = warehouse.run_query(&query_id, &record.sql) => match result {
            Ok(output) => record.succeeded(output.rows),
            Err(e) => record.failed(e.to_string()),
        },
    }
}
