//! Organization-wide maintenance jobs.
//!
//! Each task walks one organization's datasources, fact tables or features.
//! A failure on one item is logged and the rest are still processed; the job
//! then reports how many items failed.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::JobError;
use crate::clients::{AnalysisStore, WarehouseRegistry};
use crate::contracts::{
    ColumnDataType, DatasourceConfig, ExperimentStatus, FactTable, Feature, InformationSchema,
    InformationSchemaColumn, Row,
};

/// Features untouched this long are stale.
pub const STALE_FEATURE_AGE_DAYS: i64 = 14;

/// Values kept per fact table column.
pub const TOP_VALUES_LIMIT: usize = 100;

const INFORMATION_SCHEMA_SQL: &str = "-- information_schema\nSELECT table_schema, table_name, column_name, data_type\nFROM information_schema.columns\nORDER BY table_schema, table_name, ordinal_position";

pub struct MaintenanceJobs {
    store: Arc<dyn AnalysisStore>,
    warehouses: Arc<dyn WarehouseRegistry>,
}

impl MaintenanceJobs {
    pub fn new(store: Arc<dyn AnalysisStore>, warehouses: Arc<dyn WarehouseRegistry>) -> Self {
        Self { store, warehouses }
    }

    /// Reload the column catalog of every datasource of an organization.
    #[instrument(skip(self))]
    pub async fn refresh_information_schemas(&self, organization: &str) -> Result<(), JobError> {
        let datasources = self.store.list_datasources(organization).await?;
        let total = datasources.len();
        let mut failed = 0;

        for datasource in datasources {
            let id = datasource.id.clone();
            if let Err(e) = self.refresh_information_schema(datasource).await {
                warn!(datasource = %id, error = %e, "Information schema refresh failed");
                failed += 1;
            }
        }

        info!(total, failed, "Information schemas refreshed");
        partial("information schema", failed, total)
    }

    async fn refresh_information_schema(&self, datasource: DatasourceConfig) -> Result<(), JobError> {
        let warehouse = self.warehouses.resolve(&datasource).await?;
        let output = warehouse
            .run_query(&Uuid::new_v4().to_string(), INFORMATION_SCHEMA_SQL)
            .await?;

        let columns: Vec<InformationSchemaColumn> = output
            .rows
            .iter()
            .filter_map(|row| {
                Some(InformationSchemaColumn {
                    table_schema: text(row, "table_schema")?,
                    table_name: text(row, "table_name")?,
                    column_name: text(row, "column_name")?,
                    data_type: text(row, "data_type").unwrap_or_default(),
                })
            })
            .collect();

        debug!(datasource = %datasource.id, columns = columns.len(), "Information schema loaded");

        self.store
            .update_datasource(DatasourceConfig {
                information_schema: Some(InformationSchema {
                    columns,
                    refreshed_at: Utc::now(),
                }),
                ..datasource
            })
            .await?;
        Ok(())
    }

    /// Recompute the most frequent values of every string column of every
    /// fact table of an organization.
    #[instrument(skip(self))]
    pub async fn refresh_top_values(&self, organization: &str) -> Result<(), JobError> {
        let fact_tables = self.store.list_fact_tables(organization).await?;
        let total = fact_tables.len();
        let mut failed = 0;

        for fact_table in fact_tables {
            let id = fact_table.id.clone();
            if let Err(e) = self.refresh_fact_table(fact_table).await {
                warn!(fact_table = %id, error = %e, "Top values refresh failed");
                failed += 1;
            }
        }

        info!(total, failed, "Fact table top values refreshed");
        partial("top values", failed, total)
    }

    async fn refresh_fact_table(&self, mut fact_table: FactTable) -> Result<(), JobError> {
        if !fact_table.columns.iter().any(|c| c.data_type == ColumnDataType::String) {
            return Ok(());
        }

        let datasource = self
            .store
            .get_datasource(&fact_table.organization, &fact_table.datasource)
            .await?
            .ok_or_else(|| JobError::EntityNotFound(fact_table.datasource.clone()))?;
        let warehouse = self.warehouses.resolve(&datasource).await?;

        let now = Utc::now();
        for column in fact_table
            .columns
            .iter_mut()
            .filter(|c| c.data_type == ColumnDataType::String)
        {
            let sql = top_values_sql(&fact_table.id, &fact_table.sql, &column.column);
            let output = warehouse.run_query(&Uuid::new_v4().to_string(), &sql).await?;

            column.top_values = output
                .rows
                .iter()
                .filter_map(|row| text(row, "value"))
                .take(TOP_VALUES_LIMIT)
                .collect();
            column.top_values_date = Some(now);
        }

        self.store.update_fact_table(fact_table).await?;
        Ok(())
    }

    /// Flag features nobody has touched for a while and that no running
    /// experiment depends on.
    #[instrument(skip(self))]
    pub async fn recompute_stale_features(&self, organization: &str) -> Result<(), JobError> {
        let features = self.store.list_features(organization).await?;
        let cutoff = Utc::now() - Duration::days(STALE_FEATURE_AGE_DAYS);
        let mut changed = 0;

        for feature in features {
            let stale = self.is_stale(&feature, cutoff).await?;
            if stale != feature.is_stale {
                self.store
                    .update_feature(Feature {
                        is_stale: stale,
                        ..feature
                    })
                    .await?;
                changed += 1;
            }
        }

        info!(changed, "Stale features recomputed");
        Ok(())
    }

    async fn is_stale(&self, feature: &Feature, cutoff: chrono::DateTime<Utc>) -> Result<bool, JobError> {
        if feature.never_stale || feature.date_updated > cutoff {
            return Ok(false);
        }

        for experiment_id in &feature.linked_experiments {
            let experiment = self.store.get_experiment(&feature.organization, experiment_id).await?;
            if experiment.map_or(false, |e| e.status == ExperimentStatus::Running) {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

fn partial(task: &'static str, failed: usize, total: usize) -> Result<(), JobError> {
    if failed == 0 {
        Ok(())
    } else {
        Err(JobError::Partial { task, failed, total })
    }
}

fn top_values_sql(fact_table_id: &str, fact_table_sql: &str, column: &str) -> String {
    let column = format!("\"{}\"", column.replace('"', "\"\""));
    format!(
        "-- top_values:{id}\nSELECT {col} AS value, COUNT(*) AS count\nFROM (\n{sql}\n) ft\nWHERE {col} IS NOT NULL\nGROUP BY {col}\nORDER BY count DESC\nLIMIT {limit}",
        id = fact_table_id,
        col = column,
        sql = fact_table_sql.trim(),
        limit = TOP_VALUES_LIMIT,
    )
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
