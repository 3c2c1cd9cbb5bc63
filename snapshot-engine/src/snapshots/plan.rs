//! Query planning
//!
//! Builds the SQL statements of a snapshot. Every statement starts with a
//! `-- <name>` line naming the sub-query, so warehouse logs can be matched
//! back to snapshots.
//!
//! Result shapes:
//!
//! | sub-query | columns |
//! |---|---|
//! | `traffic` | `variation`, `users` |
//! | `traffic:<dimension>` | `variation`, `dimension`, `users` |
//! | `metric:<id>` | `variation`, `dimension`, `users`, `count`, `main_sum`, `main_sum_squares` |

use chrono::{DateTime, Utc};

use crate::contracts::{ExposureQuery, MetricDefinition, Phase, ALL_SLICE, OTHER_SLICE};
use crate::dimensions::{Dimension, DimensionWithSlices};
use crate::query_runner::PlannedQuery;

pub const TRAFFIC_QUERY: &str = "traffic";
pub const TRAFFIC_DIMENSION_PREFIX: &str = "traffic:";
pub const METRIC_QUERY_PREFIX: &str = "metric:";

/// Sub-query name of a metric.
pub fn metric_query_name(metric_id: &str) -> String {
    format!("{}{}", METRIC_QUERY_PREFIX, metric_id)
}

/// Sub-query name of a pre-computed dimension traffic breakdown.
pub fn traffic_query_name(dimension_id: &str) -> String {
    format!("{}{}", TRAFFIC_DIMENSION_PREFIX, dimension_id)
}

/// Everything the planner needs for one snapshot.
#[derive(Debug, Clone)]
pub struct PlanInput<'a> {
    pub exposure_query: &'a ExposureQuery,
    pub phase: &'a Phase,
    pub metrics: &'a [MetricDefinition],
    /// Requested slice axis; metric results are broken down by it
    pub dimension: Option<&'a Dimension>,
    /// Dimensions whose traffic is pre-computed for health checks
    pub precomputed: &'a [DimensionWithSlices],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryPlanner;

impl QueryPlanner {
    pub fn plan(&self, input: &PlanInput<'_>) -> Vec<PlannedQuery> {
        let mut plan = Vec::with_capacity(1 + input.precomputed.len() + input.metrics.len());
        let exposures = exposure_cte(input.exposure_query, input.phase);

        plan.push(PlannedQuery::new(
            TRAFFIC_QUERY,
            format!(
                "-- {}\n{}\nSELECT variation_id AS variation, COUNT(DISTINCT user_id) AS users\nFROM exposures\nGROUP BY variation_id",
                TRAFFIC_QUERY, exposures
            ),
        ));

        // A requested dimension replaces the pre-computed breakdowns.
        let breakdowns: Vec<(String, String)> = match input.dimension {
            Some(dimension) => vec![(dimension.id.clone(), quote_identifier(&dimension.column))],
            None => input
                .precomputed
                .iter()
                .map(|d| (d.dimension.id.clone(), bucket_expression(d)))
                .collect(),
        };

        for (dimension_id, expression) in &breakdowns {
            let name = traffic_query_name(dimension_id);
            plan.push(PlannedQuery::new(
                name.clone(),
                format!(
                    "-- {}\n{}\nSELECT variation_id AS variation, {} AS dimension, COUNT(DISTINCT user_id) AS users\nFROM exposures\nGROUP BY variation_id, {}",
                    name, exposures, expression, expression
                ),
            ));
        }

        let dimension_expression = match input.dimension {
            Some(dimension) => format!("e.{}", quote_identifier(&dimension.column)),
            None => quote_literal(ALL_SLICE),
        };

        for metric in input.metrics {
            let name = metric_query_name(&metric.id);
            plan.push(PlannedQuery::new(
                name.clone(),
                format!(
                    "-- {name}\n{exposures},\nmetric AS (\n{metric_sql}\n),\nper_user AS (\n  SELECT e.user_id, MIN(e.variation_id) AS variation, MIN({dim}) AS dimension, SUM(m.value) AS value\n  FROM exposures e\n  LEFT JOIN metric m ON m.user_id = e.user_id AND m.timestamp >= e.timestamp\n  GROUP BY e.user_id\n)\nSELECT variation, dimension, COUNT(*) AS users, COUNT(value) AS count,\n  SUM(COALESCE(value, 0)) AS main_sum, SUM(COALESCE(value, 0) * COALESCE(value, 0)) AS main_sum_squares\nFROM per_user\nGROUP BY variation, dimension",
                    name = name,
                    exposures = exposures,
                    metric_sql = metric.sql.trim(),
                    dim = dimension_expression,
                ),
            ));
        }

        plan
    }
}

fn exposure_cte(exposure_query: &ExposureQuery, phase: &Phase) -> String {
    let mut filter = format!("timestamp >= {}", timestamp_literal(phase.date_started));
    if let Some(ended) = phase.date_ended {
        filter.push_str(&format!(" AND timestamp < {}", timestamp_literal(ended)));
    }

    format!(
        "WITH exposures AS (\n  SELECT * FROM (\n{}\n  ) raw\n  WHERE {}\n)",
        exposure_query.sql.trim(),
        filter
    )
}

/// Maps values outside the enumerated slices to the other bucket.
fn bucket_expression(dimension: &DimensionWithSlices) -> String {
    let column = quote_identifier(&dimension.dimension.column);
    let slices: Vec<String> = dimension.slices.iter().map(|s| quote_literal(s)).collect();

    format!(
        "CASE WHEN {} IN ({}) THEN {} ELSE {} END",
        column,
        slices.join(", "),
        column,
        quote_literal(OTHER_SLICE)
    )
}

fn timestamp_literal(ts: DateTime<Utc>) -> String {
    quote_literal(&ts.format("%Y-%m-%d %H:%M:%S").to_string())
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn exposure_query() -> ExposureQuery {
        ExposureQuery {
            id: "users".to_string(),
            name: "Users".to_string(),
            user_id_type: "user_id".to_string(),
            sql: "SELECT user_id, timestamp, experiment_id, variation_id, country FROM exposures".to_string(),
            dimensions: vec!["country".to_string()],
            dimension_metadata: vec![],
        }
    }

    fn phase() -> Phase {
        Phase {
            name: "Main".to_string(),
            date_started: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            date_ended: None,
            variation_weights: vec![0.5, 0.5],
            coverage: 1.0,
        }
    }

    fn metric(id: &str) -> MetricDefinition {
        MetricDefinition {
            id: id.to_string(),
            organization: "org_1".to_string(),
            name: id.to_string(),
            datasource: "ds_1".to_string(),
            sql: "SELECT user_id, timestamp, value FROM purchases".to_string(),
            inverse: false,
        }
    }

    fn country(slices: &[&str]) -> DimensionWithSlices {
        DimensionWithSlices {
            dimension: Dimension {
                id: "exp:country".to_string(),
                column: "country".to_string(),
                user_id_type: "user_id".to_string(),
            },
            slices: slices.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_plan_names_and_markers() {
        let eq = exposure_query();
        let ph = phase();
        let metrics = vec![metric("met_a"), metric("met_b")];
        let precomputed = vec![country(&["US", "D'E"])];

        let plan = QueryPlanner.plan(&PlanInput {
            exposure_query: &eq,
            phase: &ph,
            metrics: &metrics,
            dimension: None,
            precomputed: &precomputed,
        });

        let names: Vec<&str> = plan.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, vec!["traffic", "traffic:exp:country", "metric:met_a", "metric:met_b"]);

        for query in &plan {
            assert!(query.sql.starts_with(&format!("-- {}\n", query.name)));
        }
        assert!(plan[1].sql.contains("'D''E'"));
        assert!(plan[1].sql.contains("'__other__'"));
        assert!(plan[2].sql.contains("'All'"));
        assert!(plan[0].sql.contains("'2026-01-01 00:00:00'"));
    }

    #[test]
    fn test_requested_dimension_replaces_precomputed() {
        let eq = exposure_query();
        let ph = phase();
        let metrics = vec![metric("met_a")];
        let requested = country(&[]).dimension;
        let precomputed = vec![country(&["US"])];

        let plan = QueryPlanner.plan(&PlanInput {
            exposure_query: &eq,
            phase: &ph,
            metrics: &metrics,
            dimension: Some(&requested),
            precomputed: &precomputed,
        });

        assert_eq!(plan.len(), 3);
        assert!(!plan[1].sql.contains("CASE WHEN"));
        assert!(plan[2].sql.contains("e.\"country\""));
    }
}
