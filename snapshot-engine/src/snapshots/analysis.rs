//! Reduction of raw query rows into health and per-metric statistics.
//!
//! Only succeeded sub-queries contribute. A metric whose query failed has no
//! entry in the results; it is reported through the snapshot's failed
//! queries instead.

use std::collections::BTreeMap;

use serde_json::Value;

use super::plan::{metric_query_name, TRAFFIC_DIMENSION_PREFIX, TRAFFIC_QUERY};
use crate::contracts::{
    DimensionTraffic, MetricDefinition, MetricResult, OrganizationSettings, Row, SliceResult, SliceTraffic,
    TrafficHealth, Variation, VariationResult, ALL_SLICE,
};
use crate::query_runner::QueryRun;
use crate::stats::{
    check_srm, finite_or_zero, mean_variance_from_sums, power_estimate, ComparisonSettings, StatsEngine,
    VariationAggregate,
};

pub struct AnalysisInput<'a> {
    pub variations: &'a [Variation],
    /// Traffic split of the analysed phase
    pub weights: &'a [f64],
    pub metrics: &'a [MetricDefinition],
    pub settings: &'a OrganizationSettings,
    pub engine: &'a dyn StatsEngine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub health: Option<TrafficHealth>,
    pub results: BTreeMap<String, MetricResult>,
}

pub fn analyze(run: &QueryRun, input: &AnalysisInput<'_>) -> Analysis {
    let rows = run.succeeded_rows();

    let health = rows.get(TRAFFIC_QUERY).map(|traffic| {
        let users = users_by_variation(traffic, input.variations);
        let srm_p_value = check_srm(&users, input.weights);

        let dimensions = rows
            .iter()
            .filter_map(|(name, rows)| {
                name.strip_prefix(TRAFFIC_DIMENSION_PREFIX)
                    .map(|dimension| dimension_traffic(dimension, rows, input))
            })
            .collect::<BTreeMap<_, _>>()
            .into_values()
            .collect();

        TrafficHealth {
            users,
            srm_p_value,
            srm_warning: srm_p_value < input.settings.srm_threshold_f64(),
            dimensions,
        }
    });

    let results = input
        .metrics
        .iter()
        .filter_map(|metric| {
            rows.get(metric_query_name(&metric.id).as_str())
                .map(|rows| (metric.id.clone(), metric_result(metric, rows, input)))
        })
        .collect();

    Analysis { health, results }
}

fn dimension_traffic(dimension: &str, rows: &[Row], input: &AnalysisInput<'_>) -> (String, DimensionTraffic) {
    let mut slices: BTreeMap<String, Vec<f64>> = BTreeMap::new();

    for row in rows {
        let Some(index) = variation_index(row, input.variations) else {
            continue;
        };
        let slice = slice_name(row);
        let users = slices
            .entry(slice)
            .or_insert_with(|| vec![0.0; input.variations.len()]);
        users[index] += number(row, "users");
    }

    let slices = slices
        .into_iter()
        .map(|(slice, users)| {
            let srm_p_value = check_srm(&users, input.weights);
            SliceTraffic {
                slice,
                users,
                srm_p_value,
            }
        })
        .collect();

    (
        dimension.to_string(),
        DimensionTraffic {
            dimension: dimension.to_string(),
            slices,
        },
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct Sums {
    users: f64,
    count: f64,
    sum: f64,
    sum_squares: f64,
}

fn metric_result(metric: &MetricDefinition, rows: &[Row], input: &AnalysisInput<'_>) -> MetricResult {
    let mut slices: BTreeMap<String, Vec<Sums>> = BTreeMap::new();

    for row in rows {
        let Some(index) = variation_index(row, input.variations) else {
            continue;
        };
        let sums = &mut slices
            .entry(slice_name(row))
            .or_insert_with(|| vec![Sums::default(); input.variations.len()])[index];

        sums.users += number(row, "users");
        sums.count += number(row, "count");
        sums.sum += number(row, "main_sum");
        sums.sum_squares += number(row, "main_sum_squares");
    }

    let comparison = ComparisonSettings {
        confidence_level: input.settings.confidence_level_f64(),
        inverse: metric.inverse,
    };

    let mut slices: Vec<SliceResult> = slices
        .into_iter()
        .map(|(name, sums)| SliceResult {
            variations: slice_variations(&sums, input, &comparison),
            name,
        })
        .collect();
    slices.sort_by_key(|s| s.name != ALL_SLICE);

    MetricResult {
        metric_id: metric.id.clone(),
        slices,
    }
}

fn slice_variations(sums: &[Sums], input: &AnalysisInput<'_>, comparison: &ComparisonSettings) -> Vec<VariationResult> {
    let total_users: f64 = sums.iter().map(|s| s.users).sum();
    let alpha = 1.0 - comparison.confidence_level;
    let mde = input.settings.minimum_detectable_effect_f64();

    let aggregates: Vec<VariationAggregate> = sums
        .iter()
        .map(|s| VariationAggregate {
            users: s.users,
            mean: finite_or_zero(s.sum / s.users),
            variance: mean_variance_from_sums(s.sum, s.sum_squares, s.users),
        })
        .collect();

    input
        .variations
        .iter()
        .zip(sums.iter().zip(aggregates.iter()))
        .enumerate()
        .map(|(index, (variation, (s, aggregate)))| {
            let power = (index > 0).then(|| {
                power_estimate(
                    mde,
                    aggregate.mean,
                    aggregate.variance,
                    total_users,
                    input.variations.len() as f64,
                    alpha,
                    true,
                )
            });
            let compared = (index > 0).then(|| input.engine.compare(&aggregates[0], aggregate, comparison));

            VariationResult {
                variation: variation.key.clone(),
                users: s.users,
                count: s.count,
                mean: aggregate.mean,
                variance: aggregate.variance,
                power,
                expected_lift: compared.map(|c| c.expected_lift),
                ci: compared.map(|c| c.ci),
                p_value: compared.and_then(|c| c.p_value),
                chance_to_win: compared.and_then(|c| c.chance_to_win),
            }
        })
        .collect()
}

fn users_by_variation(rows: &[Row], variations: &[Variation]) -> Vec<f64> {
    let mut users = vec![0.0; variations.len()];
    for row in rows {
        if let Some(index) = variation_index(row, variations) {
            users[index] += number(row, "users");
        }
    }
    users
}

/// Position of the row's variation; rows are matched on key, then id.
fn variation_index(row: &Row, variations: &[Variation]) -> Option<usize> {
    let value = text(row, "variation")?;
    variations
        .iter()
        .position(|v| v.key == value)
        .or_else(|| variations.iter().position(|v| v.id == value))
}

fn slice_name(row: &Row) -> String {
    text(row, "dimension").unwrap_or_else(|| ALL_SLICE.to_string())
}

fn text(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Numeric cell; warehouses often return large integers as strings.
fn number(row: &Row, column: &str) -> f64 {
    let value = match row.get(column) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    finite_or_zero(value)
}
