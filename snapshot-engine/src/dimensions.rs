//! Dimension Resolver
//!
//! Decides which exposure-query dimensions a snapshot may be sliced by and
//! keeps the number of analysis cells bounded.
//!
//! A cell is one (slice combination, variation) pair. For dimensions with
//! enumerated slices every dimension contributes its slices plus an implicit
//! `__other__` bucket, so the cell count is
//! `n_variations * product(slices_i + 1)`.

use serde::{Deserialize, Serialize};

use crate::contracts::{ExposureQuery, IncrementalRefreshState, EXPOSURE_DIMENSION_PREFIX};

/// Ceiling on analysis cells used when none is configured.
pub const DEFAULT_MAX_DIMENSION_CELLS: usize = 1000;

/// A dimension column of an exposure query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    /// Identifier used on snapshots, e.g. `exp:country`
    pub id: String,
    pub column: String,
    /// Unit type of the exposure query the column belongs to
    pub user_id_type: String,
}

/// A dimension with an enumerated, finite slice list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionWithSlices {
    #[serde(flatten)]
    pub dimension: Dimension,
    pub slices: Vec<String>,
}

impl DimensionWithSlices {
    /// Number of buckets, counting the implicit other bucket.
    pub fn bucket_count(&self) -> usize {
        self.slices.len() + 1
    }
}

/// The three candidate views returned by [`eligible_dimensions`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EligibleDimensions {
    /// Every candidate; usable for ad hoc traffic analysis
    pub all: Vec<Dimension>,
    /// Candidates with enumerated slices
    pub with_slices: Vec<DimensionWithSlices>,
    /// Candidates with slices, trimmed to the cell ceiling; usable for pre-computation
    pub under_max_cells: Vec<DimensionWithSlices>,
}

impl EligibleDimensions {
    pub fn contains(&self, dimension_id: &str) -> bool {
        self.all.iter().any(|d| d.id == dimension_id)
    }

    pub fn find(&self, dimension_id: &str) -> Option<&Dimension> {
        self.all.iter().find(|d| d.id == dimension_id)
    }
}

/// One entry per configured dimension column, in configuration order.
pub fn exposure_dimensions(exposure_query: &ExposureQuery) -> Vec<Dimension> {
    exposure_query
        .dimensions
        .iter()
        .map(|column| Dimension {
            id: ExposureQuery::dimension_id(column),
            column: column.clone(),
            user_id_type: exposure_query.user_id_type.clone(),
        })
        .collect()
}

/// Keep the dimensions that have a non-empty slice list.
pub fn dimensions_with_slices(dimensions: &[Dimension], exposure_query: &ExposureQuery) -> Vec<DimensionWithSlices> {
    dimensions
        .iter()
        .filter_map(|dimension| {
            let metadata = exposure_query.metadata_for(&dimension.column)?;
            if metadata.specified_slices.is_empty() {
                return None;
            }
            Some(DimensionWithSlices {
                dimension: dimension.clone(),
                slices: metadata.specified_slices.clone(),
            })
        })
        .collect()
}

/// Total analysis cells for a set of dimensions. Saturates instead of overflowing.
pub fn cell_count(dimensions: &[DimensionWithSlices], n_variations: usize) -> usize {
    dimensions
        .iter()
        .fold(n_variations, |cells, d| cells.saturating_mul(d.bucket_count()))
}

/// Drop dimensions from the tail until the cell count fits under `max_cells`.
pub fn trim_to_max_cells(
    mut dimensions: Vec<DimensionWithSlices>,
    n_variations: usize,
    max_cells: usize,
) -> Vec<DimensionWithSlices> {
    while !dimensions.is_empty() && cell_count(&dimensions, n_variations) > max_cells {
        dimensions.pop();
    }
    dimensions
}

/// Candidate dimensions for an analysis.
///
/// With incremental refresh active only dimensions already materialized by
/// the refresh pipeline are candidates.
pub fn eligible_dimensions(
    exposure_query: &ExposureQuery,
    incremental_refresh: Option<&IncrementalRefreshState>,
    n_variations: usize,
    max_cells: usize,
) -> EligibleDimensions {
    let all: Vec<Dimension> = exposure_dimensions(exposure_query)
        .into_iter()
        .filter(|d| match incremental_refresh {
            Some(state) => state
                .materialized_dimensions
                .iter()
                .any(|m| m == &d.column || m == &d.id),
            None => true,
        })
        .collect();

    let with_slices = dimensions_with_slices(&all, exposure_query);
    let under_max_cells = trim_to_max_cells(with_slices.clone(), n_variations, max_cells);

    EligibleDimensions {
        all,
        with_slices,
        under_max_cells,
    }
}

/// Resolver bound to a configured cell ceiling.
#[derive(Debug, Clone, Copy)]
pub struct DimensionResolver {
    max_cells: usize,
}

impl Default for DimensionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DIMENSION_CELLS)
    }
}

impl DimensionResolver {
    pub fn new(max_cells: usize) -> Self {
        Self { max_cells }
    }

    pub fn max_cells(&self) -> usize {
        self.max_cells
    }

    pub fn resolve(
        &self,
        exposure_query: &ExposureQuery,
        incremental_refresh: Option<&IncrementalRefreshState>,
        n_variations: usize,
    ) -> EligibleDimensions {
        eligible_dimensions(exposure_query, incremental_refresh, n_variations, self.max_cells)
    }

    /// Column name of an exposure dimension id, `None` for other id forms.
    pub fn parse(dimension_id: &str) -> Option<&str> {
        dimension_id
            .strip_prefix(EXPOSURE_DIMENSION_PREFIX)
            .filter(|column| !column.is_empty())
    }
}
