//! Datasource, Exposure Query and Metric Contracts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix for dimensions that come from an exposure query column.
pub const EXPOSURE_DIMENSION_PREFIX: &str = "exp:";

/// Slice metadata for one exposure-query dimension column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DimensionMetadata {
    pub dimension: String,
    /// Enumerated slice values; anything else falls into an implicit "other" bucket
    #[serde(default)]
    pub specified_slices: Vec<String>,
}

/// The query that assigns users to variations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExposureQuery {
    pub id: String,
    pub name: String,
    pub user_id_type: String,

    /// SELECT returning `user_id`, `timestamp`, `experiment_id`, `variation_id` and the dimension columns
    pub sql: String,

    /// Dimension columns, in priority order
    #[serde(default)]
    pub dimensions: Vec<String>,

    #[serde(default)]
    pub dimension_metadata: Vec<DimensionMetadata>,
}

impl ExposureQuery {
    /// Identifier of an exposure dimension column, e.g. `exp:country`.
    pub fn dimension_id(column: &str) -> String {
        format!("{}{}", EXPOSURE_DIMENSION_PREFIX, column)
    }

    pub fn metadata_for(&self, column: &str) -> Option<&DimensionMetadata> {
        self.dimension_metadata.iter().find(|m| m.dimension == column)
    }
}

/// A column reported by the warehouse's information schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InformationSchemaColumn {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

/// Cached copy of a datasource's information schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InformationSchema {
    pub columns: Vec<InformationSchemaColumn>,
    pub refreshed_at: DateTime<Utc>,
}

/// Connection-independent description of a warehouse datasource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasourceConfig {
    pub id: String,
    pub organization: String,
    pub name: String,

    /// Warehouse flavour, e.g. "bigquery" or "postgres"
    pub kind: String,

    #[serde(default)]
    pub exposure_queries: Vec<ExposureQuery>,

    pub information_schema: Option<InformationSchema>,
}

impl DatasourceConfig {
    pub fn exposure_query(&self, id: &str) -> Option<&ExposureQuery> {
        self.exposure_queries.iter().find(|q| q.id == id)
    }
}

/// A metric computed per user from warehouse data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricDefinition {
    pub id: String,
    pub organization: String,
    pub name: String,
    pub datasource: String,

    /// SELECT returning `user_id`, `timestamp`, `value`
    pub sql: String,

    /// Lower is better
    #[serde(default)]
    pub inverse: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricGroup {
    pub id: String,
    pub organization: String,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDataType {
    String,
    Number,
    Date,
    Boolean,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactTableColumn {
    pub column: String,
    pub data_type: ColumnDataType,
    /// Most frequent values, refreshed by the maintenance sweep
    #[serde(default)]
    pub top_values: Vec<String>,
    pub top_values_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FactTable {
    pub id: String,
    pub organization: String,
    pub datasource: String,
    pub sql: String,
    pub columns: Vec<FactTableColumn>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimension_id_and_metadata_lookup() {
        let query = ExposureQuery {
            id: "user_id".to_string(),
            name: "Users".to_string(),
            user_id_type: "user_id".to_string(),
            sql: "SELECT * FROM exposures".to_string(),
            dimensions: vec!["country".to_string(), "browser".to_string()],
            dimension_metadata: vec![DimensionMetadata {
                dimension: "country".to_string(),
                specified_slices: vec!["US".to_string(), "DE".to_string()],
            }],
        };

        assert_eq!(ExposureQuery::dimension_id("country"), "exp:country");
        assert_eq!(query.metadata_for("country").map(|m| m.specified_slices.len()), Some(2));
        assert!(query.metadata_for("browser").is_none());
    }
}
