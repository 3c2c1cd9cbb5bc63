//! Query Contracts
//!
//! A query is one SQL statement sent to a warehouse on behalf of a snapshot.
//! Records are value objects: every status change produces a new record that
//! replaces the stored one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A single result row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Lifecycle of a single sub-query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Running,
    Succeeded,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRecord {
    pub id: Uuid,
    pub snapshot_id: Uuid,
    pub organization: String,
    pub datasource: String,

    /// Logical name within the snapshot, e.g. `traffic` or `metric:met_a`
    pub name: String,

    pub sql: String,

    /// SHA-256 of datasource id and SQL text
    pub fingerprint: String,

    pub status: QueryStatus,

    #[serde(default)]
    pub rows: Vec<Row>,

    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Rows were reused from an earlier identical query
    #[serde(default)]
    pub cached_result: bool,
}

impl QueryRecord {
    /// Create a record in the `running` state.
    pub fn start(
        snapshot_id: Uuid,
        organization: impl Into<String>,
        datasource: impl Into<String>,
        name: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        let organization = organization.into();
        let datasource = datasource.into();
        let sql = sql.into();
        let fingerprint = Self::fingerprint(&organization, &datasource, &sql);

        Self {
            id: Uuid::new_v4(),
            snapshot_id,
            organization,
            datasource,
            name: name.into(),
            sql,
            fingerprint,
            status: QueryStatus::Running,
            rows: Vec::new(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            cached_result: false,
        }
    }

    /// Fingerprint used to match identical queries for caching.
    ///
    /// Datasource ids are only unique within an organization, so the
    /// organization is part of the hash.
    pub fn fingerprint(organization: &str, datasource: &str, sql: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(organization.as_bytes());
        hasher.update(b"\n");
        hasher.update(datasource.as_bytes());
        hasher.update(b"\n");
        hasher.update(sql.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn succeeded(&self, rows: Vec<Row>) -> Self {
        Self {
            status: QueryStatus::Succeeded,
            rows,
            error: None,
            finished_at: Some(Utc::now()),
            ..self.clone()
        }
    }

    pub fn from_cache(&self, rows: Vec<Row>) -> Self {
        Self {
            cached_result: true,
            ..self.succeeded(rows)
        }
    }

    pub fn failed(&self, error: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Failed,
            rows: Vec::new(),
            error: Some(error.into()),
            finished_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic_and_scoped_to_datasource() {
        let a = QueryRecord::fingerprint("org_1", "ds_1", "SELECT 1");
        let b = QueryRecord::fingerprint("org_1", "ds_1", "SELECT 1");
        let c = QueryRecord::fingerprint("org_1", "ds_2", "SELECT 1");

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fingerprint_is_scoped_to_organization() {
        let a = QueryRecord::fingerprint("org_1", "ds_1", "SELECT 1");
        let b = QueryRecord::fingerprint("org_2", "ds_1", "SELECT 1");
        assert_ne!(a, b);

        let first = QueryRecord::start(Uuid::new_v4(), "org_1", "ds_1", "traffic", "SELECT 1");
        let second = QueryRecord::start(Uuid::new_v4(), "org_2", "ds_1", "traffic", "SELECT 1");
        assert_ne!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_transitions_produce_new_records() {
        let running = QueryRecord::start(Uuid::new_v4(), "org", "ds", "traffic", "SELECT 1");
        let failed = running.failed("syntax error");

        assert_eq!(running.status, QueryStatus::Running);
        assert_eq!(failed.status, QueryStatus::Failed);
        assert_eq!(failed.id, running.id);
        assert_eq!(failed.error.as_deref(), Some("syntax error"));
        assert!(failed.finished_at.is_some());

        let cached = running.from_cache(vec![Row::new()]);
        assert!(cached.cached_result);
        assert_eq!(cached.status, QueryStatus::Succeeded);
    }
}
