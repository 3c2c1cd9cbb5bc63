//! Aggregate state of a query run.

use std::collections::HashMap;

use crate::contracts::{FailedQuery, QueryPointer, QueryRecord, QueryStatus, Row, SnapshotStatus};

/// Reduce sub-query statuses to the status of the whole run.
///
/// Cancellation wins over everything else. While any sub-query is still
/// running the run is running. A run without sub-queries has nothing left to
/// do and counts as succeeded.
pub fn reduce_status(statuses: &[QueryStatus], cancelled: bool) -> SnapshotStatus {
    if cancelled {
        return SnapshotStatus::Cancelled;
    }
    if statuses.iter().any(|s| *s == QueryStatus::Running) {
        return SnapshotStatus::Running;
    }

    let succeeded = statuses.iter().filter(|s| **s == QueryStatus::Succeeded).count();
    match (succeeded, statuses.len() - succeeded) {
        (_, 0) => SnapshotStatus::Succeeded,
        (0, _) => SnapshotStatus::Failed,
        _ => SnapshotStatus::PartiallySucceeded,
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRun {
    pub status: SnapshotStatus,
    /// Final records, in plan order
    pub queries: Vec<QueryRecord>,
}

impl QueryRun {
    pub fn pointers(&self) -> Vec<QueryPointer> {
        pointers(&self.queries)
    }

    pub fn failed_queries(&self) -> Vec<FailedQuery> {
        self.queries
            .iter()
            .filter(|q| q.status == QueryStatus::Failed)
            .map(|q| FailedQuery {
                name: q.name.clone(),
                error: q.error.clone().unwrap_or_else(|| "unknown error".to_string()),
            })
            .collect()
    }

    /// Rows of every succeeded sub-query keyed by name.
    pub fn succeeded_rows(&self) -> HashMap<&str, &[Row]> {
        self.queries
            .iter()
            .filter(|q| q.status == QueryStatus::Succeeded)
            .map(|q| (q.name.as_str(), q.rows.as_slice()))
            .collect()
    }

    /// First error message of the run, used when nothing succeeded.
    pub fn first_error(&self) -> Option<String> {
        self.queries
            .iter()
            .find_map(|q| q.error.as_ref().map(|e| format!("{}: {}", q.name, e)))
    }
}

pub(crate) fn pointers(queries: &[QueryRecord]) -> Vec<QueryPointer> {
    queries
        .iter()
        .map(|q| QueryPointer {
            query_id: q.id,
            name: q.name.clone(),
            status: q.status,
        })
        .collect()
}
