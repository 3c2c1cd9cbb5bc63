//! Warehouse Integration
//!
//! The engine treats a warehouse as a black box that accepts SQL and returns
//! rows. Cancellation is best effort: not every warehouse can stop a running
//! statement.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::contracts::{DatasourceConfig, Row};

/// Errors from warehouse operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WarehouseError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Response error: status={status}, message={message}")]
    Response { status: u16, message: String },

    #[error("Timeout error")]
    Timeout,

    #[error("Retry exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Cancellation not supported")]
    CancelUnsupported,
}

/// Rows returned by a warehouse, plus the warehouse-side statement id when
/// the warehouse reports one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub statement_id: Option<String>,
}

impl QueryOutput {
    pub fn rows(rows: Vec<Row>) -> Self {
        Self { rows, statement_id: None }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Run a statement to completion.
    ///
    /// `query_id` is the engine's id for the statement; warehouses that
    /// support cancellation use it as the statement label.
    async fn run_query(&self, query_id: &str, sql: &str) -> Result<QueryOutput, WarehouseError>;

    /// Ask the warehouse to stop a running statement.
    async fn cancel_query(&self, query_id: &str) -> Result<(), WarehouseError> {
        let _ = query_id;
        Err(WarehouseError::CancelUnsupported)
    }
}

/// Resolves a datasource to a live warehouse integration.
#[async_trait]
pub trait WarehouseRegistry: Send + Sync {
    async fn resolve(&self, datasource: &DatasourceConfig) -> Result<Arc<dyn Warehouse>, WarehouseError>;
}
