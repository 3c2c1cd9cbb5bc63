//! External Collaborators
//!
//! Traits for the persistent store and warehouse integrations the engine
//! depends on, with an in-memory store and an HTTP SQL-gateway warehouse.

pub mod memory;
pub mod sql_gateway;
pub mod store;
pub mod warehouse;

pub use memory::InMemoryStore;
pub use sql_gateway::{SqlGatewayClient, SqlGatewayConfig, SqlGatewayRegistry, SqlGatewayWarehouse};
pub use store::{AnalysisStore, SnapshotUpdate, StoreError};
pub use warehouse::{QueryOutput, Warehouse, WarehouseError, WarehouseRegistry};
