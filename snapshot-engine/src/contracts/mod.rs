//! Data Contracts
//!
//! Value types shared by every component of the engine: the external
//! entities it reads (experiments, rollouts, dashboards, datasources,
//! metrics), the records it owns (snapshots, queries) and the jobs the
//! scheduler keeps.

pub mod common;
pub mod datasource;
pub mod experiment;
pub mod jobs;
pub mod organization;
pub mod query;
pub mod snapshot;

pub use common::*;
pub use datasource::*;
pub use experiment::*;
pub use jobs::*;
pub use organization::*;
pub use query::*;
pub use snapshot::*;
