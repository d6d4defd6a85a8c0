//! PostgreSQL access layer.
//!
//! A [`ConnectionManager`] owns one pool per connection string. Tools ask it for a
//! [`ConnectionHandle`], run their statements, and drop the handle to release the client.

pub mod connection;
pub mod params;
pub mod pool;
pub mod resolver;
pub mod rows;

pub use connection::{
    ConnectionHandle, ConnectionManager, ManagerStats, Params, PoolSummary, Statement,
    StatementOutcome,
};
pub use params::SqlValue;
pub use pool::{PoolMetrics, PoolMetricsSnapshot, PoolStatus, build_pool};
pub use resolver::{ConnectionResolver, redact};
pub use rows::row_to_json;
