//! Database module for PostgreSQL connection and execution
//!
//! Provides the shared pool, its health probe, the retry layer and the
//! read-only executor used by the query pipeline.

pub mod connection;
pub mod executor;
pub mod retry;

pub use connection::{init_pool, ConnectionHealth, DbPool, HealthMonitor, PoolSettings, ProbeOutcome};
pub use executor::{PgExecutor, QueryExecutionResult, QueryExecutor};
pub use retry::{RetryError, RetryPolicy};
