//! sqlsession Engine
//!
//! Backend-neutral machinery of the session-state store:
//! - Connection pool with idle scavenger
//! - Retry/backoff engine with error classification
//! - Chunked transport choosing a payload tier per write
//! - `SqlSessionStateStore`, the facade implementing `SessionStateStore`
//!
//! Backends plug in through the [`Connector`] and [`StoreConnection`] traits.

pub mod config;
pub mod connection;
pub mod db_error;
pub mod metrics;
pub mod pool;
pub mod retry;
pub mod store;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{LoggingConfig, PoolConfig, RetryConfig, StoreConfig};
pub use connection::{CallReply, Connector, ItemReply, ProcedureCall, StoreConnection, WriteHeader};
pub use db_error::{DbError, DbErrorKind, DbResult};
pub use metrics::StoreMetrics;
pub use pool::{ConnectionGuard, ConnectionPool, PoolOptions};
pub use retry::{Classification, Decision, RetryPolicy, RetryState, classify};
pub use store::SqlSessionStateStore;
pub use transport::{ChunkedTransport, ItemRead, WriteOutcome, WriteRequest};
