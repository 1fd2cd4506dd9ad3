//! # workbench-engine
//!
//! The layer between the workbench UI and the embedded SQL engine.
//!
//! ## Core Types
//!
//! - **[`Engine`] / [`EngineConnection`]**: Capability interface every engine build implements
//! - **[`SqliteEngine`]**: Native build over SQLite
//! - **[`ConnectionPool`]**: Bounded, lazily grown set of sessions with a FIFO acquire queue
//! - **[`PooledConnection`]**: RAII guard returning its session to the pool on drop
//! - **[`classify`]**: Normalizes any raw failure into a [`DatabaseEngineError`] or a
//!   [`CancelledOperation`]
//! - **[`Error`]**: Error type for engine and pool operations
//!
//! ## Concurrency
//!
//! Execution on one session is serialized. Parallelism comes only from
//! holding several sessions at once, bounded by `max_pool_size`.

mod config;
mod decode;
mod engine;
mod error;
mod pool;
mod sqlite;
pub mod taxonomy;
mod transfer;

// Re-export public types
pub use config::{EngineConfig, ExtensionOptions, ExtensionSpec, PoolConfig};
pub use decode::{quote_column, quote_identifier, validate_identifier};
pub use engine::{
   ColumnInfo, DataFormat, Engine, EngineCapabilities, EngineConnection, JsonRow,
   PreparedStatement, QueryResult, RowBatch,
};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, ConnectionState, PoolStatus, PooledConnection};
pub use sqlite::{SqliteEngine, SqliteSession};
pub use taxonomy::{
   CancelledOperation, Classified, DatabaseEngineError, ErrorDetails, ErrorKind, RawError,
   classify, classify_with,
};
