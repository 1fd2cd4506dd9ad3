//! Error types for workbench-engine

use std::time::Duration;

use thiserror::Error;

/// Errors that may occur when working with the engine or the connection pool
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// JSON encoding or decoding failed during export/import
   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   /// No connection became idle before the acquire deadline
   #[error("timed out after {}ms waiting for a database connection", waited.as_millis())]
   ConnectionTimeout { waited: Duration },

   /// All connections are busy and the caller asked not to wait
   #[error("all {max_size} database connections are busy")]
   PoolExhausted { max_size: usize },

   /// The pool has been shut down and cannot hand out connections
   #[error("connection pool has been closed")]
   PoolClosed,

   /// Engine has not been initialized, or initialization failed
   #[error("engine is not initialized")]
   NotInitialized,

   /// Engine or connection has been closed and cannot be used
   #[error("database has been closed")]
   DatabaseClosed,

   /// SQLite type that cannot be mapped to JSON
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Export/import format the engine does not handle
   #[error("unsupported file format: {0}")]
   UnsupportedFormat(String),

   /// Import payload did not have the expected shape
   #[error("invalid import payload: {0}")]
   InvalidImport(String),

   /// Identifier failed validation before being interpolated into SQL
   #[error("invalid identifier '{0}': must match [a-zA-Z_][a-zA-Z0-9_.]*")]
   InvalidIdentifier(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Json(_) => "JSON_ERROR".to_string(),
         Error::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT".to_string(),
         Error::PoolExhausted { .. } => "POOL_EXHAUSTED".to_string(),
         Error::PoolClosed => "POOL_CLOSED".to_string(),
         Error::NotInitialized => "NOT_INITIALIZED".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE".to_string(),
         Error::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT".to_string(),
         Error::InvalidImport(_) => "INVALID_IMPORT".to_string(),
         Error::InvalidIdentifier(_) => "INVALID_IDENTIFIER".to_string(),
      }
   }

   /// Whether the failure leaves the underlying session unusable.
   ///
   /// The pool retires a slot whose operation failed with a fatal error and
   /// recreates it lazily on the next acquire.
   pub fn is_fatal(&self) -> bool {
      match self {
         Error::Io(_) | Error::DatabaseClosed => true,
         Error::Sqlx(e) => matches!(
            e,
            sqlx::Error::Io(_)
               | sqlx::Error::Protocol(_)
               | sqlx::Error::WorkerCrashed
               | sqlx::Error::PoolClosed
         ),
         _ => false,
      }
   }

   /// Errors raised by the pool itself rather than by the engine.
   pub fn is_pool_error(&self) -> bool {
      matches!(
         self,
         Error::ConnectionTimeout { .. } | Error::PoolExhausted { .. } | Error::PoolClosed
      )
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
