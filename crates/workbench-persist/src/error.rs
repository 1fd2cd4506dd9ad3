//! Error types for the workbench-persist crate.

use workbench_engine::DatabaseEngineError;

/// Result type alias for store and persistence operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while touching the private file store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Underlying file system failure.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Path rejected during normalization.
   #[error("invalid store path '{path}': {reason}")]
   InvalidPath { path: String, reason: &'static str },

   /// Nothing stored at the path.
   #[error("no file or directory at '{0}'")]
   NotFound(String),

   /// The platform refused an operation because a sync access handle is
   /// open on the path.
   #[error("an access handle is already open on '{0}'")]
   HandleConflict(String),

   /// The store root could not be opened.
   #[error("storage backend unavailable at '{path}': {source}")]
   Unavailable {
      path: String,
      #[source]
      source: std::io::Error,
   },

   /// Imported bytes do not start with the expected file header.
   #[error("'{0}' does not look like a database file")]
   InvalidHeader(String),

   /// `initialize()` has not completed.
   #[error("persistence has not been initialized")]
   NotInitialized,

   /// The store was closed and refuses further operations.
   #[error("file store has been closed")]
   Closed,

   /// Running in memory; there is no durable file.
   #[error("persistence is running in memory mode")]
   MemoryMode,
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::InvalidPath { .. } => "INVALID_PATH".to_string(),
         Error::NotFound(_) => "NOT_FOUND".to_string(),
         Error::HandleConflict(_) => "HANDLE_CONFLICT".to_string(),
         Error::Unavailable { .. } => "STORAGE_UNAVAILABLE".to_string(),
         Error::InvalidHeader(_) => "INVALID_HEADER".to_string(),
         Error::NotInitialized => "NOT_INITIALIZED".to_string(),
         Error::Closed => "STORE_CLOSED".to_string(),
         Error::MemoryMode => "MEMORY_MODE".to_string(),
      }
   }

   /// Map into the shared error taxonomy.
   ///
   /// Backend and lifecycle failures are initialization errors; everything
   /// else is a file operation error. `path` is recorded in the details.
   pub fn to_engine_error(&self, path: &str) -> DatabaseEngineError {
      let error = match self {
         Error::Unavailable { .. } | Error::NotInitialized => {
            DatabaseEngineError::initialization(self.to_string())
         }
         _ => DatabaseEngineError::file_operation(self.to_string()),
      };
      error.with_code(self.error_code()).with_path(path)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use workbench_engine::ErrorKind;

   #[test]
   fn test_unavailable_maps_to_initialization_error() {
      let err = Error::Unavailable {
         path: "/nope".into(),
         source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
      };
      let engine_err = err.to_engine_error("workbench.db");

      assert_eq!(engine_err.kind, ErrorKind::InitializationError);
      assert_eq!(engine_err.code, "STORAGE_UNAVAILABLE");
      assert_eq!(engine_err.details.path.as_deref(), Some("workbench.db"));
      assert!(!engine_err.recoverable);
   }

   #[test]
   fn test_handle_conflict_is_a_file_error() {
      let err = Error::HandleConflict("workbench.db".into());
      assert_eq!(err.error_code(), "HANDLE_CONFLICT");
      assert_eq!(
         err.to_engine_error("workbench.db").kind,
         ErrorKind::FileOperationError
      );
   }
}
