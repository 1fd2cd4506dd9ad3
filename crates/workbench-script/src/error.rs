use workbench_engine::{CancelledOperation, Classified, DatabaseEngineError, ErrorDetails};

use crate::statement::StatementKind;

/// Result type alias for script operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A statement that failed inside a script.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("statement {} ({kind}) failed: {error}", statement_index + 1)]
pub struct ScriptFailure {
   /// Zero-based position of the statement in the script
   pub statement_index: usize,
   pub kind: StatementKind,
   pub sql: String,
   pub error: DatabaseEngineError,
}

/// Error types for script execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the engine or the connection pool.
   #[error(transparent)]
   Engine(#[from] workbench_engine::Error),

   /// A statement failed; the batch was rolled back.
   #[error(transparent)]
   StatementFailed(Box<ScriptFailure>),

   /// COMMIT failed after every statement succeeded.
   #[error("commit failed: {0}")]
   CommitFailed(DatabaseEngineError),

   /// The run was cancelled before it finished.
   #[error("script cancelled: {}", .0.reason)]
   Cancelled(CancelledOperation),

   /// A statement targets a system object the runner refuses to touch.
   #[error("statement {} modifies protected object '{object}'", statement_index + 1)]
   ProtectedObject {
      statement_index: usize,
      object: String,
   },

   /// The tab already has a script running.
   #[error("a script is already running in tab {0}")]
   AlreadyRunning(String),

   /// Sort column that is not part of the result.
   #[error("sort column '{0}' is not in the result")]
   UnknownSortColumn(String),

   /// Alias or type name that cannot be spliced into ATTACH/DETACH.
   #[error("invalid attach identifier '{0}'")]
   InvalidAttachIdentifier(String),
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Engine(e) => e.error_code(),
         Error::StatementFailed(failure) => failure.error.code.clone(),
         Error::CommitFailed(_) => "COMMIT_FAILED".to_string(),
         Error::Cancelled(_) => "CANCELLED".to_string(),
         Error::ProtectedObject { .. } => "PROTECTED_OBJECT".to_string(),
         Error::AlreadyRunning(_) => "SCRIPT_ALREADY_RUNNING".to_string(),
         Error::UnknownSortColumn(_) => "UNKNOWN_SORT_COLUMN".to_string(),
         Error::InvalidAttachIdentifier(_) => "INVALID_ATTACH_IDENTIFIER".to_string(),
      }
   }

   pub fn is_cancelled(&self) -> bool {
      matches!(self, Error::Cancelled(_))
   }

   /// Map into the shared error taxonomy.
   pub fn classify(&self) -> Classified {
      match self {
         Error::Engine(e) => workbench_engine::classify(e),
         Error::StatementFailed(failure) => Classified::Failure(failure.error.clone()),
         Error::CommitFailed(e) => Classified::Failure(e.clone()),
         Error::Cancelled(op) => Classified::Cancelled(op.clone()),
         Error::ProtectedObject { .. } => Classified::Failure(
            DatabaseEngineError::query_execution(self.to_string()).with_code(self.error_code()),
         ),
         Error::AlreadyRunning(_) | Error::UnknownSortColumn(_) | Error::InvalidAttachIdentifier(_) => {
            workbench_engine::classify_with(self.to_string(), &ErrorDetails::default())
         }
      }
   }
}
