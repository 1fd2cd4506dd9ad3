use workbench_engine::{Classified, DatabaseEngineError};

/// Result type alias for workbench operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the [`Workbench`](crate::Workbench) facade.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the engine or the connection pool.
   #[error(transparent)]
   Engine(#[from] workbench_engine::Error),

   /// Error from script execution.
   #[error(transparent)]
   Script(#[from] workbench_script::Error),

   /// Persistence failure, already classified against the durable file.
   #[error("{}", .0.message)]
   Persistence(DatabaseEngineError),

   /// The session already has an open workbench.
   #[error("session {0} is already bootstrapped")]
   AlreadyBootstrapped(String),

   /// The workbench was shut down.
   #[error("workbench has been shut down")]
   ShutDown,
}

impl Error {
   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Engine(e) => e.error_code(),
         Error::Script(e) => e.error_code(),
         Error::Persistence(e) => e.code.clone(),
         Error::AlreadyBootstrapped(_) => "ALREADY_BOOTSTRAPPED".to_string(),
         Error::ShutDown => "WORKBENCH_SHUT_DOWN".to_string(),
      }
   }

   /// Map into the shared error taxonomy.
   pub fn classify(&self) -> Classified {
      match self {
         Error::Engine(e) => workbench_engine::classify(e),
         Error::Script(e) => e.classify(),
         Error::Persistence(e) => Classified::Failure(e.clone()),
         Error::AlreadyBootstrapped(_) | Error::ShutDown => Classified::Failure(
            DatabaseEngineError::initialization(self.to_string()).with_code(self.error_code()),
         ),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use workbench_engine::{CancelledOperation, ErrorKind};

   #[test]
   fn test_shutdown_is_an_initialization_failure() {
      let classified = Error::ShutDown.classify();
      let failure = classified.failure().unwrap();
      assert_eq!(failure.kind, ErrorKind::InitializationError);
      assert_eq!(failure.code, "WORKBENCH_SHUT_DOWN");
   }

   #[test]
   fn test_pool_errors_classify_as_recoverable() {
      let err = Error::Engine(workbench_engine::Error::PoolClosed);
      let classified = err.classify();
      let failure = classified.failure().unwrap();
      assert_eq!(failure.kind, ErrorKind::ConnectionPoolError);
      assert!(failure.recoverable);
   }

   #[test]
   fn test_cancellation_stays_a_cancellation() {
      let err = Error::Script(workbench_script::Error::Cancelled(
         CancelledOperation::by_system("shutdown"),
      ));
      assert!(err.classify().is_cancelled());
      assert_eq!(err.error_code(), "CANCELLED");
   }
}
