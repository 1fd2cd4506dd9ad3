//! Normalization of heterogeneous failures into a closed set of error kinds
//!
//! Raw failures reach the UI from several places: the native engine's own
//! messages, the pool, an out-of-process engine that reports a JSON envelope,
//! or a cancelled script. [`classify`] turns any of them into a
//! [`Classified`] value without ever failing itself.
//!
//! Strategies are tried in order:
//!
//! 1. Already classified values pass through untouched.
//! 2. Known engine message fragments map to the nearest kind.
//! 3. A structured envelope `{type, details: {message, sql?, path?}}` maps by
//!    its `type`. A message that is itself a serialized envelope is parsed
//!    before any fragment matching.
//! 4. Anything else becomes `UNKNOWN_ERROR`, keeping the original value.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::Error;

/// Closed set of error kinds surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
   ConnectionPoolError,
   QueryExecutionError,
   FileOperationError,
   InitializationError,
   UnknownError,
}

impl ErrorKind {
   /// Only pool failures are worth retrying unchanged.
   pub fn default_recoverable(self) -> bool {
      matches!(self, ErrorKind::ConnectionPoolError)
   }

   /// Code used when nothing more specific is known.
   pub fn default_code(self) -> &'static str {
      match self {
         ErrorKind::ConnectionPoolError => "CONNECTION_POOL_ERROR",
         ErrorKind::QueryExecutionError => "QUERY_EXECUTION_ERROR",
         ErrorKind::FileOperationError => "FILE_OPERATION_ERROR",
         ErrorKind::InitializationError => "INITIALIZATION_ERROR",
         ErrorKind::UnknownError => "UNKNOWN_ERROR",
      }
   }
}

impl fmt::Display for ErrorKind {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         ErrorKind::ConnectionPoolError => "ConnectionPoolError",
         ErrorKind::QueryExecutionError => "QueryExecutionError",
         ErrorKind::FileOperationError => "FileOperationError",
         ErrorKind::InitializationError => "InitializationError",
         ErrorKind::UnknownError => "UnknownError",
      };
      f.write_str(name)
   }
}

/// Context attached to a classified error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
   #[serde(skip_serializing_if = "Option::is_none")]
   pub query: Option<String>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub connection_id: Option<u64>,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub path: Option<String>,
   /// The raw value that was classified, kept for diagnostics
   #[serde(skip_serializing_if = "Option::is_none")]
   pub original_error: Option<JsonValue>,
}

impl ErrorDetails {
   /// Fill fields that are still empty from `other`.
   fn merge_missing(&mut self, other: &ErrorDetails) {
      if self.query.is_none() {
         self.query.clone_from(&other.query);
      }
      if self.connection_id.is_none() {
         self.connection_id = other.connection_id;
      }
      if self.path.is_none() {
         self.path.clone_from(&other.path);
      }
   }
}

/// A failure normalized into the closed taxonomy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct DatabaseEngineError {
   pub kind: ErrorKind,
   pub code: String,
   pub message: String,
   pub details: ErrorDetails,
   pub recoverable: bool,
}

impl DatabaseEngineError {
   pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
      Self {
         kind,
         code: kind.default_code().to_string(),
         message: message.into(),
         details: ErrorDetails::default(),
         recoverable: kind.default_recoverable(),
      }
   }

   pub fn connection_pool(message: impl Into<String>) -> Self {
      Self::new(ErrorKind::ConnectionPoolError, message)
   }

   pub fn query_execution(message: impl Into<String>) -> Self {
      Self::new(ErrorKind::QueryExecutionError, message)
   }

   pub fn file_operation(message: impl Into<String>) -> Self {
      Self::new(ErrorKind::FileOperationError, message)
   }

   pub fn initialization(message: impl Into<String>) -> Self {
      Self::new(ErrorKind::InitializationError, message)
   }

   pub fn with_code(mut self, code: impl Into<String>) -> Self {
      self.code = code.into();
      self
   }

   pub fn with_query(mut self, query: impl Into<String>) -> Self {
      self.details.query = Some(query.into());
      self
   }

   pub fn with_connection_id(mut self, id: u64) -> Self {
      self.details.connection_id = Some(id);
      self
   }

   pub fn with_path(mut self, path: impl Into<String>) -> Self {
      self.details.path = Some(path.into());
      self
   }

   pub fn with_original(mut self, original: JsonValue) -> Self {
      self.details.original_error = Some(original);
      self
   }
}

/// Not a failure: an operation stopped because it was cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledOperation {
   /// True when the user asked for the cancellation
   pub is_user: bool,
   pub reason: String,
}

impl CancelledOperation {
   pub fn by_user(reason: impl Into<String>) -> Self {
      Self {
         is_user: true,
         reason: reason.into(),
      }
   }

   pub fn by_system(reason: impl Into<String>) -> Self {
      Self {
         is_user: false,
         reason: reason.into(),
      }
   }
}

/// Output of classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum Classified {
   Failure(DatabaseEngineError),
   Cancelled(CancelledOperation),
}

impl Classified {
   pub fn is_cancelled(&self) -> bool {
      matches!(self, Classified::Cancelled(_))
   }

   pub fn failure(&self) -> Option<&DatabaseEngineError> {
      match self {
         Classified::Failure(e) => Some(e),
         Classified::Cancelled(_) => None,
      }
   }

   pub fn into_failure(self) -> Option<DatabaseEngineError> {
      match self {
         Classified::Failure(e) => Some(e),
         Classified::Cancelled(_) => None,
      }
   }
}

/// Input to classification.
#[derive(Debug, Clone)]
pub enum RawError {
   Classified(DatabaseEngineError),
   Cancelled(CancelledOperation),
   /// A bare message, e.g. from the engine or a foreign boundary
   Message(String),
   /// A structured value, e.g. an out-of-process engine's error envelope
   Json(JsonValue),
}

impl From<DatabaseEngineError> for RawError {
   fn from(e: DatabaseEngineError) -> Self {
      RawError::Classified(e)
   }
}

impl From<CancelledOperation> for RawError {
   fn from(c: CancelledOperation) -> Self {
      RawError::Cancelled(c)
   }
}

impl From<String> for RawError {
   fn from(message: String) -> Self {
      RawError::Message(message)
   }
}

impl From<&str> for RawError {
   fn from(message: &str) -> Self {
      RawError::Message(message.to_string())
   }
}

impl From<JsonValue> for RawError {
   fn from(value: JsonValue) -> Self {
      RawError::Json(value)
   }
}

/// Engine errors are classified where they arise: pool failures are already
/// known, everything else goes through message matching.
impl From<&Error> for RawError {
   fn from(e: &Error) -> Self {
      match e {
         Error::ConnectionTimeout { .. } | Error::PoolExhausted { .. } => RawError::Classified(
            DatabaseEngineError::connection_pool(
               "The database is not ready yet, please retry in a moment",
            )
            .with_code(e.error_code())
            .with_original(JsonValue::String(e.to_string())),
         ),
         Error::PoolClosed => RawError::Classified(
            DatabaseEngineError::connection_pool("The database connection pool has been closed")
               .with_code(e.error_code())
               .with_original(JsonValue::String(e.to_string())),
         ),
         Error::NotInitialized => RawError::Classified(
            DatabaseEngineError::initialization(e.to_string()).with_code(e.error_code()),
         ),
         // Anything the database itself rejected is a query failure unless
         // its message says otherwise
         Error::Sqlx(sqlx::Error::Database(db)) => RawError::Classified(
            classify_message(db.message())
               .and_then(Classified::into_failure)
               .unwrap_or_else(|| {
                  DatabaseEngineError::query_execution(db.message())
                     .with_code(e.error_code())
                     .with_original(JsonValue::String(e.to_string()))
               }),
         ),
         Error::Io(_) => RawError::Classified(
            DatabaseEngineError::file_operation(e.to_string()).with_code(e.error_code()),
         ),
         _ => RawError::Message(e.to_string()),
      }
   }
}

impl From<Error> for RawError {
   fn from(e: Error) -> Self {
      RawError::from(&e)
   }
}

/// Engine message fragments and the kind/code they map to.
///
/// Matched case-insensitively, first match wins.
const MESSAGE_PATTERNS: &[(&str, ErrorKind, &str)] = &[
   ("catalog error", ErrorKind::QueryExecutionError, "CATALOG_ERROR"),
   ("parser error", ErrorKind::QueryExecutionError, "PARSER_ERROR"),
   ("binder error", ErrorKind::QueryExecutionError, "BINDER_ERROR"),
   ("io error", ErrorKind::FileOperationError, "IO_ERROR"),
   ("out of memory", ErrorKind::QueryExecutionError, "OUT_OF_MEMORY"),
   // Native SQLite phrasing of the same failures
   ("no such table", ErrorKind::QueryExecutionError, "CATALOG_ERROR"),
   ("no such column", ErrorKind::QueryExecutionError, "BINDER_ERROR"),
   ("syntax error", ErrorKind::QueryExecutionError, "PARSER_ERROR"),
   ("disk i/o error", ErrorKind::FileOperationError, "IO_ERROR"),
   ("unable to open database file", ErrorKind::FileOperationError, "IO_ERROR"),
   ("database is locked", ErrorKind::ConnectionPoolError, "DATABASE_BUSY"),
];

/// Classify a raw failure. Never fails.
pub fn classify(raw: impl Into<RawError>) -> Classified {
   classify_with(raw, &ErrorDetails::default())
}

/// Classify a raw failure, attaching `context` where the classified value
/// does not already carry it.
pub fn classify_with(raw: impl Into<RawError>, context: &ErrorDetails) -> Classified {
   let mut classified = match raw.into() {
      RawError::Classified(e) => Classified::Failure(e),
      RawError::Cancelled(c) => return Classified::Cancelled(c),
      // A serialized envelope is structured data, not an engine message
      RawError::Message(message) => serde_json::from_str::<JsonValue>(&message)
         .ok()
         .and_then(|value| classify_envelope(&value))
         .or_else(|| classify_message(&message))
         .unwrap_or_else(|| unknown(JsonValue::String(message))),
      RawError::Json(value) => classify_envelope(&value)
         .or_else(|| {
            value
               .get("message")
               .and_then(JsonValue::as_str)
               .and_then(classify_message)
               .map(|c| match c {
                  Classified::Failure(e) => Classified::Failure(e.with_original(value.clone())),
                  cancelled => cancelled,
               })
         })
         .unwrap_or_else(|| unknown(value)),
   };

   if let Classified::Failure(e) = &mut classified {
      e.details.merge_missing(context);
   }
   classified
}

fn classify_message(message: &str) -> Option<Classified> {
   let lowered = message.to_lowercase();
   MESSAGE_PATTERNS
      .iter()
      .find(|(pattern, _, _)| lowered.contains(pattern))
      .map(|(_, kind, code)| {
         Classified::Failure(
            DatabaseEngineError::new(*kind, message)
               .with_code(*code)
               .with_original(JsonValue::String(message.to_string())),
         )
      })
}

/// Envelope shape used when the engine runs out-of-process.
#[derive(Debug, Deserialize)]
struct Envelope {
   #[serde(rename = "type")]
   kind: String,
   #[serde(default)]
   details: EnvelopeDetails,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeDetails {
   #[serde(default)]
   message: Option<String>,
   #[serde(default)]
   sql: Option<String>,
   #[serde(default)]
   path: Option<String>,
   #[serde(default)]
   is_user: Option<bool>,
}

fn classify_envelope(value: &JsonValue) -> Option<Classified> {
   let envelope: Envelope = serde_json::from_value(value.clone()).ok()?;
   let message = envelope
      .details
      .message
      .clone()
      .unwrap_or_else(|| envelope.kind.clone());

   let kind = match envelope.kind.as_str() {
      "QueryError" | "QueryExecutionError" => ErrorKind::QueryExecutionError,
      "ConnectionError" | "ConnectionPoolError" | "PoolError" => ErrorKind::ConnectionPoolError,
      "FileError" | "FileOperationError" | "IOError" => ErrorKind::FileOperationError,
      "InitializationError" | "InitError" => ErrorKind::InitializationError,
      "Cancelled" | "CancelledOperation" => {
         return Some(Classified::Cancelled(CancelledOperation {
            is_user: envelope.details.is_user.unwrap_or(false),
            reason: message,
         }));
      }
      _ => ErrorKind::UnknownError,
   };

   let mut error = DatabaseEngineError::new(kind, message).with_original(value.clone());
   error.details.query = envelope.details.sql;
   error.details.path = envelope.details.path;
   Some(Classified::Failure(error))
}

fn unknown(original: JsonValue) -> Classified {
   let message = match &original {
      JsonValue::String(s) => s.clone(),
      other => other.to_string(),
   };
   Classified::Failure(DatabaseEngineError::new(ErrorKind::UnknownError, message).with_original(original))
}
