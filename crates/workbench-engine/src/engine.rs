//! Capability interface shared by every engine build
//!
//! The pool, the script runner and the persistence layer only ever talk to
//! an engine through [`Engine`] and [`EngineConnection`]. The native build
//! implements them over SQLite in [`crate::sqlite`]; other builds (an engine
//! running out-of-process, a sandboxed one) implement the same traits.

use std::fmt;
use std::future::Future;

use futures::stream::BoxStream;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::Result;
use crate::config::{EngineConfig, ExtensionOptions};
use crate::transfer;

/// A decoded row, keyed by column name in result order
pub type JsonRow = IndexMap<String, JsonValue>;

/// A batch of rows yielded by [`EngineConnection::stream`]
pub type RowBatch = Vec<JsonRow>;

/// Result of executing one statement to completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
   /// Column names of the returned rows. Empty for statements without rows.
   pub columns: Vec<String>,
   pub rows: Vec<JsonRow>,
   /// Rows changed by INSERT/UPDATE/DELETE; 0 for everything else.
   pub rows_affected: u64,
}

/// Column metadata reported by a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
   pub name: String,
   /// Declared or inferred type name, when the engine knows one
   pub type_name: Option<String>,
}

/// A statement the engine parsed and planned without running it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedStatement {
   pub sql: String,
   pub columns: Vec<ColumnInfo>,
   pub parameter_count: Option<usize>,
}

/// File formats accepted by `export`/`import`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
   Json,
   Csv,
}

impl fmt::Display for DataFormat {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         DataFormat::Json => f.write_str("json"),
         DataFormat::Csv => f.write_str("csv"),
      }
   }
}

/// What an engine build can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineCapabilities {
   pub supports_streaming: bool,
   pub supports_multi_threading: bool,
   /// Largest database file the build can persist, if bounded
   pub max_file_size: Option<u64>,
   pub supported_file_formats: Vec<DataFormat>,
}

/// One session against the engine.
///
/// Execution on a single connection is serialized by `&mut self`; parallelism
/// comes from holding several connections.
pub trait EngineConnection: Send + 'static {
   /// Run a statement to completion.
   fn execute(
      &mut self,
      sql: &str,
      params: Vec<JsonValue>,
   ) -> impl Future<Output = Result<QueryResult>> + Send;

   /// Run a query and yield its rows lazily in batches of at most
   /// `batch_size`.
   ///
   /// The stream ends once the result set is consumed and cannot be
   /// restarted.
   fn stream<'a>(
      &'a mut self,
      sql: &'a str,
      params: Vec<JsonValue>,
      batch_size: usize,
   ) -> BoxStream<'a, Result<RowBatch>>;

   /// Parse and plan a statement without executing it.
   fn prepare(&mut self, sql: &str) -> impl Future<Output = Result<PreparedStatement>> + Send;

   /// Check the session is still usable.
   fn ping(&mut self) -> impl Future<Output = Result<()>> + Send;

   /// Close the session, releasing engine resources.
   fn close(self) -> impl Future<Output = Result<()>> + Send;
}

/// An engine build the pool can open sessions against.
pub trait Engine: Send + Sync + 'static {
   type Connection: EngineConnection;

   /// Prepare the engine for use. Must be called before `create_connection`.
   fn initialize(&self, config: &EngineConfig) -> impl Future<Output = Result<()>> + Send;

   fn is_initialized(&self) -> bool;

   /// Open a new session.
   fn create_connection(&self) -> impl Future<Output = Result<Self::Connection>> + Send;

   fn capabilities(&self) -> EngineCapabilities;

   /// Flush any write-ahead state into the durable database file.
   fn checkpoint(&self) -> impl Future<Output = Result<()>> + Send;

   /// Load an extension into sessions created from now on.
   fn load_extension(
      &self,
      name: &str,
      options: ExtensionOptions,
   ) -> impl Future<Output = Result<()>> + Send;

   /// Run `sql` and serialize its full result in `format`.
   fn export(&self, format: DataFormat, sql: &str) -> impl Future<Output = Result<Vec<u8>>> + Send {
      async move {
         let mut conn = self.create_connection().await?;
         let result = conn.execute(sql, Vec::new()).await;
         conn.close().await?;
         transfer::encode(format, &result?)
      }
   }

   /// Insert `data` into an existing `table` in one transaction.
   ///
   /// Returns the number of rows inserted.
   fn import(
      &self,
      format: DataFormat,
      table: &str,
      data: &[u8],
   ) -> impl Future<Output = Result<u64>> + Send {
      async move {
         let rows = transfer::decode(format, data)?;
         let mut conn = self.create_connection().await?;
         let inserted = transfer::insert_rows(&mut conn, table, rows).await;
         conn.close().await?;
         inserted
      }
   }
}
