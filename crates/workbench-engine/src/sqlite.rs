//! Native engine build over SQLite

use std::str::FromStr;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Column, ConnectOptions, Connection, Either, Executor, Statement, TypeInfo};
use tracing::{debug, trace};

use crate::config::{EngineConfig, ExtensionOptions, ExtensionSpec};
use crate::decode::{bind_value, decode_row};
use crate::engine::{
   ColumnInfo, DataFormat, Engine, EngineCapabilities, EngineConnection, PreparedStatement,
   QueryResult, RowBatch,
};
use crate::{Error, Result};

/// Largest database SQLite can address with the default page size
const SQLITE_MAX_FILE_SIZE: u64 = 281_474_976_710_656;

#[derive(Debug)]
struct EngineState {
   options: SqliteConnectOptions,
   in_memory: bool,
   extensions: Vec<ExtensionSpec>,
}

/// SQLite-backed [`Engine`].
///
/// ## Sessions
///
/// Every pooled connection is its own `SqliteConnection`. With a
/// `database_path` they all open the same durable file; without one they
/// share a single named in-memory database, since the connect options are
/// built once in `initialize` and cloned per session.
#[derive(Debug, Default)]
pub struct SqliteEngine {
   state: RwLock<Option<EngineState>>,
}

impl SqliteEngine {
   pub fn new() -> Self {
      Self::default()
   }

   fn connect_options(&self) -> Result<SqliteConnectOptions> {
      let state = self.state.read();
      let state = state.as_ref().ok_or(Error::NotInitialized)?;

      let mut options = state.options.clone();
      for ext in &state.extensions {
         options = match &ext.options.entry_point {
            Some(entry_point) => options.extension_with_entrypoint(ext.name.clone(), entry_point.clone()),
            None => options.extension(ext.name.clone()),
         };
      }
      Ok(options)
   }
}

impl Engine for SqliteEngine {
   type Connection = SqliteSession;

   async fn initialize(&self, config: &EngineConfig) -> Result<()> {
      let (options, in_memory) = match &config.database_path {
         Some(path) => (
            SqliteConnectOptions::new()
               .filename(path)
               .create_if_missing(!config.read_only)
               .read_only(config.read_only),
            false,
         ),
         None => (SqliteConnectOptions::from_str("sqlite::memory:")?, true),
      };
      let options = options.busy_timeout(config.busy_timeout);

      // Open once so a missing directory or unreadable file fails here
      // rather than on the first query
      let probe = options.clone().connect().await?;
      probe.close().await?;

      debug!(path = ?config.database_path, in_memory, "SQLite engine initialized");
      *self.state.write() = Some(EngineState {
         options,
         in_memory,
         extensions: config.extensions.clone(),
      });
      Ok(())
   }

   fn is_initialized(&self) -> bool {
      self.state.read().is_some()
   }

   async fn create_connection(&self) -> Result<SqliteSession> {
      let options = self.connect_options()?;
      let conn = options.connect().await?;
      trace!("Opened SQLite session");
      Ok(SqliteSession { conn })
   }

   fn capabilities(&self) -> EngineCapabilities {
      EngineCapabilities {
         supports_streaming: true,
         supports_multi_threading: true,
         max_file_size: Some(SQLITE_MAX_FILE_SIZE),
         supported_file_formats: vec![DataFormat::Json, DataFormat::Csv],
      }
   }

   async fn checkpoint(&self) -> Result<()> {
      let in_memory = {
         let state = self.state.read();
         state.as_ref().ok_or(Error::NotInitialized)?.in_memory
      };
      if in_memory {
         return Ok(());
      }

      let mut conn = self.connect_options()?.connect().await?;
      let result = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
         .execute(&mut conn)
         .await;
      conn.close().await?;
      result?;
      debug!("Checkpoint complete");
      Ok(())
   }

   async fn load_extension(&self, name: &str, options: ExtensionOptions) -> Result<()> {
      let mut state = self.state.write();
      let state = state.as_mut().ok_or(Error::NotInitialized)?;
      if !state.extensions.iter().any(|ext| ext.name == name) {
         state.extensions.push(ExtensionSpec {
            name: name.to_string(),
            options,
         });
      }
      debug!(extension = name, "Extension registered for new sessions");
      Ok(())
   }
}

/// One SQLite session handed out by the pool.
#[derive(Debug)]
pub struct SqliteSession {
   conn: SqliteConnection,
}

impl EngineConnection for SqliteSession {
   async fn execute(&mut self, sql: &str, params: Vec<JsonValue>) -> Result<QueryResult> {
      let mut q = sqlx::query(sql);
      for value in params {
         q = bind_value(q, value);
      }

      let mut result = QueryResult::default();
      let mut results = self.conn.fetch_many(q);
      while let Some(item) = results.try_next().await? {
         match item {
            Either::Left(done) => result.rows_affected += done.rows_affected(),
            Either::Right(row) => {
               if result.columns.is_empty() {
                  result.columns = sqlx::Row::columns(&row)
                     .iter()
                     .map(|c| c.name().to_string())
                     .collect();
               }
               result.rows.push(decode_row(&row)?);
            }
         }
      }

      Ok(result)
   }

   fn stream<'a>(
      &'a mut self,
      sql: &'a str,
      params: Vec<JsonValue>,
      batch_size: usize,
   ) -> BoxStream<'a, Result<RowBatch>> {
      let mut q = sqlx::query(sql);
      for value in params {
         q = bind_value(q, value);
      }

      q.fetch(&mut self.conn)
         .map(|row| row.map_err(Error::from).and_then(|row| decode_row(&row)))
         .try_chunks(batch_size.max(1))
         .map_err(|e| e.1)
         .boxed()
   }

   async fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
      let statement = (&mut self.conn).prepare(sql).await?;

      let columns = statement
         .columns()
         .iter()
         .map(|c| {
            let type_name = c.type_info().name();
            ColumnInfo {
               name: c.name().to_string(),
               type_name: (type_name != "NULL").then(|| type_name.to_string()),
            }
         })
         .collect();

      let parameter_count = statement.parameters().map(|params| match params {
         Either::Left(types) => types.len(),
         Either::Right(count) => count,
      });

      Ok(PreparedStatement {
         sql: sql.to_string(),
         columns,
         parameter_count,
      })
   }

   async fn ping(&mut self) -> Result<()> {
      self.conn.ping().await?;
      Ok(())
   }

   async fn close(self) -> Result<()> {
      self.conn.close().await?;
      trace!("Closed SQLite session");
      Ok(())
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;
   use tempfile::TempDir;

   async fn create_engine() -> (SqliteEngine, TempDir) {
      let temp_dir = TempDir::new().expect("Failed to create temp directory");
      let engine = SqliteEngine::new();
      engine
         .initialize(&EngineConfig {
            database_path: Some(temp_dir.path().join("test.db")),
            ..Default::default()
         })
         .await
         .expect("Failed to initialize engine");

      (engine, temp_dir)
   }

   #[tokio::test]
   async fn test_create_connection_requires_initialize() {
      let engine = SqliteEngine::new();
      let err = engine.create_connection().await.unwrap_err();
      assert_eq!(err.error_code(), "NOT_INITIALIZED");
   }

   #[tokio::test]
   async fn test_execute_reports_rows_and_changes() {
      let (engine, _temp) = create_engine().await;
      let mut conn = engine.create_connection().await.unwrap();

      let result = conn
         .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", vec![])
         .await
         .unwrap();
      assert_eq!(result.rows_affected, 0);
      assert!(result.columns.is_empty());

      let result = conn
         .execute(
            "INSERT INTO t (name) VALUES (?), (?)",
            vec![json!("Alice"), json!("Bob")],
         )
         .await
         .unwrap();
      assert_eq!(result.rows_affected, 2);

      let result = conn
         .execute("SELECT name, id FROM t ORDER BY id", vec![])
         .await
         .unwrap();
      assert_eq!(result.columns, vec!["name", "id"]);
      assert_eq!(result.rows.len(), 2);
      assert_eq!(result.rows[1].get("name"), Some(&json!("Bob")));

      conn.close().await.unwrap();
   }

   #[tokio::test]
   async fn test_sessions_share_the_database() {
      let (engine, _temp) = create_engine().await;
      let mut a = engine.create_connection().await.unwrap();
      let mut b = engine.create_connection().await.unwrap();

      a.execute("CREATE TABLE shared (v INTEGER)", vec![]).await.unwrap();
      a.execute("INSERT INTO shared VALUES (7)", vec![]).await.unwrap();

      let result = b.execute("SELECT v FROM shared", vec![]).await.unwrap();
      assert_eq!(result.rows[0].get("v"), Some(&json!(7)));
   }

   #[tokio::test]
   async fn test_in_memory_sessions_share_the_database() {
      let engine = SqliteEngine::new();
      engine.initialize(&EngineConfig::default()).await.unwrap();

      let mut a = engine.create_connection().await.unwrap();
      let mut b = engine.create_connection().await.unwrap();
      a.execute("CREATE TABLE mem (v INTEGER)", vec![]).await.unwrap();

      let result = b
         .execute("SELECT count(*) AS n FROM mem", vec![])
         .await
         .unwrap();
      assert_eq!(result.rows[0].get("n"), Some(&json!(0)));
   }

   #[tokio::test]
   async fn test_stream_yields_batches() {
      let (engine, _temp) = create_engine().await;
      let mut conn = engine.create_connection().await.unwrap();
      conn
         .execute(
            "CREATE TABLE nums AS WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10) SELECT x FROM c",
            vec![],
         )
         .await
         .unwrap();

      let batches: Vec<RowBatch> = conn
         .stream("SELECT x FROM nums ORDER BY x", vec![], 4)
         .try_collect()
         .await
         .unwrap();

      let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
      assert_eq!(sizes, vec![4, 4, 2]);
      assert_eq!(batches[2][1].get("x"), Some(&json!(10)));
   }

   #[tokio::test]
   async fn test_prepare_validates_without_running() {
      let (engine, _temp) = create_engine().await;
      let mut conn = engine.create_connection().await.unwrap();
      conn
         .execute("CREATE TABLE t (id INTEGER, label TEXT)", vec![])
         .await
         .unwrap();

      let prepared = conn
         .prepare("SELECT id, label FROM t WHERE id = ?")
         .await
         .unwrap();
      let names: Vec<&str> = prepared.columns.iter().map(|c| c.name.as_str()).collect();
      assert_eq!(names, vec!["id", "label"]);
      assert_eq!(prepared.parameter_count, Some(1));

      assert!(conn.prepare("SELECT * FROM missing").await.is_err());
   }

   #[tokio::test]
   async fn test_export_and_import_json() {
      let (engine, _temp) = create_engine().await;
      let mut conn = engine.create_connection().await.unwrap();
      conn
         .execute("CREATE TABLE src (id INTEGER, name TEXT)", vec![])
         .await
         .unwrap();
      conn
         .execute("CREATE TABLE dst (id INTEGER, name TEXT)", vec![])
         .await
         .unwrap();
      conn
         .execute("INSERT INTO src VALUES (1, 'a'), (2, 'b')", vec![])
         .await
         .unwrap();

      let bytes = engine
         .export(DataFormat::Json, "SELECT * FROM src ORDER BY id")
         .await
         .unwrap();
      let inserted = engine.import(DataFormat::Json, "dst", &bytes).await.unwrap();
      assert_eq!(inserted, 2);

      let result = conn
         .execute("SELECT name FROM dst ORDER BY id", vec![])
         .await
         .unwrap();
      assert_eq!(result.rows[1].get("name"), Some(&json!("b")));
   }

   #[tokio::test]
   async fn test_import_rolls_back_on_failure() {
      let (engine, _temp) = create_engine().await;
      let mut conn = engine.create_connection().await.unwrap();
      conn
         .execute("CREATE TABLE strict_t (id INTEGER NOT NULL)", vec![])
         .await
         .unwrap();

      let err = engine
         .import(DataFormat::Json, "strict_t", br#"[{"id":1},{"id":null}]"#)
         .await;
      assert!(err.is_err());

      let result = conn
         .execute("SELECT count(*) AS n FROM strict_t", vec![])
         .await
         .unwrap();
      assert_eq!(result.rows[0].get("n"), Some(&json!(0)));
   }

   #[tokio::test]
   async fn test_database_errors_classify_as_query_failures() {
      let (engine, _temp) = create_engine().await;
      let mut conn = engine.create_connection().await.unwrap();

      let err = conn.execute("SELECT * FROM missing", vec![]).await.unwrap_err();
      let failure = crate::classify(&err).into_failure().unwrap();
      assert_eq!(failure.kind, crate::ErrorKind::QueryExecutionError);
      assert_eq!(failure.code, "CATALOG_ERROR");

      conn.execute("CREATE TABLE u (id INTEGER PRIMARY KEY)", vec![]).await.unwrap();
      conn.execute("INSERT INTO u VALUES (1)", vec![]).await.unwrap();
      let err = conn.execute("INSERT INTO u VALUES (1)", vec![]).await.unwrap_err();
      let failure = crate::classify(&err).into_failure().unwrap();
      assert_eq!(failure.kind, crate::ErrorKind::QueryExecutionError);
      assert!(failure.code.starts_with("SQLITE_"));
      assert!(failure.message.contains("UNIQUE"));
   }

   #[tokio::test]
   async fn test_checkpoint_on_file_database() {
      let (engine, _temp) = create_engine().await;
      engine.checkpoint().await.unwrap();
   }
}
