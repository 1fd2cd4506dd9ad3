//! Lazy, sortable access to the rows of a script's final SELECT.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, trace};
use workbench_engine::{ColumnInfo, Engine, PooledConnection, RowBatch, quote_column};

use crate::{Error, Result};

/// Sort direction for a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
   #[default]
   Asc,
   Desc,
}

impl SortDirection {
   fn as_sql(self) -> &'static str {
      match self {
         SortDirection::Asc => "ASC",
         SortDirection::Desc => "DESC",
      }
   }
}

/// One ORDER BY key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortColumn {
   /// Column name as it appears in the result
   pub name: String,
   #[serde(default)]
   pub direction: SortDirection,
}

impl SortColumn {
   pub fn asc(name: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         direction: SortDirection::Asc,
      }
   }

   pub fn desc(name: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         direction: SortDirection::Desc,
      }
   }
}

/// Ordering requested by the grid. Empty keeps the query's own order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
   pub columns: Vec<SortColumn>,
}

impl SortSpec {
   pub fn by(columns: impl IntoIterator<Item = SortColumn>) -> Self {
      Self {
         columns: columns.into_iter().collect(),
      }
   }
}

/// Rows produced by a script whose last statement is a SELECT.
///
/// The adapter keeps the connection the script ran on, so readers see the
/// same session state the statement was validated against (attached
/// databases, temp tables, pragmas). Each [`get_reader`](Self::get_reader)
/// call re-runs the query on that connection; readers take turns, and a new
/// reader waits until the previous one is dropped. The connection goes back
/// to the pool once the adapter and all its clones and readers are dropped.
pub struct DataAdapter<E: Engine> {
   session: Arc<Mutex<PooledConnection<E>>>,
   sql: String,
   schema: Vec<ColumnInfo>,
   batch_size: usize,
}

impl<E: Engine> Clone for DataAdapter<E> {
   fn clone(&self) -> Self {
      Self {
         session: self.session.clone(),
         sql: self.sql.clone(),
         schema: self.schema.clone(),
         batch_size: self.batch_size,
      }
   }
}

impl<E: Engine> std::fmt::Debug for DataAdapter<E> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("DataAdapter")
         .field("sql", &self.sql)
         .field("schema", &self.schema)
         .field("batch_size", &self.batch_size)
         .finish()
   }
}

impl<E: Engine> DataAdapter<E> {
   pub(crate) fn new(
      conn: PooledConnection<E>,
      sql: String,
      schema: Vec<ColumnInfo>,
      batch_size: usize,
   ) -> Self {
      Self {
         session: Arc::new(Mutex::new(conn)),
         sql,
         schema,
         batch_size: batch_size.max(1),
      }
   }

   pub fn sql(&self) -> &str {
      &self.sql
   }

   /// Result columns, as reported when the statement was prepared
   pub fn get_schema(&self) -> &[ColumnInfo] {
      &self.schema
   }

   fn sorted_sql(&self, sort: &SortSpec) -> Result<String> {
      let base = self.sql.trim_end().trim_end_matches(';');
      if sort.columns.is_empty() {
         return Ok(base.to_string());
      }

      let mut keys = Vec::with_capacity(sort.columns.len());
      for column in &sort.columns {
         if !self.schema.is_empty() && !self.schema.iter().any(|c| c.name == column.name) {
            return Err(Error::UnknownSortColumn(column.name.clone()));
         }
         keys.push(format!(
            "{} {}",
            quote_column(&column.name),
            column.direction.as_sql()
         ));
      }

      // The base sits on its own lines so a trailing line comment cannot
      // swallow the closing parenthesis
      Ok(format!(
         "SELECT * FROM (\n{base}\n) AS workbench_sorted ORDER BY {}",
         keys.join(", ")
      ))
   }

   /// Start reading the rows in `sort` order.
   ///
   /// Must be called inside a Tokio runtime. The reader yields batches of at
   /// most the configured batch size; an engine error ends the stream after
   /// it is yielded.
   pub fn get_reader(&self, sort: &SortSpec) -> Result<RowReader> {
      let sql = self.sorted_sql(sort)?;
      let (tx, rx) = mpsc::channel(1);
      tokio::spawn(feed_rows(self.session.clone(), sql, self.batch_size, tx));
      Ok(RowReader {
         inner: ReceiverStream::new(rx),
      })
   }
}

async fn feed_rows<E: Engine>(
   session: Arc<Mutex<PooledConnection<E>>>,
   sql: String,
   batch_size: usize,
   tx: mpsc::Sender<Result<RowBatch>>,
) {
   let mut conn = tokio::select! {
      _ = tx.closed() => return,
      conn = session.lock_owned() => conn,
   };
   debug!(connection_id = conn.id(), "Reader started");

   let mut rows = conn.stream(&sql, Vec::new(), batch_size);
   while let Some(batch) = rows.next().await {
      let failed = batch.is_err();
      if tx.send(batch.map_err(Error::from)).await.is_err() {
         trace!("Reader dropped before the result was drained");
         break;
      }
      if failed {
         break;
      }
   }
}

/// Stream of row batches returned by [`DataAdapter::get_reader`].
///
/// Dropping the reader stops the query and hands the adapter's connection to
/// the next reader.
#[derive(Debug)]
pub struct RowReader {
   inner: ReceiverStream<Result<RowBatch>>,
}

impl RowReader {
   /// Next batch, or `None` once the result is exhausted.
   pub async fn next_batch(&mut self) -> Option<Result<RowBatch>> {
      self.inner.next().await
   }
}

impl Stream for RowReader {
   type Item = Result<RowBatch>;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      Pin::new(&mut self.inner).poll_next(cx)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::Arc;
   use std::time::Duration;
   use workbench_engine::{ConnectionPool, EngineConfig, PoolConfig, SqliteEngine};

   fn columns(names: &[&str]) -> Vec<ColumnInfo> {
      names
         .iter()
         .map(|name| ColumnInfo {
            name: (*name).into(),
            type_name: None,
         })
         .collect()
   }

   async fn pool() -> ConnectionPool<SqliteEngine> {
      let engine = SqliteEngine::new();
      engine.initialize(&EngineConfig::default()).await.unwrap();
      let pool = ConnectionPool::new(Arc::new(engine), PoolConfig::default());
      pool
         .query("CREATE TABLE t (id INTEGER, name TEXT)", Vec::new())
         .await
         .unwrap();
      pool
         .query(
            "INSERT INTO t VALUES (1, 'b'), (2, 'a'), (3, 'c')",
            Vec::new(),
         )
         .await
         .unwrap();
      pool
   }

   async fn adapter_with(
      pool: &ConnectionPool<SqliteEngine>,
      sql: &str,
      schema: Vec<ColumnInfo>,
   ) -> DataAdapter<SqliteEngine> {
      let conn = pool.acquire(None).await.unwrap();
      DataAdapter::new(conn, sql.to_string(), schema, 2)
   }

   async fn adapter(sql: &str) -> DataAdapter<SqliteEngine> {
      adapter_with(&pool().await, sql, columns(&["id", "name"])).await
   }

   async fn drain(adapter: &DataAdapter<SqliteEngine>, sort: &SortSpec) -> RowBatch {
      let mut reader = adapter.get_reader(sort).unwrap();
      let mut rows = Vec::new();
      while let Some(batch) = reader.next_batch().await {
         rows.extend(batch.unwrap());
      }
      rows
   }

   #[tokio::test]
   async fn test_sorted_sql_quotes_columns() {
      let adapter = adapter("SELECT id, name FROM t;").await;
      let sql = adapter
         .sorted_sql(&SortSpec::by([SortColumn::desc("name"), SortColumn::asc("id")]))
         .unwrap();
      assert_eq!(
         sql,
         "SELECT * FROM (\nSELECT id, name FROM t\n) AS workbench_sorted ORDER BY \"name\" DESC, \"id\" ASC"
      );
   }

   #[tokio::test]
   async fn test_sort_rejects_columns_outside_the_result() {
      let adapter = adapter("SELECT id, name FROM t").await;

      let err = adapter.get_reader(&SortSpec::by([SortColumn::asc("missing")])).unwrap_err();
      assert_eq!(err.error_code(), "UNKNOWN_SORT_COLUMN");

      let err = adapter
         .get_reader(&SortSpec::by([SortColumn::asc("id; DROP TABLE t")]))
         .unwrap_err();
      assert_eq!(err.error_code(), "UNKNOWN_SORT_COLUMN");
   }

   #[tokio::test]
   async fn test_sort_after_trailing_line_comment() {
      let adapter = adapter("SELECT id, name FROM t -- newest first").await;
      let rows = drain(&adapter, &SortSpec::by([SortColumn::desc("id")])).await;

      let ids: Vec<_> = rows.iter().map(|row| row["id"].as_i64().unwrap()).collect();
      assert_eq!(ids, [3, 2, 1]);
   }

   #[tokio::test]
   async fn test_sort_by_expression_and_dotted_columns() {
      let pool = pool().await;

      let counts = adapter_with(
         &pool,
         "SELECT name, count(*) FROM t GROUP BY name",
         columns(&["name", "count(*)"]),
      )
      .await;
      let rows = drain(
         &counts,
         &SortSpec::by([SortColumn::desc("count(*)"), SortColumn::asc("name")]),
      )
      .await;
      assert_eq!(rows.len(), 3);
      assert_eq!(rows[0]["name"], "a");
      drop(counts);

      let dotted = adapter_with(
         &pool,
         "SELECT id AS \"t.x\" FROM t",
         columns(&["t.x"]),
      )
      .await;
      let rows = drain(&dotted, &SortSpec::by([SortColumn::desc("t.x")])).await;
      let ids: Vec<_> = rows.iter().map(|row| row["t.x"].as_i64().unwrap()).collect();
      assert_eq!(ids, [3, 2, 1]);
   }

   #[tokio::test]
   async fn test_reader_streams_sorted_batches() {
      let adapter = adapter("SELECT id, name FROM t").await;
      let mut reader = adapter
         .get_reader(&SortSpec::by([SortColumn::asc("name")]))
         .unwrap();

      let first = reader.next_batch().await.unwrap().unwrap();
      let second = reader.next_batch().await.unwrap().unwrap();
      assert!(reader.next_batch().await.is_none());

      let names: Vec<_> = first
         .iter()
         .chain(second.iter())
         .map(|row| row["name"].as_str().unwrap().to_string())
         .collect();
      assert_eq!(first.len(), 2);
      assert_eq!(names, ["a", "b", "c"]);
   }

   #[tokio::test]
   async fn test_readers_share_the_adapter_session() {
      let pool = pool().await;
      let mut conn = pool.acquire(None).await.unwrap();
      conn
         .execute("CREATE TEMP TABLE scratch AS SELECT 7 AS x", Vec::new())
         .await
         .unwrap();
      let adapter = DataAdapter::new(conn, "SELECT x FROM scratch".into(), columns(&["x"]), 2);

      // Another idle session exists that cannot see the temp table
      drop(pool.acquire(None).await.unwrap());

      for _ in 0..2 {
         let rows = drain(&adapter, &SortSpec::by([SortColumn::asc("x")])).await;
         assert_eq!(rows.len(), 1);
         assert_eq!(rows[0]["x"], 7);
      }
   }

   #[tokio::test]
   async fn test_connection_returns_when_adapter_dropped() {
      let pool = pool().await;
      let adapter = adapter_with(&pool, "SELECT id FROM t", columns(&["id"])).await;
      let reader = adapter.get_reader(&SortSpec::default()).unwrap();
      drop(reader);
      assert_eq!(pool.status().busy, 1, "the adapter still holds its session");

      drop(adapter);
      for _ in 0..50 {
         if pool.status().busy == 0 {
            break;
         }
         tokio::time::sleep(Duration::from_millis(10)).await;
      }
      assert_eq!(pool.status().busy, 0);
   }
}
