//! Transactional execution of multi-statement scripts
//!
//! A script runs on one pooled connection. When it has more than one
//! statement and any of them writes, the runner wraps it in
//! `BEGIN`/`COMMIT` and rolls back on the first failure or on cancellation,
//! so a failed batch leaves no partial changes. Scripts that manage their own
//! transactions are run as written.

use std::fmt;
use std::future::Future;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;
use workbench_engine::{
   CancelledOperation, Classified, ColumnInfo, ConnectionPool, Engine, ErrorDetails,
   PooledConnection, QueryResult, classify_with,
};

use crate::adapter::DataAdapter;
use crate::cancel::CancelToken;
use crate::config::RunnerConfig;
use crate::error::ScriptFailure;
use crate::statement::{
   Statement, StatementKind, find_protected, leaves_transaction_open, should_wrap,
   split_statements,
};
use crate::{Error, Result};

/// Observable lifecycle of a tab's script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptExecutionState {
   #[default]
   Idle,
   Running,
   Success,
   Error,
}

/// An editor tab that runs scripts one at a time.
///
/// Cancelling a tab cancels its current run only; each run gets a fresh
/// [`CancelToken`].
#[derive(Debug)]
pub struct ScriptTab {
   id: String,
   state: watch::Sender<ScriptExecutionState>,
   cancel: Mutex<CancelToken>,
}

impl ScriptTab {
   pub fn new(id: impl Into<String>) -> Self {
      let (state, _) = watch::channel(ScriptExecutionState::Idle);
      Self {
         id: id.into(),
         state,
         cancel: Mutex::new(CancelToken::new()),
      }
   }

   pub fn id(&self) -> &str {
      &self.id
   }

   pub fn state(&self) -> ScriptExecutionState {
      *self.state.borrow()
   }

   pub fn subscribe(&self) -> watch::Receiver<ScriptExecutionState> {
      self.state.subscribe()
   }

   /// Cancel the running script. Returns false when nothing was cancelled.
   pub fn cancel(&self, operation: CancelledOperation) -> bool {
      let token = self.cancel.lock();
      self.state() == ScriptExecutionState::Running && token.cancel(operation)
   }

   /// Move to `Running` with a fresh token.
   ///
   /// The token is swapped under the same lock `cancel` takes, so a cancel
   /// that observes `Running` always reaches the new run's token.
   fn start(&self) -> Result<CancelToken> {
      let mut current = self.cancel.lock();
      let mut started = false;
      self.state.send_if_modified(|state| {
         if *state == ScriptExecutionState::Running {
            return false;
         }
         *state = ScriptExecutionState::Running;
         started = true;
         true
      });
      if !started {
         return Err(Error::AlreadyRunning(self.id.clone()));
      }

      *current = CancelToken::new();
      Ok(current.clone())
   }

   fn finish(&self, state: ScriptExecutionState) {
      self.state.send_replace(state);
   }
}

/// What a successful script produced.
pub enum ScriptOutcome<E: Engine> {
   /// The last statement was a SELECT; its rows are read lazily.
   Rows(DataAdapter<E>),
   /// Result of the last statement.
   Executed(QueryResult),
   /// The script had no statements.
   Empty,
}

impl<E: Engine> ScriptOutcome<E> {
   pub fn into_adapter(self) -> Option<DataAdapter<E>> {
      match self {
         ScriptOutcome::Rows(adapter) => Some(adapter),
         _ => None,
      }
   }

   pub fn executed(&self) -> Option<&QueryResult> {
      match self {
         ScriptOutcome::Executed(result) => Some(result),
         _ => None,
      }
   }
}

impl<E: Engine> fmt::Debug for ScriptOutcome<E> {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         ScriptOutcome::Rows(adapter) => f.debug_tuple("Rows").field(adapter).finish(),
         ScriptOutcome::Executed(result) => f.debug_tuple("Executed").field(result).finish(),
         ScriptOutcome::Empty => f.write_str("Empty"),
      }
   }
}

/// Runs scripts against a connection pool.
pub struct TransactionalScriptRunner<E: Engine> {
   pool: ConnectionPool<E>,
   config: RunnerConfig,
}

impl<E: Engine> TransactionalScriptRunner<E> {
   pub fn new(pool: ConnectionPool<E>, config: RunnerConfig) -> Self {
      Self { pool, config }
   }

   pub fn pool(&self) -> &ConnectionPool<E> {
      &self.pool
   }

   pub fn config(&self) -> &RunnerConfig {
      &self.config
   }

   /// Run `script` in `tab`.
   ///
   /// The tab moves to `Running`, then to `Success` or `Error`; a cancelled
   /// run returns it to `Idle`. Protected-object violations reject the whole
   /// script before anything executes.
   pub async fn run(&self, tab: &ScriptTab, script: &str) -> Result<ScriptOutcome<E>> {
      let token = tab.start()?;
      let run_id = Uuid::new_v4();

      let result = self.run_script(script, &token, run_id).await;
      match &result {
         Ok(_) => tab.finish(ScriptExecutionState::Success),
         Err(e) if e.is_cancelled() => {
            debug!(%run_id, tab = tab.id(), "Script cancelled");
            tab.finish(ScriptExecutionState::Idle);
         }
         Err(e) => {
            debug!(%run_id, tab = tab.id(), error = %e, "Script failed");
            tab.finish(ScriptExecutionState::Error);
         }
      }
      result
   }

   async fn run_script(
      &self,
      script: &str,
      token: &CancelToken,
      run_id: Uuid,
   ) -> Result<ScriptOutcome<E>> {
      let statements = split_statements(script);
      for statement in &statements {
         if let Some(object) = find_protected(statement, &self.config.protected_objects) {
            warn!(%run_id, index = statement.index, object, "Rejected write to protected object");
            return Err(Error::ProtectedObject {
               statement_index: statement.index,
               object,
            });
         }
      }

      let Some((last, leading)) = statements.split_last() else {
         return Ok(ScriptOutcome::Empty);
      };

      let mut conn = match until_cancelled(token, self.pool.acquire(None)).await {
         Ok(acquired) => acquired?,
         Err(reason) => return Err(Error::Cancelled(reason)),
      };

      let wrap = should_wrap(&statements);
      let user_managed = statements.iter().any(|s| s.transaction_control.is_some());
      debug!(
         %run_id,
         connection_id = conn.id(),
         statements = statements.len(),
         wrap,
         "Running script"
      );

      if wrap {
         conn.execute("BEGIN", Vec::new()).await?;
      }

      match self.run_statements(&mut conn, leading, last, token).await {
         Ok(finished) => {
            if wrap {
               if let Err(e) = conn.execute("COMMIT", Vec::new()).await {
                  let details = ErrorDetails {
                     query: Some("COMMIT".to_string()),
                     connection_id: Some(conn.id()),
                     ..Default::default()
                  };
                  rollback(&mut conn, run_id).await;
                  return Err(match classify_with(&e, &details) {
                     Classified::Failure(failure) => Error::CommitFailed(failure),
                     Classified::Cancelled(op) => Error::Cancelled(op),
                  });
               }
            } else if leaves_transaction_open(&statements) {
               warn!(%run_id, "Script left a transaction open; retiring its connection");
               conn.mark_broken();
            }
            Ok(match finished {
               Finished::Executed(result) => ScriptOutcome::Executed(result),
               // Readers run on the session the SELECT was prepared on
               Finished::Rows(columns) => ScriptOutcome::Rows(DataAdapter::new(
                  conn,
                  last.sql.clone(),
                  columns,
                  self.config.stream_batch_size,
               )),
            })
         }
         Err(e) => {
            if wrap {
               rollback(&mut conn, run_id).await;
            } else if user_managed {
               // Closing the session discards whatever the script left open
               conn.mark_broken();
            }
            Err(e)
         }
      }
   }

   async fn run_statements(
      &self,
      conn: &mut PooledConnection<E>,
      leading: &[Statement],
      last: &Statement,
      token: &CancelToken,
   ) -> Result<Finished> {
      for statement in leading {
         execute_one(conn, statement, token).await?;
      }

      if last.kind != StatementKind::Select {
         let result = execute_one(conn, last, token).await?;
         return Ok(Finished::Executed(result));
      }

      if let Some(reason) = token.reason() {
         return Err(Error::Cancelled(reason));
      }
      let id = conn.id();
      let prepared = match until_cancelled(token, conn.prepare(&last.sql)).await {
         Ok(prepared) => prepared.map_err(|e| statement_failure(last, &e, id))?,
         Err(reason) => {
            conn.mark_broken();
            return Err(Error::Cancelled(reason));
         }
      };

      Ok(Finished::Rows(prepared.columns))
   }
}

/// How the last statement of a successful script ended.
enum Finished {
   Rows(Vec<ColumnInfo>),
   Executed(QueryResult),
}

/// Race `work` against cancellation, preferring the cancellation.
async fn until_cancelled<F: Future>(
   token: &CancelToken,
   work: F,
) -> std::result::Result<F::Output, CancelledOperation> {
   tokio::select! {
      biased;
      reason = token.cancelled() => Err(reason),
      output = work => Ok(output),
   }
}

async fn execute_one<E: Engine>(
   conn: &mut PooledConnection<E>,
   statement: &Statement,
   token: &CancelToken,
) -> Result<QueryResult> {
   if let Some(reason) = token.reason() {
      return Err(Error::Cancelled(reason));
   }

   let id = conn.id();
   match until_cancelled(token, conn.execute(&statement.sql, Vec::new())).await {
      Ok(result) => result.map_err(|e| statement_failure(statement, &e, id)),
      Err(reason) => {
         // The engine may still be running the statement
         conn.mark_broken();
         Err(Error::Cancelled(reason))
      }
   }
}

async fn rollback<E: Engine>(conn: &mut PooledConnection<E>, run_id: Uuid) {
   if let Err(e) = conn.execute("ROLLBACK", Vec::new()).await {
      warn!(%run_id, error = %e, "Rollback failed; retiring connection");
      conn.mark_broken();
   }
}

fn statement_failure(
   statement: &Statement,
   error: &workbench_engine::Error,
   connection_id: u64,
) -> Error {
   let details = ErrorDetails {
      query: Some(statement.sql.clone()),
      connection_id: Some(connection_id),
      ..Default::default()
   };
   match classify_with(error, &details) {
      Classified::Failure(error) => Error::StatementFailed(Box::new(ScriptFailure {
         statement_index: statement.index,
         kind: statement.kind,
         sql: statement.sql.clone(),
         error,
      })),
      Classified::Cancelled(op) => Error::Cancelled(op),
   }
}
