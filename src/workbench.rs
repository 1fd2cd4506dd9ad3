use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use workbench_engine::{
   CancelledOperation, ConnectionPool, DatabaseEngineError, Engine, PoolStatus, QueryResult,
   SqliteEngine,
};
use workbench_persist::{PersistenceController, PersistenceMode, PersistenceState};
use workbench_script::{ScriptExecutionState, ScriptOutcome, TransactionalScriptRunner};

use crate::config::WorkbenchConfig;
use crate::session::Session;
use crate::{Error, Result};

/// The data layer as the workbench UI sees it.
///
/// Owns the engine, its connection pool, the script runner and the durable
/// database file. Script tabs and user-facing errors are tracked on the
/// [`Session`] the workbench was opened against.
pub struct Workbench<E: Engine = SqliteEngine> {
   session: Arc<Session>,
   persistence: PersistenceController,
   runner: TransactionalScriptRunner<E>,
   shut_down: AtomicBool,
}

impl Workbench<SqliteEngine> {
   /// Open the workbench over the native SQLite engine.
   pub async fn open(config: WorkbenchConfig, session: Arc<Session>) -> Result<Self> {
      Self::with_engine(SqliteEngine::new(), config, session).await
   }
}

impl<E: Engine> Workbench<E> {
   /// Bootstrap `session` against `engine`.
   ///
   /// Fails if the session already has an open workbench. The durable file
   /// is set up before the engine so that an unavailable store fails here
   /// rather than falling back to memory.
   pub async fn with_engine(engine: E, config: WorkbenchConfig, session: Arc<Session>) -> Result<Self> {
      if !session.begin_bootstrap() {
         return Err(Error::AlreadyBootstrapped(session.id().to_string()));
      }

      match Self::bootstrap(engine, config, Arc::clone(&session)).await {
         Ok(workbench) => Ok(workbench),
         Err(e) => {
            session.reset_bootstrap();
            Err(e)
         }
      }
   }

   async fn bootstrap(engine: E, config: WorkbenchConfig, session: Arc<Session>) -> Result<Self> {
      let persistence = PersistenceController::new(&config.storage_root, config.persistence)
         .map_err(|e| Error::Persistence(e.to_engine_error(&config.storage_root.display().to_string())))?;
      let state = persistence.initialize().map_err(Error::Persistence)?;

      let engine_config = workbench_engine::EngineConfig {
         database_path: persistence.database_file(),
         ..config.engine
      };
      engine.initialize(&engine_config).await?;

      let pool = ConnectionPool::new(Arc::new(engine), config.pool);
      let runner = TransactionalScriptRunner::new(pool, config.runner);

      info!(
         session = session.id(),
         mode = ?state.mode,
         path = %state.db_path,
         size = state.db_size,
         "Workbench opened"
      );
      Ok(Self {
         session,
         persistence,
         runner,
         shut_down: AtomicBool::new(false),
      })
   }

   pub fn session(&self) -> &Arc<Session> {
      &self.session
   }

   pub fn pool(&self) -> &ConnectionPool<E> {
      self.runner.pool()
   }

   pub fn pool_status(&self) -> PoolStatus {
      self.pool().status()
   }

   /// Whether the durable file can be exported, imported or cleared.
   fn file_operations_allowed(&self, operation: &str) -> bool {
      if self.ensure_open().is_err() {
         warn!(operation, "Workbench has been shut down");
         return false;
      }
      if self.persistence.mode() == PersistenceMode::Memory {
         warn!(operation, "No durable file in memory mode");
         return false;
      }
      true
   }

   fn ensure_open(&self) -> Result<()> {
      if self.shut_down.load(Ordering::Acquire) {
         return Err(Error::ShutDown);
      }
      Ok(())
   }

   /// Run one statement on a pooled connection.
   pub async fn query(&self, sql: &str, params: Vec<JsonValue>) -> Result<QueryResult> {
      self.ensure_open()?;
      Ok(self.pool().query(sql, params).await?)
   }

   /// Run `script` in the tab `tab_id`.
   ///
   /// A failure is recorded in the session's user-facing error map under the
   /// tab id; a success clears it. Cancellations are never recorded.
   ///
   /// A returned [`DataAdapter`](workbench_script::DataAdapter) keeps the
   /// script's connection busy until it is dropped.
   pub async fn run_script_query(&self, tab_id: &str, script: &str) -> Result<ScriptOutcome<E>> {
      self.ensure_open()?;
      let tab = self.session.tab(tab_id);

      match self.runner.run(&tab, script).await {
         Ok(outcome) => {
            self.session.clear_error(tab_id);
            Ok(outcome)
         }
         Err(e) => {
            self.session.record_error(tab_id, e.classify());
            Err(e.into())
         }
      }
   }

   /// Cancel the script running in `tab_id`. False if none is running.
   pub fn cancel_script(&self, tab_id: &str) -> bool {
      let Some(tab) = self.session.find_tab(tab_id) else {
         return false;
      };
      let cancelled = tab.cancel(CancelledOperation::by_user("Query cancelled by user"));
      if cancelled {
         debug!(tab = tab_id, "Script cancelled by user");
      }
      cancelled
   }

   pub fn script_state(&self, tab_id: &str) -> ScriptExecutionState {
      self.session
         .find_tab(tab_id)
         .map(|tab| tab.state())
         .unwrap_or_default()
   }

   async fn checkpoint(&self) {
      if let Err(e) = self.pool().engine().checkpoint().await {
         warn!(error = %e, "Checkpoint failed");
      }
   }

   /// The durable file's bytes, flushed first. `None` in memory mode or on
   /// failure.
   pub async fn export_database(&self) -> Option<Vec<u8>> {
      if !self.file_operations_allowed("export") {
         return None;
      }
      self.checkpoint().await;
      self.persistence.export_db()
   }

   /// Replace the database with `bytes`.
   ///
   /// Always false in memory mode, where closing sessions would drop the
   /// database. Idle sessions are closed first so new ones open the imported file.
   /// Sessions busy at the time keep their view until released.
   pub async fn import_database(&self, bytes: &[u8]) -> bool {
      if !self.file_operations_allowed("import") {
         return false;
      }
      self.pool().close_idle().await;
      self.checkpoint().await;
      self.persistence.import_db(bytes)
   }

   /// Replace the database with an empty one.
   pub async fn clear_database(&self) -> bool {
      if !self.file_operations_allowed("clear") {
         return false;
      }
      self.pool().close_idle().await;
      self.checkpoint().await;
      self.persistence.clear_db()
   }

   /// Refresh and return the durable file's state.
   pub fn persistence_state(&self) -> PersistenceState {
      if let Err(e) = self.persistence.get_db_size() {
         debug!(error = %e, "Could not refresh database size");
      }
      self.persistence.state()
   }

   pub fn subscribe_persistence(&self) -> watch::Receiver<PersistenceState> {
      self.persistence.subscribe()
   }

   /// Flush the engine and record the sync time.
   pub async fn sync(&self) -> Result<PersistenceState> {
      self.ensure_open()?;
      self.pool().engine().checkpoint().await?;
      self.persistence
         .update_last_sync()
         .map_err(|e| Error::Persistence(e.to_engine_error(&self.persistence.state().db_path)))
   }

   pub fn user_errors(&self) -> HashMap<String, DatabaseEngineError> {
      self.session.user_errors()
   }

   /// Cancel running scripts, close the pool and release the durable file.
   ///
   /// The session can be bootstrapped again afterwards.
   pub async fn shutdown(&self) {
      if self.shut_down.swap(true, Ordering::AcqRel) {
         return;
      }

      for tab in self.session.tabs() {
         if tab.cancel(CancelledOperation::by_system("Workbench shutting down")) {
            debug!(tab = tab.id(), "Cancelled running script");
         }
      }
      self.pool().close().await;
      self.persistence.close();
      self.session.reset_bootstrap();
      info!(session = self.session.id(), "Workbench shut down");
   }
}
