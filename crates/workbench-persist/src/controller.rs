//! Lifecycle of the single durable database file

use std::path::PathBuf;
use std::sync::OnceLock;

use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use workbench_engine::DatabaseEngineError;

use crate::config::{PersistenceConfig, PersistenceMode};
use crate::path::StorePath;
use crate::state::PersistenceState;
use crate::store::OpfsStore;
use crate::{Error, Result};

/// Owns the durable database file and publishes [`PersistenceState`].
///
/// Every write goes through [`OpfsStore`], so an open access handle on the
/// file is closed before the write and reopened after it.
#[derive(Debug)]
pub struct PersistenceController {
   root: PathBuf,
   config: PersistenceConfig,
   path: StorePath,
   store: OnceLock<OpfsStore>,
   state: watch::Sender<PersistenceState>,
}

impl PersistenceController {
   /// Validate the configuration. Nothing is touched until
   /// [`initialize`](Self::initialize).
   pub fn new(root: impl Into<PathBuf>, config: PersistenceConfig) -> Result<Self> {
      let path = StorePath::parse(&config.db_path)?;
      let (state, _) = watch::channel(PersistenceState {
         mode: config.mode,
         db_path: path.to_string(),
         db_size: 0,
         last_sync: None,
      });

      Ok(Self {
         root: root.into(),
         config,
         path,
         store: OnceLock::new(),
         state,
      })
   }

   pub fn config(&self) -> &PersistenceConfig {
      &self.config
   }

   pub fn mode(&self) -> PersistenceMode {
      self.config.mode
   }

   /// Open the store and make sure the durable file exists.
   ///
   /// An unusable storage backend fails with an initialization error; there
   /// is no silent fallback to memory mode. Calling this again only
   /// refreshes the published size.
   pub fn initialize(&self) -> std::result::Result<PersistenceState, DatabaseEngineError> {
      self.try_initialize()
         .map_err(|e| e.to_engine_error(self.path.as_str()))
   }

   fn try_initialize(&self) -> Result<PersistenceState> {
      if self.config.mode == PersistenceMode::Memory {
         debug!("Persistence running in memory mode");
         return Ok(self.state());
      }

      if self.store.get().is_none() {
         let store = OpfsStore::open(&self.root)?;
         let existed = store.exists(&self.path);
         store.get_file_handle(&self.path, true)?;
         info!(root = %self.root.display(), path = %self.path, existed, "Persistence initialized");
         // A concurrent initializer may win; the loser's store closes on drop.
         let _ = self.store.set(store);
      }

      self.refresh_size()?;
      Ok(self.state())
   }

   fn store(&self) -> Result<&OpfsStore> {
      if self.config.mode == PersistenceMode::Memory {
         return Err(Error::MemoryMode);
      }
      self.store.get().ok_or(Error::NotInitialized)
   }

   /// Direct access to the underlying store once initialized.
   pub fn file_store(&self) -> Option<&OpfsStore> {
      self.store.get()
   }

   /// Host location of the durable file, for opening it with the engine.
   ///
   /// `None` in memory mode.
   pub fn database_file(&self) -> Option<PathBuf> {
      match self.config.mode {
         PersistenceMode::Persistent => Some(self.path.to_fs_path(&self.root)),
         PersistenceMode::Memory => None,
      }
   }

   /// The durable file's bytes, or `None` if they cannot be read.
   pub fn export_db(&self) -> Option<Vec<u8>> {
      match self.store().and_then(|store| store.read(&self.path)) {
         Ok(bytes) => {
            debug!(path = %self.path, bytes = bytes.len(), "Exported database");
            Some(bytes)
         }
         Err(e) => {
            warn!(path = %self.path, error = %e, "Export failed");
            None
         }
      }
   }

   /// Replace the durable file with `bytes`.
   ///
   /// On failure the previous file and state are left untouched.
   pub fn import_db(&self, bytes: &[u8]) -> bool {
      match self.try_import(bytes) {
         Ok(size) => {
            info!(path = %self.path, size, "Imported database");
            true
         }
         Err(e) => {
            warn!(path = %self.path, code = %e.error_code(), error = %e, "Import failed");
            false
         }
      }
   }

   fn try_import(&self, bytes: &[u8]) -> Result<u64> {
      let store = self.store()?;
      if let Some(header) = &self.config.expected_header
         && !bytes.starts_with(header)
      {
         return Err(Error::InvalidHeader(self.path.to_string()));
      }

      store.store(&self.path, bytes)?;
      let size = store.size(&self.path)?;
      self.state.send_modify(|state| {
         state.db_size = size;
         state.last_sync = Some(OffsetDateTime::now_utc());
      });
      Ok(size)
   }

   /// Replace the durable file with an empty one.
   pub fn clear_db(&self) -> bool {
      match self.try_clear() {
         Ok(()) => {
            info!(path = %self.path, "Cleared database");
            true
         }
         Err(e) => {
            warn!(path = %self.path, code = %e.error_code(), error = %e, "Clear failed");
            false
         }
      }
   }

   fn try_clear(&self) -> Result<()> {
      let store = self.store()?;
      match store.delete(&self.path) {
         Ok(()) | Err(Error::NotFound(_)) => {}
         Err(e) => return Err(e),
      }
      // The old file is gone even if the empty one cannot be created
      self.state.send_modify(|state| {
         state.db_size = 0;
         state.last_sync = None;
      });
      store.get_file_handle(&self.path, true)?;
      self.refresh_size()?;
      Ok(())
   }

   /// Current size of the durable file. Always zero in memory mode.
   pub fn get_db_size(&self) -> Result<u64> {
      if self.config.mode == PersistenceMode::Memory {
         return Ok(0);
      }
      self.refresh_size()
   }

   fn refresh_size(&self) -> Result<u64> {
      let size = self.store()?.size(&self.path)?;
      self.state.send_if_modified(|state| {
         let changed = state.db_size != size;
         state.db_size = size;
         changed
      });
      Ok(size)
   }

   /// Record that the engine has just flushed to the durable file.
   pub fn update_last_sync(&self) -> Result<PersistenceState> {
      self.refresh_size()?;
      self.state.send_modify(|state| state.last_sync = Some(OffsetDateTime::now_utc()));
      Ok(self.state())
   }

   pub fn state(&self) -> PersistenceState {
      self.state.borrow().clone()
   }

   pub fn subscribe(&self) -> watch::Receiver<PersistenceState> {
      self.state.subscribe()
   }

   /// Release every access handle. Later store operations fail.
   pub fn close(&self) {
      if let Some(store) = self.store.get() {
         store.close_all();
      }
   }
}

impl Drop for PersistenceController {
   fn drop(&mut self) {
      self.close();
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_rejects_unsafe_db_path_up_front() {
      let config = PersistenceConfig {
         db_path: "../escape.db".into(),
         ..Default::default()
      };
      let err = PersistenceController::new("/tmp", config).unwrap_err();
      assert_eq!(err.error_code(), "INVALID_PATH");
   }

   #[test]
   fn test_operations_before_initialize_fail_softly() {
      let controller = PersistenceController::new("/tmp/unused", PersistenceConfig::default()).unwrap();
      assert!(controller.export_db().is_none());
      assert!(!controller.import_db(b"x"));
      assert!(!controller.clear_db());
      assert!(matches!(controller.get_db_size(), Err(Error::NotInitialized)));
   }

   #[test]
   fn test_memory_mode_has_no_durable_file() {
      let config = PersistenceConfig {
         mode: PersistenceMode::Memory,
         ..Default::default()
      };
      let controller = PersistenceController::new("/nonexistent/root", config).unwrap();

      let state = controller.initialize().unwrap();
      assert_eq!(state.mode, PersistenceMode::Memory);
      assert!(controller.database_file().is_none());
      assert_eq!(controller.get_db_size().unwrap(), 0);
      assert!(!controller.import_db(b"x"));
   }
}
