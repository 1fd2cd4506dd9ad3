//! Handle cache and exclusive-access arbitration over the file store
//!
//! Every operation on a path runs under that path's lock. Operations the
//! platform refuses while a sync access handle is open (read, write, size,
//! remove) first close the cached handle, run, and then reopen it if one was
//! open before. Handle conflicts are therefore impossible through the store
//! rather than caught and retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{FileBackend, FileHandle, SyncAccessHandle};
use crate::path::StorePath;
use crate::{Error, Result};

/// Path-safe, handle-caching view of the private file store.
#[derive(Debug)]
pub struct OpfsStore {
   backend: FileBackend,
   directories: Mutex<HashMap<StorePath, PathBuf>>,
   files: Mutex<HashMap<StorePath, FileHandle>>,
   sync_handles: Mutex<HashMap<StorePath, SyncAccessHandle>>,
   path_locks: Mutex<HashMap<StorePath, Arc<Mutex<()>>>>,
   closed: AtomicBool,
}

impl OpfsStore {
   pub fn new(backend: FileBackend) -> Self {
      Self {
         backend,
         directories: Mutex::new(HashMap::new()),
         files: Mutex::new(HashMap::new()),
         sync_handles: Mutex::new(HashMap::new()),
         path_locks: Mutex::new(HashMap::new()),
         closed: AtomicBool::new(false),
      }
   }

   /// Open the store rooted at `root`, failing if the directory is unusable.
   pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
      Ok(Self::new(FileBackend::new(root)?))
   }

   pub fn root(&self) -> &Path {
      self.backend.root()
   }

   /// Normalize a raw path, rejecting anything that could escape the store.
   pub fn normalize(raw: &str) -> Result<StorePath> {
      StorePath::parse(raw)
   }

   fn path_lock(&self, path: &StorePath) -> Arc<Mutex<()>> {
      Arc::clone(self.path_locks.lock().entry(path.clone()).or_default())
   }

   pub fn get_directory_handle(&self, path: &StorePath, create: bool) -> Result<PathBuf> {
      if let Some(dir) = self.directories.lock().get(path) {
         return Ok(dir.clone());
      }
      let dir = self.backend.get_directory(path, create)?;
      self.directories.lock().insert(path.clone(), dir.clone());
      Ok(dir)
   }

   /// Resolve a file handle, creating the file (and its directories) when
   /// `create` is set.
   pub fn get_file_handle(&self, path: &StorePath, create: bool) -> Result<FileHandle> {
      if let Some(handle) = self.files.lock().get(path) {
         return Ok(handle.clone());
      }
      if let Some(parent) = path.parent() {
         self.get_directory_handle(&parent, create)?;
      }
      let handle = self.backend.get_file(path, create)?;
      self.files.lock().insert(path.clone(), handle.clone());
      Ok(handle)
   }

   pub fn has_sync_handle(&self, path: &StorePath) -> bool {
      self.sync_handles.lock().contains_key(path)
   }

   pub fn open_sync_handle_count(&self) -> usize {
      self.sync_handles.lock().len()
   }

   /// Close the cached handle for `path`, if any. Caller holds the path lock.
   fn close_sync_handle_locked(&self, path: &StorePath) -> bool {
      let Some(handle) = self.sync_handles.lock().remove(path) else {
         return false;
      };
      if let Err(e) = handle.close() {
         warn!(%path, error = %e, "Closing access handle failed");
      }
      true
   }

   fn open_sync_handle_locked(&self, path: &StorePath) -> Result<()> {
      self.close_sync_handle_locked(path);
      let file = self.get_file_handle(path, false)?;
      let handle = self.backend.create_sync_access_handle(&file)?;
      self.sync_handles.lock().insert(path.clone(), handle);
      Ok(())
   }

   /// Open an exclusive access handle on `path`, closing any prior one first.
   pub fn open_sync_handle(&self, path: &StorePath) -> Result<()> {
      self.ensure_open()?;
      let lock = self.path_lock(path);
      let _guard = lock.lock();
      self.open_sync_handle_locked(path)
   }

   pub fn close_sync_handle(&self, path: &StorePath) -> bool {
      let lock = self.path_lock(path);
      let _guard = lock.lock();
      self.close_sync_handle_locked(path)
   }

   /// Run `f` with the path's access handle, opening one if needed.
   pub fn with_sync_handle<T>(
      &self,
      path: &StorePath,
      f: impl FnOnce(&mut SyncAccessHandle) -> Result<T>,
   ) -> Result<T> {
      self.ensure_open()?;
      let lock = self.path_lock(path);
      let _guard = lock.lock();
      if !self.has_sync_handle(path) {
         self.open_sync_handle_locked(path)?;
      }
      let mut handles = self.sync_handles.lock();
      let handle = handles
         .get_mut(path)
         .ok_or_else(|| Error::NotFound(path.to_string()))?;
      f(handle)
   }

   fn ensure_open(&self) -> Result<()> {
      if self.closed.load(Ordering::Acquire) {
         return Err(Error::Closed);
      }
      Ok(())
   }

   /// Run `op` on `path` with no access handle open.
   ///
   /// With `reopen`, a handle that was open before is reopened afterwards,
   /// whether or not `op` succeeded.
   fn exclusive<T>(
      &self,
      path: &StorePath,
      reopen: bool,
      op: impl FnOnce(&FileBackend) -> Result<T>,
   ) -> Result<T> {
      self.ensure_open()?;
      let lock = self.path_lock(path);
      let _guard = lock.lock();

      let had_handle = self.close_sync_handle_locked(path);
      let result = op(&self.backend);

      if had_handle
         && reopen
         && let Err(e) = self.open_sync_handle_locked(path)
      {
         warn!(%path, error = %e, "Failed to reopen access handle");
      }
      result
   }

   /// Replace the file at `path` with `bytes`, creating it if needed.
   pub fn store(&self, path: &StorePath, bytes: &[u8]) -> Result<()> {
      let file = self.get_file_handle(path, true)?;
      self.exclusive(path, true, |backend| backend.write_file(&file, bytes))?;
      debug!(%path, bytes = bytes.len(), "Stored file");
      Ok(())
   }

   pub fn read(&self, path: &StorePath) -> Result<Vec<u8>> {
      let file = self.get_file_handle(path, false)?;
      self.exclusive(path, true, |backend| backend.read_file(&file))
   }

   pub fn size(&self, path: &StorePath) -> Result<u64> {
      let file = self.get_file_handle(path, false)?;
      self.exclusive(path, true, |backend| backend.file_size(&file))
   }

   pub fn exists(&self, path: &StorePath) -> bool {
      path.to_fs_path(self.root()).is_file()
   }

   /// Remove the file at `path`. Its access handle is closed, not reopened.
   ///
   /// The cached file handle is dropped when the file is gone afterwards,
   /// including when it was already missing.
   pub fn delete(&self, path: &StorePath) -> Result<()> {
      let result = self.exclusive(path, false, |backend| backend.remove(path));
      if matches!(result, Ok(()) | Err(Error::NotFound(_))) {
         self.files.lock().remove(path);
      }
      result?;
      debug!(%path, "Deleted file");
      Ok(())
   }

   /// Close every cached access handle and drop the handle caches.
   ///
   /// The store refuses further operations afterwards.
   pub fn close_all(&self) {
      if self.closed.swap(true, Ordering::AcqRel) {
         return;
      }
      let handles: Vec<_> = self.sync_handles.lock().drain().collect();
      for (path, handle) in handles {
         if let Err(e) = handle.close() {
            warn!(%path, error = %e, "Closing access handle failed");
         }
      }
      self.files.lock().clear();
      self.directories.lock().clear();
      debug!(root = %self.root().display(), "Store closed");
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }
}

impl Drop for OpfsStore {
   fn drop(&mut self) {
      self.close_all();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use tempfile::TempDir;

   fn store() -> (OpfsStore, TempDir) {
      let dir = TempDir::new().unwrap();
      (OpfsStore::open(dir.path()).unwrap(), dir)
   }

   fn path(raw: &str) -> StorePath {
      OpfsStore::normalize(raw).unwrap()
   }

   #[test]
   fn test_reopening_a_handle_closes_the_prior_one() {
      let (store, _dir) = store();
      let p = path("opfs://db/app.db");
      store.store(&p, b"data").unwrap();

      store.open_sync_handle(&p).unwrap();
      store.open_sync_handle(&p).unwrap();

      assert_eq!(store.open_sync_handle_count(), 1);
      assert!(store.has_sync_handle(&p));
   }

   #[test]
   fn test_operations_close_and_reopen_open_handles() {
      let (store, _dir) = store();
      let p = path("app.db");
      store.store(&p, b"one").unwrap();
      store.open_sync_handle(&p).unwrap();

      store.store(&p, b"two").unwrap();
      assert_eq!(store.read(&p).unwrap(), b"two");
      assert_eq!(store.size(&p).unwrap(), 3);
      assert!(store.has_sync_handle(&p));

      let contents = store.with_sync_handle(&p, |h| h.read_all()).unwrap();
      assert_eq!(contents, b"two");
   }

   #[test]
   fn test_delete_closes_handle_without_reopening() {
      let (store, _dir) = store();
      let p = path("app.db");
      store.store(&p, b"x").unwrap();
      store.open_sync_handle(&p).unwrap();

      store.delete(&p).unwrap();
      assert!(!store.has_sync_handle(&p));
      assert!(!store.exists(&p));
      assert!(matches!(store.read(&p), Err(Error::NotFound(_))));
   }

   #[test]
   fn test_with_sync_handle_writes_through() {
      let (store, _dir) = store();
      let p = path("notes/app.db");
      store.get_file_handle(&p, true).unwrap();

      store.with_sync_handle(&p, |h| h.write_all(b"abc")).unwrap();
      assert_eq!(store.read(&p).unwrap(), b"abc");
   }

   #[test]
   fn test_close_all_releases_handles() {
      let (store, _dir) = store();
      for raw in ["a.db", "b.db"] {
         store.store(&path(raw), b"x").unwrap();
         store.open_sync_handle(&path(raw)).unwrap();
      }
      assert_eq!(store.open_sync_handle_count(), 2);

      store.close_all();
      assert_eq!(store.open_sync_handle_count(), 0);
      assert!(store.is_closed());
      assert!(store.read(&path("a.db")).is_err());
   }
}
