//! Host file system standing in for the private file store
//!
//! Enforces the platform rule the store has to live with: a path can have
//! at most one open sync access handle, and while it is open the path can
//! not be read, replaced or removed through any other route. Breaking the
//! rule fails with [`Error::HandleConflict`], just as the platform would.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::path::StorePath;
use crate::{Error, Result};

type OpenSet = Arc<Mutex<HashSet<StorePath>>>;

/// A file inside the store. Cheap to clone; holds no OS resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
   path: StorePath,
   fs_path: PathBuf,
}

impl FileHandle {
   pub fn path(&self) -> &StorePath {
      &self.path
   }

   pub fn fs_path(&self) -> &Path {
      &self.fs_path
   }
}

/// Exclusive, synchronous read/write access to one file.
///
/// Released on [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct SyncAccessHandle {
   path: StorePath,
   file: Option<File>,
   open: OpenSet,
}

impl SyncAccessHandle {
   pub fn path(&self) -> &StorePath {
      &self.path
   }

   fn file(&mut self) -> io::Result<&mut File> {
      self.file
         .as_mut()
         .ok_or_else(|| io::Error::other("access handle is closed"))
   }

   pub fn size(&mut self) -> Result<u64> {
      Ok(self.file()?.metadata()?.len())
   }

   pub fn read_all(&mut self) -> Result<Vec<u8>> {
      let file = self.file()?;
      file.seek(SeekFrom::Start(0))?;
      let mut bytes = Vec::new();
      file.read_to_end(&mut bytes)?;
      Ok(bytes)
   }

   /// Replace the file's contents in place.
   pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
      let file = self.file()?;
      file.set_len(0)?;
      file.seek(SeekFrom::Start(0))?;
      file.write_all(bytes)?;
      Ok(())
   }

   pub fn flush(&mut self) -> Result<()> {
      self.file()?.sync_all()?;
      Ok(())
   }

   /// Flush and release the handle.
   pub fn close(mut self) -> Result<()> {
      let flushed = self.flush();
      self.release();
      flushed
   }

   fn release(&mut self) {
      if self.file.take().is_some() {
         self.open.lock().remove(&self.path);
         trace!(path = %self.path, "Access handle closed");
      }
   }
}

impl Drop for SyncAccessHandle {
   fn drop(&mut self) {
      if let Some(file) = &self.file
         && let Err(e) = file.sync_all()
      {
         warn!(path = %self.path, error = %e, "Flush on drop failed");
      }
      self.release();
   }
}

/// The store's backing directory.
#[derive(Debug)]
pub struct FileBackend {
   root: PathBuf,
   open: OpenSet,
   temp_counter: AtomicU64,
}

impl FileBackend {
   /// Open (creating if needed) the store rooted at `root`.
   pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
      let root = root.into();
      fs::create_dir_all(&root)
         .and_then(|()| fs::metadata(&root))
         .and_then(|meta| {
            if meta.is_dir() {
               Ok(())
            } else {
               Err(io::Error::other("store root is not a directory"))
            }
         })
         .map_err(|source| Error::Unavailable {
            path: root.display().to_string(),
            source,
         })?;

      Ok(Self {
         root,
         open: OpenSet::default(),
         temp_counter: AtomicU64::new(0),
      })
   }

   pub fn root(&self) -> &Path {
      &self.root
   }

   pub fn is_open(&self, path: &StorePath) -> bool {
      self.open.lock().contains(path)
   }

   fn check_not_open(&self, path: &StorePath) -> Result<()> {
      if self.is_open(path) {
         return Err(Error::HandleConflict(path.to_string()));
      }
      Ok(())
   }

   fn not_found(path: &StorePath) -> impl FnOnce(io::Error) -> Error + '_ {
      move |e| {
         if e.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path.to_string())
         } else {
            Error::Io(e)
         }
      }
   }

   /// Resolve a directory, creating it and its parents when `create` is set.
   pub fn get_directory(&self, path: &StorePath, create: bool) -> Result<PathBuf> {
      let fs_path = path.to_fs_path(&self.root);
      if create {
         fs::create_dir_all(&fs_path)?;
      } else if !fs_path.is_dir() {
         return Err(Error::NotFound(path.to_string()));
      }
      Ok(fs_path)
   }

   /// Resolve a file. With `create`, a missing file is created empty; its
   /// directory must already exist.
   pub fn get_file(&self, path: &StorePath, create: bool) -> Result<FileHandle> {
      let fs_path = path.to_fs_path(&self.root);
      if create {
         OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&fs_path)
            .map_err(Self::not_found(path))?;
      } else if !fs_path.is_file() {
         return Err(Error::NotFound(path.to_string()));
      }
      Ok(FileHandle {
         path: path.clone(),
         fs_path,
      })
   }

   pub fn create_sync_access_handle(&self, handle: &FileHandle) -> Result<SyncAccessHandle> {
      let mut open = self.open.lock();
      if open.contains(&handle.path) {
         return Err(Error::HandleConflict(handle.path.to_string()));
      }

      let file = OpenOptions::new()
         .read(true)
         .write(true)
         .open(&handle.fs_path)
         .map_err(Self::not_found(&handle.path))?;
      open.insert(handle.path.clone());
      trace!(path = %handle.path, "Access handle opened");

      Ok(SyncAccessHandle {
         path: handle.path.clone(),
         file: Some(file),
         open: Arc::clone(&self.open),
      })
   }

   pub fn read_file(&self, handle: &FileHandle) -> Result<Vec<u8>> {
      self.check_not_open(&handle.path)?;
      fs::read(&handle.fs_path).map_err(Self::not_found(&handle.path))
   }

   pub fn file_size(&self, handle: &FileHandle) -> Result<u64> {
      self.check_not_open(&handle.path)?;
      Ok(fs::metadata(&handle.fs_path)
         .map_err(Self::not_found(&handle.path))?
         .len())
   }

   /// Replace the file's contents atomically.
   ///
   /// Bytes go to a sibling temp file that is renamed over the target, so a
   /// failed write leaves the previous contents in place.
   pub fn write_file(&self, handle: &FileHandle, bytes: &[u8]) -> Result<()> {
      self.check_not_open(&handle.path)?;

      let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
      let temp = handle
         .fs_path
         .with_file_name(format!(".{}.{n}.tmp", handle.path.file_name()));

      let written = File::create(&temp).and_then(|mut file| {
         file.write_all(bytes)?;
         file.sync_all()
      });
      if let Err(e) = written.and_then(|()| fs::rename(&temp, &handle.fs_path)) {
         if let Err(cleanup) = fs::remove_file(&temp)
            && cleanup.kind() != io::ErrorKind::NotFound
         {
            warn!(temp = %temp.display(), error = %cleanup, "Failed to remove temp file");
         }
         return Err(Error::Io(e));
      }
      Ok(())
   }

   pub fn remove(&self, path: &StorePath) -> Result<()> {
      self.check_not_open(path)?;
      fs::remove_file(path.to_fs_path(&self.root)).map_err(Self::not_found(path))
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use tempfile::TempDir;

   fn backend() -> (FileBackend, TempDir) {
      let dir = TempDir::new().unwrap();
      (FileBackend::new(dir.path().join("store")).unwrap(), dir)
   }

   fn path(raw: &str) -> StorePath {
      StorePath::parse(raw).unwrap()
   }

   #[test]
   fn test_second_handle_on_a_path_conflicts() {
      let (backend, _dir) = backend();
      let file = backend.get_file(&path("a.db"), true).unwrap();

      let first = backend.create_sync_access_handle(&file).unwrap();
      let err = backend.create_sync_access_handle(&file).unwrap_err();
      assert_eq!(err.error_code(), "HANDLE_CONFLICT");

      first.close().unwrap();
      assert!(backend.create_sync_access_handle(&file).is_ok());
   }

   #[test]
   fn test_open_handle_blocks_other_routes() {
      let (backend, _dir) = backend();
      let file = backend.get_file(&path("a.db"), true).unwrap();
      let handle = backend.create_sync_access_handle(&file).unwrap();

      assert!(matches!(backend.read_file(&file), Err(Error::HandleConflict(_))));
      assert!(matches!(backend.file_size(&file), Err(Error::HandleConflict(_))));
      assert!(matches!(backend.write_file(&file, b"x"), Err(Error::HandleConflict(_))));
      assert!(matches!(backend.remove(file.path()), Err(Error::HandleConflict(_))));

      drop(handle);
      assert!(backend.remove(file.path()).is_ok());
   }

   #[test]
   fn test_handle_reads_and_writes() {
      let (backend, _dir) = backend();
      let file = backend.get_file(&path("a.db"), true).unwrap();

      let mut handle = backend.create_sync_access_handle(&file).unwrap();
      handle.write_all(b"hello world").unwrap();
      handle.write_all(b"bye").unwrap();
      assert_eq!(handle.size().unwrap(), 3);
      assert_eq!(handle.read_all().unwrap(), b"bye");
      handle.close().unwrap();

      assert_eq!(backend.read_file(&file).unwrap(), b"bye");
   }

   #[test]
   fn test_write_file_replaces_and_leaves_no_temp_files() {
      let (backend, _dir) = backend();
      backend.get_directory(&path("nested"), true).unwrap();
      let file = backend.get_file(&path("nested/a.db"), true).unwrap();

      backend.write_file(&file, b"first").unwrap();
      backend.write_file(&file, b"second").unwrap();
      assert_eq!(backend.read_file(&file).unwrap(), b"second");

      let entries: Vec<_> = fs::read_dir(file.fs_path().parent().unwrap())
         .unwrap()
         .map(|e| e.unwrap().file_name())
         .collect();
      assert_eq!(entries, ["a.db"]);
   }

   #[test]
   fn test_missing_paths_are_not_found() {
      let (backend, _dir) = backend();
      assert!(matches!(backend.get_file(&path("nope.db"), false), Err(Error::NotFound(_))));
      assert!(matches!(backend.remove(&path("nope.db")), Err(Error::NotFound(_))));
      assert!(matches!(backend.get_directory(&path("d"), false), Err(Error::NotFound(_))));
   }

   #[test]
   fn test_unusable_root_is_unavailable() {
      let dir = TempDir::new().unwrap();
      let file_root = dir.path().join("plain-file");
      fs::write(&file_root, b"").unwrap();

      let err = FileBackend::new(&file_root).unwrap_err();
      assert_eq!(err.error_code(), "STORAGE_UNAVAILABLE");
   }
}
