//! Integration tests for the durable file lifecycle.

use std::fs;

use tempfile::TempDir;
use workbench_engine::ErrorKind;
use workbench_persist::{
   OpfsStore, PersistenceConfig, PersistenceController, SQLITE_HEADER, StorePath,
};

struct TestStore {
   controller: PersistenceController,
   dir: TempDir,
}

fn init_tracing() {
   let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn sqlite_bytes(body: &[u8]) -> Vec<u8> {
   let mut bytes = SQLITE_HEADER.to_vec();
   bytes.extend_from_slice(body);
   bytes
}

fn setup(db_path: &str) -> TestStore {
   init_tracing();
   let dir = TempDir::new().unwrap();
   let config = PersistenceConfig {
      db_path: db_path.into(),
      expected_header: Some(SQLITE_HEADER.to_vec()),
      ..Default::default()
   };
   let controller = PersistenceController::new(dir.path().join("origin"), config).unwrap();
   controller.initialize().unwrap();
   TestStore { controller, dir }
}

#[test]
fn test_initialize_creates_an_empty_file() {
   let store = setup("opfs://data/workbench.db");

   let file = store.controller.database_file().unwrap();
   assert!(file.starts_with(store.dir.path()));
   assert!(file.is_file());

   let state = store.controller.state();
   assert_eq!(state.db_path, "data/workbench.db");
   assert_eq!(state.db_size, 0);
   assert!(state.last_sync.is_none());
}

#[test]
fn test_import_then_export_returns_the_same_bytes() {
   let store = setup("workbench.db");
   let bytes = sqlite_bytes(b"page data");

   assert!(store.controller.import_db(&bytes));
   assert_eq!(store.controller.export_db().unwrap(), bytes);

   let state = store.controller.state();
   assert_eq!(state.db_size, bytes.len() as u64);
   assert!(state.last_sync.is_some());
}

#[test]
fn test_rejected_import_keeps_previous_bytes() {
   let store = setup("workbench.db");
   let original = sqlite_bytes(b"original");
   assert!(store.controller.import_db(&original));
   let before = store.controller.state();

   assert!(!store.controller.import_db(b"definitely not a database"));

   assert_eq!(store.controller.export_db().unwrap(), original);
   assert_eq!(store.controller.state(), before);
}

#[test]
fn test_clear_leaves_an_empty_file_in_place() {
   let store = setup("workbench.db");
   assert!(store.controller.import_db(&sqlite_bytes(b"rows")));

   assert!(store.controller.clear_db());

   assert_eq!(store.controller.get_db_size().unwrap(), 0);
   assert!(store.controller.database_file().unwrap().is_file());
   assert!(store.controller.state().last_sync.is_none());
   assert_eq!(store.controller.export_db().unwrap(), Vec::<u8>::new());
}

#[test]
fn test_failed_clear_still_reports_the_missing_file() {
   let store = setup("opfs://data/workbench.db");
   assert!(store.controller.import_db(&sqlite_bytes(b"rows")));
   assert!(store.controller.state().last_sync.is_some());

   // Recreating the file fails once its directory is gone
   let file = store.controller.database_file().unwrap();
   std::fs::remove_dir_all(file.parent().unwrap()).unwrap();

   assert!(!store.controller.clear_db());
   let state = store.controller.state();
   assert_eq!(state.db_size, 0);
   assert!(state.last_sync.is_none());
   assert!(!file.exists());
}

#[test]
fn test_writes_succeed_while_an_access_handle_is_open() {
   let store = setup("workbench.db");
   let files = store.controller.file_store().unwrap();
   let path = StorePath::parse("workbench.db").unwrap();

   files.open_sync_handle(&path).unwrap();
   // A second open closes the first rather than conflicting.
   files.open_sync_handle(&path).unwrap();
   assert_eq!(files.open_sync_handle_count(), 1);

   let bytes = sqlite_bytes(b"through the handle");
   assert!(store.controller.import_db(&bytes));
   assert!(files.has_sync_handle(&path));
   assert_eq!(files.with_sync_handle(&path, |h| h.read_all()).unwrap(), bytes);

   assert!(store.controller.clear_db());
   assert!(!files.has_sync_handle(&path));
}

#[test]
fn test_subscribers_see_state_changes() {
   let store = setup("workbench.db");
   let mut rx = store.controller.subscribe();
   assert!(!rx.has_changed().unwrap());

   assert!(store.controller.import_db(&sqlite_bytes(b"abc")));
   assert!(rx.has_changed().unwrap());
   assert_eq!(rx.borrow_and_update().db_size, 19);

   let synced = store.controller.update_last_sync().unwrap();
   assert!(rx.has_changed().unwrap());
   assert_eq!(*rx.borrow_and_update(), synced);
}

#[test]
fn test_unusable_root_fails_initialization() {
   init_tracing();
   let dir = TempDir::new().unwrap();
   let root = dir.path().join("not-a-directory");
   fs::write(&root, b"").unwrap();

   let controller = PersistenceController::new(&root, PersistenceConfig::default()).unwrap();
   let err = controller.initialize().unwrap_err();

   assert_eq!(err.kind, ErrorKind::InitializationError);
   assert_eq!(err.code, "STORAGE_UNAVAILABLE");
   assert_eq!(err.details.path.as_deref(), Some("workbench.db"));
}

#[test]
fn test_closed_controller_refuses_operations() {
   let store = setup("workbench.db");
   store.controller.close();

   assert!(store.controller.export_db().is_none());
   assert!(!store.controller.import_db(&sqlite_bytes(b"")));
   assert_eq!(
      store.controller.get_db_size().unwrap_err().error_code(),
      "STORE_CLOSED"
   );
}

#[test]
fn test_store_survives_reopen() {
   let dir = TempDir::new().unwrap();
   let path = OpfsStore::normalize("opfs://keep/me.db").unwrap();
   {
      let store = OpfsStore::open(dir.path()).unwrap();
      store.store(&path, b"durable").unwrap();
   }
   let store = OpfsStore::open(dir.path()).unwrap();
   assert_eq!(store.read(&path).unwrap(), b"durable");
}
