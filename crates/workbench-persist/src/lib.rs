//! # workbench-persist
//!
//! Durable storage for the workbench database.
//!
//! - **[`StorePath`]**: Validated, scheme-stripped paths inside the store
//! - **[`OpfsStore`]**: Handle caching and exclusive access-handle arbitration
//! - **[`PersistenceController`]**: Import, export and clear of the single
//!   durable database file, with a published [`PersistenceState`]
//!
//! The store follows the origin private file system's rule that a file has
//! at most one open sync access handle and cannot be touched any other way
//! while it is open. [`OpfsStore`] closes and reopens handles around every
//! operation so callers never see a conflict.
//!
//! # Example
//!
//! ```no_run
//! use workbench_persist::{PersistenceConfig, PersistenceController, SQLITE_HEADER};
//!
//! let config = PersistenceConfig {
//!     expected_header: Some(SQLITE_HEADER.to_vec()),
//!     ..Default::default()
//! };
//! let controller = PersistenceController::new("/var/lib/workbench", config).unwrap();
//! controller.initialize().unwrap();
//!
//! if let Some(bytes) = controller.export_db() {
//!     assert!(controller.import_db(&bytes));
//! }
//! println!("{:?}", controller.state());
//! ```

mod backend;
mod config;
mod controller;
mod error;
mod path;
mod state;
mod store;

pub use backend::{FileBackend, FileHandle, SyncAccessHandle};
pub use config::{PersistenceConfig, PersistenceMode, SQLITE_HEADER};
pub use controller::PersistenceController;
pub use error::{Error, Result};
pub use path::StorePath;
pub use state::PersistenceState;
pub use store::OpfsStore;
