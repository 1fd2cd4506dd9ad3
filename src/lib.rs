//! # sql-workbench
//!
//! Data layer of a SQL workbench: everything between the UI and the
//! embedded SQL engine.
//!
//! - **[`Workbench`]**: The UI-facing surface. Queries, tabbed script
//!   execution, and export/import/clear of the durable database file
//! - **[`Session`]**: Explicit per-session context holding script tabs and
//!   the user-facing error map
//! - **[`WorkbenchConfig`]**: Engine, pool, runner and persistence settings
//!
//! The subsystems live in their own crates and are re-exported here:
//! [`engine`], [`script`] and [`persist`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sql_workbench::{Session, Workbench, WorkbenchConfig};
//! use sql_workbench::script::SortSpec;
//!
//! # async fn example() -> sql_workbench::Result<()> {
//! let config = WorkbenchConfig {
//!     storage_root: "/var/lib/workbench".into(),
//!     ..Default::default()
//! };
//! let workbench = Workbench::open(config, Arc::new(Session::new())).await?;
//!
//! let outcome = workbench
//!    .run_script_query("tab-1", "CREATE TABLE t (x); INSERT INTO t VALUES (1); SELECT * FROM t")
//!    .await?;
//! if let Some(adapter) = outcome.into_adapter() {
//!    println!("{:?}", adapter.get_schema());
//!    let mut reader = adapter.get_reader(&SortSpec::default())?;
//!    while let Some(batch) = reader.next_batch().await {
//!       println!("{} rows", batch?.len());
//!    }
//! }
//!
//! let bytes = workbench.export_database().await;
//! println!("{:?}", workbench.persistence_state());
//! workbench.shutdown().await;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```
//!
//! ## Known limitation
//!
//! Nothing guards the durable file against writers in other processes
//! sharing the same storage root. Run one workbench per root.

mod config;
mod error;
mod session;
mod workbench;

pub use workbench_engine as engine;
pub use workbench_persist as persist;
pub use workbench_script as script;

pub use config::WorkbenchConfig;
pub use error::{Error, Result};
pub use session::Session;
pub use workbench::Workbench;
