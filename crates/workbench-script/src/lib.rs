//! # workbench-script
//!
//! Script execution on top of `workbench-engine`.
//!
//! - **[`split_statements`]**: Splits a script into classified [`Statement`]s
//! - **[`TransactionalScriptRunner`]**: Runs a script on one pooled connection, all or nothing
//! - **[`ScriptTab`]**: Per-tab execution state and cancellation
//! - **[`DataAdapter`]**: Schema and sorted, streamed rows of a script's final SELECT
//! - **[`build_attach_query`]** / **[`build_detach_query`]**: ATTACH/DETACH statements
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use workbench_engine::{ConnectionPool, Engine, EngineConfig, PoolConfig, SqliteEngine};
//! use workbench_script::{RunnerConfig, ScriptTab, SortSpec, TransactionalScriptRunner};
//!
//! # async fn example() -> Result<(), workbench_script::Error> {
//! let engine = SqliteEngine::new();
//! engine.initialize(&EngineConfig::default()).await?;
//! let pool = ConnectionPool::new(Arc::new(engine), PoolConfig::default());
//! let runner = TransactionalScriptRunner::new(pool, RunnerConfig::default());
//!
//! let tab = ScriptTab::new("tab-1");
//! let outcome = runner
//!    .run(&tab, "CREATE TABLE t (x); INSERT INTO t VALUES (1); SELECT x FROM t")
//!    .await?;
//! if let Some(adapter) = outcome.into_adapter() {
//!    let mut reader = adapter.get_reader(&SortSpec::default())?;
//!    while let Some(batch) = reader.next_batch().await {
//!       println!("{} rows", batch?.len());
//!    }
//! }
//! # Ok(())
//! # }
//! ```

mod adapter;
mod builders;
mod cancel;
mod config;
mod error;
mod runner;
pub mod statement;

pub use adapter::{DataAdapter, RowReader, SortColumn, SortDirection, SortSpec};
pub use builders::{AttachOptions, build_attach_query, build_detach_query};
pub use cancel::CancelToken;
pub use config::RunnerConfig;
pub use error::{Error, Result, ScriptFailure};
pub use runner::{ScriptExecutionState, ScriptOutcome, ScriptTab, TransactionalScriptRunner};
pub use statement::{Statement, StatementKind, TRANSACTION_POLICY, split_statements};
