use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use workbench_engine::{EngineConfig, PoolConfig};
use workbench_persist::PersistenceConfig;
use workbench_script::RunnerConfig;

/// Configuration for [`Workbench`](crate::Workbench)
///
/// # Examples
///
/// ```
/// use sql_workbench::WorkbenchConfig;
/// use workbench_engine::PoolConfig;
///
/// let config = WorkbenchConfig {
///     storage_root: "/var/lib/workbench".into(),
///     pool: PoolConfig {
///         max_pool_size: 2,
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert_eq!(config.persistence.db_path, "workbench.db");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkbenchConfig {
   /// Root of the private file store holding the durable database file
   ///
   /// Default: `workbench-data`
   pub storage_root: PathBuf,

   /// Engine settings. `database_path` is replaced by the durable file in
   /// persistent mode and cleared in memory mode.
   pub engine: EngineConfig,

   pub pool: PoolConfig,

   pub runner: RunnerConfig,

   pub persistence: PersistenceConfig,
}

impl Default for WorkbenchConfig {
   fn default() -> Self {
      Self {
         storage_root: PathBuf::from("workbench-data"),
         engine: EngineConfig::default(),
         pool: PoolConfig::default(),
         runner: RunnerConfig::default(),
         persistence: PersistenceConfig::default(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use workbench_persist::PersistenceMode;

   #[test]
   fn test_nested_partial_json() {
      let config: WorkbenchConfig = serde_json::from_str(
         r#"{
            "storageRoot": "/data",
            "pool": {"maxPoolSize": 1},
            "persistence": {"mode": "memory"}
         }"#,
      )
      .unwrap();

      assert_eq!(config.storage_root, PathBuf::from("/data"));
      assert_eq!(config.pool.max_pool_size, 1);
      assert_eq!(config.persistence.mode, PersistenceMode::Memory);
      assert_eq!(config.runner.stream_batch_size, 1024);
   }
}
