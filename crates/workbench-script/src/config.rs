use serde::{Deserialize, Serialize};

/// Configuration for [`TransactionalScriptRunner`](crate::TransactionalScriptRunner)
///
/// # Examples
///
/// ```
/// use workbench_script::RunnerConfig;
///
/// let config = RunnerConfig {
///     stream_batch_size: 256,
///     ..Default::default()
/// };
/// assert!(config.protected_objects.iter().any(|p| p == "sqlite_*"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
   /// Objects DDL and DML statements may not write to
   ///
   /// Case-insensitive; a trailing `*` matches any name with that prefix.
   ///
   /// Default: `sqlite_*`, `information_schema`, `pg_catalog`, `duckdb_*`
   pub protected_objects: Vec<String>,

   /// Rows per batch handed out by a [`RowReader`](crate::RowReader)
   ///
   /// Default: 1024
   pub stream_batch_size: usize,
}

impl Default for RunnerConfig {
   fn default() -> Self {
      Self {
         protected_objects: ["sqlite_*", "information_schema", "pg_catalog", "duckdb_*"]
            .into_iter()
            .map(String::from)
            .collect(),
         stream_batch_size: 1024,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_partial_json_keeps_default_protection() {
      let config: RunnerConfig = serde_json::from_str(r#"{"streamBatchSize": 10}"#).unwrap();
      assert_eq!(config.stream_batch_size, 10);
      assert_eq!(config.protected_objects.len(), 4);
   }
}
