use serde::{Deserialize, Serialize};

/// First 16 bytes of every SQLite database file.
pub const SQLITE_HEADER: &[u8] = b"SQLite format 3\0";

/// Where the database lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceMode {
   /// One durable file in the private file store
   #[default]
   Persistent,
   /// Nothing survives the session
   Memory,
}

/// Configuration for [`PersistenceController`](crate::PersistenceController)
///
/// # Examples
///
/// ```
/// use workbench_persist::{PersistenceConfig, PersistenceMode};
///
/// let config = PersistenceConfig {
///     db_path: "opfs://projects/sales.db".into(),
///     ..Default::default()
/// };
/// assert_eq!(config.mode, PersistenceMode::Persistent);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistenceConfig {
   /// Default: persistent
   pub mode: PersistenceMode,

   /// Logical path of the durable file inside the store
   ///
   /// Default: `workbench.db`
   pub db_path: String,

   /// Imports whose bytes do not start with this prefix are rejected
   ///
   /// Default: none (any bytes are accepted)
   pub expected_header: Option<Vec<u8>>,
}

impl Default for PersistenceConfig {
   fn default() -> Self {
      Self {
         mode: PersistenceMode::Persistent,
         db_path: "workbench.db".to_string(),
         expected_header: None,
      }
   }
}
