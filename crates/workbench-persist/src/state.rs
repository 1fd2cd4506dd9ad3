use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::PersistenceMode;

/// Read model of the durable file, published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceState {
   pub mode: PersistenceMode,
   /// Normalized store path of the durable file
   pub db_path: String,
   /// File size in bytes
   pub db_size: u64,
   /// When the file was last written by an import or an explicit sync
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_sync: Option<OffsetDateTime>,
}
