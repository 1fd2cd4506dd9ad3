//! Configuration for the engine and its connection pool

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`ConnectionPool`](crate::ConnectionPool)
///
/// # Examples
///
/// ```
/// use workbench_engine::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just one field
/// let config = PoolConfig {
///     max_pool_size: 2,
///     ..Default::default()
/// };
/// assert_eq!(config.acquire_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
   /// Maximum number of concurrently open engine sessions
   ///
   /// Fixed for the lifetime of the pool. Sessions are created lazily, so a
   /// pool that never sees concurrent use only ever opens one.
   ///
   /// Default: 4
   pub max_pool_size: usize,

   /// How long `acquire()` waits for an idle session when no timeout is given
   ///
   /// Default: 30 seconds
   #[serde(with = "duration_ms")]
   pub acquire_timeout: Duration,

   /// Queue callers when every session is busy
   ///
   /// When false, `acquire()` fails immediately with `PoolExhausted` instead
   /// of waiting for a release.
   ///
   /// Default: true
   pub wait_when_exhausted: bool,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_pool_size: 4,
         acquire_timeout: Duration::from_secs(30),
         wait_when_exhausted: true,
      }
   }
}

/// Options passed to `Engine::load_extension`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtensionOptions {
   /// Entry point symbol, when the extension does not use the default one
   pub entry_point: Option<String>,
}

/// An extension to load into every session the engine opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionSpec {
   pub name: String,
   #[serde(default)]
   pub options: ExtensionOptions,
}

/// Configuration for the native engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
   /// Durable database file. `None` runs the engine in memory.
   pub database_path: Option<PathBuf>,

   /// Open every session read-only
   ///
   /// Default: false
   pub read_only: bool,

   /// How long a session waits on a locked database file before failing
   ///
   /// Default: 5 seconds
   #[serde(with = "duration_ms")]
   pub busy_timeout: Duration,

   /// Extensions loaded into each new session
   pub extensions: Vec<ExtensionSpec>,
}

impl Default for EngineConfig {
   fn default() -> Self {
      Self {
         database_path: None,
         read_only: false,
         busy_timeout: Duration::from_secs(5),
         extensions: Vec::new(),
      }
   }
}

mod duration_ms {
   use std::time::Duration;

   use serde::{Deserialize, Deserializer, Serializer};

   pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
      serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
   }

   pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
      Ok(Duration::from_millis(u64::deserialize(deserializer)?))
   }
}
