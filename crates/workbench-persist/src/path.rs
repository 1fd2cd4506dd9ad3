//! Store path normalization

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{Error, Result};

const SCHEME_PREFIXES: &[&str] = &["opfs://", "opfs:"];

const ILLEGAL_CHARS: &[char] = &['\\', ':', '*', '?', '"', '<', '>', '|'];

/// A validated path inside the private file store.
///
/// Always relative, `/`-separated, with no empty, `.` or `..` segments. The
/// `opfs://` and `opfs:` scheme prefixes and any leading `/` are stripped, so
/// `opfs:///data/app.db`, `/data/app.db` and `data/app.db` are the same path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
   pub fn parse(raw: &str) -> Result<Self> {
      let invalid = |reason| Error::InvalidPath {
         path: raw.to_string(),
         reason,
      };

      let mut rest = raw.trim();
      for prefix in SCHEME_PREFIXES {
         if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
         }
      }
      let rest = rest.trim_start_matches('/');

      if rest.is_empty() {
         return Err(invalid("path is empty"));
      }
      for segment in rest.split('/') {
         match segment {
            "" => return Err(invalid("path has an empty segment")),
            "." | ".." => return Err(invalid("path may not contain '.' or '..' segments")),
            _ if segment.contains(ILLEGAL_CHARS) || segment.chars().any(char::is_control) => {
               return Err(invalid("path contains an illegal character"));
            }
            _ => {}
         }
      }

      Ok(Self(rest.to_string()))
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }

   pub fn segments(&self) -> impl Iterator<Item = &str> {
      self.0.split('/')
   }

   pub fn file_name(&self) -> &str {
      self.0.rsplit('/').next().unwrap_or(&self.0)
   }

   /// Containing directory, or `None` at the store root.
   pub fn parent(&self) -> Option<StorePath> {
      self.0.rsplit_once('/').map(|(parent, _)| Self(parent.to_string()))
   }

   /// Location of this path under `root` on the host file system.
   pub fn to_fs_path(&self, root: &Path) -> PathBuf {
      self.segments().fold(root.to_path_buf(), |path, segment| path.join(segment))
   }
}

impl fmt::Display for StorePath {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}
