//! ATTACH / DETACH statement builders

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Options for [`build_attach_query`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttachOptions {
   pub read_only: bool,
   /// Storage type of the attached file (for example `sqlite`), when the
   /// engine cannot infer it
   pub db_type: Option<String>,
}

/// Aliases are plain identifiers: no quoting, no qualification.
fn validate_alias(alias: &str) -> Result<()> {
   let mut chars = alias.chars();
   let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
   if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
      Ok(())
   } else {
      Err(Error::InvalidAttachIdentifier(alias.to_string()))
   }
}

/// Build an `ATTACH` statement.
///
/// ```
/// use workbench_script::{AttachOptions, build_attach_query};
///
/// let sql = build_attach_query(
///     "/a.db",
///     "mydb",
///     &AttachOptions { read_only: true, ..Default::default() },
/// )
/// .unwrap();
/// assert_eq!(sql, "ATTACH '/a.db' AS mydb (READ_ONLY)");
/// ```
pub fn build_attach_query(path: &str, alias: &str, options: &AttachOptions) -> Result<String> {
   validate_alias(alias)?;

   let mut parts = Vec::new();
   if let Some(db_type) = &options.db_type {
      validate_alias(db_type)?;
      parts.push(format!("TYPE {db_type}"));
   }
   if options.read_only {
      parts.push("READ_ONLY".to_string());
   }

   let mut sql = format!("ATTACH '{}' AS {alias}", path.replace('\'', "''"));
   if !parts.is_empty() {
      sql.push_str(&format!(" ({})", parts.join(", ")));
   }
   Ok(sql)
}

/// Build a `DETACH` statement for an alias created by [`build_attach_query`].
pub fn build_detach_query(alias: &str) -> Result<String> {
   validate_alias(alias)?;
   Ok(format!("DETACH {alias}"))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_attach_without_options() {
      let sql = build_attach_query("/data/other.db", "other", &AttachOptions::default()).unwrap();
      assert_eq!(sql, "ATTACH '/data/other.db' AS other");
   }

   #[test]
   fn test_attach_with_type_and_read_only() {
      let options = AttachOptions {
         read_only: true,
         db_type: Some("sqlite".into()),
      };
      let sql = build_attach_query("/a.db", "mydb", &options).unwrap();
      assert_eq!(sql, "ATTACH '/a.db' AS mydb (TYPE sqlite, READ_ONLY)");
   }

   #[test]
   fn test_attach_escapes_path_quotes() {
      let sql = build_attach_query("/it's.db", "x", &AttachOptions::default()).unwrap();
      assert_eq!(sql, "ATTACH '/it''s.db' AS x");
   }

   #[test]
   fn test_rejects_unsafe_alias() {
      for alias in ["", "1db", "my db", "a.b", "x; DROP TABLE t"] {
         let err = build_attach_query("/a.db", alias, &AttachOptions::default()).unwrap_err();
         assert_eq!(err.error_code(), "INVALID_ATTACH_IDENTIFIER");
      }
      assert!(build_detach_query("a-b").is_err());
   }

   #[test]
   fn test_detach() {
      assert_eq!(build_detach_query("mydb").unwrap(), "DETACH mydb");
   }
}
