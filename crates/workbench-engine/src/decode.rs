//! Conversion between SQLite values and JSON

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteRow, SqliteValueRef};
use sqlx::{Column, Decode, Row, Sqlite, TypeInfo, ValueRef};

use crate::engine::JsonRow;
use crate::{Error, Result};

/// Decode a single SQLite value into JSON.
///
/// BLOBs are returned as base64 strings so rows stay JSON-serializable.
pub(crate) fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_ascii_uppercase();
   let decoded = match type_name.as_str() {
      "TEXT" | "DATE" | "TIME" | "DATETIME" => {
         <String as Decode<Sqlite>>::decode(value).map(JsonValue::String)
      }
      "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => {
         <f64 as Decode<Sqlite>>::decode(value).map(|f| {
            serde_json::Number::from_f64(f)
               .map(JsonValue::Number)
               .unwrap_or(JsonValue::Null)
         })
      }
      "INTEGER" | "INT" | "INT4" | "INT8" | "BIGINT" | "BOOLEAN" => {
         <i64 as Decode<Sqlite>>::decode(value).map(JsonValue::from)
      }
      "BLOB" => <Vec<u8> as Decode<Sqlite>>::decode(value)
         .map(|bytes| JsonValue::String(BASE64.encode(bytes))),
      "NULL" => return Ok(JsonValue::Null),
      other => return Err(Error::UnsupportedDatatype(other.to_string())),
   };

   decoded.map_err(|e| Error::UnsupportedDatatype(format!("{type_name}: {e}")))
}

/// Decode every column of a row, preserving column order.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<JsonRow> {
   let mut value = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      let v = row.try_get_raw(i)?;
      value.insert(column.name().to_string(), to_json(v)?);
   }
   Ok(value)
}

/// Helper function to bind a JSON value to a SQLx query
pub(crate) fn bind_value<'a>(
   query: sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>>,
   value: JsonValue,
) -> sqlx::query::Query<'a, Sqlite, SqliteArguments<'a>> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Bool(b) => query.bind(b),
      JsonValue::Number(number) => {
         // Preserve integer precision by binding as i64 when possible
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            match i64::try_from(uint_val) {
               Ok(v) => query.bind(v),
               // Value too large for i64, use f64 (will lose precision)
               Err(_) => query.bind(uint_val as f64),
            }
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Validate that an identifier is safe for SQL interpolation.
///
/// Accepts names matching `[a-zA-Z_][a-zA-Z0-9_.]*`, which covers plain
/// names and qualified names like `schema.table`.
pub fn validate_identifier(name: &str) -> Result<()> {
   let mut chars = name.chars();
   let valid = match chars.next() {
      Some(first) if first.is_ascii_alphabetic() || first == '_' => {
         chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '.')
      }
      _ => false,
   };

   if valid {
      Ok(())
   } else {
      Err(Error::InvalidIdentifier(name.to_string()))
   }
}

/// Quote an identifier with double quotes.
///
/// Qualified names are quoted per segment, and embedded double quotes are
/// doubled per SQL standard (`"` → `""`).
pub fn quote_identifier(name: &str) -> String {
   name
      .split('.')
      .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
      .collect::<Vec<_>>()
      .join(".")
}

/// Quote a result column name as one identifier.
///
/// Unlike [`quote_identifier`], dots are part of the name, so a column
/// aliased `"t.x"` stays one identifier.
pub fn quote_column(name: &str) -> String {
   format!("\"{}\"", name.replace('"', "\"\""))
}
