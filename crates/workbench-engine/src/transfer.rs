//! Export/import encodings shared by all engine builds

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::decode::{quote_identifier, validate_identifier};
use crate::engine::{DataFormat, EngineConnection, JsonRow, QueryResult};
use crate::{Error, Result};

/// Serialize a result set.
///
/// JSON is an array of objects in column order. CSV follows RFC 4180 with
/// `\n` record terminators: a header row, then one record per row with
/// fields quoted only when needed. NULL becomes an empty field.
pub(crate) fn encode(format: DataFormat, result: &QueryResult) -> Result<Vec<u8>> {
   match format {
      DataFormat::Json => Ok(serde_json::to_vec(&result.rows)?),
      DataFormat::Csv => {
         let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
         writer.write_record(&result.columns).map_err(std::io::Error::from)?;

         for row in &result.rows {
            let fields = result.columns.iter().map(|c| match row.get(c) {
               None | Some(JsonValue::Null) => String::new(),
               Some(JsonValue::String(s)) => s.clone(),
               Some(other) => other.to_string(),
            });
            writer.write_record(fields).map_err(std::io::Error::from)?;
         }

         writer.into_inner().map_err(|e| Error::Io(e.into_error()))
      }
   }
}

fn invalid_csv(e: csv::Error) -> Error {
   Error::InvalidImport(format!("malformed CSV: {e}"))
}

/// Parse an import payload into rows.
///
/// CSV input must be UTF-8 with a header row; quoted fields may contain
/// delimiters, doubled quotes and line breaks, and every record must have as
/// many fields as the header. Values are imported as text.
pub(crate) fn decode(format: DataFormat, data: &[u8]) -> Result<Vec<JsonRow>> {
   match format {
      DataFormat::Json => {
         let value: JsonValue = serde_json::from_slice(data)?;
         let JsonValue::Array(items) = value else {
            return Err(Error::InvalidImport("expected a JSON array of objects".into()));
         };

         items
            .into_iter()
            .map(|item| match item {
               JsonValue::Object(map) => Ok(map.into_iter().collect()),
               other => Err(Error::InvalidImport(format!("expected an object, found {other}"))),
            })
            .collect()
      }
      DataFormat::Csv => {
         let mut reader = csv::ReaderBuilder::new().from_reader(data);
         let header: Vec<String> = reader
            .headers()
            .map_err(invalid_csv)?
            .iter()
            .map(str::to_string)
            .collect();

         reader
            .records()
            .map(|record| {
               let record = record.map_err(invalid_csv)?;
               Ok(header
                  .iter()
                  .cloned()
                  .zip(record.iter().map(|field| JsonValue::String(field.to_string())))
                  .collect())
            })
            .collect()
      }
   }
}

/// Insert rows into `table` inside one transaction, rolling back on the
/// first failure.
pub(crate) async fn insert_rows<C: EngineConnection>(
   conn: &mut C,
   table: &str,
   rows: Vec<JsonRow>,
) -> Result<u64> {
   validate_identifier(table)?;

   // Column list is the union of keys, in first-seen order
   let mut columns: IndexMap<String, ()> = IndexMap::new();
   for row in &rows {
      for key in row.keys() {
         columns.entry(key.clone()).or_insert(());
      }
   }
   for column in columns.keys() {
      validate_identifier(column)?;
   }

   if rows.is_empty() {
      return Ok(0);
   }

   let column_list: Vec<String> = columns.keys().map(|c| quote_identifier(c)).collect();
   let placeholders = vec!["?"; columns.len()].join(", ");
   let sql = format!(
      "INSERT INTO {} ({}) VALUES ({})",
      quote_identifier(table),
      column_list.join(", "),
      placeholders
   );

   conn.execute("BEGIN", Vec::new()).await?;

   let mut inserted = 0;
   for row in rows {
      let values = columns
         .keys()
         .map(|c| row.get(c).cloned().unwrap_or(JsonValue::Null))
         .collect();

      match conn.execute(&sql, values).await {
         Ok(result) => inserted += result.rows_affected,
         Err(e) => {
            if let Err(rollback_err) = conn.execute("ROLLBACK", Vec::new()).await {
               warn!(table, error = %rollback_err, "Rollback after failed import also failed");
            }
            return Err(e);
         }
      }
   }

   conn.execute("COMMIT", Vec::new()).await?;
   debug!(table, inserted, "Imported rows");
   Ok(inserted)
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   fn result() -> QueryResult {
      let mut first = JsonRow::new();
      first.insert("id".into(), json!(1));
      first.insert("name".into(), json!("Smith, Jane"));
      let mut second = JsonRow::new();
      second.insert("id".into(), json!(2));
      second.insert("name".into(), JsonValue::Null);

      QueryResult {
         columns: vec!["id".into(), "name".into()],
         rows: vec![first, second],
         rows_affected: 0,
      }
   }

   #[test]
   fn test_encode_csv_quotes_fields() {
      let bytes = encode(DataFormat::Csv, &result()).unwrap();
      assert_eq!(
         String::from_utf8(bytes).unwrap(),
         "id,name\n1,\"Smith, Jane\"\n2,\n"
      );
   }

   #[test]
   fn test_encode_json_preserves_column_order() {
      let bytes = encode(DataFormat::Json, &result()).unwrap();
      assert_eq!(
         String::from_utf8(bytes).unwrap(),
         r#"[{"id":1,"name":"Smith, Jane"},{"id":2,"name":null}]"#
      );
   }

   #[test]
   fn test_decode_csv_with_quotes() {
      let rows = decode(DataFormat::Csv, b"id,note\n1,\"a \"\"quoted\"\", b\"\n2,plain\n").unwrap();
      assert_eq!(rows.len(), 2);
      assert_eq!(rows[0]["note"], json!("a \"quoted\", b"));
      assert_eq!(rows[1]["id"], json!("2"));
   }

   #[test]
   fn test_csv_fields_spanning_lines_survive_export_and_import() {
      let mut row = JsonRow::new();
      row.insert("id".into(), json!(1));
      row.insert("note".into(), json!("first line\nsecond, \"quoted\" line"));
      let result = QueryResult {
         columns: vec!["id".into(), "note".into()],
         rows: vec![row],
         rows_affected: 0,
      };

      let bytes = encode(DataFormat::Csv, &result).unwrap();
      assert_eq!(
         String::from_utf8(bytes.clone()).unwrap(),
         "id,note\n1,\"first line\nsecond, \"\"quoted\"\" line\"\n"
      );

      let rows = decode(DataFormat::Csv, &bytes).unwrap();
      assert_eq!(rows.len(), 1);
      assert_eq!(rows[0]["note"], json!("first line\nsecond, \"quoted\" line"));
   }

   #[test]
   fn test_decode_csv_accepts_crlf_and_rejects_bad_utf8() {
      let rows = decode(DataFormat::Csv, b"a,b\r\n1,2\r\n").unwrap();
      assert_eq!(rows[0]["b"], json!("2"));

      let err = decode(DataFormat::Csv, b"a\n\xff\n").unwrap_err();
      assert_eq!(err.error_code(), "INVALID_IMPORT");
   }

   #[test]
   fn test_decode_csv_rejects_ragged_records() {
      let err = decode(DataFormat::Csv, b"a,b\n1\n").unwrap_err();
      assert_eq!(err.error_code(), "INVALID_IMPORT");
   }

   #[test]
   fn test_decode_json_requires_array_of_objects() {
      assert!(decode(DataFormat::Json, br#"{"a":1}"#).is_err());
      assert!(decode(DataFormat::Json, b"[1,2]").is_err());
      let rows = decode(DataFormat::Json, br#"[{"a":1}]"#).unwrap();
      assert_eq!(rows[0]["a"], json!(1));
   }
}
