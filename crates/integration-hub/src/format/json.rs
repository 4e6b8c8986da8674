//! JSON array and JSON Lines formats
//!
//! Objects are keyed by field name; header names are accepted on input.
//! Textual values in typed columns (`"42"` in an integer column) are coerced
//! through the column type. Keys outside the schema pass through unchanged.

use super::{FileFormat, FormatCodec, FormatError, Row};
use crate::schema::model::json_type;
use crate::schema::{ColumnType, Schema};
use serde_json::Value;

/// A JSON document holding one array of objects
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

/// One JSON object per line
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLinesCodec;

impl FormatCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, input: &str, schema: &Schema, _format: &FileFormat) -> Result<Vec<Row>, FormatError> {
        if input.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(input)? {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| normalize(schema, item, index))
                .collect(),
            Value::Object(map) => Ok(vec![normalize(schema, Value::Object(map), 0)?]),
            other => Err(FormatError::Malformed {
                line: 1,
                message: format!("expected an array of objects, found {}", json_type(&other)),
            }),
        }
    }

    fn encode(&self, rows: &[Row], _schema: &Schema, format: &FileFormat) -> Result<Vec<u8>, FormatError> {
        let bytes = if format.pretty_print {
            serde_json::to_vec_pretty(rows)?
        } else {
            serde_json::to_vec(rows)?
        };
        Ok(bytes)
    }
}

impl FormatCodec for JsonLinesCodec {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    fn decode(&self, input: &str, schema: &Schema, _format: &FileFormat) -> Result<Vec<Row>, FormatError> {
        let mut rows = Vec::new();
        for (index, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(line).map_err(|e| FormatError::Malformed {
                line: index + 1,
                message: e.to_string(),
            })?;
            rows.push(normalize(schema, value, rows.len())?);
        }
        Ok(rows)
    }

    fn encode(&self, rows: &[Row], _schema: &Schema, format: &FileFormat) -> Result<Vec<u8>, FormatError> {
        let mut output = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut output, row)?;
            output.extend_from_slice(format.line_separator.as_str().as_bytes());
        }
        Ok(output)
    }
}

/// Rename header keys to field names, coerce typed text and fill absent columns
fn normalize(schema: &Schema, value: Value, index: usize) -> Result<Row, FormatError> {
    let object = match value {
        Value::Object(object) => object,
        other => {
            return Err(FormatError::Record {
                index,
                message: format!("expected an object, found {}", json_type(&other)),
            })
        }
    };

    let mut row = Row::new();
    for (key, value) in object {
        match schema.resolve(&key) {
            Some(column) => {
                let value = match value {
                    Value::String(text) if column.kind != ColumnType::String => column
                        .parse(text.trim())
                        .map_err(|message| FormatError::Record { index, message })?,
                    other => other,
                };
                row.insert(column.field_name.clone(), value);
            }
            None => {
                row.insert(key, value);
            }
        }
    }
    for column in schema.columns() {
        if !row.contains_key(&column.field_name) {
            let value = column
                .parse("")
                .map_err(|message| FormatError::Record { index, message })?;
            row.insert(column.field_name.clone(), value);
        }
    }
    Ok(row)
}
