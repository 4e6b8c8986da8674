//! Fixed-width text format
//!
//! Every column occupies exactly its declared `length` characters. Values are
//! left-aligned, padded with spaces and truncated when too long. There is no
//! header and no delimiter.

use super::{FileFormat, FormatCodec, FormatError, Row};
use crate::schema::Schema;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
pub struct FixedWidthCodec;

impl FixedWidthCodec {
    fn widths(schema: &Schema) -> Result<Vec<usize>, FormatError> {
        let missing: Vec<&str> = schema
            .columns()
            .iter()
            .filter(|c| c.length.is_none())
            .map(|c| c.field_name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(FormatError::Unsupported {
                schema: schema.name().to_string(),
                format: super::FormatType::FixedWidth,
                message: format!("columns without length: {}", missing.join(", ")),
            });
        }
        Ok(schema.columns().iter().filter_map(|c| c.length).collect())
    }
}

impl FormatCodec for FixedWidthCodec {
    fn name(&self) -> &'static str {
        "fixed_width"
    }

    fn decode(&self, input: &str, schema: &Schema, format: &FileFormat) -> Result<Vec<Row>, FormatError> {
        let widths = Self::widths(schema)?;
        let mut rows = Vec::new();

        for (index, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let chars: Vec<char> = line.chars().collect();
            let mut offset = 0;
            let mut row = Row::new();
            for (column, width) in schema.columns().iter().zip(&widths) {
                let end = (offset + width).min(chars.len());
                let start = offset.min(chars.len());
                let cell: String = chars[start..end].iter().collect();
                offset += width;

                let cell = cell.trim();
                let cell = if !format.null_value.is_empty() && cell == format.null_value {
                    ""
                } else {
                    cell
                };
                let value = column.parse(cell).map_err(|message| FormatError::Malformed {
                    line: index + 1,
                    message,
                })?;
                row.insert(column.field_name.clone(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn encode(&self, rows: &[Row], schema: &Schema, format: &FileFormat) -> Result<Vec<u8>, FormatError> {
        let widths = Self::widths(schema)?;
        let line_ending = format.line_separator.as_str();
        let mut output = String::new();

        for (index, row) in rows.iter().enumerate() {
            for (column, width) in schema.columns().iter().zip(&widths) {
                let value = row.get(&column.field_name).unwrap_or(&Value::Null);
                let text = column
                    .render(value)
                    .unwrap_or_else(|| format.null_value.clone());
                if text.contains('\n') || text.contains('\r') {
                    return Err(FormatError::Record {
                        index,
                        message: format!("column '{}' contains a line break", column.name),
                    });
                }
                let length = text.chars().count();
                if length > *width {
                    warn!(
                        "Truncating column '{}' of record {} from {} to {} characters",
                        column.name, index, length, width
                    );
                }
                output.extend(text.chars().take(*width));
                output.extend(std::iter::repeat(' ').take(width.saturating_sub(length)));
            }
            output.push_str(line_ending);
        }

        Ok(output.into_bytes())
    }
}
