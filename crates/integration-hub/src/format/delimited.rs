//! Delimited text formats (CSV, TSV, pipe)
//!
//! - RFC 4180 quoting: fields holding the delimiter, the quote character or a
//!   line break are quoted, embedded quotes are doubled
//! - Quoted fields may span lines
//! - Header row mapped to columns by header name, falling back to column order
//! - Blank lines are skipped

use super::{FileFormat, FormatCodec, FormatError, Row};
use crate::schema::{ColumnSchema, Schema};
use serde_json::Value;

/// Codec shared by the CSV, TSV and pipe format tags
#[derive(Debug, Clone, Copy, Default)]
pub struct DelimitedCodec;

impl FormatCodec for DelimitedCodec {
    fn name(&self) -> &'static str {
        "delimited"
    }

    fn decode(&self, input: &str, schema: &Schema, format: &FileFormat) -> Result<Vec<Row>, FormatError> {
        let mut lines = split_records(input, format.delimiter(), format.quote)?.into_iter();

        let mapping: Vec<Option<&ColumnSchema>> = if format.has_header {
            match lines.next() {
                Some((_, header)) => header_mapping(schema, &header),
                None => return Ok(Vec::new()),
            }
        } else {
            schema.columns().iter().map(Some).collect()
        };

        let mut rows = Vec::new();
        for (line, fields) in lines {
            let mut row = Row::new();
            for (index, raw) in fields.iter().enumerate() {
                let Some(Some(column)) = mapping.get(index) else {
                    continue;
                };
                let raw = if !format.null_value.is_empty() && *raw == format.null_value {
                    ""
                } else {
                    raw.as_str()
                };
                let value = column
                    .parse(raw)
                    .map_err(|message| FormatError::Malformed { line, message })?;
                row.insert(column.field_name.clone(), value);
            }
            for column in schema.columns() {
                if !row.contains_key(&column.field_name) {
                    let value = column
                        .parse("")
                        .map_err(|message| FormatError::Malformed { line, message })?;
                    row.insert(column.field_name.clone(), value);
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn encode(&self, rows: &[Row], schema: &Schema, format: &FileFormat) -> Result<Vec<u8>, FormatError> {
        let delimiter = format.delimiter().to_string();
        let line_ending = format.line_separator.as_str();
        let mut output = String::new();

        if format.has_header {
            let header: Vec<String> = schema
                .columns()
                .iter()
                .map(|c| escape_field(&c.name, format))
                .collect();
            output.push_str(&header.join(&delimiter));
            output.push_str(line_ending);
        }

        for row in rows {
            let cells: Vec<String> = schema
                .columns()
                .iter()
                .map(|column| {
                    let value = row.get(&column.field_name).unwrap_or(&Value::Null);
                    match column.render(value) {
                        Some(text) => escape_field(&text, format),
                        None => format.null_value.clone(),
                    }
                })
                .collect();
            output.push_str(&cells.join(&delimiter));
            output.push_str(line_ending);
        }

        Ok(output.into_bytes())
    }
}

/// Map header cells to columns. Without a single recognised header name the
/// columns are taken positionally.
fn header_mapping<'a>(schema: &'a Schema, header: &[String]) -> Vec<Option<&'a ColumnSchema>> {
    let by_name: Vec<Option<&ColumnSchema>> = header.iter().map(|h| schema.resolve(h)).collect();
    if by_name.iter().any(Option::is_some) {
        by_name
    } else {
        schema.columns().iter().map(Some).collect()
    }
}

fn escape_field(field: &str, format: &FileFormat) -> String {
    let delimiter = format.delimiter();
    let quote = format.quote;

    let needs_quoting = field.contains(delimiter)
        || field.contains(quote)
        || field.contains('\n')
        || field.contains('\r');

    if needs_quoting {
        let escaped = field.replace(quote, &format!("{}{}", quote, quote));
        format!("{}{}{}", quote, escaped, quote)
    } else {
        field.to_string()
    }
}

/// Split delimited text into records of raw fields, each tagged with the
/// 1-based line it starts on.
fn split_records(input: &str, delimiter: char, quote: char) -> Result<Vec<(usize, Vec<String>)>, FormatError> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut quote_line = 1;
    let mut chars = input.chars().peekable();

    let mut finish_record = |fields: &mut Vec<String>, field: &mut String, start: usize| {
        fields.push(std::mem::take(field));
        let done = std::mem::take(fields);
        if !(done.len() == 1 && done[0].is_empty()) {
            records.push((start, done));
        }
    };

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == quote {
                if chars.peek() == Some(&quote) {
                    chars.next();
                    field.push(quote);
                } else {
                    in_quotes = false;
                }
            } else {
                if c == '\n' {
                    line += 1;
                }
                field.push(c);
            }
            continue;
        }

        match c {
            c if c == quote && field.is_empty() => {
                in_quotes = true;
                quote_line = line;
            }
            c if c == delimiter => fields.push(std::mem::take(&mut field)),
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                finish_record(&mut fields, &mut field, record_line);
                line += 1;
                record_line = line;
            }
            '\n' => {
                finish_record(&mut fields, &mut field, record_line);
                line += 1;
                record_line = line;
            }
            c => field.push(c),
        }
    }

    if in_quotes {
        return Err(FormatError::Malformed {
            line: quote_line,
            message: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !fields.is_empty() {
        finish_record(&mut fields, &mut field, record_line);
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::test_support::{payment_schema, sample_rows};

    #[test]
    fn test_split_quoted_fields() {
        let records = split_records("a,\"b,c\",\"say \"\"hi\"\"\"\n\nd,e,f\n", ',', '"').unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1, vec!["a", "b,c", "say \"hi\""]);
        assert_eq!(records[1].0, 3);
    }

    #[test]
    fn test_multiline_quoted_field() {
        let records = split_records("\"line1\nline2\",x\r\ny,z", ',', '"').unwrap();
        assert_eq!(records[0].1[0], "line1\nline2");
        assert_eq!(records[1].1, vec!["y", "z"]);
    }

    #[test]
    fn test_unterminated_quote() {
        let err = split_records("a\n\"open,b", ',', '"').unwrap_err();
        assert!(matches!(err, FormatError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_encode_decode_csv() {
        let schema = payment_schema();
        let format = FileFormat::csv();
        let bytes = DelimitedCodec.encode(&sample_rows(), &schema, &format).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("id,Payee,amount,booked\n"));
        assert!(text.contains("\"ACME, Inc.\""));
        assert!(text.contains("100.50"));

        let rows = DelimitedCodec.decode(&text, &schema, &format).unwrap();
        assert_eq!(rows, sample_rows());
    }

    #[test]
    fn test_header_maps_by_name() {
        let schema = payment_schema();
        let input = "booked|Payee|id\n2024-01-05|Bob|7\n";
        let rows = DelimitedCodec.decode(input, &schema, &FileFormat::pipe()).unwrap();
        assert_eq!(rows[0]["id"], Value::from(7));
        assert_eq!(rows[0]["payee"], Value::from("Bob"));
        assert_eq!(rows[0]["amount"], Value::Null);
    }

    #[test]
    fn test_empty_input_and_empty_output() {
        let schema = payment_schema();
        let format = FileFormat::tsv();
        assert!(DelimitedCodec.decode("", &schema, &format).unwrap().is_empty());
        let bytes = DelimitedCodec.encode(&[], &schema, &format).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "id\tPayee\tamount\tbooked\n");
    }

    #[test]
    fn test_null_marker_and_bad_value() {
        let schema = payment_schema();
        let format = FileFormat::csv().with_header(false).with_null_value("NULL");
        let rows = DelimitedCodec.decode("1,x,NULL,NULL\n", &schema, &format).unwrap();
        assert_eq!(rows[0]["amount"], Value::Null);

        let err = DelimitedCodec.decode("1,x,NULL,NULL\nabc,y,1,2024-01-01\n", &schema, &format).unwrap_err();
        assert!(matches!(err, FormatError::Malformed { line: 2, .. }));
    }
}
