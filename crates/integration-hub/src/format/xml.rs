//! XML format: one element per record, one child element per column
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <records>
//!   <record><id>1</id><payee>ACME</payee></record>
//! </records>
//! ```
//!
//! Child elements are named after the schema field names. Null values are
//! omitted on output; missing or empty elements read back as null.

use super::{FileFormat, FormatCodec, FormatError, Row};
use crate::schema::Schema;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default)]
pub struct XmlCodec;

fn xml_error(e: impl std::fmt::Display) -> FormatError {
    FormatError::Xml(e.to_string())
}

impl FormatCodec for XmlCodec {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn decode(&self, input: &str, schema: &Schema, format: &FileFormat) -> Result<Vec<Row>, FormatError> {
        if input.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut reader = Reader::from_str(input);
        reader.config_mut().trim_text(true);

        let mut rows = Vec::new();
        let mut depth = 0usize;
        let mut current: Option<Row> = None;
        let mut element: Option<String> = None;
        let mut text = String::new();

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(start) => {
                    depth += 1;
                    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                    match depth {
                        2 if name == format.record_element => current = Some(Row::new()),
                        3 if current.is_some() => {
                            element = Some(name);
                            text.clear();
                        }
                        _ => {}
                    }
                }
                Event::Empty(empty) => {
                    let name = String::from_utf8_lossy(empty.name().as_ref()).into_owned();
                    match depth + 1 {
                        2 if name == format.record_element => {
                            rows.push(finish_row(schema, Row::new(), rows.len())?)
                        }
                        3 => {
                            if let Some(row) = current.as_mut() {
                                row.insert(field_for(schema, &name), Value::Null);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(t) if element.is_some() => {
                    text.push_str(&t.unescape().map_err(xml_error)?);
                }
                Event::CData(data) if element.is_some() => {
                    text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
                Event::End(_) => {
                    match depth {
                        3 => {
                            if let (Some(row), Some(name)) = (current.as_mut(), element.take()) {
                                row.insert(field_for(schema, &name), Value::String(std::mem::take(&mut text)));
                            }
                        }
                        2 => {
                            if let Some(row) = current.take() {
                                rows.push(finish_row(schema, row, rows.len())?);
                            }
                        }
                        _ => {}
                    }
                    depth = depth.saturating_sub(1);
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(rows)
    }

    fn encode(&self, rows: &[Row], schema: &Schema, format: &FileFormat) -> Result<Vec<u8>, FormatError> {
        let mut writer = if format.pretty_print {
            Writer::new_with_indent(Vec::new(), b' ', 2)
        } else {
            Writer::new(Vec::new())
        };

        if format.xml_declaration {
            writer
                .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
                .map_err(xml_error)?;
        }
        writer
            .write_event(Event::Start(BytesStart::new(format.root_element.as_str())))
            .map_err(xml_error)?;

        for row in rows {
            writer
                .write_event(Event::Start(BytesStart::new(format.record_element.as_str())))
                .map_err(xml_error)?;
            for column in schema.columns() {
                let value = row.get(&column.field_name).unwrap_or(&Value::Null);
                let Some(text) = column.render(value) else {
                    continue;
                };
                let name = column.field_name.as_str();
                writer
                    .write_event(Event::Start(BytesStart::new(name)))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::Text(BytesText::new(&text)))
                    .map_err(xml_error)?;
                writer
                    .write_event(Event::End(BytesEnd::new(name)))
                    .map_err(xml_error)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new(format.record_element.as_str())))
                .map_err(xml_error)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new(format.root_element.as_str())))
            .map_err(xml_error)?;
        Ok(writer.into_inner())
    }
}

fn field_for(schema: &Schema, element: &str) -> String {
    schema
        .resolve(element)
        .map(|c| c.field_name.clone())
        .unwrap_or_else(|| element.to_string())
}

/// Coerce element text through the column types and fill absent columns
fn finish_row(schema: &Schema, raw: Row, index: usize) -> Result<Row, FormatError> {
    let mut row = Row::new();
    for (key, value) in raw {
        let value = match (schema.column(&key), value) {
            (Some(column), Value::String(text)) => column
                .parse(&text)
                .map_err(|message| FormatError::Record { index, message })?,
            (_, other) => other,
        };
        row.insert(key, value);
    }
    for column in schema.columns() {
        if !row.contains_key(&column.field_name) {
            row.insert(column.field_name.clone(), Value::Null);
        }
    }
    Ok(row)
}
