//! Schema-driven record repository
//!
//! A [`FileRepository`] reads and writes collections of one record type in
//! any registered [`FileFormat`], and is the entry point for the merge and
//! split engines.
//!
//! ```text
//!            read / read_all / read_bytes                write / write_to / to_bytes
//!  file ──▶ FormatCodec::decode ──▶ Row ──▶ T     T ──▶ Row ──▶ FormatCodec::encode ──▶ file
//!                                      │
//!                          merge(lists) / split(records, rule)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let repo = FileRepository::<Payment>::new()?;
//! let monday = repo.read("in/monday.csv", &FileFormat::csv())?;
//! let tuesday = repo.read("in/tuesday.csv", &FileFormat::csv())?;
//! let merged = repo.merge([monday, tuesday]).deduplicate().build();
//! repo.write(&merged, "out/payments.json", &FileFormat::json().pretty())?;
//! ```

mod convert;
mod send;

pub use convert::FieldMapping;
pub use send::SendBuilder;

use crate::error::{IntegrationError, Result};
use crate::flow::result::ValidationResult;
use crate::format::{FileFormat, FormatRegistry, Row};
use crate::merge::MergeBuilder;
use crate::schema::model::json_type;
use crate::schema::{FileRecord, Schema};
use crate::split::{SplitResult, SplitRule};
use serde::Serialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static DEFAULT_FORMATS: LazyLock<Arc<FormatRegistry>> = LazyLock::new(|| Arc::new(FormatRegistry::new()));

/// Shared registry holding every built-in codec
pub fn default_formats() -> Arc<FormatRegistry> {
    DEFAULT_FORMATS.clone()
}

/// Reads, writes, merges and splits records of type `T`
pub struct FileRepository<T> {
    schema: Arc<Schema>,
    formats: Arc<FormatRegistry>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for FileRepository<T> {
    fn clone(&self) -> Self {
        Self {
            schema: self.schema.clone(),
            formats: self.formats.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for FileRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRepository")
            .field("schema", &self.schema.name())
            .field("formats", &self.formats.len())
            .finish()
    }
}

impl<T: FileRecord> FileRepository<T> {
    /// Derive the schema of `T`; descriptor errors surface here
    pub fn new() -> Result<Self> {
        Self::with_formats(default_formats())
    }

    pub fn with_formats(formats: Arc<FormatRegistry>) -> Result<Self> {
        Ok(Self {
            schema: Schema::of::<T>()?,
            formats,
            _record: PhantomData,
        })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn formats(&self) -> &Arc<FormatRegistry> {
        &self.formats
    }

    /// Read every record of a file, in file order
    pub fn read(&self, path: impl AsRef<Path>, format: &FileFormat) -> Result<Vec<T>> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| IntegrationError::file_parse(path.display(), e.to_string()))?;
        let records = self.decode(&bytes, format, &path.display().to_string())?;
        debug!("Read {} records from {}", records.len(), path.display());
        Ok(records)
    }

    /// Read several files and concatenate them in the given order
    pub fn read_all<P: AsRef<Path>>(&self, paths: &[P], format: &FileFormat) -> Result<Vec<T>> {
        let mut records = Vec::new();
        for path in paths {
            records.extend(self.read(path, format)?);
        }
        Ok(records)
    }

    pub fn read_bytes(&self, bytes: &[u8], format: &FileFormat) -> Result<Vec<T>> {
        self.decode(bytes, format, "<memory>")
    }

    pub fn read_from<R: Read>(&self, mut reader: R, format: &FileFormat) -> Result<Vec<T>> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| IntegrationError::file_parse("<stream>", e.to_string()))?;
        self.decode(&bytes, format, "<stream>")
    }

    fn decode(&self, bytes: &[u8], format: &FileFormat, label: &str) -> Result<Vec<T>> {
        let rows = decode_rows(&self.formats, &self.schema, bytes, format, label)?;
        rows.into_iter()
            .enumerate()
            .map(|(index, row)| {
                self.schema
                    .from_row(row)
                    .map_err(|e| IntegrationError::file_parse(label, format!("record {}: {}", index, e)))
            })
            .collect()
    }

    /// Write records to a file, creating parent directories
    pub fn write(&self, records: &[T], path: impl AsRef<Path>, format: &FileFormat) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.encode(records, format, &path.display().to_string())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| IntegrationError::file_write(path.display(), None, e.to_string()))?;
        }
        std::fs::write(path, bytes).map_err(|e| IntegrationError::file_write(path.display(), None, e.to_string()))?;
        debug!("Wrote {} records to {}", records.len(), path.display());
        Ok(())
    }

    pub fn write_to<W: Write>(&self, records: &[T], mut writer: W, format: &FileFormat) -> Result<()> {
        let bytes = self.encode(records, format, "<stream>")?;
        writer
            .write_all(&bytes)
            .and_then(|_| writer.flush())
            .map_err(|e| IntegrationError::file_write("<stream>", None, e.to_string()))
    }

    pub fn to_bytes(&self, records: &[T], format: &FileFormat) -> Result<Vec<u8>> {
        self.encode(records, format, "<memory>")
    }

    fn encode(&self, records: &[T], format: &FileFormat, label: &str) -> Result<Vec<u8>> {
        let rows = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                self.schema
                    .to_row(record)
                    .map_err(|e| IntegrationError::file_write(label, Some(index), e))
            })
            .collect::<Result<Vec<Row>>>()?;
        encode_rows(&self.formats, &self.schema, &rows, format, label)
    }

    /// Start a merge of several record lists
    pub fn merge<I>(&self, lists: I) -> MergeBuilder<T>
    where
        I: IntoIterator<Item = Vec<T>>,
    {
        MergeBuilder::new(lists).with_schema(self.schema.clone())
    }

    pub fn split(&self, records: Vec<T>, rule: &SplitRule<T>) -> Result<SplitResult<T>> {
        rule.apply(records)
    }

    pub fn find_all<'a, P>(&self, records: &'a [T], predicate: P) -> Vec<&'a T>
    where
        P: Fn(&T) -> bool,
    {
        records.iter().filter(|r| predicate(r)).collect()
    }

    pub fn find_first<'a, P>(&self, records: &'a [T], predicate: P) -> Option<&'a T>
    where
        P: Fn(&T) -> bool,
    {
        records.iter().find(|r| predicate(r))
    }

    pub fn count<P>(&self, records: &[T], predicate: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        records.iter().filter(|r| predicate(r)).count()
    }

    /// Check non-nullable columns; values longer than a fixed width are warnings
    pub fn validate(&self, records: &[T]) -> ValidationResult {
        let mut result = ValidationResult::valid();
        for (index, record) in records.iter().enumerate() {
            let row_number = index + 1;
            let row = match self.schema.to_row(record) {
                Ok(row) => row,
                Err(e) => {
                    result.add_error(format!("row {}: {}", row_number, e));
                    continue;
                }
            };
            for column in self.schema.columns() {
                let value = row.get(&column.field_name).unwrap_or(&Value::Null);
                let blank = match value {
                    Value::Null => true,
                    Value::String(s) => s.trim().is_empty(),
                    _ => false,
                };
                if blank && !column.nullable {
                    result.add_error(format!(
                        "row {}: field '{}' must not be null",
                        row_number, column.field_name
                    ));
                    continue;
                }
                if let (Some(length), Some(text)) = (column.length, column.render(value)) {
                    let actual = text.chars().count();
                    if actual > length {
                        result.add_warning(format!(
                            "row {}: field '{}' has {} characters and will be truncated to {}",
                            row_number, column.field_name, actual, length
                        ));
                    }
                }
            }
        }
        result
    }

    /// Map records of another type onto `T`
    pub fn convert<S: Serialize>(&self, source: &[S], mapping: &FieldMapping) -> Result<Vec<T>> {
        source
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let row = match serde_json::to_value(record)? {
                    Value::Object(row) => row,
                    other => {
                        return Err(IntegrationError::transformation(
                            "convert",
                            format!("record {} is {}, not an object", index, json_type(&other)),
                        ))
                    }
                };
                let mapped = mapping
                    .apply(&row, &self.schema)
                    .map_err(|e| IntegrationError::transformation("convert", format!("record {}: {}", index, e)))?;
                self.schema
                    .from_row(mapped)
                    .map_err(|e| IntegrationError::transformation("convert", format!("record {}: {}", index, e)))
            })
            .collect()
    }

    /// Serialize records and deliver them to a remote destination
    pub fn send<'a>(&'a self, records: &'a [T]) -> SendBuilder<'a, T> {
        SendBuilder::new(self, records)
    }
}

fn decode_rows(
    formats: &FormatRegistry,
    schema: &Schema,
    bytes: &[u8],
    format: &FileFormat,
    label: &str,
) -> Result<Vec<Row>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| IntegrationError::file_parse(label, format!("not valid UTF-8: {}", e)))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    formats
        .decode(text, schema, format)
        .map_err(|e| IntegrationError::file_parse(label, e.to_string()))
}

fn encode_rows(
    formats: &FormatRegistry,
    schema: &Schema,
    rows: &[Row],
    format: &FileFormat,
    label: &str,
) -> Result<Vec<u8>> {
    formats
        .encode(rows, schema, format)
        .map_err(|e| IntegrationError::file_write(label, e.record_index(), e.to_string()))
}

/// Decode untyped records (used by flow components configured at runtime)
pub fn decode_values(
    formats: &FormatRegistry,
    schema: &Schema,
    bytes: &[u8],
    format: &FileFormat,
    label: &str,
) -> Result<Vec<Value>> {
    Ok(decode_rows(formats, schema, bytes, format, label)?
        .into_iter()
        .map(Value::Object)
        .collect())
}

/// Encode untyped records; every record must be an object
pub fn encode_values(
    formats: &FormatRegistry,
    schema: &Schema,
    records: &[Value],
    format: &FileFormat,
    label: &str,
) -> Result<Vec<u8>> {
    let rows = records
        .iter()
        .enumerate()
        .map(|(index, record)| match record {
            Value::Object(row) => Ok(row.clone()),
            other => Err(IntegrationError::file_write(
                label,
                Some(index),
                format!("expected an object, found {}", json_type(other)),
            )),
        })
        .collect::<Result<Vec<Row>>>()?;
    encode_rows(formats, schema, &rows, format, label)
}
