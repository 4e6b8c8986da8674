//! File formats for record repositories
//!
//! Formats are **how** records are laid out in a file; repositories and file
//! components decide **where** the bytes go.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          FileRepository<T> / FileInput / FileOutput             │
//! └───────────────────────────┬─────────────────────────────────────┘
//!                             │ FormatRegistry::get(FormatType)
//!                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        FormatCodec                              │
//! │  DelimitedCodec (csv/tsv/pipe), FixedWidthCodec, JsonCodec,     │
//! │  JsonLinesCodec, XmlCodec                                       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! | Format | Extension | Empty file written as |
//! |--------|-----------|-----------------------|
//! | CSV / TSV / pipe | `.csv` `.tsv` `.txt` | header row only |
//! | Fixed width | `.dat` | nothing |
//! | JSON | `.json` | `[]` |
//! | JSON Lines | `.jsonl` | nothing |
//! | XML | `.xml` | `<records></records>` |
//!
//! Codecs work on field maps (`serde_json::Map`) keyed by the schema's field
//! names, so typed repositories and untyped flow components share them.

pub mod delimited;
pub mod fixed_width;
pub mod json;
pub mod xml;

pub use delimited::DelimitedCodec;
pub use fixed_width::FixedWidthCodec;
pub use json::{JsonCodec, JsonLinesCodec};
pub use xml::XmlCodec;

use crate::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A record as seen by a codec
pub type Row = Map<String, Value>;

/// Supported file format tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FormatType {
    Csv,
    Tsv,
    Pipe,
    FixedWidth,
    Xml,
    Json,
    JsonLines,
}

impl FormatType {
    pub fn extension(&self) -> &'static str {
        match self {
            FormatType::Csv => ".csv",
            FormatType::Tsv => ".tsv",
            FormatType::Pipe => ".txt",
            FormatType::FixedWidth => ".dat",
            FormatType::Xml => ".xml",
            FormatType::Json => ".json",
            FormatType::JsonLines => ".jsonl",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FormatType::Csv | FormatType::Pipe => "text/csv",
            FormatType::Tsv => "text/tab-separated-values",
            FormatType::FixedWidth => "text/plain",
            FormatType::Xml => "application/xml",
            FormatType::Json => "application/json",
            FormatType::JsonLines => "application/x-ndjson",
        }
    }

    /// Delimiter used when a [`FileFormat`] does not set one
    pub fn default_delimiter(&self) -> char {
        match self {
            FormatType::Tsv => '\t',
            FormatType::Pipe => '|',
            _ => ',',
        }
    }

    pub fn is_delimited(&self) -> bool {
        matches!(self, FormatType::Csv | FormatType::Tsv | FormatType::Pipe)
    }
}

/// Line ending style for line-oriented formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LineSeparator {
    #[default]
    Lf,
    Crlf,
}

impl LineSeparator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineSeparator::Lf => "\n",
            LineSeparator::Crlf => "\r\n",
        }
    }
}

/// Format options for reading and writing a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FileFormat {
    #[serde(rename = "type")]
    pub format_type: FormatType,

    /// Field delimiter for delimited formats (defaults per format type)
    #[serde(default)]
    pub delimiter: Option<char>,

    #[serde(default = "default_quote")]
    pub quote: char,

    /// Delimited formats: first line holds column names
    #[serde(default = "default_true")]
    pub has_header: bool,

    /// Cell text that represents null
    #[serde(default)]
    pub null_value: String,

    #[serde(default)]
    pub line_separator: LineSeparator,

    /// XML root element
    #[serde(default = "default_root_element")]
    pub root_element: String,

    /// XML element wrapping each record
    #[serde(default = "default_record_element")]
    pub record_element: String,

    #[serde(default = "default_true")]
    pub xml_declaration: bool,

    /// Indent JSON and XML output
    #[serde(default)]
    pub pretty_print: bool,
}

fn default_quote() -> char {
    '"'
}

fn default_true() -> bool {
    true
}

fn default_root_element() -> String {
    "records".to_string()
}

fn default_record_element() -> String {
    "record".to_string()
}

impl FileFormat {
    pub fn new(format_type: FormatType) -> Self {
        Self {
            format_type,
            delimiter: None,
            quote: default_quote(),
            has_header: true,
            null_value: String::new(),
            line_separator: LineSeparator::default(),
            root_element: default_root_element(),
            record_element: default_record_element(),
            xml_declaration: true,
            pretty_print: false,
        }
    }

    pub fn csv() -> Self {
        Self::new(FormatType::Csv)
    }

    pub fn tsv() -> Self {
        Self::new(FormatType::Tsv)
    }

    pub fn pipe() -> Self {
        Self::new(FormatType::Pipe)
    }

    pub fn fixed_width() -> Self {
        Self::new(FormatType::FixedWidth)
    }

    pub fn json() -> Self {
        Self::new(FormatType::Json)
    }

    pub fn json_lines() -> Self {
        Self::new(FormatType::JsonLines)
    }

    pub fn xml() -> Self {
        Self::new(FormatType::Xml)
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn with_null_value(mut self, null_value: impl Into<String>) -> Self {
        self.null_value = null_value.into();
        self
    }

    pub fn with_line_separator(mut self, separator: LineSeparator) -> Self {
        self.line_separator = separator;
        self
    }

    pub fn with_elements(mut self, root: impl Into<String>, record: impl Into<String>) -> Self {
        self.root_element = root.into();
        self.record_element = record.into();
        self
    }

    pub fn with_xml_declaration(mut self, enabled: bool) -> Self {
        self.xml_declaration = enabled;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.pretty_print = true;
        self
    }

    /// Effective delimiter
    pub fn delimiter(&self) -> char {
        self.delimiter
            .unwrap_or_else(|| self.format_type.default_delimiter())
    }
}

/// Errors raised by codecs. Repositories attach the file path.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("record {index}: {message}")]
    Record { index: usize, message: String },

    #[error("schema '{schema}' cannot be used with {format:?}: {message}")]
    Unsupported {
        schema: String,
        format: FormatType,
        message: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FormatError {
    /// Index of the offending record, for write errors
    pub fn record_index(&self) -> Option<usize> {
        match self {
            FormatError::Record { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Encode/decode capability for one format
pub trait FormatCodec: Send + Sync {
    /// Format name (e.g. "csv", "json")
    fn name(&self) -> &'static str;

    /// Parse file content into rows, in file order. Empty content yields no rows.
    fn decode(&self, input: &str, schema: &Schema, format: &FileFormat)
        -> Result<Vec<Row>, FormatError>;

    /// Serialize rows. An empty slice yields a valid empty document.
    fn encode(&self, rows: &[Row], schema: &Schema, format: &FileFormat)
        -> Result<Vec<u8>, FormatError>;
}

/// Codecs keyed by format tag
#[derive(Clone)]
pub struct FormatRegistry {
    codecs: HashMap<FormatType, Arc<dyn FormatCodec>>,
}

impl FormatRegistry {
    /// Registry without any codec
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    /// Registry with every built-in codec
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let delimited: Arc<dyn FormatCodec> = Arc::new(DelimitedCodec);
        registry.register_shared(FormatType::Csv, delimited.clone());
        registry.register_shared(FormatType::Tsv, delimited.clone());
        registry.register_shared(FormatType::Pipe, delimited);
        registry.register(FormatType::FixedWidth, FixedWidthCodec);
        registry.register(FormatType::Json, JsonCodec);
        registry.register(FormatType::JsonLines, JsonLinesCodec);
        registry.register(FormatType::Xml, XmlCodec);
        registry
    }

    /// Register (or replace) the codec for a format
    pub fn register(&mut self, format: FormatType, codec: impl FormatCodec + 'static) {
        self.register_shared(format, Arc::new(codec));
    }

    pub fn register_shared(&mut self, format: FormatType, codec: Arc<dyn FormatCodec>) {
        self.codecs.insert(format, codec);
    }

    pub fn get(&self, format: FormatType) -> Option<Arc<dyn FormatCodec>> {
        self.codecs.get(&format).cloned()
    }

    pub fn contains(&self, format: FormatType) -> bool {
        self.codecs.contains_key(&format)
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Decode with the codec registered for `format.format_type`
    pub fn decode(&self, input: &str, schema: &Schema, format: &FileFormat) -> Result<Vec<Row>, FormatError> {
        self.codec_for(schema, format)?.decode(input, schema, format)
    }

    /// Encode with the codec registered for `format.format_type`
    pub fn encode(&self, rows: &[Row], schema: &Schema, format: &FileFormat) -> Result<Vec<u8>, FormatError> {
        self.codec_for(schema, format)?.encode(rows, schema, format)
    }

    fn codec_for(&self, schema: &Schema, format: &FileFormat) -> Result<Arc<dyn FormatCodec>, FormatError> {
        self.get(format.format_type)
            .ok_or_else(|| FormatError::Unsupported {
                schema: schema.name().to_string(),
                format: format.format_type,
                message: "no codec registered".to_string(),
            })
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut formats: Vec<_> = self.codecs.keys().collect();
        formats.sort_by_key(|f| format!("{:?}", f));
        f.debug_struct("FormatRegistry")
            .field("formats", &formats)
            .finish()
    }
}
