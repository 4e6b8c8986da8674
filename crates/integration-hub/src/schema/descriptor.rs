//! Declarative record metadata
//!
//! A record type describes its file layout once through a [`RecordDescriptor`]:
//! one type-level declaration, one [`ColumnDef`] per field and optional
//! identity fields for deduplication.
//!
//! ```rust,ignore
//! impl FileRecord for Payment {
//!     fn descriptor() -> RecordDescriptor {
//!         RecordDescriptor::new("payment")
//!             .description("Outgoing payment instruction")
//!             .version("2")
//!             .column("id", ColumnDef::new(1).kind(ColumnType::Integer).nullable(false))
//!             .column("amount", ColumnDef::new(2).kind(ColumnType::Decimal).format("0.00"))
//!             .column("booked_on", ColumnDef::new(3).kind(ColumnType::Date).format("%d.%m.%Y"))
//!             .id("id")
//!     }
//! }
//! ```

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Value type of a column; drives parsing of textual formats
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    #[default]
    String,
    Integer,
    Decimal,
    Boolean,
    /// Stored as `YYYY-MM-DD`; `format` is a chrono pattern for the file side
    Date,
    /// Stored as `YYYY-MM-DDTHH:MM:SS`; `format` is a chrono pattern for the file side
    DateTime,
}

/// Type-level declaration of a record type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTypeDecl {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
}

/// Column declaration for a single field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub(crate) order: Option<u32>,
    pub(crate) name: Option<String>,
    pub(crate) nullable: bool,
    pub(crate) format: Option<String>,
    pub(crate) length: Option<usize>,
    pub(crate) default_value: Option<String>,
    pub(crate) kind: ColumnType,
}

impl ColumnDef {
    /// Column at the given position (positions need not be contiguous)
    pub fn new(order: u32) -> Self {
        Self {
            order: Some(order),
            ..Self::unordered()
        }
    }

    /// Column without a position. Deriving a schema from it fails; this exists
    /// for descriptors assembled from external metadata.
    pub fn unordered() -> Self {
        Self {
            order: None,
            name: None,
            nullable: true,
            format: None,
            length: None,
            default_value: None,
            kind: ColumnType::String,
        }
    }

    /// Header / element name, defaults to the field name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Numeric (`0.00`) or chrono date pattern (`%d.%m.%Y`)
    pub fn format(mut self, pattern: impl Into<String>) -> Self {
        self.format = Some(pattern.into());
        self
    }

    /// Fixed-width column length
    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    /// Textual value used when the file cell is empty
    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    pub fn kind(mut self, kind: ColumnType) -> Self {
        self.kind = kind;
        self
    }
}

/// Builder describing a record type's columns and identity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordDescriptor {
    pub(crate) file_types: Vec<FileTypeDecl>,
    pub(crate) columns: Vec<(String, ColumnDef)>,
    pub(crate) ids: Vec<(String, Option<u32>)>,
}

impl RecordDescriptor {
    /// Descriptor with its type-level declaration
    pub fn new(name: impl Into<String>) -> Self {
        Self::undeclared().file_type(name)
    }

    /// Descriptor without any type-level declaration
    pub fn undeclared() -> Self {
        Self::default()
    }

    /// Add a type-level declaration. Exactly one is allowed.
    pub fn file_type(mut self, name: impl Into<String>) -> Self {
        self.file_types.push(FileTypeDecl {
            name: name.into(),
            description: None,
            version: None,
        });
        self
    }

    /// Description of the most recent type-level declaration
    pub fn description(mut self, description: impl Into<String>) -> Self {
        if let Some(decl) = self.file_types.last_mut() {
            decl.description = Some(description.into());
        }
        self
    }

    /// Version of the most recent type-level declaration
    pub fn version(mut self, version: impl Into<String>) -> Self {
        if let Some(decl) = self.file_types.last_mut() {
            decl.version = Some(version.into());
        }
        self
    }

    pub fn column(mut self, field: impl Into<String>, def: ColumnDef) -> Self {
        self.columns.push((field.into(), def));
        self
    }

    /// Mark a field as (part of) the identity, in declaration order
    pub fn id(mut self, field: impl Into<String>) -> Self {
        self.ids.push((field.into(), None));
        self
    }

    /// Mark a field as part of a composite identity at an explicit position
    pub fn id_ordered(mut self, field: impl Into<String>, order: u32) -> Self {
        self.ids.push((field.into(), Some(order)));
        self
    }
}

/// A record type that can be read from and written to files.
///
/// Records travel through serde: every column's field name must be a
/// serialized field of the struct.
pub trait FileRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn descriptor() -> RecordDescriptor;
}
