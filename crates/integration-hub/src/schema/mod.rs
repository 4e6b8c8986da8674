//! Schema model
//!
//! Record types declare their file layout through an explicit
//! [`RecordDescriptor`]. The descriptor is validated once and turned into an
//! immutable [`Schema`] that the repository, format codecs and merge engine
//! share.
//!
//! ```text
//! ┌──────────────────┐  validate   ┌────────────┐   cached per   ┌────────────┐
//! │ RecordDescriptor │────────────▶│   Schema   │───────────────▶│ Arc<Schema>│
//! │  (builder API)   │  all errors │ (columns,  │    TypeId      │            │
//! └──────────────────┘  collected  │  identity) │                └────────────┘
//!                                  └────────────┘
//! ```

pub mod descriptor;
pub mod model;
mod value;

pub use descriptor::{ColumnDef, ColumnType, FileRecord, FileTypeDecl, RecordDescriptor};
pub use model::{ColumnSchema, IdColumn, Schema};
