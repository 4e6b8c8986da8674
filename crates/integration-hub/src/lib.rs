//! integration-hub - Declarative batch integration
//!
//! Reads record files, reshapes them and delivers them to partners over
//! SFTP or HTTP, with retry and circuit breaking around every delivery.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                 IntegrationEngine (flows, workers)               │
//! │  FlowDefinition ─▶ FlowExecutor: read ─▶ transform ─▶ send ─▶ ack │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Components: FileInput, MappingTransformer, FileOutput,          │
//! │              RemoteOutput (SFTP / HTTP)                          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Records: Schema, FileRepository, formats, merge, split          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Reliability: RetryPolicy, CircuitBreaker, ErrorHandler          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Library usage
//!
//! ```rust,ignore
//! use integration_hub::{FileFormat, FileRepository, SftpDestination};
//!
//! let repo = FileRepository::<Claim>::new()?;
//! let claims = repo.read("in/claims.csv", &FileFormat::csv())?;
//! let result = repo
//!     .send(&claims)
//!     .format(FileFormat::json())
//!     .to(SftpDestination::new("sftp.partner.example", "/inbound", "partner"))
//!     .credentials(provider)
//!     .execute()
//!     .await;
//! ```
//!
//! # CLI usage
//!
//! ```bash
//! integration-hub -c integration.yaml run
//! integration-hub -c integration.yaml run --flow nightly-claims
//! integration-hub -c integration.yaml validate
//! ```

// Common types (SensitiveString)
pub mod types;
// Error types
pub mod error;
// Records
pub mod format;
pub mod merge;
pub mod repository;
pub mod schema;
pub mod split;
// Runtime
pub mod bootstrap;
pub mod config;
pub mod connectors;
pub mod flow;
pub mod resilience;

pub use types::SensitiveString;

pub use error::{ErrorKind, IntegrationError, Result};

pub use schema::{ColumnDef, ColumnType, FileRecord, RecordDescriptor, Schema};

pub use format::{FileFormat, FormatType, LineSeparator};

pub use merge::{MergeBuilder, MergeResult};
pub use repository::{FieldMapping, FileRepository, SendBuilder};
pub use split::{SplitResult, SplitRule};

pub use flow::{
    ComponentRegistry, EngineStatistics, FlowContext, FlowDefinition, FlowHandle, FlowResult, FlowState,
    InputSource, IntegrationEngine, OutputDestination, SendResult, Transformer, ValidationResult,
};

pub use resilience::{
    BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState, ErrorHandler,
    ResiliencePolicy, RetryPolicy,
};

pub use connectors::{
    CredentialBundle, CredentialsProvider, Destination, FileInput, FileOutput, HttpDestination, RemoteOutput,
    RestClient, SftpClient, SftpDestination, StaticCredentialsProvider,
};

pub use bootstrap::Bootstrap;
pub use config::IntegrationConfig;
