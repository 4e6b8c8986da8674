//! Error types for integration-hub
//!
//! Every failure in the framework is an [`IntegrationError`]. Each variant maps
//! to an [`ErrorKind`] tag which drives retry eligibility, error statistics and
//! custom handler matching.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for integration-hub operations
pub type Result<T> = std::result::Result<T, IntegrationError>;

/// Classification tag for [`IntegrationError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Read,
    Send,
    Transformation,
    SchemaValidation,
    CredentialsNotFound,
    FileParse,
    FileWrite,
    SplitRuleConflict,
    CircuitOpen,
    Cancelled,
    IllegalState,
    Config,
    NotFound,
    Io,
    Serialization,
    Http,
}

impl ErrorKind {
    /// Stable snake_case name, used as the key in error statistics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Read => "read",
            ErrorKind::Send => "send",
            ErrorKind::Transformation => "transformation",
            ErrorKind::SchemaValidation => "schema_validation",
            ErrorKind::CredentialsNotFound => "credentials_not_found",
            ErrorKind::FileParse => "file_parse",
            ErrorKind::FileWrite => "file_write",
            ErrorKind::SplitRuleConflict => "split_rule_conflict",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::Config => "config",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Io => "io",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Http => "http",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by flows, repositories and protocol clients
#[derive(Debug, Error)]
pub enum IntegrationError {
    /// A session with an external system could not be established
    #[error("connection error: {0}")]
    Connection(String),

    /// An input source failed while reading
    #[error("read error from '{source_name}': {message}")]
    Read {
        source_name: String,
        message: String,
        /// Records (or bytes) consumed before the failure, when known
        offset: Option<u64>,
        /// HTTP status code, if the source answered over HTTP
        status: Option<u16>,
    },

    /// A destination rejected or failed a write
    #[error("send error to '{destination}': {message} ({records_sent}/{records_attempted} sent)")]
    Send {
        destination: String,
        message: String,
        records_sent: usize,
        records_attempted: usize,
        /// HTTP status code, for REST destinations
        status: Option<u16>,
    },

    /// A single record could not be converted
    #[error("transformation error in '{transformer}': {message}")]
    Transformation { transformer: String, message: String },

    /// A record descriptor is invalid; lists every violation found
    #[error("schema validation failed for '{type_name}': {}", .violations.join("; "))]
    SchemaValidation {
        type_name: String,
        violations: Vec<String>,
    },

    #[error("credentials not found: {0}")]
    CredentialsNotFound(String),

    /// A file could not be read or decoded
    #[error("failed to parse '{path}': {message}")]
    FileParse { path: String, message: String },

    /// A file could not be encoded or written
    #[error("failed to write '{path}': {message}")]
    FileWrite {
        path: String,
        /// Index of the record that failed to encode, if a single record was at fault
        record_index: Option<usize>,
        message: String,
    },

    #[error("split rule conflict: {0}")]
    SplitRuleConflict(String),

    /// The named circuit breaker rejected the call without running it
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IntegrationError {
    /// Classification tag of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection(_) => ErrorKind::Connection,
            Self::Read { .. } => ErrorKind::Read,
            Self::Send { .. } => ErrorKind::Send,
            Self::Transformation { .. } => ErrorKind::Transformation,
            Self::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            Self::CredentialsNotFound(_) => ErrorKind::CredentialsNotFound,
            Self::FileParse { .. } => ErrorKind::FileParse,
            Self::FileWrite { .. } => ErrorKind::FileWrite,
            Self::SplitRuleConflict(_) => ErrorKind::SplitRuleConflict,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::IllegalState(_) => ErrorKind::IllegalState,
            Self::Config(_) => ErrorKind::Config,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) | Self::Yaml(_) => ErrorKind::Serialization,
            Self::Http(_) => ErrorKind::Http,
        }
    }

    /// Check if this error is transient and may succeed on retry
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Io(_) => true,
            Self::Read { status, .. } | Self::Send { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 429,
            },
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a read error without progress information
    pub fn read(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Read {
            source_name: source_name.into(),
            message: msg.into(),
            offset: None,
            status: None,
        }
    }

    /// Create a send error for a batch that was not delivered at all
    pub fn send(destination: impl Into<String>, msg: impl Into<String>, attempted: usize) -> Self {
        Self::Send {
            destination: destination.into(),
            message: msg.into(),
            records_sent: 0,
            records_attempted: attempted,
            status: None,
        }
    }

    /// Create a transformation error
    pub fn transformation(transformer: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transformation {
            transformer: transformer.into(),
            message: msg.into(),
        }
    }

    /// Create a file parse error
    pub fn file_parse(path: impl fmt::Display, msg: impl Into<String>) -> Self {
        Self::FileParse {
            path: path.to_string(),
            message: msg.into(),
        }
    }

    /// Create a file write error
    pub fn file_write(path: impl fmt::Display, record_index: Option<usize>, msg: impl Into<String>) -> Self {
        let message = match record_index {
            Some(index) => format!("record {}: {}", index, msg.into()),
            None => msg.into(),
        };
        Self::FileWrite {
            path: path.to_string(),
            record_index,
            message,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(IntegrationError::connection("x").kind(), ErrorKind::Connection);
        assert_eq!(IntegrationError::read("in", "x").kind(), ErrorKind::Read);
        assert_eq!(IntegrationError::config("x").kind(), ErrorKind::Config);
        assert_eq!(
            IntegrationError::CircuitOpen("sftp".into()).kind(),
            ErrorKind::CircuitOpen
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(IntegrationError::connection("refused").is_retryable());
        assert!(IntegrationError::send("api", "timeout", 3).is_retryable());
        assert!(!IntegrationError::config("bad").is_retryable());
        assert!(!IntegrationError::CircuitOpen("api".into()).is_retryable());

        let client_error = IntegrationError::Send {
            destination: "api".into(),
            message: "bad request".into(),
            records_sent: 0,
            records_attempted: 1,
            status: Some(400),
        };
        assert!(!client_error.is_retryable());

        let server_error = IntegrationError::Send {
            destination: "api".into(),
            message: "unavailable".into(),
            records_sent: 0,
            records_attempted: 1,
            status: Some(503),
        };
        assert!(server_error.is_retryable());

        assert!(IntegrationError::read("inbox", "reset by peer").is_retryable());
        let not_found = IntegrationError::Read {
            source_name: "api".into(),
            message: "HTTP 404".into(),
            offset: None,
            status: Some(404),
        };
        assert!(!not_found.is_retryable());
        let throttled = IntegrationError::Read {
            source_name: "api".into(),
            message: "HTTP 429".into(),
            offset: None,
            status: Some(429),
        };
        assert!(throttled.is_retryable());
    }

    #[test]
    fn test_schema_validation_lists_all_violations() {
        let err = IntegrationError::SchemaValidation {
            type_name: "Payment".into(),
            violations: vec!["missing file type".into(), "duplicate order 1".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("missing file type"));
        assert!(msg.contains("duplicate order 1"));
    }

    #[test]
    fn test_file_write_includes_record_index() {
        let err = IntegrationError::file_write("/tmp/out.csv", Some(4), "value too long");
        assert!(err.to_string().contains("record 4"));
        match err {
            IntegrationError::FileWrite { record_index, .. } => assert_eq!(record_index, Some(4)),
            other => panic!("unexpected error: {other}"),
        }
    }
}
