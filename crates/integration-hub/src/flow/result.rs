//! Outcome values returned by destinations, validators and flow runs

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Tri-state outcome of a send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Success,
    Partial,
    Failure,
}

/// Result of delivering records to an output destination
#[derive(Debug, Clone, Serialize)]
pub struct SendResult {
    pub status: SendStatus,
    pub message: String,
    pub records_sent: usize,
    pub records_failed: usize,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl SendResult {
    fn with_status(status: SendStatus, message: String, sent: usize, failed: usize) -> Self {
        Self {
            status,
            message,
            records_sent: sent,
            records_failed: failed,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Every record was delivered
    pub fn success(records_sent: usize) -> Self {
        Self::with_status(
            SendStatus::Success,
            format!("{} records sent", records_sent),
            records_sent,
            0,
        )
    }

    /// Some records were delivered
    pub fn partial(records_sent: usize, records_failed: usize, message: impl Into<String>) -> Self {
        Self::with_status(SendStatus::Partial, message.into(), records_sent, records_failed)
    }

    /// Nothing was delivered
    pub fn failure(message: impl Into<String>) -> Self {
        Self::with_status(SendStatus::Failure, message.into(), 0, 0)
    }

    /// Nothing was delivered out of `attempted` records
    pub fn failed_records(records_failed: usize, message: impl Into<String>) -> Self {
        Self::with_status(SendStatus::Failure, message.into(), 0, records_failed)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == SendStatus::Success
    }

    pub fn is_partial(&self) -> bool {
        self.status == SendStatus::Partial
    }

    pub fn is_failure(&self) -> bool {
        self.status == SendStatus::Failure
    }
}

/// Outcome of a validation pass: ordered errors and warnings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self::default()
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.add_error(error);
        self
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.add_warning(warning);
        self
    }

    /// Combine two results, keeping the order of messages
    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self
    }
}

/// Lifecycle of a single flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowState {
    Idle,
    Reading,
    Transforming,
    Sending,
    Acknowledging,
    Completed,
    Failed,
    Cancelled,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Completed | FlowState::Failed | FlowState::Cancelled)
    }
}

/// Outcome of a flow run; returned on every path, including failures
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_name: String,
    pub state: FlowState,
    pub success: bool,
    /// Some outputs succeeded, some did not
    pub partial: bool,
    pub records_read: usize,
    pub records_processed: usize,
    pub records_failed: usize,
    pub send_results: Vec<(String, SendResult)>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub message: String,
    pub started_at: DateTime<Utc>,
}

impl FlowResult {
    /// Empty result for a run that is about to start
    pub fn started(flow_name: impl Into<String>) -> Self {
        Self {
            flow_name: flow_name.into(),
            state: FlowState::Idle,
            success: false,
            partial: false,
            records_read: 0,
            records_processed: 0,
            records_failed: 0,
            send_results: Vec::new(),
            duration: Duration::ZERO,
            message: String::new(),
            started_at: Utc::now(),
        }
    }

    /// A run that failed before doing any work
    pub fn rejected(flow_name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::started(flow_name);
        result.state = FlowState::Failed;
        result.message = message.into();
        result
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn send_result(&self, output: &str) -> Option<&SendResult> {
        self.send_results
            .iter()
            .find(|(name, _)| name == output)
            .map(|(_, result)| result)
    }
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
