//! Fluent delivery of a record collection to a remote destination

use super::FileRepository;
use crate::connectors::credentials::{CredentialsProvider, StaticCredentialsProvider};
use crate::connectors::destination::{Destination, Payload};
use crate::connectors::pattern::render_filename;
use crate::error::{IntegrationError, Result};
use crate::flow::result::SendResult;
use crate::format::FileFormat;
use crate::resilience::RetryPolicy;
use crate::schema::FileRecord;
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Default name of the sent file; `{flow}` is the schema name here
pub const DEFAULT_FILENAME_PATTERN: &str = "{flow}_{timestamp}.{ext}";

type SuccessCallback<'a> = Box<dyn FnOnce(&SendResult) + Send + 'a>;
type FailureCallback<'a> = Box<dyn FnOnce(&IntegrationError) + Send + 'a>;

/// Builder returned by [`FileRepository::send`].
///
/// ```rust,ignore
/// let result = repo
///     .send(&claims)
///     .format(FileFormat::csv())
///     .to(SftpDestination::new("sftp.partner", "/inbound", "partner-sftp"))
///     .filename("claims_{date}.{ext}")
///     .retry(RetryPolicy::exponential(3, Duration::from_secs(2), 2.0))
///     .credentials(provider)
///     .on_failure(|e| alert(e))
///     .execute()
///     .await;
/// ```
pub struct SendBuilder<'a, T> {
    repository: &'a FileRepository<T>,
    records: &'a [T],
    format: FileFormat,
    destination: Option<Destination>,
    filename: Option<String>,
    metadata: HashMap<String, String>,
    retry: Option<RetryPolicy>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    on_success: Option<SuccessCallback<'a>>,
    on_failure: Option<FailureCallback<'a>>,
}

impl<'a, T: FileRecord> SendBuilder<'a, T> {
    pub(crate) fn new(repository: &'a FileRepository<T>, records: &'a [T]) -> Self {
        Self {
            repository,
            records,
            format: FileFormat::csv(),
            destination: None,
            filename: None,
            metadata: HashMap::new(),
            retry: None,
            credentials: None,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn format(mut self, format: FileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn to(mut self, destination: impl Into<Destination>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// File name or pattern (`{timestamp}`, `{date}`, `{uuid}`, `{ext}`)
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn credentials(mut self, provider: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&SendResult) + Send + 'a,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&IntegrationError) + Send + 'a,
    {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Serialize and deliver. Failures are reported in the result, never raised.
    pub async fn execute(self) -> SendResult {
        let SendBuilder {
            repository,
            records,
            format,
            destination,
            filename,
            metadata,
            retry,
            credentials,
            on_success,
            on_failure,
        } = self;

        let outcome: Result<SendResult> = async {
            let destination = destination
                .ok_or_else(|| IntegrationError::config("no destination configured for send"))?;
            let schema = repository.schema();
            let pattern = filename.as_deref().unwrap_or(DEFAULT_FILENAME_PATTERN);
            let file_name = render_filename(pattern, schema.name(), format.format_type.extension());
            let data = repository.to_bytes(records, &format)?;

            let mut payload = Payload::new(file_name, format.format_type.content_type(), data, records.len());
            payload.metadata.extend(metadata);

            let provider = credentials.unwrap_or_else(|| Arc::new(StaticCredentialsProvider::new()));
            let policy = retry.unwrap_or_else(RetryPolicy::no_retry);
            let result = policy
                .retry(|| destination.deliver(&payload, provider.as_ref()))
                .await;
            if result.attempts > 1 {
                info!("Send of {} took {} attempts", payload.file_name, result.attempts);
            }
            result.into_result()
        }
        .await;

        match outcome {
            Ok(result) => {
                counter!("repository.send.success").increment(1);
                if let Some(callback) = on_success {
                    callback(&result);
                }
                result
            }
            Err(e) => {
                error!("Send of {} records failed: {}", records.len(), e);
                counter!("repository.send.failure").increment(1);
                let result = SendResult::failed_records(records.len(), e.to_string())
                    .with_metadata("error_kind", e.kind().as_str());
                if let Some(callback) = on_failure {
                    callback(&e);
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::destination::SftpDestination;
    use crate::error::ErrorKind;
    use crate::schema::{ColumnDef, RecordDescriptor};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl FileRecord for Note {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::new("note").column("text", ColumnDef::new(1))
        }
    }

    #[tokio::test]
    async fn test_missing_destination_reports_failure() {
        let repo = FileRepository::<Note>::new().unwrap();
        let notes = vec![Note { text: "hi".into() }];
        let seen = Mutex::new(None);

        let result = repo
            .send(&notes)
            .on_failure(|e| *seen.lock().unwrap() = Some(e.kind()))
            .on_success(|_| panic!("must not succeed"))
            .execute()
            .await;

        assert!(result.is_failure());
        assert_eq!(result.records_failed, 1);
        assert_eq!(*seen.lock().unwrap(), Some(ErrorKind::Config));
    }

    #[tokio::test]
    async fn test_unknown_credentials_fail_without_retry() {
        let repo = FileRepository::<Note>::new().unwrap();
        let notes = vec![Note { text: "a".into() }, Note { text: "b".into() }];

        let result = repo
            .send(&notes)
            .to(SftpDestination::new("localhost", "/in", "nobody"))
            .retry(RetryPolicy::fixed(3, std::time::Duration::from_millis(1)))
            .execute()
            .await;

        assert!(result.is_failure());
        assert_eq!(result.records_failed, 2);
        assert_eq!(result.metadata.get("error_kind").map(String::as_str), Some("credentials_not_found"));
    }
}
