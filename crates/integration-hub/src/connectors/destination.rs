//! Remote destinations for serialized record files
//!
//! A [`Destination`] takes a finished [`Payload`] (file name, content type
//! and bytes) and delivers it either to an SFTP directory or to an HTTP
//! endpoint. Credentials are resolved by name at delivery time.
//!
//! ```yaml
//! type: sftp
//! host: sftp.partner.example
//! remote_path: /inbound/claims
//! credentials: partner-sftp
//! ---
//! type: http
//! url: https://api.partner.example/v1/uploads
//! method: put
//! headers:
//!   X-File-Name: ${filename}
//!   X-Record-Count: ${records}
//! auth: partner-oauth
//! multipart: true
//! ```

use super::credentials::CredentialsProvider;
use super::pattern::render_filename;
use super::rest::{RequestBody, RestAuth, RestClient, RestClientConfig};
use super::sftp::{join_remote, SftpClient, SftpConfig};
use crate::error::{IntegrationError, Result};
use crate::flow::component::{FlowContext, OutputDestination};
use crate::flow::result::SendResult;
use crate::format::{FileFormat, FormatRegistry};
use crate::repository::{default_formats, encode_values};
use crate::resilience::{CircuitBreaker, ResiliencePolicy, RetryPolicy};
use crate::schema::Schema;
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use regex::Regex;
use reqwest::Method;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, info, warn};

/// A serialized file ready for delivery
#[derive(Debug, Clone)]
pub struct Payload {
    pub file_name: String,
    pub content_type: String,
    pub data: Vec<u8>,
    /// Number of records encoded in `data`
    pub records: usize,
    pub metadata: HashMap<String, String>,
}

impl Payload {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, data: Vec<u8>, records: usize) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            data,
            records,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

fn default_port() -> u16 {
    22
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_temp_suffix() -> String {
    ".tmp".to_string()
}

fn default_field_name() -> String {
    "file".to_string()
}

/// Upload to a directory on an SFTP server.
///
/// The file is written as `<name><temp_suffix>` and renamed once complete.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SftpDestination {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub remote_path: String,
    /// Name resolved through the [`CredentialsProvider`]
    pub credentials: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub create_directory: bool,
    /// Empty uploads straight to the final name
    #[serde(default = "default_temp_suffix")]
    pub temp_suffix: String,
    #[serde(default)]
    pub strict_host_key_checking: bool,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

impl SftpDestination {
    pub fn new(host: impl Into<String>, remote_path: impl Into<String>, credentials: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            remote_path: remote_path.into(),
            credentials: credentials.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            create_directory: true,
            temp_suffix: default_temp_suffix(),
            strict_host_key_checking: false,
            known_hosts_path: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_create_directory(mut self, create: bool) -> Self {
        self.create_directory = create;
        self
    }

    pub fn with_temp_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.temp_suffix = suffix.into();
        self
    }

    fn client_config(&self) -> SftpConfig {
        SftpConfig {
            host: self.host.clone(),
            port: self.port,
            connect_timeout_ms: self.connect_timeout_ms,
            strict_host_key_checking: self.strict_host_key_checking,
            known_hosts_path: self.known_hosts_path.clone(),
        }
    }

    pub async fn deliver(&self, payload: &Payload, provider: &dyn CredentialsProvider) -> Result<SendResult> {
        let credentials = provider.ssh_credentials(&self.credentials)?;
        let config = self.client_config();
        let directory = self.remote_path.clone();
        let target = join_remote(&self.remote_path, &payload.file_name);
        let temp = format!("{}{}", target, self.temp_suffix);
        let create_directory = self.create_directory;
        let data = payload.data.clone();

        let remote = target.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut client = SftpClient::new(config, credentials);
            client.connect()?;
            if !create_directory && !directory.is_empty() && !client.exists(&directory)? {
                return Err(IntegrationError::send(
                    format!("sftp://{}{}", client.config().host, directory),
                    "remote directory does not exist",
                    1,
                ));
            }
            if temp == remote {
                client.upload_bytes(&data, &remote)?;
            } else {
                client.upload_bytes(&data, &temp)?;
                if let Err(e) = client.rename(&temp, &remote) {
                    if let Err(cleanup) = client.delete(&temp) {
                        warn!("Failed to remove temporary file {}: {}", temp, cleanup);
                    }
                    return Err(e);
                }
            }
            client.disconnect();
            Ok(())
        })
        .await
        .map_err(|e| IntegrationError::illegal_state(format!("sftp upload task failed: {}", e)))??;

        info!(
            "Uploaded {} ({} records) to sftp://{}:{}{}",
            payload.file_name, payload.records, self.host, self.port, target
        );
        counter!("destination.sftp.uploads").increment(1);
        Ok(SendResult::success(payload.records)
            .with_metadata("remote_path", target)
            .with_metadata("file_name", payload.file_name.clone()))
    }
}

/// HTTP verb used to upload a file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

impl HttpMethod {
    fn as_method(self) -> Method {
        match self {
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
        }
    }
}

/// Upload to an HTTP endpoint, as a raw body or a multipart file part
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HttpDestination {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Overrides the content type of the encoded format
    #[serde(default)]
    pub content_type: Option<String>,
    /// Values may use `${filename}`, `${records}`, `${timestamp}`,
    /// `${content_type}`, `${metadata.KEY}` or environment variables
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Credentials name; OAuth2 bundles take precedence over basic ones
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default)]
    pub multipart: bool,
    #[serde(default = "default_field_name")]
    pub field_name: String,
}

impl HttpDestination {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            content_type: None,
            headers: HashMap::new(),
            auth: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            multipart: false,
            field_name: default_field_name(),
        }
    }

    pub fn with_method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_auth(mut self, credentials: impl Into<String>) -> Self {
        self.auth = Some(credentials.into());
        self
    }

    pub fn multipart(mut self, field_name: impl Into<String>) -> Self {
        self.multipart = true;
        self.field_name = field_name.into();
        self
    }

    fn resolve_auth(&self, provider: &dyn CredentialsProvider) -> Result<RestAuth> {
        let Some(name) = &self.auth else {
            return Ok(RestAuth::None);
        };
        if let Ok(oauth) = provider.oauth2_credentials(name) {
            return Ok(RestAuth::OAuth2(oauth));
        }
        let basic = provider.credentials(name)?;
        Ok(RestAuth::Basic {
            username: basic.username,
            password: basic.password,
        })
    }

    pub async fn deliver(&self, payload: &Payload, provider: &dyn CredentialsProvider) -> Result<SendResult> {
        let auth = self.resolve_auth(provider)?;
        let config = RestClientConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            read_timeout_ms: self.read_timeout_ms,
            ..RestClientConfig::default()
        };
        let client = RestClient::new(config)?.with_auth(auth);

        let content_type = self
            .content_type
            .clone()
            .unwrap_or_else(|| payload.content_type.clone());
        let headers: HashMap<String, String> = self
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), render_placeholders(value, payload, &content_type)))
            .collect();
        let body = if self.multipart {
            RequestBody::Multipart {
                field: self.field_name.clone(),
                file_name: payload.file_name.clone(),
                content_type,
                data: payload.data.clone(),
            }
        } else {
            RequestBody::bytes(content_type, payload.data.clone())
        };

        let response = client
            .request(self.method.as_method(), &self.url, Some(body), &headers)
            .await
            .map_err(|e| match e {
                IntegrationError::Send {
                    destination,
                    message,
                    status,
                    ..
                } => IntegrationError::Send {
                    destination,
                    message,
                    records_sent: 0,
                    records_attempted: payload.records,
                    status,
                },
                other => other,
            })?;

        info!(
            "Uploaded {} ({} records) to {} -> HTTP {}",
            payload.file_name, payload.records, self.url, response.status
        );
        counter!("destination.http.uploads").increment(1);
        Ok(SendResult::success(payload.records)
            .with_metadata("status", response.status.to_string())
            .with_metadata("file_name", payload.file_name.clone()))
    }
}

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_.]*)\}").unwrap());

/// Expand `${var}` in a header value; unknown names stay as written
fn render_placeholders(template: &str, payload: &Payload, content_type: &str) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = &caps[1];
            let value = match name {
                "filename" => Some(payload.file_name.clone()),
                "records" => Some(payload.records.to_string()),
                "timestamp" => Some(Utc::now().to_rfc3339()),
                "content_type" => Some(content_type.to_string()),
                other => match other.strip_prefix("metadata.") {
                    Some(key) => payload.metadata.get(key).cloned(),
                    None => std::env::var(other).ok(),
                },
            };
            value.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Where a [`SendBuilder`](crate::repository::SendBuilder) or
/// [`RemoteOutput`] delivers its file
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Destination {
    Sftp(SftpDestination),
    Http(HttpDestination),
}

impl Destination {
    /// Human-readable target, for logs and errors
    pub fn name(&self) -> String {
        match self {
            Destination::Sftp(d) => format!("sftp://{}:{}{}", d.host, d.port, d.remote_path),
            Destination::Http(d) => d.url.clone(),
        }
    }

    pub async fn deliver(&self, payload: &Payload, provider: &dyn CredentialsProvider) -> Result<SendResult> {
        debug!("Delivering {} to {}", payload.file_name, self.name());
        match self {
            Destination::Sftp(d) => d.deliver(payload, provider).await,
            Destination::Http(d) => d.deliver(payload, provider).await,
        }
    }
}

impl From<SftpDestination> for Destination {
    fn from(value: SftpDestination) -> Self {
        Destination::Sftp(value)
    }
}

impl From<HttpDestination> for Destination {
    fn from(value: HttpDestination) -> Self {
        Destination::Http(value)
    }
}

/// Flow output that encodes each batch as one file and delivers it remotely
pub struct RemoteOutput {
    name: String,
    destination: Destination,
    schema: Arc<Schema>,
    format: FileFormat,
    filename_pattern: String,
    resilience: ResiliencePolicy,
    required: bool,
    credentials: Arc<dyn CredentialsProvider>,
    formats: Arc<FormatRegistry>,
    connected: AtomicBool,
}

impl std::fmt::Debug for RemoteOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteOutput")
            .field("name", &self.name)
            .field("destination", &self.destination.name())
            .field("schema", &self.schema.name())
            .field("filename_pattern", &self.filename_pattern)
            .finish()
    }
}

impl RemoteOutput {
    pub fn new(
        name: impl Into<String>,
        destination: impl Into<Destination>,
        schema: Arc<Schema>,
        format: FileFormat,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            schema,
            format,
            filename_pattern: "{flow}_{timestamp}.{ext}".to_string(),
            resilience: ResiliencePolicy::new(),
            required: true,
            credentials,
            formats: default_formats(),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_filename_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filename_pattern = pattern.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.resilience = self.resilience.with_retry(retry);
        self
    }

    /// Fail fast while the destination's breaker is open
    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.resilience = self.resilience.with_breaker(breaker);
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

#[async_trait]
impl OutputDestination for RemoteOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_required(&self) -> bool {
        self.required
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, ctx: &FlowContext, record: &Value) -> Result<SendResult> {
        self.send_batch(ctx, std::slice::from_ref(record)).await
    }

    async fn send_batch(&self, ctx: &FlowContext, records: &[Value]) -> Result<SendResult> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(IntegrationError::illegal_state(format!(
                "output '{}' is not connected",
                self.name
            )));
        }
        let file_name = render_filename(&self.filename_pattern, &ctx.flow_name, self.format.format_type.extension());
        let data = encode_values(&self.formats, &self.schema, records, &self.format, &file_name)?;
        let payload = Payload::new(file_name, self.format.format_type.content_type(), data, records.len())
            .with_metadata("flow", ctx.flow_name.clone())
            .with_metadata("run_id", ctx.run_id.to_string());

        self.resilience
            .execute(|| self.destination.deliver(&payload, self.credentials.as_ref()))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::credentials::{CredentialBundle, Credentials, OAuth2Credentials, StaticCredentialsProvider};
    use crate::error::ErrorKind;

    #[test]
    fn test_destination_from_yaml() {
        let sftp: Destination = serde_yaml::from_str(
            "type: sftp\nhost: sftp.example\nremote_path: /in\ncredentials: partner\n",
        )
        .unwrap();
        match &sftp {
            Destination::Sftp(d) => {
                assert_eq!(d.port, 22);
                assert_eq!(d.temp_suffix, ".tmp");
                assert!(d.create_directory);
            }
            other => panic!("unexpected destination {:?}", other),
        }
        assert_eq!(sftp.name(), "sftp://sftp.example:22/in");

        let http: Destination =
            serde_yaml::from_str("type: http\nurl: https://api/upload\nmethod: put\nmultipart: true\n").unwrap();
        match http {
            Destination::Http(d) => {
                assert_eq!(d.method, HttpMethod::Put);
                assert_eq!(d.field_name, "file");
                assert_eq!(d.read_timeout_ms, 60_000);
            }
            other => panic!("unexpected destination {:?}", other),
        }
    }

    #[test]
    fn test_header_placeholders() {
        let payload = Payload::new("claims.csv", "text/csv", vec![], 12).with_metadata("batch", "B7");
        assert_eq!(
            render_placeholders("${filename}:${records}:${metadata.batch}", &payload, "text/csv"),
            "claims.csv:12:B7"
        );
        assert_eq!(render_placeholders("${content_type}", &payload, "text/plain"), "text/plain");
        assert_eq!(
            render_placeholders("${NO_SUCH_VARIABLE_FOR_HUB}", &payload, "text/csv"),
            "${NO_SUCH_VARIABLE_FOR_HUB}"
        );
    }

    #[test]
    fn test_auth_resolution() {
        let provider = StaticCredentialsProvider::new()
            .with("basic", CredentialBundle::Basic(Credentials::new("u", "p")))
            .with(
                "oauth",
                CredentialBundle::OAuth2(OAuth2Credentials::new("http://auth/token", "hub", "s")),
            );

        let destination = HttpDestination::new("http://api/upload");
        assert!(matches!(destination.resolve_auth(&provider).unwrap(), RestAuth::None));
        assert!(matches!(
            destination.clone().with_auth("basic").resolve_auth(&provider).unwrap(),
            RestAuth::Basic { ref username, .. } if username == "u"
        ));
        assert!(matches!(
            destination.clone().with_auth("oauth").resolve_auth(&provider).unwrap(),
            RestAuth::OAuth2(_)
        ));
        let err = destination.with_auth("missing").resolve_auth(&provider).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialsNotFound);
    }

    #[tokio::test]
    async fn test_sftp_requires_credentials() {
        let provider = StaticCredentialsProvider::new();
        let destination = SftpDestination::new("localhost", "/in", "nobody");
        let payload = Payload::new("a.csv", "text/csv", b"x".to_vec(), 1);
        let err = destination.deliver(&payload, &provider).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialsNotFound);
    }

    #[tokio::test]
    async fn test_remote_output_must_be_connected() {
        let schema = Arc::new(crate::format::test_support::payment_schema());
        let output = RemoteOutput::new(
            "upload",
            HttpDestination::new("http://127.0.0.1:1/upload"),
            schema,
            FileFormat::csv(),
            Arc::new(StaticCredentialsProvider::new()),
        );
        let err = output
            .send_batch(&FlowContext::new("f"), &[serde_json::json!({"id": 1})])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }
}
