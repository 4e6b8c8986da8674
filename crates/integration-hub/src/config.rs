//! Configuration file for the `integration-hub` binary
//!
//! ```yaml
//! engine:
//!   worker_pool_size: 4
//! credentials:
//!   partner-sftp:
//!     type: ssh
//!     username: claims
//!     password: ${PARTNER_SFTP_PASSWORD}
//! schemas:
//!   claim:
//!     columns:
//!       - { field: id, kind: integer, nullable: false }
//!       - { field: amount, kind: decimal, format: "0.00" }
//!     ids: [id]
//! inputs:
//!   inbox:
//!     type: file
//!     directory: /data/inbox
//!     pattern: "claims_*.csv"
//!     format: { type: csv }
//!     schema: claim
//! outputs:
//!   partner:
//!     schema: claim
//!     format: { type: json }
//!     target:
//!       type: sftp
//!       host: sftp.partner.example
//!       remote_path: /inbound
//!       credentials: partner-sftp
//! flows:
//!   - name: nightly-claims
//!     inputs: [inbox]
//!     outputs: [partner]
//! ```

use crate::connectors::credentials::CredentialBundle;
use crate::connectors::destination::{HttpDestination, SftpDestination};
use crate::connectors::rest::RestClientConfig;
use crate::flow::component::MappingSpec;
use crate::flow::definition::FlowDefinition;
use crate::flow::engine::DEFAULT_WORKER_POOL_SIZE;
use crate::format::FileFormat;
use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, RetryPolicy};
use crate::schema::{ColumnDef, ColumnType, RecordDescriptor};
use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// `${VAR}` or `${VAR:-default}`
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}").unwrap()
});

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate, JsonSchema)]
pub struct IntegrationConfig {
    #[serde(default)]
    #[validate(nested)]
    pub engine: EngineConfig,

    /// Retry applied to outputs with `retry: true`
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,

    /// Breaker settings for outputs with `circuit_breaker: true`
    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Defaults for SFTP destinations
    #[serde(default)]
    pub sftp: SftpSettings,

    /// Defaults for HTTP destinations
    #[serde(default)]
    pub rest: RestClientConfig,

    #[serde(default)]
    pub file: FileSettings,

    /// Named credential bundles
    #[serde(default)]
    pub credentials: HashMap<String, CredentialBundle>,

    /// Record layouts referenced by inputs and outputs
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaConfig>,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputConfig>,

    /// Field mappings usable as flow transformers
    #[serde(default)]
    pub transformers: BTreeMap<String, MappingSpec>,

    #[serde(default)]
    pub outputs: BTreeMap<String, OutputConfig>,

    #[serde(default)]
    #[validate(nested)]
    pub flows: Vec<FlowDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct EngineConfig {
    /// Flows running in the background at once
    #[serde(default = "default_worker_pool_size")]
    #[validate(range(min = 1, max = 1024))]
    pub worker_pool_size: usize,

    /// Background runs allowed to wait for a worker (unbounded when unset)
    #[serde(default)]
    pub max_queue: Option<usize>,

    /// Prefix for runtime worker thread names
    #[serde(default = "default_thread_name_prefix")]
    #[validate(length(min = 1))]
    pub thread_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: default_worker_pool_size(),
            max_queue: None,
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

fn default_worker_pool_size() -> usize {
    DEFAULT_WORKER_POOL_SIZE
}

fn default_thread_name_prefix() -> String {
    "integration-".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct RetryConfig {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0))]
    pub multiplier: f64,

    /// Linear backoff step
    #[serde(default = "default_increment_ms")]
    pub increment_ms: u64,

    #[serde(default)]
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            increment_ms: default_increment_ms(),
            strategy: BackoffStrategy::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_increment_ms() -> u64 {
    1_000
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_multiplier(self.multiplier)
            .with_increment(Duration::from_millis(self.increment_ms))
            .with_strategy(self.strategy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u64,

    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    #[serde(default = "default_success_threshold")]
    #[validate(range(min = 1))]
    pub success_threshold: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_failure_threshold() -> u64 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_success_threshold() -> u64 {
    3
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
            success_threshold: self.success_threshold,
            ..CircuitBreakerConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SftpSettings {
    #[serde(default = "default_sftp_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub strict_host_key_checking: bool,

    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for SftpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_sftp_timeout_ms(),
            strict_host_key_checking: true,
            known_hosts_path: None,
        }
    }
}

fn default_sftp_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FileSettings {
    /// Default archive directory for file inputs
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    /// Where file inputs move files that fail to parse
    #[serde(default)]
    pub error_dir: Option<PathBuf>,
}

/// Record layout declared in configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SchemaConfig {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    /// Columns in file order
    pub columns: Vec<ColumnConfig>,

    /// Identity fields, in key order
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ColumnConfig {
    pub field: String,

    /// Header or element name; defaults to the field name
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub kind: ColumnType,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default)]
    pub format: Option<String>,

    /// Fixed-width length
    #[serde(default)]
    pub length: Option<usize>,

    #[serde(default)]
    pub default_value: Option<String>,
}

impl SchemaConfig {
    pub fn to_descriptor(&self, name: &str) -> RecordDescriptor {
        let mut descriptor = RecordDescriptor::new(name);
        if let Some(description) = &self.description {
            descriptor = descriptor.description(description.clone());
        }
        if let Some(version) = &self.version {
            descriptor = descriptor.version(version.clone());
        }
        for (index, column) in self.columns.iter().enumerate() {
            let mut def = ColumnDef::new(index as u32 + 1)
                .kind(column.kind)
                .nullable(column.nullable);
            if let Some(name) = &column.name {
                def = def.name(name.clone());
            }
            if let Some(format) = &column.format {
                def = def.format(format.clone());
            }
            if let Some(length) = column.length {
                def = def.length(length);
            }
            if let Some(value) = &column.default_value {
                def = def.default_value(value.clone());
            }
            descriptor = descriptor.column(column.field.clone(), def);
        }
        for id in &self.ids {
            descriptor = descriptor.id(id.clone());
        }
        descriptor
    }
}

/// Input component
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputConfig {
    File(FileInputConfig),
}

impl InputConfig {
    pub fn schema(&self) -> &str {
        match self {
            InputConfig::File(c) => &c.schema,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FileInputConfig {
    pub directory: PathBuf,

    /// Glob, or a regex when prefixed with `regex:`
    #[serde(default = "default_pattern")]
    pub pattern: String,

    pub format: FileFormat,

    pub schema: String,

    /// Overrides `file.archive_dir`
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,

    #[serde(default)]
    pub delete_after_read: bool,
}

fn default_pattern() -> String {
    "*".to_string()
}

/// Output component
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OutputConfig {
    pub schema: String,

    pub format: FileFormat,

    /// Placeholders: `{flow}`, `{timestamp}`, `{date}`, `{uuid}`, `{ext}`
    #[serde(default)]
    pub filename_pattern: Option<String>,

    /// A failing required output fails the flow
    #[serde(default = "default_true")]
    pub required: bool,

    /// Retry deliveries with the `retry` section
    #[serde(default)]
    pub retry: bool,

    /// Guard deliveries with a breaker named after the output
    #[serde(default)]
    pub circuit_breaker: bool,

    pub target: OutputTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputTarget {
    File { directory: PathBuf },
    Sftp(SftpDestination),
    Http(HttpDestination),
}

impl IntegrationConfig {
    /// Load, expand environment variables and validate
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded).context("Failed to parse config")?;
        config.check()?;
        Ok(config)
    }

    /// Expand `${VAR}` and `${VAR:-default}`; unset variables without a default become empty
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());
                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Field constraints plus cross references between sections
    pub fn check(&self) -> anyhow::Result<()> {
        self.validate().context("Config validation failed")?;

        let mut flow_names = HashSet::new();
        for flow in &self.flows {
            if !flow_names.insert(flow.name.as_str()) {
                anyhow::bail!("Flow '{}' is defined more than once", flow.name);
            }
            for input in &flow.inputs {
                if !self.inputs.contains_key(input) {
                    anyhow::bail!("Flow '{}' references unknown input '{}'", flow.name, input);
                }
            }
            for transformer in &flow.transformers {
                if !self.transformers.contains_key(transformer) {
                    anyhow::bail!("Flow '{}' references unknown transformer '{}'", flow.name, transformer);
                }
            }
            for output in &flow.outputs {
                if !self.outputs.contains_key(output) {
                    anyhow::bail!("Flow '{}' references unknown output '{}'", flow.name, output);
                }
            }
        }

        for (name, input) in &self.inputs {
            if !self.schemas.contains_key(input.schema()) {
                anyhow::bail!("Input '{}' references unknown schema '{}'", name, input.schema());
            }
        }

        for (name, output) in &self.outputs {
            if !self.schemas.contains_key(&output.schema) {
                anyhow::bail!("Output '{}' references unknown schema '{}'", name, output.schema);
            }
            let credentials = match &output.target {
                OutputTarget::File { .. } => None,
                OutputTarget::Sftp(d) => Some(&d.credentials),
                OutputTarget::Http(d) => d.auth.as_ref(),
            };
            if let Some(credentials) = credentials {
                if !self.credentials.contains_key(credentials) {
                    anyhow::bail!("Output '{}' references unknown credentials '{}'", name, credentials);
                }
            }
        }

        for (name, schema) in &self.schemas {
            if schema.columns.is_empty() {
                anyhow::bail!("Schema '{}' has no columns", name);
            }
        }

        Ok(())
    }

    pub fn enabled_flows(&self) -> impl Iterator<Item = &FlowDefinition> {
        self.flows.iter().filter(|f| f.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
credentials:
  partner:
    type: ssh
    username: claims
    password: ${IH_TEST_PARTNER_PASSWORD:-secret}
schemas:
  claim:
    columns:
      - { field: id, kind: integer, nullable: false }
      - { field: amount, kind: decimal, format: "0.00" }
    ids: [id]
inputs:
  inbox:
    type: file
    directory: /tmp/inbox
    format: { type: csv }
    schema: claim
outputs:
  partner:
    schema: claim
    format: { type: json }
    retry: true
    target:
      type: sftp
      host: sftp.example
      remote_path: /in
      credentials: partner
flows:
  - name: nightly
    inputs: [inbox]
    outputs: [partner]
"#;

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("IH_TEST_HOST", "sftp.internal");
        let expanded = IntegrationConfig::expand_env_vars("host: ${IH_TEST_HOST}");
        assert_eq!(expanded, "host: sftp.internal");
    }

    #[test]
    fn test_env_var_with_default() {
        std::env::remove_var("IH_TEST_MISSING");
        let expanded = IntegrationConfig::expand_env_vars("value: ${IH_TEST_MISSING:-fallback}");
        assert_eq!(expanded, "value: fallback");
    }

    #[test]
    fn test_parse_config_defaults() {
        let config = IntegrationConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.engine.worker_pool_size, 10);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.circuit_breaker.success_threshold, 3);
        assert_eq!(config.rest.user_agent, "IntegrationHub/1.0");
        assert!(config.sftp.strict_host_key_checking);

        let InputConfig::File(inbox) = &config.inputs["inbox"];
        assert_eq!(inbox.pattern, "*");
        assert!(matches!(config.outputs["partner"].target, OutputTarget::Sftp(_)));
        assert_eq!(config.enabled_flows().count(), 1);
    }

    #[test]
    fn test_schema_config_to_descriptor() {
        let config = IntegrationConfig::from_yaml(CONFIG).unwrap();
        let descriptor = config.schemas["claim"].to_descriptor("claim");
        let schema = crate::schema::Schema::from_descriptor("claim", &descriptor).unwrap();
        assert_eq!(schema.columns().len(), 2);
        assert!(schema.has_id_columns());
    }

    #[test]
    fn test_unknown_references_rejected() {
        let broken = CONFIG.replace("outputs: [partner]", "outputs: [nowhere]");
        let err = IntegrationConfig::from_yaml(&broken).unwrap_err();
        assert!(err.to_string().contains("unknown output 'nowhere'"));

        let broken = CONFIG.replace("credentials: partner\n", "credentials: other\n");
        let err = IntegrationConfig::from_yaml(&broken).unwrap_err();
        assert!(err.to_string().contains("unknown credentials 'other'"));
    }

    #[test]
    fn test_invalid_worker_pool_size() {
        let yaml = format!("engine:\n  worker_pool_size: 0\n{}", CONFIG);
        let err = IntegrationConfig::from_yaml(&yaml).unwrap_err();
        assert!(format!("{:#}", err).contains("worker_pool_size"));
    }

    #[test]
    fn test_retry_config_to_policy() {
        let policy = RetryConfig::default().to_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
