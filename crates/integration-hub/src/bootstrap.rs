//! Build a ready-to-run engine from an [`IntegrationConfig`]
//!
//! Every schema, input, transformer and output in the config becomes a
//! registered component; every flow is registered as declared.

use crate::config::{InputConfig, IntegrationConfig, OutputConfig, OutputTarget, SftpSettings};
use crate::connectors::credentials::{CredentialsProvider, StaticCredentialsProvider};
use crate::connectors::destination::{HttpDestination, RemoteOutput, SftpDestination};
use crate::connectors::file::{FileInput, FileOutput};
use crate::connectors::pattern::FilePattern;
use crate::connectors::rest::RestClientConfig;
use crate::error::{IntegrationError, Result};
use crate::flow::component::{MappingTransformer, OutputDestination};
use crate::flow::engine::IntegrationEngine;
use crate::resilience::CircuitBreakerRegistry;
use crate::schema::Schema;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Destination defaults; a destination still at these values takes the config section's setting
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_READ_TIMEOUT_MS: u64 = 60_000;

/// An engine wired from configuration, plus the shared breakers of its outputs
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub engine: IntegrationEngine,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub credentials: Arc<StaticCredentialsProvider>,
}

impl Bootstrap {
    pub fn from_config(config: &IntegrationConfig) -> Result<Self> {
        let mut engine = IntegrationEngine::new().with_worker_pool_size(config.engine.worker_pool_size);
        if let Some(max_queue) = config.engine.max_queue {
            engine = engine.with_max_queue(max_queue);
        }
        let credentials = Arc::new(StaticCredentialsProvider::from_map(config.credentials.clone()));
        let breakers = Arc::new(CircuitBreakerRegistry::with_default_config(
            config.circuit_breaker.to_config(),
        ));

        let schemas = build_schemas(config)?;
        let registry = engine.registry();

        for (name, input) in &config.inputs {
            let InputConfig::File(file) = input;
            let schema = lookup(&schemas, &file.schema)?;
            let mut component = FileInput::new(
                name.clone(),
                &file.directory,
                FilePattern::new(&file.pattern)?,
                file.format.clone(),
                schema,
            )
            .delete_after_read(file.delete_after_read);
            if let Some(dir) = file.archive_dir.as_ref().or(config.file.archive_dir.as_ref()) {
                component = component.with_archive_dir(dir);
            }
            if let Some(dir) = &config.file.error_dir {
                component = component.with_error_dir(dir);
            }
            registry.register_input(name.clone(), Arc::new(component));
        }

        for (name, spec) in &config.transformers {
            registry.register_transformer(name.clone(), Arc::new(MappingTransformer::new(name.clone(), spec.clone())));
        }

        let provider: Arc<dyn CredentialsProvider> = credentials.clone();
        for (name, output) in &config.outputs {
            let component = build_output(config, name, output, &schemas, &provider, &breakers)?;
            registry.register_output(name.clone(), component);
        }

        for flow in &config.flows {
            flow.check()?;
            registry.register_flow(flow.clone());
        }

        info!(
            "Bootstrapped {} flow(s), {} input(s), {} transformer(s), {} output(s)",
            registry.flow_count(),
            registry.input_count(),
            registry.transformer_count(),
            registry.output_count()
        );
        Ok(Self {
            engine,
            breakers,
            credentials,
        })
    }
}

fn build_schemas(config: &IntegrationConfig) -> Result<HashMap<String, Arc<Schema>>> {
    config
        .schemas
        .iter()
        .map(|(name, schema)| {
            let descriptor = schema.to_descriptor(name);
            let schema = Schema::from_descriptor(name, &descriptor)?;
            Ok((name.clone(), Arc::new(schema)))
        })
        .collect()
}

fn lookup(schemas: &HashMap<String, Arc<Schema>>, name: &str) -> Result<Arc<Schema>> {
    schemas
        .get(name)
        .cloned()
        .ok_or_else(|| IntegrationError::not_found(format!("schema '{}'", name)))
}

fn build_output(
    config: &IntegrationConfig,
    name: &str,
    output: &OutputConfig,
    schemas: &HashMap<String, Arc<Schema>>,
    provider: &Arc<dyn CredentialsProvider>,
    breakers: &CircuitBreakerRegistry,
) -> Result<Arc<dyn OutputDestination>> {
    let schema = lookup(schemas, &output.schema)?;

    let remote = match &output.target {
        OutputTarget::File { directory } => {
            let mut file = FileOutput::new(name, directory, output.format.clone(), schema).with_required(output.required);
            if let Some(pattern) = &output.filename_pattern {
                file = file.with_filename_pattern(pattern.clone());
            }
            return Ok(Arc::new(file));
        }
        OutputTarget::Sftp(destination) => {
            let destination = with_sftp_defaults(destination.clone(), &config.sftp);
            RemoteOutput::new(name, destination, schema, output.format.clone(), provider.clone())
        }
        OutputTarget::Http(destination) => {
            let destination = with_rest_defaults(destination.clone(), &config.rest);
            RemoteOutput::new(name, destination, schema, output.format.clone(), provider.clone())
        }
    };

    let mut remote = remote.with_required(output.required);
    if let Some(pattern) = &output.filename_pattern {
        remote = remote.with_filename_pattern(pattern.clone());
    }
    if output.retry {
        remote = remote.with_retry(config.retry.to_policy());
    }
    if output.circuit_breaker {
        remote = remote.with_breaker(breakers.get_or_create(name));
    }
    Ok(Arc::new(remote))
}

/// Fill destination settings left at their defaults from the `sftp` section
fn with_sftp_defaults(mut destination: SftpDestination, settings: &SftpSettings) -> SftpDestination {
    if destination.connect_timeout_ms == DEFAULT_CONNECT_TIMEOUT_MS {
        destination.connect_timeout_ms = settings.connect_timeout_ms;
    }
    if destination.known_hosts_path.is_none() {
        destination.known_hosts_path = settings.known_hosts_path.clone();
        destination.strict_host_key_checking |= settings.strict_host_key_checking && settings.known_hosts_path.is_some();
    }
    destination
}

/// Fill destination settings left at their defaults from the `rest` section
fn with_rest_defaults(mut destination: HttpDestination, rest: &RestClientConfig) -> HttpDestination {
    if destination.connect_timeout_ms == DEFAULT_CONNECT_TIMEOUT_MS {
        destination.connect_timeout_ms = rest.connect_timeout_ms;
    }
    if destination.read_timeout_ms == DEFAULT_READ_TIMEOUT_MS {
        destination.read_timeout_ms = rest.read_timeout_ms;
    }
    for (header, value) in &rest.default_headers {
        destination
            .headers
            .entry(header.clone())
            .or_insert_with(|| value.clone());
    }
    let has_user_agent = destination.headers.keys().any(|h| h.eq_ignore_ascii_case("user-agent"));
    if !has_user_agent {
        destination.headers.insert("User-Agent".to_string(), rest.user_agent.clone());
    }
    destination
}
