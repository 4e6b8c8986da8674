//! Declarative description of a flow

use crate::error::{IntegrationError, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use validator::Validate;

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    1
}

/// A flow wires named inputs, transformers and outputs together.
///
/// Components are referenced by the names they were registered under in
/// the [`ComponentRegistry`](super::registry::ComponentRegistry); the
/// definition itself holds no instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, JsonSchema)]
pub struct FlowDefinition {
    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Read in order
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Applied to every record, in order
    #[serde(default)]
    pub transformers: Vec<String>,

    #[serde(default)]
    pub outputs: Vec<String>,

    /// Abort on the first input or transformation error instead of skipping
    #[serde(default = "default_true")]
    pub fail_on_error: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Concurrent runs of this flow allowed by the engine
    #[serde(default = "default_max_concurrent")]
    #[validate(range(min = 1, max = 1024))]
    pub max_concurrent: usize,

    /// Free-form settings handed to components through the flow context
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl FlowDefinition {
    pub fn builder(name: impl Into<String>) -> FlowDefinitionBuilder {
        FlowDefinitionBuilder::new(name)
    }

    /// Check field constraints; blank names and zero concurrency are rejected
    pub fn check(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(IntegrationError::config("flow name must not be blank"));
        }
        self.validate()
            .map_err(|e| IntegrationError::config(format!("flow '{}': {}", self.name, e)))
    }

    /// Every component name referenced by this flow
    pub fn component_names(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .chain(&self.transformers)
            .chain(&self.outputs)
            .map(String::as_str)
    }
}

/// Builder for [`FlowDefinition`]
///
/// ```rust,ignore
/// let flow = FlowDefinition::builder("nightly-claims")
///     .description("Claims from the partner SFTP to the billing API")
///     .input("partner-inbox")
///     .transformer("normalize")
///     .output("billing-api")
///     .fail_on_error(false)
///     .build()?;
/// ```
#[derive(Debug, Clone)]
pub struct FlowDefinitionBuilder {
    definition: FlowDefinition,
}

impl FlowDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            definition: FlowDefinition {
                name: name.into(),
                description: None,
                inputs: Vec::new(),
                transformers: Vec::new(),
                outputs: Vec::new(),
                fail_on_error: true,
                enabled: true,
                max_concurrent: 1,
                properties: HashMap::new(),
            },
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.definition.description = Some(description.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.definition.inputs.push(name.into());
        self
    }

    pub fn transformer(mut self, name: impl Into<String>) -> Self {
        self.definition.transformers.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.definition.outputs.push(name.into());
        self
    }

    pub fn fail_on_error(mut self, fail: bool) -> Self {
        self.definition.fail_on_error = fail;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.definition.enabled = enabled;
        self
    }

    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.definition.max_concurrent = max;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.definition.properties.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<FlowDefinition> {
        self.definition.check()?;
        Ok(self.definition)
    }
}
