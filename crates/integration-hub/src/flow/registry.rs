//! Named flow definitions and component instances
//!
//! Registering a name twice replaces the earlier entry and logs a warning.

use super::component::{InputSource, OutputDestination, Transformer};
use super::definition::FlowDefinition;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Thread-safe registry of flows and the components they reference
#[derive(Default)]
pub struct ComponentRegistry {
    flows: RwLock<HashMap<String, Arc<FlowDefinition>>>,
    inputs: RwLock<HashMap<String, Arc<dyn InputSource>>>,
    transformers: RwLock<HashMap<String, Arc<dyn Transformer>>>,
    outputs: RwLock<HashMap<String, Arc<dyn OutputDestination>>>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("flows", &self.flow_names())
            .field("inputs", &self.input_count())
            .field("transformers", &self.transformer_count())
            .field("outputs", &self.output_count())
            .finish()
    }
}

fn insert<V: ?Sized>(map: &RwLock<HashMap<String, Arc<V>>>, kind: &str, name: String, value: Arc<V>) {
    if map.write().insert(name.clone(), value).is_some() {
        warn!("Replacing registered {} '{}'", kind, name);
    } else {
        debug!("Registered {} '{}'", kind, name);
    }
}

fn sorted_keys<V: ?Sized>(map: &RwLock<HashMap<String, Arc<V>>>) -> Vec<String> {
    let mut names: Vec<String> = map.read().keys().cloned().collect();
    names.sort();
    names
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_flow(&self, definition: FlowDefinition) {
        let name = definition.name.clone();
        insert(&self.flows, "flow", name, Arc::new(definition));
    }

    pub fn register_input(&self, name: impl Into<String>, input: Arc<dyn InputSource>) {
        insert(&self.inputs, "input", name.into(), input);
    }

    pub fn register_transformer(&self, name: impl Into<String>, transformer: Arc<dyn Transformer>) {
        insert(&self.transformers, "transformer", name.into(), transformer);
    }

    pub fn register_output(&self, name: impl Into<String>, output: Arc<dyn OutputDestination>) {
        insert(&self.outputs, "output", name.into(), output);
    }

    pub fn flow(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.read().get(name).cloned()
    }

    pub fn input(&self, name: &str) -> Option<Arc<dyn InputSource>> {
        self.inputs.read().get(name).cloned()
    }

    pub fn transformer(&self, name: &str) -> Option<Arc<dyn Transformer>> {
        self.transformers.read().get(name).cloned()
    }

    pub fn output(&self, name: &str) -> Option<Arc<dyn OutputDestination>> {
        self.outputs.read().get(name).cloned()
    }

    pub fn remove_flow(&self, name: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.write().remove(name)
    }

    /// Registered flows, sorted by name
    pub fn flows(&self) -> Vec<Arc<FlowDefinition>> {
        let mut flows: Vec<_> = self.flows.read().values().cloned().collect();
        flows.sort_by(|a, b| a.name.cmp(&b.name));
        flows
    }

    pub fn flow_names(&self) -> Vec<String> {
        sorted_keys(&self.flows)
    }

    pub fn input_names(&self) -> Vec<String> {
        sorted_keys(&self.inputs)
    }

    pub fn transformer_names(&self) -> Vec<String> {
        sorted_keys(&self.transformers)
    }

    pub fn output_names(&self) -> Vec<String> {
        sorted_keys(&self.outputs)
    }

    /// Components referenced by `flow` that are not registered, in flow order
    pub fn missing_components(&self, flow: &FlowDefinition) -> Vec<String> {
        let inputs = self.inputs.read();
        let transformers = self.transformers.read();
        let outputs = self.outputs.read();

        let missing_inputs = flow
            .inputs
            .iter()
            .filter(|n| !inputs.contains_key(*n))
            .map(|n| format!("input '{}'", n));
        let missing_transformers = flow
            .transformers
            .iter()
            .filter(|n| !transformers.contains_key(*n))
            .map(|n| format!("transformer '{}'", n));
        let missing_outputs = flow
            .outputs
            .iter()
            .filter(|n| !outputs.contains_key(*n))
            .map(|n| format!("output '{}'", n));

        missing_inputs
            .chain(missing_transformers)
            .chain(missing_outputs)
            .collect()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.read().len()
    }

    pub fn input_count(&self) -> usize {
        self.inputs.read().len()
    }

    pub fn transformer_count(&self) -> usize {
        self.transformers.read().len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.read().len()
    }

    pub fn clear(&self) {
        self.flows.write().clear();
        self.inputs.write().clear();
        self.transformers.write().clear();
        self.outputs.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::component::FnTransformer;

    #[test]
    fn test_replace_keeps_latest() {
        let registry = ComponentRegistry::new();
        registry.register_flow(FlowDefinition::builder("f").description("first").build().unwrap());
        registry.register_flow(FlowDefinition::builder("f").description("second").build().unwrap());
        assert_eq!(registry.flow_count(), 1);
        assert_eq!(registry.flow("f").unwrap().description.as_deref(), Some("second"));
    }

    #[test]
    fn test_missing_components_in_flow_order() {
        let registry = ComponentRegistry::new();
        registry.register_transformer("upper", Arc::new(FnTransformer::new("upper", |v| Ok(Some(v)))));
        let flow = FlowDefinition::builder("f")
            .input("inbox")
            .transformer("upper")
            .transformer("lower")
            .output("outbox")
            .build()
            .unwrap();
        assert_eq!(
            registry.missing_components(&flow),
            vec!["input 'inbox'", "transformer 'lower'", "output 'outbox'"]
        );
    }

    #[test]
    fn test_names_sorted_and_clear() {
        let registry = ComponentRegistry::new();
        for name in ["b", "a", "c"] {
            registry.register_flow(FlowDefinition::builder(name).build().unwrap());
        }
        assert_eq!(registry.flow_names(), vec!["a", "b", "c"]);
        registry.clear();
        assert_eq!(registry.flow_count(), 0);
    }
}
