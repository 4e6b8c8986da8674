//! Pluggable flow components
//!
//! Components are registered by name in the
//! [`ComponentRegistry`](super::registry::ComponentRegistry) and shared between
//! flows, so every method takes `&self`; implementations keep their state
//! behind interior mutability.

use super::result::{SendResult, ValidationResult};
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Per-run information handed to components
#[derive(Debug, Clone)]
pub struct FlowContext {
    pub flow_name: String,
    pub run_id: Uuid,
    pub properties: HashMap<String, String>,
}

impl FlowContext {
    pub fn new(flow_name: impl Into<String>) -> Self {
        Self {
            flow_name: flow_name.into(),
            run_id: Uuid::new_v4(),
            properties: HashMap::new(),
        }
    }

    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties = properties;
        self
    }
}

/// Source of records for a flow
#[async_trait]
pub trait InputSource: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Whether another [`read`](Self::read) would return records
    async fn has_data(&self) -> Result<bool>;

    /// Next batch of records
    async fn read(&self, ctx: &FlowContext) -> Result<Vec<Value>>;

    /// Everything read in this run was delivered
    async fn acknowledge(&self, ctx: &FlowContext) -> Result<()>;

    /// Delivery failed; make the data readable again
    async fn rollback(&self, ctx: &FlowContext) -> Result<()>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// Per-record conversion step
#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &str;

    /// Convert a record; `Ok(None)` drops it from the flow
    async fn transform(&self, record: Value) -> Result<Option<Value>>;

    /// Check the transformer's own configuration
    fn validate(&self) -> ValidationResult {
        ValidationResult::valid()
    }
}

/// Sink for the records of a flow
#[async_trait]
pub trait OutputDestination: Send + Sync {
    fn name(&self) -> &str;

    /// A failing required output fails the flow and rolls back the inputs
    fn is_required(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()>;

    async fn send(&self, ctx: &FlowContext, record: &Value) -> Result<SendResult>;

    /// Send records one by one; partial when only some succeed
    async fn send_batch(&self, ctx: &FlowContext, records: &[Value]) -> Result<SendResult> {
        let mut sent = 0;
        let mut failures = Vec::new();
        for (index, record) in records.iter().enumerate() {
            match self.send(ctx, record).await {
                Ok(result) if result.is_success() => sent += 1,
                Ok(result) => failures.push(format!("record {}: {}", index, result.message)),
                Err(e) => failures.push(format!("record {}: {}", index, e)),
            }
        }
        Ok(match (sent, failures.len()) {
            (_, 0) => SendResult::success(sent),
            (0, failed) => SendResult::failed_records(failed, failures.join("; ")),
            (_, failed) => SendResult::partial(sent, failed, failures.join("; ")),
        })
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

type TransformFn = dyn Fn(Value) -> Result<Option<Value>> + Send + Sync;

/// Transformer backed by a closure
pub struct FnTransformer {
    name: String,
    f: Arc<TransformFn>,
}

impl FnTransformer {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Result<Option<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// Transformer that keeps only records matching `predicate`
    pub fn filter<P>(name: impl Into<String>, predicate: P) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::new(name, move |record| Ok(predicate(&record).then_some(record)))
    }
}

impl std::fmt::Debug for FnTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTransformer").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Transformer for FnTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(&self, record: Value) -> Result<Option<Value>> {
        (self.f)(record)
    }
}

/// Config-driven field mapping for object records
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MappingSpec {
    /// old field name -> new field name
    #[serde(default)]
    pub rename: HashMap<String, String>,
    #[serde(default)]
    pub drop: Vec<String>,
    /// Constant values added to every record
    #[serde(default)]
    pub set: HashMap<String, Value>,
    /// Only these fields survive, when non-empty (applied last)
    #[serde(default)]
    pub keep: Vec<String>,
}

/// Transformer applying a [`MappingSpec`]
#[derive(Debug, Clone)]
pub struct MappingTransformer {
    name: String,
    spec: MappingSpec,
}

impl MappingTransformer {
    pub fn new(name: impl Into<String>, spec: MappingSpec) -> Self {
        Self {
            name: name.into(),
            spec,
        }
    }

    fn apply(&self, mut object: Map<String, Value>) -> Map<String, Value> {
        let mut renames: Vec<(&String, &String)> = self.spec.rename.iter().collect();
        renames.sort();
        for (from, to) in renames {
            if let Some(value) = object.remove(from) {
                object.insert(to.clone(), value);
            }
        }
        for field in &self.spec.drop {
            object.remove(field);
        }
        for (field, value) in &self.spec.set {
            object.insert(field.clone(), value.clone());
        }
        if !self.spec.keep.is_empty() {
            object.retain(|k, _| self.spec.keep.contains(k));
        }
        object
    }
}

#[async_trait]
impl Transformer for MappingTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(&self, record: Value) -> Result<Option<Value>> {
        match record {
            Value::Object(object) => Ok(Some(Value::Object(self.apply(object)))),
            other => Err(IntegrationError::transformation(
                &self.name,
                format!("expected an object record, found {}", crate::schema::model::json_type(&other)),
            )),
        }
    }

    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::valid();
        for (from, to) in &self.spec.rename {
            if self.spec.drop.contains(to) {
                result.add_warning(format!("'{}' is renamed to '{}' which is then dropped", from, to));
            }
            if to.trim().is_empty() {
                result.add_error(format!("rename of '{}' has an empty target", from));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_transformer_filter() {
        let t = FnTransformer::filter("big", |r| r["amount"].as_f64().unwrap_or(0.0) > 10.0);
        assert!(t.transform(json!({"amount": 5})).await.unwrap().is_none());
        assert!(t.transform(json!({"amount": 50})).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_mapping_transformer() {
        let spec: MappingSpec = serde_yaml::from_str(
            "rename: {amt: amount}\ndrop: [internal]\nset: {source: partner}\n",
        )
        .unwrap();
        let t = MappingTransformer::new("map", spec);
        let out = t
            .transform(json!({"id": 1, "amt": 9.5, "internal": true}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, json!({"id": 1, "amount": 9.5, "source": "partner"}));
        assert!(t.validate().is_valid());

        let err = t.transform(json!(42)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transformation);
    }

    #[tokio::test]
    async fn test_mapping_keep() {
        let t = MappingTransformer::new(
            "keep",
            MappingSpec {
                keep: vec!["id".into()],
                ..Default::default()
            },
        );
        let out = t.transform(json!({"id": 1, "x": 2})).await.unwrap().unwrap();
        assert_eq!(out, json!({"id": 1}));
    }

    struct Flaky;

    #[async_trait]
    impl OutputDestination for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _ctx: &FlowContext, record: &Value) -> Result<SendResult> {
            if record["ok"].as_bool().unwrap_or(false) {
                Ok(SendResult::success(1))
            } else {
                Err(IntegrationError::send("flaky", "rejected", 1))
            }
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_default_send_batch_outcomes() {
        let ctx = FlowContext::new("f");
        let ok = json!({"ok": true});
        let bad = json!({"ok": false});

        assert!(Flaky.send_batch(&ctx, &[ok.clone(), ok.clone()]).await.unwrap().is_success());
        let partial = Flaky.send_batch(&ctx, &[ok.clone(), bad.clone()]).await.unwrap();
        assert!(partial.is_partial());
        assert_eq!(partial.records_sent, 1);
        assert_eq!(partial.records_failed, 1);
        assert!(Flaky.send_batch(&ctx, &[bad]).await.unwrap().is_failure());
        assert!(Flaky.send_batch(&ctx, &[]).await.unwrap().is_success());
    }
}
