//! Runs a single flow through its lifecycle
//!
//! ```text
//! Idle ─▶ Reading ─▶ Transforming ─▶ Sending ─▶ Acknowledging ─▶ Completed
//!            │            │             │              │
//!            └────────────┴──────┬──────┴──────────────┘
//!                                ▼
//!                        Failed / Cancelled
//! ```
//!
//! Inputs are acknowledged only when every required output reports
//! success; otherwise they are rolled back so the data can be read again.
//! Cancellation is checked between records and between phases. Sends that
//! already reached an output are not undone.

use super::component::{FlowContext, InputSource, OutputDestination, Transformer};
use super::definition::FlowDefinition;
use super::registry::ComponentRegistry;
use super::result::{FlowResult, FlowState, SendResult};
use crate::error::{IntegrationError, Result};
use crate::resilience::ErrorHandler;
use metrics::{counter, histogram};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct ResolvedFlow {
    inputs: Vec<(String, Arc<dyn InputSource>)>,
    transformers: Vec<Arc<dyn Transformer>>,
    outputs: Vec<(String, Arc<dyn OutputDestination>)>,
}

/// Executes flow definitions against the components of a registry
#[derive(Debug, Clone)]
pub struct FlowExecutor {
    registry: Arc<ComponentRegistry>,
    errors: Arc<ErrorHandler>,
}

impl FlowExecutor {
    pub fn new(registry: Arc<ComponentRegistry>, errors: Arc<ErrorHandler>) -> Self {
        Self { registry, errors }
    }

    /// Run `definition` once. Never fails; the outcome is in the result.
    pub async fn execute(
        &self,
        definition: &FlowDefinition,
        ctx: &FlowContext,
        cancel: &CancellationToken,
    ) -> FlowResult {
        let start = Instant::now();
        let mut result = FlowResult::started(&definition.name);
        info!(flow = %definition.name, run_id = %ctx.run_id, "Starting flow");
        counter!("flow.executions.started").increment(1);

        if let Err(e) = self.run(definition, ctx, cancel, &mut result).await {
            result.success = false;
            result.message = e.to_string();
            if matches!(e, IntegrationError::Cancelled(_)) {
                result.state = FlowState::Cancelled;
                warn!(flow = %definition.name, "Flow cancelled in {:?}", start.elapsed());
            } else {
                result.state = FlowState::Failed;
                self.errors.handle(&definition.name, &e);
            }
        }

        result.duration = start.elapsed();
        histogram!("flow.duration_ms").record(result.duration.as_millis() as f64);
        match result.state {
            FlowState::Completed => {
                counter!("flow.executions.success").increment(1);
                info!(
                    flow = %definition.name,
                    read = result.records_read,
                    processed = result.records_processed,
                    failed = result.records_failed,
                    "Flow completed in {:?}",
                    result.duration
                );
            }
            FlowState::Cancelled => counter!("flow.executions.cancelled").increment(1),
            _ => {
                counter!("flow.executions.failure").increment(1);
                error!(flow = %definition.name, "Flow failed: {}", result.message);
            }
        }
        result
    }

    fn resolve(&self, definition: &FlowDefinition) -> Result<ResolvedFlow> {
        let missing = self.registry.missing_components(definition);
        if !missing.is_empty() {
            return Err(IntegrationError::not_found(format!(
                "flow '{}' references unregistered {}",
                definition.name,
                missing.join(", ")
            )));
        }
        // components may be removed concurrently; treat that as missing too
        let gone = |kind: &str, name: &str| {
            IntegrationError::not_found(format!("flow '{}' references unregistered {} '{}'", definition.name, kind, name))
        };
        Ok(ResolvedFlow {
            inputs: definition
                .inputs
                .iter()
                .map(|n| -> Result<(String, Arc<dyn InputSource>)> {
                    Ok((n.clone(), self.registry.input(n).ok_or_else(|| gone("input", n))?))
                })
                .collect::<Result<_>>()?,
            transformers: definition
                .transformers
                .iter()
                .map(|n| self.registry.transformer(n).ok_or_else(|| gone("transformer", n)))
                .collect::<Result<_>>()?,
            outputs: definition
                .outputs
                .iter()
                .map(|n| -> Result<(String, Arc<dyn OutputDestination>)> {
                    Ok((n.clone(), self.registry.output(n).ok_or_else(|| gone("output", n))?))
                })
                .collect::<Result<_>>()?,
        })
    }

    async fn run(
        &self,
        definition: &FlowDefinition,
        ctx: &FlowContext,
        cancel: &CancellationToken,
        result: &mut FlowResult,
    ) -> Result<()> {
        let flow = self.resolve(definition)?;
        let cancelled = || IntegrationError::Cancelled(format!("flow '{}'", definition.name));

        // Reading
        result.state = FlowState::Reading;
        let mut consumed: Vec<Arc<dyn InputSource>> = Vec::new();
        let mut records = Vec::new();
        for (name, input) in &flow.inputs {
            if cancel.is_cancelled() {
                self.rollback_inputs(&consumed, ctx).await;
                return Err(cancelled());
            }
            match read_input(input.as_ref(), ctx, cancel).await {
                Ok(batch) => {
                    debug!(flow = %definition.name, input = %name, "Read {} records", batch.len());
                    records.extend(batch);
                    consumed.push(input.clone());
                }
                Err(e) if definition.fail_on_error || matches!(e, IntegrationError::Cancelled(_)) => {
                    consumed.push(input.clone());
                    self.rollback_inputs(&consumed, ctx).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(flow = %definition.name, input = %name, "Skipping input: {}", e);
                    self.errors.handle(&definition.name, &e);
                    if let Err(e) = input.rollback(ctx).await {
                        warn!(input = %name, "Rollback failed: {}", e);
                    }
                }
            }
        }
        result.records_read = records.len();

        // Transforming
        result.state = FlowState::Transforming;
        let mut processed = Vec::with_capacity(records.len());
        for record in records {
            if cancel.is_cancelled() {
                self.rollback_inputs(&consumed, ctx).await;
                return Err(cancelled());
            }
            match apply_chain(&flow.transformers, record).await {
                Ok(Some(record)) => processed.push(record),
                Ok(None) => {}
                Err(e) if definition.fail_on_error => {
                    self.rollback_inputs(&consumed, ctx).await;
                    return Err(e);
                }
                Err(e) => {
                    debug!(flow = %definition.name, "Skipping record: {}", e);
                    self.errors.handle(&definition.name, &e);
                    result.records_failed += 1;
                }
            }
        }
        result.records_processed = processed.len();

        // Sending
        result.state = FlowState::Sending;
        if processed.is_empty() {
            debug!(flow = %definition.name, "No records to send");
        } else {
            for (name, output) in &flow.outputs {
                if cancel.is_cancelled() {
                    self.rollback_inputs(&consumed, ctx).await;
                    return Err(cancelled());
                }
                let sent = self.send_to(definition, name, output.as_ref(), ctx, &processed).await;
                result.send_results.push((name.clone(), sent));
            }
        }

        let failed_required: Vec<&str> = flow
            .outputs
            .iter()
            .zip(&result.send_results)
            .filter(|((_, output), (_, sent))| output.is_required() && !sent.is_success())
            .map(|((name, _), _)| name.as_str())
            .collect();
        let any_delivered = result
            .send_results
            .iter()
            .any(|(_, sent)| sent.is_success() || sent.is_partial());
        let all_delivered = result.send_results.iter().all(|(_, sent)| sent.is_success());

        if !failed_required.is_empty() {
            self.rollback_inputs(&consumed, ctx).await;
            for (_, output) in &flow.outputs {
                if let Err(e) = output.rollback().await {
                    warn!(output = %output.name(), "Output rollback failed: {}", e);
                }
            }
            result.state = FlowState::Failed;
            result.success = false;
            result.partial = any_delivered;
            result.message = format!("required output(s) failed: {}", failed_required.join(", "));
            return Ok(());
        }

        // Acknowledging
        result.state = FlowState::Acknowledging;
        for input in &consumed {
            if let Err(e) = input.acknowledge(ctx).await {
                warn!(flow = %definition.name, input = %input.name(), "Acknowledge failed: {}", e);
                self.errors.handle(&definition.name, &e);
            }
        }
        for (_, output) in &flow.outputs {
            if let Err(e) = output.commit().await {
                warn!(output = %output.name(), "Commit failed: {}", e);
            }
        }

        result.state = FlowState::Completed;
        result.success = true;
        result.partial = !all_delivered;
        result.message = if all_delivered {
            format!(
                "{} records read, {} processed, {} failed",
                result.records_read, result.records_processed, result.records_failed
            )
        } else {
            "completed; optional output(s) failed".to_string()
        };
        Ok(())
    }

    async fn send_to(
        &self,
        definition: &FlowDefinition,
        name: &str,
        output: &dyn OutputDestination,
        ctx: &FlowContext,
        records: &[Value],
    ) -> SendResult {
        let sent = async {
            output.connect().await?;
            let sent = output.send_batch(ctx, records).await;
            if let Err(e) = output.close().await {
                warn!(output = %name, "Close failed: {}", e);
            }
            sent
        }
        .await;

        match sent {
            Ok(sent) => {
                if !sent.is_success() {
                    warn!(flow = %definition.name, output = %name, "Send incomplete: {}", sent.message);
                }
                sent
            }
            Err(e) => {
                self.errors.handle(&definition.name, &e);
                SendResult::failed_records(records.len(), e.to_string())
                    .with_metadata("error_kind", e.kind().as_str())
            }
        }
    }

    async fn rollback_inputs(&self, inputs: &[Arc<dyn InputSource>], ctx: &FlowContext) {
        for input in inputs {
            if let Err(e) = input.rollback(ctx).await {
                warn!(input = %input.name(), "Rollback failed: {}", e);
            }
        }
    }
}

async fn read_input(input: &dyn InputSource, ctx: &FlowContext, cancel: &CancellationToken) -> Result<Vec<Value>> {
    input.connect().await?;
    let records = async {
        let mut records = Vec::new();
        while input.has_data().await? {
            if cancel.is_cancelled() {
                return Err(IntegrationError::Cancelled(format!("flow '{}'", ctx.flow_name)));
            }
            records.extend(input.read(ctx).await?);
        }
        Ok(records)
    }
    .await;
    if let Err(e) = input.close().await {
        warn!(input = %input.name(), "Close failed: {}", e);
    }
    records
}

async fn apply_chain(transformers: &[Arc<dyn Transformer>], mut record: Value) -> Result<Option<Value>> {
    for transformer in transformers {
        match transformer.transform(record).await? {
            Some(next) => record = next,
            None => return Ok(None),
        }
    }
    Ok(Some(record))
}
