//! Integration engine: the entry point for running flows
//!
//! The engine owns the [`ComponentRegistry`], the shared [`ErrorHandler`]
//! and a worker pool for background runs. Each flow may run at most
//! `max_concurrent` times at once; further runs are rejected.
//!
//! ```rust,ignore
//! let engine = IntegrationEngine::new().with_worker_pool_size(4);
//! engine.registry().register_input("inbox", Arc::new(inbox));
//! engine.registry().register_output("billing", Arc::new(billing));
//! engine.registry().register_flow(flow);
//!
//! let result = engine.execute_flow("nightly-claims").await;
//! let handle = engine.execute_flow_async("hourly-sync");
//! handle.cancel();
//! let result = handle.join().await;
//! ```

use super::component::FlowContext;
use super::definition::FlowDefinition;
use super::executor::FlowExecutor;
use super::registry::ComponentRegistry;
use super::result::{FlowResult, FlowState, ValidationResult};
use crate::error::{IntegrationError, Result};
use crate::resilience::ErrorHandler;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default number of flows running in the background at once
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Snapshot of engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatistics {
    pub registered_flows: usize,
    pub registered_inputs: usize,
    pub registered_transformers: usize,
    pub registered_outputs: usize,
    pub running_flows: usize,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub total_errors: u64,
}

/// An active run of a flow
#[derive(Debug, Clone, Serialize)]
pub struct RunningFlow {
    pub flow_name: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

struct ActiveRun {
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

struct EngineInner {
    registry: Arc<ComponentRegistry>,
    errors: Arc<ErrorHandler>,
    executor: FlowExecutor,
    workers: Arc<Semaphore>,
    worker_pool_size: usize,
    max_queue: Option<usize>,
    queued: AtomicUsize,
    running: Mutex<HashMap<String, HashMap<Uuid, ActiveRun>>>,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Removes a run from the active set when dropped
struct RunGuard {
    inner: Arc<EngineInner>,
    flow_name: String,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.inner.running.lock();
        if let Some(runs) = running.get_mut(&self.flow_name) {
            runs.remove(&self.run_id);
            if runs.is_empty() {
                running.remove(&self.flow_name);
            }
        }
    }
}

impl EngineInner {
    fn record(&self, result: &FlowResult) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        if result.success {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reject(&self, flow_name: &str, error: IntegrationError) -> FlowResult {
        self.errors.handle(flow_name, &error);
        let result = FlowResult::rejected(flow_name, error.to_string());
        self.record(&result);
        result
    }
}

/// Handle to a flow started with [`IntegrationEngine::execute_flow_async`]
#[derive(Debug)]
pub struct FlowHandle {
    flow_name: String,
    run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<FlowResult>,
}

impl FlowHandle {
    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Ask the run to stop at its next checkpoint
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finish
    pub async fn join(self) -> FlowResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) => FlowResult::rejected(&self.flow_name, format!("flow task failed: {}", e)),
        }
    }
}

/// Runs registered flows
#[derive(Clone)]
pub struct IntegrationEngine {
    inner: Arc<EngineInner>,
}

impl Default for IntegrationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IntegrationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrationEngine")
            .field("worker_pool_size", &self.inner.worker_pool_size)
            .field("flows", &self.inner.registry.flow_count())
            .field("running", &self.inner.running.lock().len())
            .finish()
    }
}

impl IntegrationEngine {
    pub fn new() -> Self {
        Self::with_parts(
            Arc::new(ComponentRegistry::new()),
            Arc::new(ErrorHandler::new()),
            DEFAULT_WORKER_POOL_SIZE,
        )
    }

    /// Engine over an existing registry and error handler
    pub fn with_parts(registry: Arc<ComponentRegistry>, errors: Arc<ErrorHandler>, worker_pool_size: usize) -> Self {
        Self::build(registry, errors, worker_pool_size, None)
    }

    fn build(
        registry: Arc<ComponentRegistry>,
        errors: Arc<ErrorHandler>,
        worker_pool_size: usize,
        max_queue: Option<usize>,
    ) -> Self {
        let worker_pool_size = worker_pool_size.max(1);
        Self {
            inner: Arc::new(EngineInner {
                executor: FlowExecutor::new(registry.clone(), errors.clone()),
                registry,
                errors,
                workers: Arc::new(Semaphore::new(worker_pool_size)),
                worker_pool_size,
                max_queue,
                queued: AtomicUsize::new(0),
                running: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn with_worker_pool_size(self, size: usize) -> Self {
        Self::build(
            self.inner.registry.clone(),
            self.inner.errors.clone(),
            size,
            self.inner.max_queue,
        )
    }

    /// Reject background runs while this many are already waiting for a worker
    pub fn with_max_queue(self, max_queue: usize) -> Self {
        Self::build(
            self.inner.registry.clone(),
            self.inner.errors.clone(),
            self.inner.worker_pool_size,
            Some(max_queue),
        )
    }

    /// Background runs waiting for a worker
    pub fn queued(&self) -> usize {
        self.inner.queued.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.inner.registry
    }

    pub fn error_handler(&self) -> &Arc<ErrorHandler> {
        &self.inner.errors
    }

    pub fn worker_pool_size(&self) -> usize {
        self.inner.worker_pool_size
    }

    /// Register a run, enforcing the flow's concurrency limit
    fn begin_run(&self, definition: &FlowDefinition, run_id: Uuid) -> Result<(RunGuard, CancellationToken)> {
        let mut running = self.inner.running.lock();
        let runs = running.entry(definition.name.clone()).or_default();
        if runs.len() >= definition.max_concurrent {
            return Err(IntegrationError::illegal_state(format!(
                "flow '{}' is already running ({} of {} allowed)",
                definition.name,
                runs.len(),
                definition.max_concurrent
            )));
        }
        let cancel = self.inner.shutdown.child_token();
        runs.insert(
            run_id,
            ActiveRun {
                started_at: Utc::now(),
                cancel: cancel.clone(),
            },
        );
        Ok((
            RunGuard {
                inner: self.inner.clone(),
                flow_name: definition.name.clone(),
                run_id,
            },
            cancel,
        ))
    }

    /// Resolve a flow and reserve a run slot for it
    fn prepare(&self, flow_name: &str) -> Result<(Arc<FlowDefinition>, FlowContext, RunGuard, CancellationToken)> {
        if self.inner.shutdown.is_cancelled() {
            return Err(IntegrationError::illegal_state("engine is shut down"));
        }
        let definition = self
            .inner
            .registry
            .flow(flow_name)
            .ok_or_else(|| IntegrationError::not_found(format!("flow '{}'", flow_name)))?;
        if !definition.enabled {
            return Err(IntegrationError::illegal_state(format!("flow '{}' is disabled", flow_name)));
        }
        let ctx = FlowContext::new(flow_name).with_properties(definition.properties.clone());
        let (guard, cancel) = self.begin_run(&definition, ctx.run_id)?;
        Ok((definition, ctx, guard, cancel))
    }

    /// Run a flow on the calling task and wait for it
    pub async fn execute_flow(&self, flow_name: &str) -> FlowResult {
        let (definition, ctx, _guard, cancel) = match self.prepare(flow_name) {
            Ok(prepared) => prepared,
            Err(e) => return self.inner.reject(flow_name, e),
        };
        let result = self.inner.executor.execute(&definition, &ctx, &cancel).await;
        self.inner.record(&result);
        result
    }

    /// Run a flow on the worker pool
    pub fn execute_flow_async(&self, flow_name: &str) -> FlowHandle {
        let flow_name = flow_name.to_string();
        let prepared = match self.inner.max_queue {
            Some(max) if self.inner.queued.load(Ordering::SeqCst) >= max => Err(IntegrationError::illegal_state(
                format!("worker queue is full ({} waiting)", max),
            )),
            _ => self.prepare(&flow_name),
        };
        let (definition, ctx, guard, cancel) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let result = self.inner.reject(&flow_name, e);
                return FlowHandle {
                    flow_name,
                    run_id: Uuid::new_v4(),
                    cancel: CancellationToken::new(),
                    join: tokio::spawn(async move { result }),
                };
            }
        };

        let run_id = ctx.run_id;
        let inner = self.inner.clone();
        let token = cancel.clone();
        inner.queued.fetch_add(1, Ordering::SeqCst);
        let join = tokio::spawn(async move {
            let _guard = guard;
            let permit = tokio::select! {
                permit = inner.workers.clone().acquire_owned() => {
                    inner.queued.fetch_sub(1, Ordering::SeqCst);
                    permit
                }
                _ = token.cancelled() => {
                    inner.queued.fetch_sub(1, Ordering::SeqCst);
                    let mut result = FlowResult::rejected(&definition.name, "cancelled before start");
                    result.state = FlowState::Cancelled;
                    inner.record(&result);
                    return result;
                }
            };
            let Ok(_permit) = permit else {
                return inner.reject(&definition.name, IntegrationError::illegal_state("worker pool is closed"));
            };
            debug!(flow = %definition.name, run_id = %run_id, "Worker acquired");
            let result = inner.executor.execute(&definition, &ctx, &token).await;
            inner.record(&result);
            result
        });

        FlowHandle {
            flow_name,
            run_id,
            cancel,
            join,
        }
    }

    /// Cancel every active run of a flow; returns how many were signalled
    pub fn cancel_flow(&self, flow_name: &str) -> usize {
        let running = self.inner.running.lock();
        let Some(runs) = running.get(flow_name) else {
            return 0;
        };
        for run in runs.values() {
            run.cancel.cancel();
        }
        info!(flow = flow_name, "Cancelled {} run(s)", runs.len());
        runs.len()
    }

    /// Run every enabled flow on the worker pool, results in flow-name order
    pub async fn execute_all_flows(&self) -> Vec<FlowResult> {
        let handles: Vec<FlowHandle> = self
            .inner
            .registry
            .flows()
            .into_iter()
            .filter(|f| f.enabled)
            .map(|f| self.execute_flow_async(&f.name))
            .collect();
        futures::future::join_all(handles.into_iter().map(FlowHandle::join)).await
    }

    /// Check a flow's definition and wiring without running it
    ///
    /// An unknown flow is reported as an invalid result, never as an error.
    pub fn validate_flow(&self, flow_name: &str) -> ValidationResult {
        let Some(definition) = self.inner.registry.flow(flow_name) else {
            return ValidationResult::invalid(format!("flow definition not found: {}", flow_name));
        };

        let mut result = ValidationResult::valid();
        if let Err(e) = definition.check() {
            result.add_error(e.to_string());
        }
        if definition.inputs.is_empty() {
            result.add_error("flow has no inputs");
        }
        if definition.outputs.is_empty() {
            result.add_error("flow has no outputs");
        }
        for missing in self.inner.registry.missing_components(&definition) {
            result.add_error(format!("missing {}", missing));
        }
        for name in &definition.transformers {
            if let Some(transformer) = self.inner.registry.transformer(name) {
                result = result.merge(transformer.validate());
            }
        }
        if !definition.enabled {
            result.add_warning("flow is disabled");
        }
        result
    }

    /// Active runs, ordered by flow name then start time
    pub fn running_flows(&self) -> Vec<RunningFlow> {
        let running = self.inner.running.lock();
        let mut flows: Vec<RunningFlow> = running
            .iter()
            .flat_map(|(name, runs)| {
                runs.iter().map(move |(run_id, run)| RunningFlow {
                    flow_name: name.clone(),
                    run_id: *run_id,
                    started_at: run.started_at,
                })
            })
            .collect();
        flows.sort_by(|a, b| a.flow_name.cmp(&b.flow_name).then(a.started_at.cmp(&b.started_at)));
        flows
    }

    pub fn is_running(&self, flow_name: &str) -> bool {
        self.inner.running.lock().contains_key(flow_name)
    }

    pub fn statistics(&self) -> EngineStatistics {
        let registry = &self.inner.registry;
        EngineStatistics {
            registered_flows: registry.flow_count(),
            registered_inputs: registry.input_count(),
            registered_transformers: registry.transformer_count(),
            registered_outputs: registry.output_count(),
            running_flows: self.inner.running.lock().values().map(HashMap::len).sum(),
            total_executions: self.inner.counters.total.load(Ordering::Relaxed),
            successful_executions: self.inner.counters.succeeded.load(Ordering::Relaxed),
            failed_executions: self.inner.counters.failed.load(Ordering::Relaxed),
            total_errors: self.inner.errors.total_error_count(),
        }
    }

    /// Whether the engine accepts new runs
    pub fn is_ready(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Stop accepting runs and cancel the active ones
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let active = self.statistics().running_flows;
        if active > 0 {
            warn!("Shutting down with {} active run(s)", active);
        }
        self.inner.shutdown.cancel();
        self.inner.workers.close();
        info!("Integration engine shut down");
    }
}
