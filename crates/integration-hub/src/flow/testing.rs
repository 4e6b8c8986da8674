//! In-memory components for exercising flows without external systems
//!
//! ```rust,ignore
//! let input = Arc::new(MemoryInput::new("in", vec![json!({"id": 1})]));
//! let output = Arc::new(MemoryOutput::new("out"));
//! engine.registry().register_input("in", input.clone());
//! engine.registry().register_output("out", output.clone());
//!
//! let result = engine.execute_flow("copy").await;
//! assert_eq!(output.records().len(), 1);
//! assert_eq!(input.acknowledged(), 1);
//! ```

use super::component::{FlowContext, InputSource, OutputDestination};
use super::result::SendResult;
use crate::error::{IntegrationError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Input serving a fixed list of records in a single batch.
///
/// Acknowledged records are gone; rolled back records are served again on
/// the next run.
#[derive(Debug)]
pub struct MemoryInput {
    name: String,
    pending: Mutex<Vec<Value>>,
    in_flight: Mutex<Vec<Value>>,
    fail_reads: bool,
    connected: AtomicBool,
    acknowledged: AtomicUsize,
    rolled_back: AtomicUsize,
}

impl MemoryInput {
    pub fn new(name: impl Into<String>, records: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            pending: Mutex::new(records),
            in_flight: Mutex::new(Vec::new()),
            fail_reads: false,
            connected: AtomicBool::new(false),
            acknowledged: AtomicUsize::new(0),
            rolled_back: AtomicUsize::new(0),
        }
    }

    /// Input whose reads always fail
    pub fn failing(name: impl Into<String>) -> Self {
        let mut input = Self::new(name, vec![Value::Null]);
        input.fail_reads = true;
        input
    }

    /// Records not yet acknowledged
    pub fn remaining(&self) -> usize {
        self.pending.lock().len() + self.in_flight.lock().len()
    }

    pub fn acknowledged(&self) -> usize {
        self.acknowledged.load(Ordering::SeqCst)
    }

    pub fn rolled_back(&self) -> usize {
        self.rolled_back.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InputSource for MemoryInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn has_data(&self) -> Result<bool> {
        Ok(!self.pending.lock().is_empty())
    }

    async fn read(&self, _ctx: &FlowContext) -> Result<Vec<Value>> {
        if self.fail_reads {
            return Err(IntegrationError::read(&self.name, "simulated read failure"));
        }
        let batch = std::mem::take(&mut *self.pending.lock());
        self.in_flight.lock().extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn acknowledge(&self, _ctx: &FlowContext) -> Result<()> {
        self.in_flight.lock().clear();
        self.acknowledged.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _ctx: &FlowContext) -> Result<()> {
        let returned = std::mem::take(&mut *self.in_flight.lock());
        let mut pending = self.pending.lock();
        let rest = std::mem::replace(&mut *pending, returned);
        pending.extend(rest);
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Output collecting every record it is sent
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    records: Mutex<Vec<Value>>,
    fail: bool,
    required: bool,
    delay: Option<Duration>,
    connected: AtomicBool,
    batches: AtomicUsize,
}

impl MemoryOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Mutex::new(Vec::new()),
            fail: false,
            required: true,
            delay: None,
            connected: AtomicBool::new(false),
            batches: AtomicUsize::new(0),
        }
    }

    /// Output rejecting every send
    pub fn failing(name: impl Into<String>) -> Self {
        let mut output = Self::new(name);
        output.fail = true;
        output
    }

    /// A failure of this output does not fail the flow
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Sleep before accepting each batch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn records(&self) -> Vec<Value> {
        self.records.lock().clone()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutputDestination for MemoryOutput {
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

    async fn send_batch(&self, _ctx: &FlowContext, records: &[Value]) -> Result<SendResult> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(IntegrationError::send(&self.name, "simulated send failure", records.len()));
        }
        self.records.lock().extend_from_slice(records);
        self.batches.fetch_add(1, Ordering::SeqCst);
        Ok(SendResult::success(records.len()))
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
