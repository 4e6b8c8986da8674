//! Central error handling for flows
//!
//! Every error reported by the executor is logged, counted per flow and kept
//! in a bounded log of recent errors. Custom handlers are then consulted in
//! registration order; the first matching one runs, otherwise the fallback.
//! Handler errors and panics never escape [`ErrorHandler::handle`].

use crate::error::{ErrorKind, IntegrationError, Result};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Default capacity of the recent error log
pub const DEFAULT_RECENT_CAPACITY: usize = 100;

type Matcher = Arc<dyn Fn(&IntegrationError) -> bool + Send + Sync>;
type Handler = Arc<dyn Fn(&str, &IntegrationError) -> Result<()> + Send + Sync>;

/// One reported error
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub flow_name: String,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Error counters of a single flow
#[derive(Debug)]
pub struct ErrorStats {
    flow_name: String,
    count: AtomicU64,
    by_kind: Mutex<HashMap<ErrorKind, u64>>,
    last_error: RwLock<Option<(DateTime<Utc>, String)>>,
}

impl ErrorStats {
    fn new(flow_name: &str) -> Self {
        Self {
            flow_name: flow_name.to_string(),
            count: AtomicU64::new(0),
            by_kind: Mutex::new(HashMap::new()),
            last_error: RwLock::new(None),
        }
    }

    fn record(&self, error: &IntegrationError, at: DateTime<Utc>) {
        self.count.fetch_add(1, Ordering::SeqCst);
        *self.by_kind.lock().entry(error.kind()).or_insert(0) += 1;
        *self.last_error.write() = Some((at, error.to_string()));
    }

    pub fn flow_name(&self) -> &str {
        &self.flow_name
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn count_for(&self, kind: ErrorKind) -> u64 {
        self.by_kind.lock().get(&kind).copied().unwrap_or(0)
    }

    pub fn by_kind(&self) -> HashMap<ErrorKind, u64> {
        self.by_kind.lock().clone()
    }

    pub fn last_error_time(&self) -> Option<DateTime<Utc>> {
        self.last_error.read().as_ref().map(|(at, _)| *at)
    }

    pub fn last_error_message(&self) -> Option<String> {
        self.last_error.read().as_ref().map(|(_, msg)| msg.clone())
    }
}

/// Classifies, counts and dispatches flow errors
pub struct ErrorHandler {
    stats: RwLock<HashMap<String, Arc<ErrorStats>>>,
    recent: Mutex<VecDeque<ErrorRecord>>,
    capacity: usize,
    handlers: RwLock<Vec<(Matcher, Handler)>>,
    fallback: RwLock<Option<Handler>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("flows", &self.stats.read().len())
            .field("capacity", &self.capacity)
            .field("handlers", &self.handlers.read().len())
            .finish()
    }
}

impl ErrorHandler {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_RECENT_CAPACITY)
    }

    /// Handler keeping at most `capacity` recent errors
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stats: RwLock::new(HashMap::new()),
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            handlers: RwLock::new(Vec::new()),
            fallback: RwLock::new(None),
        }
    }

    /// Register a handler for errors accepted by `matcher`
    pub fn register<M, H>(&self, matcher: M, handler: H)
    where
        M: Fn(&IntegrationError) -> bool + Send + Sync + 'static,
        H: Fn(&str, &IntegrationError) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.write().push((Arc::new(matcher), Arc::new(handler)));
    }

    /// Register a handler for one error kind
    pub fn on_kind<H>(&self, kind: ErrorKind, handler: H)
    where
        H: Fn(&str, &IntegrationError) -> Result<()> + Send + Sync + 'static,
    {
        self.register(move |e| e.kind() == kind, handler);
    }

    /// Handler used when no registered matcher accepts an error
    pub fn set_fallback<H>(&self, handler: H)
    where
        H: Fn(&str, &IntegrationError) -> Result<()> + Send + Sync + 'static,
    {
        *self.fallback.write() = Some(Arc::new(handler));
    }

    /// Report an error raised while running `flow_name`
    pub fn handle(&self, flow_name: &str, err: &IntegrationError) {
        let now = Utc::now();
        error!(flow = flow_name, kind = %err.kind(), "Flow error: {}", err);
        counter!("flow.errors").increment(1);

        self.stats_entry(flow_name).record(err, now);

        {
            let mut recent = self.recent.lock();
            if self.capacity > 0 {
                while recent.len() >= self.capacity {
                    recent.pop_front();
                }
                recent.push_back(ErrorRecord {
                    flow_name: flow_name.to_string(),
                    kind: err.kind(),
                    message: err.to_string(),
                    timestamp: now,
                });
            }
        }

        // clone out of the lock so handlers may register further handlers
        let matched = self
            .handlers
            .read()
            .iter()
            .find(|(matcher, _)| {
                catch_unwind(AssertUnwindSafe(|| matcher(err))).unwrap_or(false)
            })
            .map(|(_, handler)| handler.clone());
        let Some(handler) = matched.or_else(|| self.fallback.read().clone()) else {
            return;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(flow_name, err))) {
            Ok(Ok(())) => debug!(flow = flow_name, "Error handler completed"),
            Ok(Err(e)) => error!(flow = flow_name, "Error handler failed: {}", e),
            Err(_) => error!(flow = flow_name, "Error handler panicked"),
        }
    }

    fn stats_entry(&self, flow_name: &str) -> Arc<ErrorStats> {
        if let Some(stats) = self.stats.read().get(flow_name) {
            return stats.clone();
        }
        self.stats
            .write()
            .entry(flow_name.to_string())
            .or_insert_with(|| Arc::new(ErrorStats::new(flow_name)))
            .clone()
    }

    pub fn stats(&self, flow_name: &str) -> Option<Arc<ErrorStats>> {
        self.stats.read().get(flow_name).cloned()
    }

    pub fn all_stats(&self) -> Vec<Arc<ErrorStats>> {
        let mut all: Vec<_> = self.stats.read().values().cloned().collect();
        all.sort_by(|a, b| a.flow_name.cmp(&b.flow_name));
        all
    }

    /// Recent errors, oldest first, optionally for one flow
    pub fn recent_errors(&self, flow_name: Option<&str>) -> Vec<ErrorRecord> {
        self.recent
            .lock()
            .iter()
            .filter(|r| flow_name.map_or(true, |f| r.flow_name == f))
            .cloned()
            .collect()
    }

    pub fn clear_stats(&self, flow_name: &str) {
        self.stats.write().remove(flow_name);
    }

    /// Drop every counter and the recent error log
    pub fn clear_all_stats(&self) {
        self.stats.write().clear();
        self.recent.lock().clear();
    }

    pub fn total_error_count(&self) -> u64 {
        self.stats.read().values().map(|s| s.count()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_stats_per_flow() {
        let handler = ErrorHandler::new();
        handler.handle("a", &IntegrationError::connection("down"));
        handler.handle("a", &IntegrationError::connection("down again"));
        handler.handle("b", &IntegrationError::config("bad"));

        let a = handler.stats("a").unwrap();
        assert_eq!(a.count(), 2);
        assert_eq!(a.count_for(ErrorKind::Connection), 2);
        assert!(a.last_error_message().unwrap().contains("down again"));
        assert!(a.last_error_time().is_some());
        assert_eq!(handler.total_error_count(), 3);
        assert_eq!(handler.all_stats().len(), 2);

        handler.clear_stats("a");
        assert!(handler.stats("a").is_none());
        assert_eq!(handler.total_error_count(), 1);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let handler = ErrorHandler::with_capacity(3);
        for i in 0..5 {
            handler.handle("f", &IntegrationError::not_found(format!("item {}", i)));
        }
        let recent = handler.recent_errors(None);
        assert_eq!(recent.len(), 3);
        assert!(recent[0].message.contains("item 2"));
        assert!(recent[2].message.contains("item 4"));
        assert!(handler.recent_errors(Some("other")).is_empty());

        handler.clear_all_stats();
        assert!(handler.recent_errors(None).is_empty());
    }

    #[test]
    fn test_first_matching_handler_wins() {
        let handler = ErrorHandler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let fallback_hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        handler.on_kind(ErrorKind::Connection, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        handler.register(|_| true, |_, _| panic!("must not run"));
        let f = fallback_hits.clone();
        handler.set_fallback(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        handler.handle("f", &IntegrationError::connection("x"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fallback_and_swallowed_failures() {
        let handler = ErrorHandler::new();
        handler.on_kind(ErrorKind::Config, |_, _| panic!("boom"));
        handler.on_kind(ErrorKind::Read, |_, _| Err(IntegrationError::illegal_state("handler broke")));
        let fallback_hits = Arc::new(AtomicUsize::new(0));
        let f = fallback_hits.clone();
        handler.set_fallback(move |_, _| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        handler.handle("f", &IntegrationError::config("x"));
        handler.handle("f", &IntegrationError::read("in", "x"));
        handler.handle("f", &IntegrationError::not_found("x"));
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stats("f").unwrap().count(), 3);
    }
}
