// src/progress.rs

//! Progress tracking for fetch and setup runs
//!
//! The tracker is a per-origin activity set: every origin (a human-readable
//! string naming one tree request) is started at most once when real work
//! begins and stopped exactly once on the success path. Counters feed the
//! end-of-run summary; nothing here is persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::info;

/// Per-origin task activity tracker
#[derive(Debug, Default)]
pub struct TaskTracker {
    active: Mutex<HashMap<String, u32>>,
    started: AtomicU64,
    stopped: AtomicU64,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that work for `origin` has started.
    pub fn start(&self, origin: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active.entry(origin.to_string()).or_insert(0) += 1;
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record that work for `origin` finished successfully.
    pub fn stop(&self, origin: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.get_mut(origin) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                active.remove(origin);
            }
            None => {}
        }
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of origins currently in flight.
    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// One currently-active origin, if any, for display.
    pub fn sample(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .next()
            .cloned()
    }

    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn stopped_count(&self) -> u64 {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Counters summarizing a setup or fetch run
#[derive(Debug, Default)]
pub struct SetupStats {
    /// Roots already present in the local Git store.
    cache_hits: AtomicU64,
    /// Roots materialized by fetching or importing content.
    fetched: AtomicU64,
    /// Generator commands executed.
    executed: AtomicU64,
}

impl SetupStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }

    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Log the end-of-run summary.
    pub fn report(&self) {
        info!(
            "{} cache hits, {} fetched, {} commands executed",
            self.cache_hits(),
            self.fetched(),
            self.executed()
        );
    }
}
