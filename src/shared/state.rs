//! Process-scoped state shared between the trigger sources and the worker

use crate::bank::QuestionIndex;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The live question index.
///
/// Matching works on a snapshot; a reload swaps the whole `Arc`, so a run in
/// flight keeps seeing the index it started with.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    inner: Arc<RwLock<Arc<QuestionIndex>>>,
}

impl IndexHandle {
    pub fn new(index: QuestionIndex) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(index))),
        }
    }

    pub fn snapshot(&self) -> Arc<QuestionIndex> {
        self.inner.read().clone()
    }

    /// Swap in a new index, returning the previous one
    pub fn replace(&self, index: QuestionIndex) -> Arc<QuestionIndex> {
        std::mem::replace(&mut *self.inner.write(), Arc::new(index))
    }
}

impl Default for IndexHandle {
    fn default() -> Self {
        Self::new(QuestionIndex::empty())
    }
}

/// Counters kept across runs
#[derive(Debug)]
pub struct RuntimeStats {
    started: Instant,
    requests: AtomicU64,
    bank_matches: AtomicU64,
    fallback_requests: AtomicU64,
    failures: AtomicU64,
    collapsed_triggers: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Default for RuntimeStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            bank_matches: AtomicU64::new(0),
            fallback_requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            collapsed_triggers: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }
}

impl RuntimeStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bank_match(&self) {
        self.bank_matches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collapsed(&self) {
        self.collapsed_triggers.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a run-ending failure and remember its message
    pub fn set_error(&self, error: impl Into<String>) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.into());
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.started.elapsed(),
            requests: self.requests.load(Ordering::Relaxed),
            bank_matches: self.bank_matches.load(Ordering::Relaxed),
            fallback_requests: self.fallback_requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            collapsed_triggers: self.collapsed_triggers.load(Ordering::Relaxed),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Point-in-time copy of [`RuntimeStats`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub requests: u64,
    pub bank_matches: u64,
    pub fallback_requests: u64,
    pub failures: u64,
    pub collapsed_triggers: u64,
    pub last_error: Option<String>,
}

impl StatsSnapshot {
    /// Share of requests answered from the bank, in percent
    pub fn match_rate(&self) -> f64 {
        self.bank_matches as f64 / self.requests.max(1) as f64 * 100.0
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime {:.1}s, requests {}, bank matches {} ({:.1}%), fallback hand-offs {}, failures {}, collapsed triggers {}",
            self.uptime.as_secs_f64(),
            self.requests,
            self.bank_matches,
            self.match_rate(),
            self.fallback_requests,
            self.failures,
            self.collapsed_triggers
        )
    }
}
