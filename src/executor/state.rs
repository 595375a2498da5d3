//! Task execution state tracking
//!
//! Tracks in-flight requests and outcome counters.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::time::Instant;

use crate::protocol::{ExecutionResult, ResultReport};

// ─────────────────────────────────────────────────────────────────
// Task Channel
// ─────────────────────────────────────────────────────────────────

/// Where a task was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskChannel {
    /// Delivered on the push stream
    Push,
    /// Pulled from the backlog
    Poll,
}

impl fmt::Display for TaskChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskChannel::Push => write!(f, "push"),
            TaskChannel::Poll => write!(f, "poll"),
        }
    }
}

/// How an execution ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Capability produced a usable link
    Completed,
    /// Capability failed or transport gave up; a failed result was reported
    Failed,
    /// Dropped before reaching the capability (disabled or no host)
    Abandoned,
}

// ─────────────────────────────────────────────────────────────────
// Pending Request Context
// ─────────────────────────────────────────────────────────────────

/// Per-request data needed to report an outcome
#[derive(Debug, Clone)]
pub struct PendingRequestContext {
    pub request_id: String,
    pub user_id: Option<String>,
    pub original_url: String,
    pub sub_id: String,
    /// Execution host the request was dispatched to
    pub host_id: String,
    pub channel: TaskChannel,
    pub started_at: Instant,
}

impl PendingRequestContext {
    /// Build the `/result` body for this request
    pub fn report(&self, result: ExecutionResult) -> ResultReport {
        ResultReport {
            link: result.link,
            data: result.product_data,
            request_id: self.request_id.clone(),
            sub_id: self.sub_id.clone(),
            original_url: self.original_url.clone(),
            user_id: self.user_id.clone(),
            success: result.success,
            error: result.error,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Tracker
// ─────────────────────────────────────────────────────────────────

/// Snapshot of tracker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub retries: u64,
}

/// Tracks requests between host acquisition and result reporting
#[derive(Default)]
pub struct TaskTracker {
    active: RwLock<HashMap<String, PendingRequestContext>>,
    completed: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU64,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a request. Returns `false` if it is already in flight.
    pub fn begin(&self, ctx: PendingRequestContext) -> bool {
        let mut active = self.active.write();
        if active.contains_key(&ctx.request_id) {
            return false;
        }
        active.insert(ctx.request_id.clone(), ctx);
        true
    }

    /// Stop tracking a request and count its outcome
    pub fn finish(&self, request_id: &str, outcome: TaskOutcome) -> Option<PendingRequestContext> {
        self.record(outcome);
        self.active.write().remove(request_id)
    }

    /// Count an outcome for a request that never got a context
    pub fn record(&self, outcome: TaskOutcome) {
        let counter = match outcome {
            TaskOutcome::Completed => &self.completed,
            TaskOutcome::Failed => &self.failed,
            TaskOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn is_active(&self, request_id: &str) -> bool {
        self.active.read().contains_key(request_id)
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.read().keys().cloned().collect()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            in_flight: self.active.read().len(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
