//! Dedup gate between the task sources and the executor
//!
//! Both the push stream and the poller submit here. A request id is
//! executed at most once while it is remembered by the cache.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::dedup::DedupCache;
use super::state::TaskChannel;
use crate::lifecycle::EnabledFlag;
use crate::protocol::Task;

/// Receives tasks that passed the gate
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: Task, channel: TaskChannel);
}

/// Why a submission was not executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Disabled,
    Duplicate,
    Ignored,
}

pub struct Dispatcher {
    cache: Mutex<DedupCache>,
    handler: Arc<dyn TaskHandler>,
    flag: EnabledFlag,
    accepted: AtomicU64,
    duplicates: AtomicU64,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn TaskHandler>, flag: EnabledFlag) -> Self {
        Self {
            cache: Mutex::new(DedupCache::default()),
            handler,
            flag,
            accepted: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Gate one task and start its execution in the background
    pub fn submit(&self, task: Task, channel: TaskChannel) -> Admission {
        if !task.is_dispatchable() {
            debug!(request_id = %task.request_id, task_type = %task.kind, "Ignoring non-dispatchable task");
            return Admission::Ignored;
        }

        // Checked before the cache so tasks seen while disabled can be redelivered later
        if !self.flag.is_enabled() {
            debug!(request_id = %task.request_id, "Worker disabled, not dispatching");
            return Admission::Disabled;
        }

        if !self.cache.lock().insert(&task.request_id) {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = %task.request_id, channel = %channel, "Duplicate task dropped");
            return Admission::Duplicate;
        }

        self.accepted.fetch_add(1, Ordering::Relaxed);
        info!(
            request_id = %task.request_id,
            item_id = %task.item_id,
            channel = %channel,
            "Task accepted"
        );

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            handler.handle(task, channel).await;
        });

        Admission::Accepted
    }

    /// Number of tasks handed to the executor
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn has_seen(&self, request_id: &str) -> bool {
        self.cache.lock().contains(request_id)
    }
}

/// Records handled tasks, for tests
#[cfg(test)]
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<(String, TaskChannel)>>,
}

#[cfg(test)]
#[async_trait]
impl TaskHandler for RecordingHandler {
    async fn handle(&self, task: Task, channel: TaskChannel) {
        self.seen.lock().push((task.request_id, channel));
    }
}
