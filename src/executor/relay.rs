//! Correlation of relayed tasks with host answers
//!
//! Each relayed request registers a single-resolution waiter keyed by
//! `requestId`. The host side resolves it when a matching `RESULT` arrives.
//! Waiters deregister themselves when dropped, so a timed out or abandoned
//! dispatch never leaves a listener behind.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::{ExecutionResult, HostResult};

struct Slot {
    token: u64,
    tx: oneshot::Sender<ExecutionResult>,
}

/// Outstanding relay waiters
#[derive(Default)]
pub struct PendingResponses {
    waiters: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `request_id`. At most one may be outstanding.
    pub fn register(self: &Arc<Self>, request_id: &str) -> Result<ResponseWaiter> {
        let mut waiters = self.waiters.lock();
        if waiters.contains_key(request_id) {
            return Err(Error::DuplicateListener {
                request_id: request_id.to_string(),
            });
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        waiters.insert(request_id.to_string(), Slot { token, tx });

        Ok(ResponseWaiter {
            request_id: request_id.to_string(),
            token,
            rx,
            registry: Arc::clone(self),
        })
    }

    /// Deliver a host answer. Returns `false` when nobody is waiting for it.
    pub fn resolve(&self, answer: HostResult) -> bool {
        let slot = self.waiters.lock().remove(&answer.request_id);
        match slot {
            Some(slot) => slot.tx.send(answer.result).is_ok(),
            None => {
                debug!(request_id = %answer.request_id, "Dropping uncorrelated host result");
                false
            }
        }
    }

    /// Number of registered waiters
    pub fn outstanding(&self) -> usize {
        self.waiters.lock().len()
    }

    fn release(&self, request_id: &str, token: u64) {
        let mut waiters = self.waiters.lock();
        if waiters.get(request_id).is_some_and(|slot| slot.token == token) {
            waiters.remove(request_id);
        }
    }
}

/// Receiving half of a registered waiter
pub struct ResponseWaiter {
    request_id: String,
    token: u64,
    rx: oneshot::Receiver<ExecutionResult>,
    registry: Arc<PendingResponses>,
}

impl ResponseWaiter {
    /// Wait for the correlated answer. Callers bound this with their own deadline.
    pub async fn recv(mut self) -> Result<ExecutionResult> {
        (&mut self.rx)
            .await
            .map_err(|_| Error::host_transport("response channel closed"))
    }
}

impl Drop for ResponseWaiter {
    fn drop(&mut self) {
        self.registry.release(&self.request_id, self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn answer(request_id: &str) -> HostResult {
        HostResult {
            request_id: request_id.to_string(),
            result: ExecutionResult::success("https://s.shp.ee/x", None),
        }
    }

    #[tokio::test]
    async fn test_resolve_delivers_and_cleans_up() {
        let pending = Arc::new(PendingResponses::new());
        let waiter = pending.register("r1").unwrap();
        assert_eq!(pending.outstanding(), 1);

        assert!(pending.resolve(answer("r1")));
        let result = waiter.recv().await.unwrap();
        assert!(result.is_usable());
        assert_eq!(pending.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let pending = Arc::new(PendingResponses::new());
        let _first = pending.register("r1").unwrap();
        assert!(matches!(
            pending.register("r1"),
            Err(Error::DuplicateListener { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_waiter() {
        let pending = Arc::new(PendingResponses::new());
        let waiter = pending.register("r1").unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(15), waiter.recv()).await;
        assert!(waited.is_err());
        assert_eq!(pending.outstanding(), 0);

        // a late answer finds nobody
        assert!(!pending.resolve(answer("r1")));
    }

    #[tokio::test]
    async fn test_dropped_waiter_deregisters() {
        let pending = Arc::new(PendingResponses::new());
        let waiter = pending.register("r1").unwrap();
        drop(waiter);
        assert_eq!(pending.outstanding(), 0);
        assert!(pending.register("r1").is_ok());
    }

    #[tokio::test]
    async fn test_stale_drop_keeps_newer_waiter() {
        let pending = Arc::new(PendingResponses::new());
        let first = pending.register("r1").unwrap();
        assert!(pending.resolve(answer("r1")));

        let _second = pending.register("r1").unwrap();
        drop(first);
        assert_eq!(pending.outstanding(), 1);
    }
}
