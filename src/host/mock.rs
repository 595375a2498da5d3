//! Scripted execution hosts for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::traits::{CapabilityRequest, ExecutionHost, HostProvider};
use crate::error::{Error, Result};
use crate::executor::PendingResponses;
use crate::protocol::{ExecutionResult, HostResult, HostTask};

/// What the host does with the next call
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Answer with this result
    Respond(ExecutionResult),
    /// Never answer
    Silent,
    /// Fail the call itself
    Fail,
    /// Succeed after this delay. Relayed answers arrive the same delay later.
    Slow(Duration),
}

pub struct MockHost {
    id: String,
    ready: AtomicBool,
    script: Mutex<VecDeque<Scripted>>,
    calls: AtomicUsize,
    reloads: AtomicUsize,
    responses: Mutex<Option<Arc<PendingResponses>>>,
}

impl MockHost {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ready: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            responses: Mutex::new(None),
        })
    }

    /// Queue behaviors for upcoming calls. An empty script answers with success.
    pub fn script(&self, steps: impl IntoIterator<Item = Scripted>) {
        self.script.lock().extend(steps);
    }

    /// Route relayed answers into `responses`
    pub fn relay_into(&self, responses: Arc<PendingResponses>) {
        *self.responses.lock() = Some(responses);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Scripted {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Scripted::Respond(mock_link()))
    }
}

fn mock_link() -> ExecutionResult {
    ExecutionResult::success("https://s.shp.ee/mock", None)
}

#[async_trait]
impl ExecutionHost for MockHost {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn generate_offer_link(&self, _request: &CapabilityRequest) -> Result<ExecutionResult> {
        match self.next_step() {
            Scripted::Respond(result) => Ok(result),
            Scripted::Silent => std::future::pending().await,
            Scripted::Fail => Err(Error::host_transport("mock host unreachable")),
            Scripted::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(mock_link())
            }
        }
    }

    async fn relay(&self, task: &HostTask) -> Result<()> {
        let (result, delay) = match self.next_step() {
            Scripted::Respond(result) => (result, Duration::ZERO),
            Scripted::Silent => return Ok(()),
            Scripted::Fail => return Err(Error::host_transport("mock host unreachable")),
            Scripted::Slow(delay) => {
                tokio::time::sleep(delay).await;
                (mock_link(), delay)
            }
        };

        let responses = self.responses.lock().clone();
        if let Some(responses) = responses {
            let answer = HostResult {
                request_id: task.request_id.clone(),
                result,
            };
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                responses.resolve(answer);
            });
        }
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockProvider {
    hosts: Mutex<Vec<Arc<MockHost>>>,
    provisions: AtomicUsize,
    fail_provision: AtomicBool,
    unready: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_host(&self, host: Arc<MockHost>) {
        self.hosts.lock().push(host);
    }

    pub fn fail_provision(&self) {
        self.fail_provision.store(true, Ordering::SeqCst);
    }

    /// Provisioned hosts never report ready
    pub fn provision_unready(&self) {
        self.unready.store(true, Ordering::SeqCst);
    }

    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HostProvider for MockProvider {
    async fn find(&self, _pattern: &str) -> Result<Option<Arc<dyn ExecutionHost>>> {
        Ok(self
            .hosts
            .lock()
            .first()
            .map(|h| Arc::clone(h) as Arc<dyn ExecutionHost>))
    }

    async fn provision(&self, _url: &str) -> Result<Arc<dyn ExecutionHost>> {
        let n = self.provisions.fetch_add(1, Ordering::SeqCst);
        // opening a tab takes a moment
        tokio::time::sleep(Duration::from_millis(200)).await;

        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(Error::connection_failed("mock://json/new", "browser not running"));
        }

        let host = MockHost::new(&format!("provisioned-{}", n));
        host.set_ready(!self.unready.load(Ordering::SeqCst));
        self.hosts.lock().push(Arc::clone(&host));
        Ok(host)
    }
}
