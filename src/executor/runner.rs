//! Task execution runner
//!
//! Takes a deduplicated task through host acquisition, capability dispatch
//! (with bounded wait and transport retry) and result reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::TaskHandler;
use super::relay::PendingResponses;
use super::state::{PendingRequestContext, TaskChannel, TaskOutcome, TaskTracker};
use crate::config::{DispatchStrategy, ExecutorSettings};
use crate::coordinator::ResultReporter;
use crate::error::{Error, Result};
use crate::host::{CapabilityRequest, ExecutionHost, HostManager};
use crate::lifecycle::EnabledFlag;
use crate::protocol::{ExecutionResult, Task};

// ─────────────────────────────────────────────────────────────────
// Executor Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for the task executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How requests reach the capability
    pub strategy: DispatchStrategy,

    /// Upper bound on one capability call
    pub response_timeout: Duration,

    /// Wait after reloading the host before retrying
    pub retry_settle: Duration,

    /// Retries after a transport failure
    pub max_transport_retries: u32,

    /// Prefix of generated sub ids
    pub sub_id_prefix: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&ExecutorSettings::default())
    }
}

impl From<&ExecutorSettings> for ExecutorConfig {
    fn from(settings: &ExecutorSettings) -> Self {
        Self {
            strategy: settings.strategy,
            response_timeout: Duration::from_millis(settings.response_timeout_ms),
            retry_settle: Duration::from_millis(settings.retry_settle_ms),
            max_transport_retries: settings.max_transport_retries,
            sub_id_prefix: settings.sub_id_prefix.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Task Executor
// ─────────────────────────────────────────────────────────────────

/// Runs tasks against the execution host and reports their outcome
pub struct TaskExecutor {
    config: ExecutorConfig,
    hosts: Arc<HostManager>,
    responses: Arc<PendingResponses>,
    reporter: Arc<ResultReporter>,
    flag: EnabledFlag,
    tracker: Arc<TaskTracker>,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        hosts: Arc<HostManager>,
        responses: Arc<PendingResponses>,
        reporter: Arc<ResultReporter>,
        flag: EnabledFlag,
    ) -> Self {
        Self {
            config,
            hosts,
            responses,
            reporter,
            flag,
            tracker: Arc::new(TaskTracker::new()),
        }
    }

    pub fn tracker(&self) -> Arc<TaskTracker> {
        Arc::clone(&self.tracker)
    }

    /// Execute one task end to end
    pub async fn execute(&self, task: Task, channel: TaskChannel) -> TaskOutcome {
        let request_id = task.request_id.clone();

        if !self.flag.is_enabled() {
            debug!(request_id = %request_id, "Worker disabled, skipping task");
            self.tracker.record(TaskOutcome::Abandoned);
            return TaskOutcome::Abandoned;
        }

        let host = match self.hosts.acquire().await {
            Ok(host) => host,
            Err(e) => {
                error!(request_id = %request_id, error = %e.format_for_log(), "No execution host, abandoning task");
                self.tracker.record(TaskOutcome::Abandoned);
                return TaskOutcome::Abandoned;
            }
        };

        let ctx = PendingRequestContext {
            request_id: request_id.clone(),
            user_id: task.user_id.clone(),
            original_url: task.original_url.clone(),
            sub_id: generate_sub_id(&self.config.sub_id_prefix),
            host_id: host.id().to_string(),
            channel,
            started_at: Instant::now(),
        };
        if !self.tracker.begin(ctx.clone()) {
            warn!(request_id = %request_id, "Request already in flight, skipping");
            return TaskOutcome::Abandoned;
        }

        let request = CapabilityRequest {
            item_id: task.item_id,
            shop_id: task.shop_id,
            sub_id: ctx.sub_id.clone(),
            original_url: task.original_url,
        };

        let Some(result) = self.run_with_retry(&request_id, host, &request).await else {
            info!(request_id = %request_id, "Worker disabled before dispatch, task dropped");
            self.tracker.finish(&request_id, TaskOutcome::Abandoned);
            return TaskOutcome::Abandoned;
        };

        let outcome = if result.is_usable() {
            info!(
                request_id = %request_id,
                sub_id = %ctx.sub_id,
                elapsed_ms = ctx.elapsed_ms(),
                "Link generated"
            );
            TaskOutcome::Completed
        } else {
            warn!(
                request_id = %request_id,
                error = result.error.as_deref().unwrap_or("no link returned"),
                "Link generation failed"
            );
            TaskOutcome::Failed
        };

        self.reporter.report(&ctx.report(result)).await;
        self.tracker.finish(&request_id, outcome);
        outcome
    }

    /// Dispatch with transport retry. `None` means the worker was disabled
    /// before the request reached the capability.
    async fn run_with_retry(
        &self,
        request_id: &str,
        host: Arc<dyn ExecutionHost>,
        request: &CapabilityRequest,
    ) -> Option<ExecutionResult> {
        let mut retries = 0;

        loop {
            if !self.flag.is_enabled() {
                return None;
            }

            match self.dispatch(request_id, host.as_ref(), request).await {
                Ok(result) => return Some(result),
                Err(e) if e.is_transport() && retries < self.config.max_transport_retries => {
                    retries += 1;
                    self.tracker.record_retry();
                    warn!(
                        request_id = %request_id,
                        host_id = %host.id(),
                        attempt = retries,
                        error = %e,
                        "Transport failure, reloading host before retry"
                    );
                    if let Err(reload_err) = host.reload().await {
                        warn!(host_id = %host.id(), error = %reload_err, "Host reload failed");
                    }
                    tokio::time::sleep(self.config.retry_settle).await;
                }
                Err(e) => {
                    error!(request_id = %request_id, error = %e.format_for_log(), "Execution failed");
                    return Some(ExecutionResult::failure(e.to_string()));
                }
            }
        }
    }

    async fn dispatch(
        &self,
        request_id: &str,
        host: &dyn ExecutionHost,
        request: &CapabilityRequest,
    ) -> Result<ExecutionResult> {
        let timeout = self.config.response_timeout;
        let timed_out = || Error::ResponseTimeout {
            request_id: request_id.to_string(),
            timeout_secs: timeout.as_secs(),
        };

        match self.config.strategy {
            DispatchStrategy::Direct => tokio::time::timeout(timeout, host.generate_offer_link(request))
                .await
                .map_err(|_| timed_out())?,
            DispatchStrategy::Relay => {
                // registered before sending so a fast answer is not lost
                let waiter = self.responses.register(request_id)?;
                let task = request.to_host_task(request_id);
                // one deadline covers both the send and the answer
                tokio::time::timeout(timeout, async {
                    host.relay(&task).await?;
                    waiter.recv().await
                })
                .await
                .map_err(|_| timed_out())?
            }
        }
    }
}

#[async_trait]
impl TaskHandler for TaskExecutor {
    async fn handle(&self, task: Task, channel: TaskChannel) {
        self.execute(task, channel).await;
    }
}

/// Attribution token: prefix plus 8 random alphanumerics
fn generate_sub_id(prefix: &str) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix, &random[..8])
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
