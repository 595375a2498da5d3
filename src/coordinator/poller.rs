//! Fallback poller
//!
//! Pulls the coordinator backlog, covering tasks the push stream missed
//! while disconnected (and serving poll-only deployments).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::client::CoordinatorApi;
use crate::executor::{Admission, Dispatcher, TaskChannel};

pub struct Poller {
    api: Arc<dyn CoordinatorApi>,
    dispatcher: Arc<Dispatcher>,
}

impl Poller {
    pub fn new(api: Arc<dyn CoordinatorApi>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { api, dispatcher }
    }

    /// One pull. Returns how many tasks were accepted for execution.
    pub async fn poll(&self) -> usize {
        let tasks = match self.api.fetch_pending().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Backlog poll failed");
                return 0;
            }
        };

        if tasks.is_empty() {
            return 0;
        }

        debug!(count = tasks.len(), "Backlog received");
        tasks
            .into_iter()
            .map(|task| self.dispatcher.submit(task, TaskChannel::Poll))
            .filter(|admission| *admission == Admission::Accepted)
            .count()
    }

    /// Poll every `period`, starting one period from now
    pub fn spawn_schedule(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poller.poll().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::mock::{task, MockCoordinator};
    use crate::executor::RecordingHandler;
    use crate::lifecycle::EnabledFlag;

    fn setup() -> (Arc<Poller>, Arc<MockCoordinator>, Arc<RecordingHandler>, Arc<Dispatcher>) {
        let api = Arc::new(MockCoordinator::new());
        let handler = Arc::new(RecordingHandler::default());
        let dispatcher = Arc::new(Dispatcher::new(handler.clone(), EnabledFlag::in_memory(true)));
        let poller = Arc::new(Poller::new(api.clone(), dispatcher.clone()));
        (poller, api, handler, dispatcher)
    }

    #[tokio::test]
    async fn test_backlog_dispatched_once() {
        let (poller, api, handler, dispatcher) = setup();
        api.set_backlog(vec![task("r1")]);

        assert_eq!(poller.poll().await, 1);
        // the coordinator keeps returning it until the result lands
        assert_eq!(poller.poll().await, 0);
        tokio::task::yield_now().await;

        assert_eq!(handler.seen.lock().len(), 1);
        assert!(dispatcher.has_seen("r1"));
    }

    #[tokio::test]
    async fn test_fetch_error_swallowed() {
        let (poller, api, handler, _dispatcher) = setup();
        api.fail_fetch(true);

        assert_eq!(poller.poll().await, 0);
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_polls_on_period() {
        let (poller, api, _handler, _dispatcher) = setup();
        let schedule = poller.spawn_schedule(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(api.poll_count(), 0);

        tokio::time::sleep(Duration::from_secs(62)).await;
        assert_eq!(api.poll_count(), 2);

        schedule.abort();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(api.poll_count(), 2);
    }
}
