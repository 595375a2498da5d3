//! Push stream connector
//!
//! Keeps one Server-Sent Events subscription to the coordinator open:
//! - Watchdog for streams that go silent without an error
//! - Fixed-delay reconnection
//! - Reconciling poll after every successful open
//!
//! State machine:
//! `Disconnected --connect--> Connecting --open--> Connected
//!  --error|eof|watchdog--> Reconnecting --timer--> Connecting`.
//! A failed open goes straight to `Reconnecting`. `disable` returns to
//! `Disconnected` from anywhere and cancels every timer.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::client::CoordinatorApi;
use super::poller::Poller;
use crate::config::CoordinatorSettings;
use crate::executor::{Dispatcher, TaskChannel};
use crate::lifecycle::EnabledFlag;
use crate::protocol::StreamMessage;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Timings for the push connection
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Delay before reconnecting after a failure
    pub reconnect_delay: Duration,

    /// Silence longer than this counts as a stalled stream
    pub watchdog_silence: Duration,

    /// Watchdog check period
    pub watchdog_check: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::from(&CoordinatorSettings::default())
    }
}

impl From<&CoordinatorSettings> for ConnectorConfig {
    fn from(settings: &CoordinatorSettings) -> Self {
        Self {
            reconnect_delay: settings.reconnect_delay(),
            watchdog_silence: settings.watchdog_silence(),
            watchdog_check: settings.watchdog_check(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connection State
// ─────────────────────────────────────────────────────────────────

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected, nothing scheduled
    #[default]
    Disconnected,
    /// Opening the stream
    Connecting,
    /// Stream open
    Connected,
    /// Waiting for the reconnect timer
    Reconnecting,
}

struct ConnectorState {
    connection: ConnectionState,

    /// Bumped on every open attempt and on disable. Callbacks carrying an
    /// older generation belong to a superseded subscription.
    generation: u64,

    subscription: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,

    last_message: Instant,
}

impl ConnectorState {
    fn teardown(&mut self) {
        if let Some(handle) = self.subscription.take() {
            handle.abort();
        }
        if let Some(handle) = self.watchdog.take() {
            handle.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────

pub struct Connector {
    api: Arc<dyn CoordinatorApi>,
    dispatcher: Arc<Dispatcher>,
    poller: Arc<Poller>,
    flag: EnabledFlag,
    config: ConnectorConfig,
    state: Mutex<ConnectorState>,
}

impl Connector {
    pub fn new(
        api: Arc<dyn CoordinatorApi>,
        dispatcher: Arc<Dispatcher>,
        poller: Arc<Poller>,
        flag: EnabledFlag,
        config: ConnectorConfig,
    ) -> Self {
        Self {
            api,
            dispatcher,
            poller,
            flag,
            config,
            state: Mutex::new(ConnectorState {
                connection: ConnectionState::Disconnected,
                generation: 0,
                subscription: None,
                watchdog: None,
                reconnect: None,
                last_message: Instant::now(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    /// When the last message (or the last open) was observed
    #[cfg(test)]
    pub fn last_message_at(&self) -> Instant {
        self.state.lock().last_message
    }

    /// Open the push subscription unless one is open or opening.
    /// A pending reconnect is cancelled and replaced by an immediate attempt.
    pub fn connect(self: &Arc<Self>) {
        if !self.flag.is_enabled() {
            debug!("Worker disabled, not connecting");
            return;
        }

        let mut state = self.state.lock();
        match state.connection {
            ConnectionState::Connecting | ConnectionState::Connected => return,
            ConnectionState::Reconnecting => {
                if let Some(timer) = state.reconnect.take() {
                    timer.abort();
                }
            }
            ConnectionState::Disconnected => {}
        }

        state.generation += 1;
        state.connection = ConnectionState::Connecting;
        let generation = state.generation;

        info!(generation = generation, "Connecting to coordinator push stream");
        let this = Arc::clone(self);
        state.subscription = Some(tokio::spawn(async move {
            this.run_subscription(generation).await;
        }));
    }

    /// Close everything and stay closed until the next `connect`
    pub fn disable(&self) {
        let mut state = self.state.lock();
        state.teardown();
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        state.generation += 1;
        if state.connection != ConnectionState::Disconnected {
            info!("Push stream disabled");
        }
        state.connection = ConnectionState::Disconnected;
    }

    async fn run_subscription(self: Arc<Self>, generation: u64) {
        let mut stream = match self.api.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to open push stream");
                self.schedule_reconnect(generation);
                return;
            }
        };

        if !self.on_open(generation) {
            return;
        }

        while let Some(item) = stream.next().await {
            match item {
                Ok(data) => self.on_message(generation, &data),
                Err(e) => {
                    warn!(error = %e, "Push stream failed");
                    self.schedule_reconnect(generation);
                    return;
                }
            }
        }

        warn!("Push stream closed by coordinator");
        self.schedule_reconnect(generation);
    }

    fn on_open(self: &Arc<Self>, generation: u64) -> bool {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.connection != ConnectionState::Connecting {
                return false;
            }
            state.connection = ConnectionState::Connected;
            state.last_message = Instant::now();
            state.watchdog = Some(self.spawn_watchdog(generation));
        }

        info!("Push stream connected");

        // pick up whatever was queued while we were away
        let poller = Arc::clone(&self.poller);
        tokio::spawn(async move {
            poller.poll().await;
        });
        true
    }

    fn on_message(&self, generation: u64, data: &str) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.last_message = Instant::now();
        }

        match StreamMessage::parse(data) {
            Ok(StreamMessage::Heartbeat) => trace!("Heartbeat"),
            Ok(StreamMessage::Task(task)) => {
                self.dispatcher.submit(task, TaskChannel::Push);
            }
            Ok(StreamMessage::Other(kind)) => debug!(message_type = %kind, "Ignoring stream message"),
            Err(e) => debug!(error = %e, "Ignoring malformed stream message"),
        }
    }

    fn spawn_watchdog(self: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let check = self.config.watchdog_check;
        let silence = self.config.watchdog_silence;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + check, check);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let quiet_for = this.state.lock().last_message.elapsed();
                if quiet_for > silence {
                    warn!(silent_secs = quiet_for.as_secs(), "Push stream stalled");
                    this.schedule_reconnect(generation);
                    return;
                }
            }
        })
    }

    /// Tear down the current subscription and retry after the fixed delay.
    /// Only the first failure of a generation schedules anything.
    fn schedule_reconnect(self: &Arc<Self>, generation: u64) {
        let mut state = self.state.lock();
        if state.generation != generation
            || !matches!(state.connection, ConnectionState::Connecting | ConnectionState::Connected)
        {
            return;
        }

        state.teardown();
        state.connection = ConnectionState::Reconnecting;

        let delay = self.config.reconnect_delay;
        info!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");

        let this = Arc::clone(self);
        state.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reconnect_due(generation);
        }));
    }

    fn reconnect_due(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.generation != generation || state.connection != ConnectionState::Reconnecting {
                return;
            }
            // this timer is the running task; nothing to abort
            state.reconnect = None;
        }
        self.connect();
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.teardown();
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::mock::MockCoordinator;
    use crate::executor::RecordingHandler;

    struct Harness {
        connector: Arc<Connector>,
        api: Arc<MockCoordinator>,
        handler: Arc<RecordingHandler>,
        dispatcher: Arc<Dispatcher>,
        flag: EnabledFlag,
    }

    fn harness() -> Harness {
        let api = Arc::new(MockCoordinator::new());
        let handler = Arc::new(RecordingHandler::default());
        let flag = EnabledFlag::in_memory(true);
        let dispatcher = Arc::new(Dispatcher::new(handler.clone(), flag.clone()));
        let poller = Arc::new(Poller::new(api.clone(), dispatcher.clone()));
        let connector = Arc::new(Connector::new(
            api.clone(),
            dispatcher.clone(),
            poller,
            flag.clone(),
            ConnectorConfig::default(),
        ));
        Harness { connector, api, handler, dispatcher, flag }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_opens_once_and_polls() {
        let h = harness();

        h.connector.connect();
        advance(10).await;

        assert_eq!(h.connector.state(), ConnectionState::Connected);
        assert_eq!(h.api.open_count(), 1);
        assert_eq!(h.api.poll_count(), 1);

        h.connector.connect();
        advance(10).await;
        assert_eq!(h.api.open_count(), 1);
        assert_eq!(h.api.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_disabled_is_noop() {
        let h = harness();
        h.flag.set(false).unwrap();

        h.connector.connect();
        advance(10).await;

        assert_eq!(h.connector.state(), ConnectionState::Disconnected);
        assert_eq!(h.api.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reconnects_after_silence() {
        let h = harness();
        h.connector.connect();

        // checks at 10s..40s see at most 40s of silence
        advance(49_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Connected);

        // the 50s check fires, reconnect 5s later
        advance(2_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Reconnecting);
        assert_eq!(h.api.live_streams(), 0);

        advance(5_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Connected);
        assert_eq!(h.api.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_message_at_39s_prevents_reconnect() {
        let h = harness();
        let start = Instant::now();
        h.connector.connect();

        advance(39_000).await;
        h.api.push(r#"{"type":"ping"}"#);
        advance(10).await;
        assert!(h.connector.last_message_at() >= start + Duration::from_secs(39));

        advance(36_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Connected);
        assert_eq!(h.api.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_schedules_single_reconnect() {
        let h = harness();
        h.connector.connect();
        advance(10).await;

        h.api.break_stream();
        advance(4_900).await;
        assert_eq!(h.connector.state(), ConnectionState::Reconnecting);
        assert_eq!(h.api.open_count(), 1);

        advance(200).await;
        assert_eq!(h.connector.state(), ConnectionState::Connected);
        assert_eq!(h.api.open_count(), 2);

        advance(20_000).await;
        assert_eq!(h.api.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_before_timer_cancels_it() {
        let h = harness();
        h.connector.connect();
        advance(10).await;

        h.api.break_stream();
        advance(1_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Reconnecting);

        h.connector.connect();
        advance(10).await;
        assert_eq!(h.api.open_count(), 2);

        // the cancelled timer must not open a third subscription
        advance(10_000).await;
        assert_eq!(h.api.open_count(), 2);
        assert_eq!(h.api.live_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_retries() {
        let h = harness();
        h.api.refuse_stream(true);

        h.connector.connect();
        advance(10).await;
        assert_eq!(h.connector.state(), ConnectionState::Reconnecting);

        h.api.refuse_stream(false);
        advance(5_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Connected);
        assert_eq!(h.api.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_then_task_dispatches_once() {
        let h = harness();
        h.connector.connect();
        advance(10).await;
        let opened_at = h.connector.last_message_at();

        h.api.push(r#"{"type":"ping"}"#);
        advance(1_000).await;
        let after_ping = h.connector.last_message_at();
        assert!(after_ping > opened_at);
        assert_eq!(h.dispatcher.accepted(), 0);

        h.api.push(
            r#"{"type":"generate_link","itemId":"1","shopId":"2","requestId":"r2","userId":"u1","originalUrl":"https://x/y"}"#,
        );
        advance(1_000).await;

        assert!(h.connector.last_message_at() > after_ping);
        assert_eq!(h.dispatcher.accepted(), 1);
        assert_eq!(h.handler.seen.lock().as_slice(), &[("r2".to_string(), TaskChannel::Push)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_message_keeps_connection() {
        let h = harness();
        h.connector.connect();
        advance(10).await;

        h.api.push("not json");
        h.api.push(r#"{"type":"generate_link"}"#);
        advance(10).await;

        assert_eq!(h.connector.state(), ConnectionState::Connected);
        assert_eq!(h.dispatcher.accepted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_cancels_pending_reconnect() {
        let h = harness();
        h.connector.connect();
        advance(10).await;

        h.api.break_stream();
        advance(1_000).await;
        assert_eq!(h.connector.state(), ConnectionState::Reconnecting);

        h.connector.disable();
        assert_eq!(h.connector.state(), ConnectionState::Disconnected);

        advance(60_000).await;
        assert_eq!(h.api.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_closes_open_stream() {
        let h = harness();
        h.connector.connect();
        advance(10).await;
        assert_eq!(h.api.live_streams(), 1);

        h.connector.disable();
        advance(10).await;
        assert_eq!(h.api.live_streams(), 0);

        // late events on the old stream are not observed
        h.api.push(r#"{"type":"generate_link","itemId":"1","requestId":"r5"}"#);
        advance(10).await;
        assert_eq!(h.dispatcher.accepted(), 0);
    }
}
