//! In-memory coordinator for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::client::{CoordinatorApi, MessageStream};
use crate::error::{Error, Result};
use crate::protocol::{LogRecord, ResultReport, Task};

#[derive(Default)]
pub struct MockCoordinator {
    opens: AtomicUsize,
    polls: AtomicUsize,
    refuse_stream: AtomicBool,
    fail_fetch: AtomicBool,
    fail_results: AtomicBool,
    streams: Mutex<Vec<mpsc::UnboundedSender<Result<String>>>>,
    backlog: Mutex<Vec<Task>>,
    results: Mutex<Vec<ResultReport>>,
    logs: Mutex<Vec<LogRecord>>,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `open_stream` calls so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn refuse_stream(&self, refuse: bool) {
        self.refuse_stream.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_results(&self, fail: bool) {
        self.fail_results.store(fail, Ordering::SeqCst);
    }

    pub fn set_backlog(&self, tasks: Vec<Task>) {
        *self.backlog.lock() = tasks;
    }

    /// Deliver a raw event payload on the most recent stream
    pub fn push(&self, data: &str) {
        if let Some(tx) = self.streams.lock().last() {
            let _ = tx.send(Ok(data.to_string()));
        }
    }

    /// Fail the most recent stream
    pub fn break_stream(&self) {
        if let Some(tx) = self.streams.lock().last() {
            let _ = tx.send(Err(Error::connection_lost("reset by peer")));
        }
    }

    /// Number of streams whose receiving side is still alive
    pub fn live_streams(&self) -> usize {
        self.streams.lock().iter().filter(|tx| !tx.is_closed()).count()
    }

    pub fn results(&self) -> Vec<ResultReport> {
        self.results.lock().clone()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.lock().clone()
    }
}

#[async_trait]
impl CoordinatorApi for MockCoordinator {
    async fn open_stream(&self) -> Result<MessageStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse_stream.load(Ordering::SeqCst) {
            return Err(Error::connection_failed("mock://stream", "refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().push(tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn fetch_pending(&self) -> Result<Vec<Task>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::connection_failed("mock://pending-tasks", "unreachable"));
        }
        Ok(self.backlog.lock().clone())
    }

    async fn post_result(&self, report: &ResultReport) -> Result<()> {
        if self.fail_results.load(Ordering::SeqCst) {
            return Err(Error::connection_failed("mock://result", "unreachable"));
        }
        self.results.lock().push(report.clone());
        Ok(())
    }

    async fn post_log(&self, record: &LogRecord) -> Result<()> {
        self.logs.lock().push(record.clone());
        Ok(())
    }
}

/// A dispatchable task with the given id
pub fn task(request_id: &str) -> Task {
    serde_json::from_value(serde_json::json!({
        "type": "generate_link",
        "requestId": request_id,
        "itemId": "1",
        "shopId": "2",
        "userId": "u1",
        "originalUrl": "https://x/y",
    }))
    .expect("valid task")
}
