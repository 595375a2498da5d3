//! HTTP client for the coordinator API
//!
//! Four endpoints hang off the configured base URL:
//! - `GET /stream`: Server-Sent Events push channel
//! - `GET /pending-tasks`: backlog for the fallback poller
//! - `POST /result`: task outcomes
//! - `POST /log`: shipped log records

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tracing::debug;

use super::sse::SseReader;
use crate::config::CoordinatorSettings;
use crate::error::{Error, Result};
use crate::protocol::{LogRecord, PendingTasksResponse, ResultReport, Task};

/// Push stream: the `data` payload of each event, or the error that ended it
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Coordinator operations used by the worker
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Open the push subscription
    async fn open_stream(&self) -> Result<MessageStream>;

    /// Pull the current backlog
    async fn fetch_pending(&self) -> Result<Vec<Task>>;

    /// Submit one outcome
    async fn post_result(&self, report: &ResultReport) -> Result<()>;

    /// Ship one log record
    async fn post_log(&self, record: &LogRecord) -> Result<()>;
}

/// reqwest-backed coordinator client
#[derive(Clone)]
pub struct HttpCoordinator {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpCoordinator {
    pub fn new(settings: &CoordinatorSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .user_agent(crate::version::BUILD.user_agent())
            .build()?;

        Ok(Self {
            http,
            base_url: settings.url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_millis(settings.request_timeout_ms),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinator {
    async fn open_stream(&self) -> Result<MessageStream> {
        let url = self.endpoint("stream");
        // no overall timeout here: the stream is meant to stay open
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| Error::connection_failed(&url, e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::connection_failed(&url, e.to_string()))?;

        debug!(url = %url, "Push stream opened");

        let body = response.bytes_stream().boxed();
        let events = stream::unfold((body, SseReader::new()), |(mut body, mut reader)| async move {
            loop {
                if let Some(event) = reader.next_event() {
                    return Some((Ok(event.data), (body, reader)));
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(e) = reader.push(&chunk) {
                            return Some((Err(e), (body, reader)));
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(Error::connection_lost(e.to_string())), (body, reader)))
                    }
                    None => return None,
                }
            }
        });

        Ok(events.boxed())
    }

    async fn fetch_pending(&self) -> Result<Vec<Task>> {
        let response: PendingTasksResponse = self
            .http
            .get(self.endpoint("pending-tasks"))
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.into_tasks())
    }

    async fn post_result(&self, report: &ResultReport) -> Result<()> {
        self.http
            .post(self.endpoint("result"))
            .timeout(self.request_timeout)
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn post_log(&self, record: &LogRecord) -> Result<()> {
        self.http
            .post(self.endpoint("log"))
            .timeout(self.request_timeout)
            .json(record)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
