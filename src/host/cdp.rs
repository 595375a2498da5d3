//! Chrome DevTools Protocol host adapter
//!
//! Drives a tab of a Chromium instance started with
//! `--remote-debugging-port`. Discovery and tab creation go through the
//! DevTools HTTP endpoints; everything else runs over the tab's WebSocket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use super::traits::{matches_pattern, CapabilityRequest, ExecutionHost, HostProvider};
use crate::config::HostSettings;
use crate::error::{Error, Result};
use crate::executor::PendingResponses;
use crate::protocol::{ExecutionResult, HostMessage, HostTask};

/// Page binding that carries relay answers back to the worker
const RELAY_BINDING: &str = "__linkgenRelay";

/// Upper bound for a single DevTools command
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Forwards `RESULT` window messages from the page to the binding
const BRIDGE_SCRIPT: &str = r#"(() => {
  if (window.__linkgenBridge) return true;
  window.__linkgenBridge = true;
  window.addEventListener('message', (event) => {
    const msg = event.data;
    if (event.source !== window || !msg || msg.type !== 'RESULT') return;
    try { __linkgenRelay(JSON.stringify(msg)); } catch (_) {}
  });
  return true;
})()"#;

// ─────────────────────────────────────────────────────────────────
// Discovery
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    url: String,
    web_socket_debugger_url: Option<String>,
}

impl TargetInfo {
    fn is_page_matching(&self, pattern: &str) -> bool {
        self.kind == "page" && matches_pattern(pattern, &self.url)
    }
}

/// Finds and opens tabs through the DevTools HTTP endpoints
pub struct CdpHostProvider {
    http: reqwest::Client,
    endpoint: String,
    capability: String,
    responses: Arc<PendingResponses>,
    hosts: Mutex<HashMap<String, Arc<CdpHost>>>,
}

impl CdpHostProvider {
    pub fn new(settings: &HostSettings, responses: Arc<PendingResponses>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            endpoint: settings.cdp_url.trim_end_matches('/').to_string(),
            capability: settings.capability.clone(),
            responses,
            hosts: Mutex::new(HashMap::new()),
        })
    }

    async fn list_targets(&self) -> Result<Vec<TargetInfo>> {
        let url = format!("{}/json/list", self.endpoint);
        let targets = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::connection_failed(&url, e.to_string()))?
            .error_for_status()?
            .json()
            .await?;
        Ok(targets)
    }

    /// Number of open tabs matching `pattern`
    pub async fn count_matching(&self, pattern: &str) -> Result<usize> {
        let targets = self.list_targets().await?;
        Ok(targets.iter().filter(|t| t.is_page_matching(pattern)).count())
    }

    /// Reuse the cached host for a target so its session survives lookups
    fn host_for(&self, target: &TargetInfo, ws_url: &str) -> Arc<CdpHost> {
        let mut hosts = self.hosts.lock();
        Arc::clone(hosts.entry(target.id.clone()).or_insert_with(|| {
            Arc::new(CdpHost {
                id: target.id.clone(),
                ws_url: ws_url.to_string(),
                capability: self.capability.clone(),
                responses: Arc::clone(&self.responses),
                session: tokio::sync::Mutex::new(None),
            })
        }))
    }
}

#[async_trait]
impl HostProvider for CdpHostProvider {
    async fn find(&self, pattern: &str) -> Result<Option<Arc<dyn ExecutionHost>>> {
        let targets = self.list_targets().await?;

        // forget tabs that were closed
        self.hosts
            .lock()
            .retain(|id, _| targets.iter().any(|t| &t.id == id));

        let found = targets.iter().find_map(|t| match &t.web_socket_debugger_url {
            Some(ws) if t.is_page_matching(pattern) => Some((t, ws)),
            _ => None,
        });

        Ok(found.map(|(target, ws)| self.host_for(target, ws) as Arc<dyn ExecutionHost>))
    }

    async fn provision(&self, url: &str) -> Result<Arc<dyn ExecutionHost>> {
        let endpoint = format!("{}/json/new?{}", self.endpoint, url);
        let target: TargetInfo = self
            .http
            .put(&endpoint)
            .send()
            .await
            .map_err(|e| Error::connection_failed(&endpoint, e.to_string()))?
            .error_for_status()?
            .json()
            .await?;

        let ws = target
            .web_socket_debugger_url
            .clone()
            .ok_or_else(|| Error::host_unavailable("new tab has no debugger URL (already attached?)"))?;

        info!(target_id = %target.id, url = %url, "Opened host tab");
        Ok(self.host_for(&target, &ws))
    }
}

// ─────────────────────────────────────────────────────────────────
// Host
// ─────────────────────────────────────────────────────────────────

/// One browser tab
pub struct CdpHost {
    id: String,
    ws_url: String,
    capability: String,
    responses: Arc<PendingResponses>,
    session: tokio::sync::Mutex<Option<Arc<CdpSession>>>,
}

impl CdpHost {
    async fn session(&self) -> Result<Arc<CdpSession>> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(Arc::clone(session));
            }
        }

        let session = Arc::new(CdpSession::connect(&self.ws_url, Arc::clone(&self.responses)).await?);
        debug!(host_id = %self.id, "DevTools session opened");
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    async fn ensure_bridge(&self, session: &CdpSession) -> Result<()> {
        if session.bridge_installed.load(Ordering::SeqCst) {
            return Ok(());
        }

        session.call("Runtime.addBinding", json!({ "name": RELAY_BINDING })).await?;
        session
            .call("Page.addScriptToEvaluateOnNewDocument", json!({ "source": BRIDGE_SCRIPT }))
            .await?;
        if let Evaluation::Thrown(msg) = session.evaluate(BRIDGE_SCRIPT, false).await? {
            return Err(Error::host_transport(format!("relay bridge failed: {}", msg)));
        }

        session.bridge_installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn capability_expression(&self, request: &CapabilityRequest) -> Result<String> {
        let cap = &self.capability;
        Ok(format!(
            "(async () => {{\n  let fn;\n  try {{ fn = {cap}; }} catch (_) {{}}\n  if (typeof fn !== 'function') return {{ __linkgenMissing: true }};\n  return await {cap}({item}, {shop}, {sub}, {url});\n}})()",
            cap = cap,
            item = serde_json::to_string(&request.item_id)?,
            shop = serde_json::to_string(&request.shop_id)?,
            sub = serde_json::to_string(&request.sub_id)?,
            url = serde_json::to_string(&request.original_url)?,
        ))
    }
}

#[async_trait]
impl ExecutionHost for CdpHost {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_ready(&self) -> Result<bool> {
        let session = self.session().await?;
        match session.evaluate("document.readyState", false).await? {
            Evaluation::Value(state) => Ok(state.as_str() == Some("complete")),
            Evaluation::Thrown(_) => Ok(false),
        }
    }

    async fn generate_offer_link(&self, request: &CapabilityRequest) -> Result<ExecutionResult> {
        let session = self.session().await?;
        let expression = self.capability_expression(request)?;

        match session.evaluate(&expression, true).await? {
            Evaluation::Value(value) if value.get("__linkgenMissing").is_some() => Err(
                Error::host_transport(format!("capability {} is not loaded in the page", self.capability)),
            ),
            Evaluation::Value(value) => Ok(serde_json::from_value(value).unwrap_or_else(|e| {
                warn!(host_id = %self.id, error = %e, "Capability returned an unexpected shape");
                ExecutionResult::failure(format!("Malformed capability result: {}", e))
            })),
            Evaluation::Thrown(msg) => Ok(ExecutionResult::failure(msg)),
        }
    }

    async fn relay(&self, task: &HostTask) -> Result<()> {
        let session = self.session().await?;
        self.ensure_bridge(&session).await?;

        let message = serde_json::to_string(&HostMessage::Task(task.clone()))?;
        match session
            .evaluate(&format!("window.postMessage({}, '*')", message), false)
            .await?
        {
            Evaluation::Value(_) => Ok(()),
            Evaluation::Thrown(msg) => Err(Error::host_transport(format!("relay post failed: {}", msg))),
        }
    }

    async fn reload(&self) -> Result<()> {
        let session = self.session().await?;
        session.call("Page.reload", json!({ "ignoreCache": false })).await?;

        // execution contexts are gone after a reload; reconnect lazily
        self.session.lock().await.take();
        info!(host_id = %self.id, "Host reloaded");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────

enum Evaluation {
    Value(Value),
    Thrown(String),
}

type CallMap = Arc<Mutex<HashMap<u64, oneshot::Sender<std::result::Result<Value, String>>>>>;

/// A WebSocket session with one tab. Responses are correlated by id.
struct CdpSession {
    outgoing: mpsc::UnboundedSender<WsMessage>,
    calls: CallMap,
    next_id: AtomicU64,
    open: Arc<AtomicBool>,
    bridge_installed: AtomicBool,
    pump: JoinHandle<()>,
}

impl CdpSession {
    async fn connect(ws_url: &str, responses: Arc<PendingResponses>) -> Result<Self> {
        let (stream, _) = connect_async(ws_url).await?;
        let (mut write, mut read) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<WsMessage>();
        let calls: CallMap = Arc::new(Mutex::new(HashMap::new()));
        let open = Arc::new(AtomicBool::new(true));

        let pump = tokio::spawn({
            let calls = Arc::clone(&calls);
            let open = Arc::clone(&open);
            async move {
                loop {
                    tokio::select! {
                        msg = outgoing_rx.recv() => {
                            let Some(msg) = msg else { break };
                            if let Err(e) = write.send(msg).await {
                                debug!(error = %e, "DevTools write failed");
                                break;
                            }
                        }
                        msg = read.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => handle_incoming(&text, &calls, &responses),
                            Some(Ok(WsMessage::Ping(data))) => {
                                let _ = write.send(WsMessage::Pong(data)).await;
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Err(e)) => {
                                debug!(error = %e, "DevTools read failed");
                                break;
                            }
                            _ => {}
                        },
                    }
                }

                open.store(false, Ordering::SeqCst);
                // waking callers with a closed channel
                calls.lock().clear();
            }
        });

        Ok(Self {
            outgoing,
            calls,
            next_id: AtomicU64::new(1),
            open,
            bridge_installed: AtomicBool::new(false),
            pump,
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(id, tx);
        let _guard = CallGuard { id, calls: &self.calls };

        let frame = json!({ "id": id, "method": method, "params": params });
        self.outgoing
            .send(WsMessage::Text(frame.to_string()))
            .map_err(|_| Error::host_transport("DevTools session closed"))?;

        match tokio::time::timeout(CALL_TIMEOUT, rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(Error::host_transport(format!("{}: {}", method, message))),
            Ok(Err(_)) => Err(Error::host_transport("DevTools session closed")),
            Err(_) => Err(Error::host_transport(format!("{} timed out", method))),
        }
    }

    async fn evaluate(&self, expression: &str, await_promise: bool) -> Result<Evaluation> {
        let reply = self
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": await_promise,
                    "returnByValue": true,
                }),
            )
            .await?;

        if let Some(details) = reply.get("exceptionDetails") {
            let message = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script exception")
                .to_string();
            return Ok(Evaluation::Thrown(message));
        }

        Ok(Evaluation::Value(
            reply.pointer("/result/value").cloned().unwrap_or(Value::Null),
        ))
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Removes a call's reply slot when the caller stops waiting
struct CallGuard<'a> {
    id: u64,
    calls: &'a CallMap,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.calls.lock().remove(&self.id);
    }
}

fn handle_incoming(text: &str, calls: &CallMap, responses: &PendingResponses) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        debug!("Ignoring non-JSON DevTools frame");
        return;
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        if let Some(tx) = calls.lock().remove(&id) {
            let reply = match frame.get("error") {
                Some(err) => Err(err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown DevTools error")
                    .to_string()),
                None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(reply);
        }
        return;
    }

    if frame.get("method").and_then(Value::as_str) == Some("Runtime.bindingCalled")
        && frame.pointer("/params/name").and_then(Value::as_str) == Some(RELAY_BINDING)
    {
        let payload = frame.pointer("/params/payload").and_then(Value::as_str).unwrap_or_default();
        match serde_json::from_str::<HostMessage>(payload) {
            Ok(HostMessage::Result(answer)) => {
                responses.resolve(answer);
            }
            Ok(HostMessage::Task(_)) => {}
            Err(e) => debug!(error = %e, "Ignoring malformed relay payload"),
        }
    }
}
