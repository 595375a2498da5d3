//! Protocol message definitions
//!
//! Wire types for worker-coordinator communication (push stream, backlog,
//! result and log posts) and for the host correlation protocol.
//! Everything is JSON with camelCase field names.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

// ─────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────

/// Task types the coordinator can issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Mint an affiliate link for an item
    GenerateLink,

    /// Anything this worker does not understand
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::GenerateLink => write!(f, "generate_link"),
            TaskType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A unit of work issued by the coordinator. Identity is `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Correlation identifier assigned by the coordinator
    #[serde(deserialize_with = "text_or_number")]
    pub request_id: String,

    /// Task discriminator
    #[serde(rename = "type")]
    pub kind: TaskType,

    /// Target item
    #[serde(default, deserialize_with = "text_or_number")]
    pub item_id: String,

    /// Shop owning the item, when known
    #[serde(default, deserialize_with = "optional_text_or_number", skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,

    /// User who asked for the link
    #[serde(default, deserialize_with = "optional_text_or_number")]
    pub user_id: Option<String>,

    /// Product URL the user submitted
    #[serde(default)]
    pub original_url: String,
}

impl Task {
    /// Whether this worker should execute the task at all
    pub fn is_dispatchable(&self) -> bool {
        self.kind == TaskType::GenerateLink
            && !self.request_id.is_empty()
            && !self.item_id.is_empty()
    }
}

/// Response body of `GET /pending-tasks`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PendingTasksResponse {
    /// Raw task entries. Decoded one by one so a single bad entry
    /// does not discard the whole backlog.
    #[serde(default)]
    pub tasks: Option<Vec<Value>>,
}

impl PendingTasksResponse {
    /// Decode the backlog, skipping malformed entries
    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| match serde_json::from_value::<Task>(raw) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping malformed backlog entry");
                    None
                }
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────────
// Push Stream
// ─────────────────────────────────────────────────────────────────

/// A decoded push stream message
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Keep-alive, carries nothing
    Heartbeat,

    /// A task to dispatch
    Task(Task),

    /// A well-formed message of a type this worker ignores
    Other(String),
}

impl StreamMessage {
    /// Parse the `data` field of one stream event
    pub fn parse(data: &str) -> serde_json::Result<Self> {
        let value: Value = serde_json::from_str(data)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match kind.as_str() {
            "ping" => Ok(StreamMessage::Heartbeat),
            "generate_link" => Ok(StreamMessage::Task(serde_json::from_value(value)?)),
            _ => Ok(StreamMessage::Other(kind)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Execution Results
// ─────────────────────────────────────────────────────────────────

/// Product metadata returned alongside a link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductData {
    #[serde(default, deserialize_with = "text_or_number")]
    pub name: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub image: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub price: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub sold: String,
    #[serde(default, deserialize_with = "text_or_number")]
    pub cashback: String,
}

/// Outcome of one capability invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default)]
    pub success: bool,

    /// Generated link. Older host scripts return it as `data`.
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_data: Option<ProductData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// A successful result
    pub fn success(link: impl Into<String>, product_data: Option<ProductData>) -> Self {
        Self {
            success: true,
            link: Some(link.into()),
            product_data,
            error: None,
        }
    }

    /// A failed result
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            link: None,
            product_data: None,
            error: Some(error.into()),
        }
    }

    /// Whether the result carries a link the coordinator can use
    pub fn is_usable(&self) -> bool {
        self.success && self.link.as_deref().is_some_and(|l| !l.is_empty())
    }
}

/// Body of `POST /result`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultReport {
    pub link: Option<String>,
    pub data: Option<ProductData>,
    pub request_id: String,
    pub sub_id: String,
    pub original_url: String,
    pub user_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /log`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub message: String,
    pub level: String,
    pub sender: String,
}

// ─────────────────────────────────────────────────────────────────
// Host Correlation Protocol (relay strategy)
// ─────────────────────────────────────────────────────────────────

/// Messages exchanged with the host's privileged execution context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostMessage {
    /// Worker → host
    Task(HostTask),

    /// Host → worker
    Result(HostResult),
}

/// Request relayed into the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTask {
    pub request_id: String,
    pub item_id: String,
    pub shop_id: Option<String>,
    pub sub_id: String,
    pub original_url: String,
}

/// Correlated answer from the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
    pub request_id: String,
    pub result: ExecutionResult,
}

// ─────────────────────────────────────────────────────────────────
// Lenient scalar decoding
// ─────────────────────────────────────────────────────────────────

/// Identifiers show up as strings or numbers depending on the producer
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Text(s) => s,
            Scalar::Int(n) => n.to_string(),
            Scalar::Uint(n) => n.to_string(),
            Scalar::Float(n) => n.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(String::from)
        .unwrap_or_default())
}

fn optional_text_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Scalar>::deserialize(deserializer)?
        .map(String::from)
        .filter(|s| !s.is_empty()))
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
