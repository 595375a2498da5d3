//! Execution host abstraction
//!
//! An execution host is the authenticated browser tab that exposes the
//! link capability. Providers locate or open one; hosts run requests.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ExecutionResult, HostTask};

/// Arguments of one capability call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub item_id: String,
    pub shop_id: Option<String>,
    pub sub_id: String,
    pub original_url: String,
}

impl CapabilityRequest {
    /// The same request in relay form
    pub fn to_host_task(&self, request_id: &str) -> HostTask {
        HostTask {
            request_id: request_id.to_string(),
            item_id: self.item_id.clone(),
            shop_id: self.shop_id.clone(),
            sub_id: self.sub_id.clone(),
            original_url: self.original_url.clone(),
        }
    }
}

/// Finds or opens execution hosts
#[async_trait]
pub trait HostProvider: Send + Sync {
    /// First existing host whose URL matches `pattern`
    async fn find(&self, pattern: &str) -> Result<Option<Arc<dyn ExecutionHost>>>;

    /// Open a new host at `url`
    async fn provision(&self, url: &str) -> Result<Arc<dyn ExecutionHost>>;
}

/// A live execution host
#[async_trait]
pub trait ExecutionHost: Send + Sync {
    /// Stable identifier (CDP target id)
    fn id(&self) -> &str;

    /// Whether the page finished loading
    async fn is_ready(&self) -> Result<bool>;

    /// Direct strategy: call the capability and return its answer.
    /// Errors are transport failures; a capability-level failure is an
    /// `Ok` result with `success == false`.
    async fn generate_offer_link(&self, request: &CapabilityRequest) -> Result<ExecutionResult>;

    /// Relay strategy: post the task into the page. The answer arrives
    /// asynchronously through the response correlator.
    async fn relay(&self, task: &HostTask) -> Result<()>;

    /// Reload the page, dropping any session state
    async fn reload(&self) -> Result<()>;
}

/// Glob match with `*` wildcards, as used for target URL patterns
pub fn matches_pattern(pattern: &str, url: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == url;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !url.starts_with(first) || url.len() < first.len() + last.len() || !url.ends_with(last) {
        return false;
    }

    let mut rest = &url[first.len()..url.len() - last.len()];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    true
}
