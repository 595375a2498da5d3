//! Best-effort result reporting

use std::sync::Arc;

use tracing::{debug, warn};

use super::client::CoordinatorApi;
use crate::protocol::ResultReport;

pub struct ResultReporter {
    api: Arc<dyn CoordinatorApi>,
}

impl ResultReporter {
    pub fn new(api: Arc<dyn CoordinatorApi>) -> Self {
        Self { api }
    }

    /// Post one outcome. Failures are logged and dropped.
    pub async fn report(&self, report: &ResultReport) -> bool {
        match self.api.post_result(report).await {
            Ok(()) => {
                debug!(request_id = %report.request_id, success = report.success, "Result reported");
                true
            }
            Err(e) => {
                warn!(request_id = %report.request_id, error = %e, "Failed to report result");
                false
            }
        }
    }
}
