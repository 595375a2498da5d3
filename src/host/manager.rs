//! Execution host manager
//!
//! Locates the host tab, opening one when none exists. Acquisition is
//! single-flight: concurrent callers queue on the host slot, so only the
//! first provisions and the rest find the tab it opened.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::{ExecutionHost, HostProvider};
use crate::config::HostSettings;
use crate::error::{Error, Result};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Host selection and readiness timings
#[derive(Debug, Clone)]
pub struct HostManagerConfig {
    pub target_pattern: String,
    pub provision_url: String,
    pub ready_timeout: Duration,
    pub settle_delay: Duration,
}

impl From<&HostSettings> for HostManagerConfig {
    fn from(settings: &HostSettings) -> Self {
        Self {
            target_pattern: settings.target_pattern.clone(),
            provision_url: settings.provision_url.clone(),
            ready_timeout: Duration::from_millis(settings.ready_timeout_ms),
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
        }
    }
}

pub struct HostManager {
    provider: Arc<dyn HostProvider>,
    config: HostManagerConfig,
    slot: Mutex<Option<Arc<dyn ExecutionHost>>>,
}

impl HostManager {
    pub fn new(provider: Arc<dyn HostProvider>, config: HostManagerConfig) -> Self {
        Self {
            provider,
            config,
            slot: Mutex::new(None),
        }
    }

    /// Return a ready host, provisioning one if needed.
    ///
    /// Every failure to locate or open a host is reported as
    /// `HostUnavailable`.
    pub async fn acquire(&self) -> Result<Arc<dyn ExecutionHost>> {
        let mut slot = self.slot.lock().await;

        match self.provider.find(&self.config.target_pattern).await {
            Ok(Some(host)) => {
                debug!(host_id = %host.id(), "Reusing existing host");
                *slot = Some(Arc::clone(&host));
                return Ok(host);
            }
            Ok(None) => {}
            Err(e) => {
                *slot = None;
                return Err(Error::host_unavailable(format!("host lookup failed: {}", e)));
            }
        }

        info!(url = %self.config.provision_url, "No matching host, provisioning one");
        let host = self
            .provider
            .provision(&self.config.provision_url)
            .await
            .map_err(|e| Error::host_unavailable(format!("provisioning failed: {}", e)))?;

        self.wait_ready(host.as_ref()).await;
        // give the page's own scripts time to initialize
        tokio::time::sleep(self.config.settle_delay).await;

        info!(host_id = %host.id(), "Host provisioned");
        *slot = Some(Arc::clone(&host));
        Ok(host)
    }

    /// Best effort: proceeds after the timeout even if the page never
    /// reported ready.
    async fn wait_ready(&self, host: &dyn ExecutionHost) {
        let ready = tokio::time::timeout(self.config.ready_timeout, async {
            loop {
                match host.is_ready().await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => debug!(host_id = %host.id(), error = %e, "Readiness check failed"),
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        })
        .await;

        if ready.is_err() {
            warn!(
                host_id = %host.id(),
                timeout_ms = self.config.ready_timeout.as_millis() as u64,
                "Host did not report ready, proceeding anyway"
            );
        }
    }

    /// Liveness probe: look up the host without provisioning
    pub async fn probe(&self) -> bool {
        match self.provider.find(&self.config.target_pattern).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                debug!(error = %e, "Host probe failed");
                false
            }
        }
    }

    /// Id of the most recently acquired host
    pub async fn current_host_id(&self) -> Option<String> {
        self.slot.lock().await.as_ref().map(|h| h.id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::{MockHost, MockProvider};

    fn config() -> HostManagerConfig {
        HostManagerConfig::from(&HostSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_existing_host() {
        let provider = Arc::new(MockProvider::new());
        provider.add_host(MockHost::new("tab-1"));
        let manager = HostManager::new(provider.clone(), config());

        let host = manager.acquire().await.unwrap();
        assert_eq!(host.id(), "tab-1");
        assert_eq!(provider.provision_count(), 0);
        assert_eq!(manager.current_host_id().await.as_deref(), Some("tab-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisions_and_settles() {
        let provider = Arc::new(MockProvider::new());
        let manager = HostManager::new(provider.clone(), config());

        let start = tokio::time::Instant::now();
        let host = manager.acquire().await.unwrap();

        assert_eq!(provider.provision_count(), 1);
        assert!(host.id().starts_with("provisioned-"));
        // ready immediately, then the 3s settle delay
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout_is_best_effort() {
        let provider = Arc::new(MockProvider::new());
        provider.provision_unready();
        let manager = HostManager::new(provider.clone(), config());

        let start = tokio::time::Instant::now();
        assert!(manager.acquire().await.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_provisioning() {
        let provider = Arc::new(MockProvider::new());
        let manager = Arc::new(HostManager::new(provider.clone(), config()));

        let a = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire().await.map(|h| h.id().to_string()) }
        });
        let b = tokio::spawn({
            let manager = manager.clone();
            async move { manager.acquire().await.map(|h| h.id().to_string()) }
        });

        let (a, b) = (a.await.unwrap().unwrap(), b.await.unwrap().unwrap());
        assert_eq!(a, b);
        assert_eq!(provider.provision_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_failure_is_host_unavailable() {
        let provider = Arc::new(MockProvider::new());
        provider.fail_provision();
        let manager = HostManager::new(provider.clone(), config());

        let err = match manager.acquire().await {
            Ok(_) => panic!("acquire should fail"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::HostUnavailable { .. }));
        assert!(!manager.probe().await);
    }
}
