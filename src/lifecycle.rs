//! Worker lifecycle
//!
//! Owns the persisted enable flag and turns the task sources on and off
//! with it. A keep-alive loop probes the host, picks up flag changes made
//! by `linkgen-worker enable|disable` and re-asserts the push connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::coordinator::{Connector, Poller};
use crate::error::{Error, Result};
use crate::executor::TaskTracker;
use crate::host::HostManager;

// ─────────────────────────────────────────────────────────────────
// Enable Flag
// ─────────────────────────────────────────────────────────────────

/// On-disk form of the flag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub extension_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            extension_enabled: true,
            updated_at: None,
        }
    }
}

impl PersistedState {
    /// Read the state file. A missing file means the default (enabled).
    pub fn read(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(Error::IoRead {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("State file {} is corrupt: {}", path.display(), e))
        })
    }

    fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?).map_err(|e| Error::IoWrite {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, path).map_err(|e| Error::IoWrite {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

struct FlagInner {
    enabled: AtomicBool,
    path: Option<PathBuf>,
}

/// Process-wide enable flag, read before every dispatch decision
#[derive(Clone)]
pub struct EnabledFlag {
    inner: Arc<FlagInner>,
}

impl EnabledFlag {
    /// Load the flag from `path`. Unreadable state falls back to enabled.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = PersistedState::read(&path).unwrap_or_else(|e| {
            warn!(error = %e, "Could not read worker state, assuming enabled");
            PersistedState::default()
        });

        Self {
            inner: Arc::new(FlagInner {
                enabled: AtomicBool::new(state.extension_enabled),
                path: Some(path),
            }),
        }
    }

    /// A flag that is never persisted
    #[cfg(test)]
    pub fn in_memory(enabled: bool) -> Self {
        Self {
            inner: Arc::new(FlagInner {
                enabled: AtomicBool::new(enabled),
                path: None,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Update and persist the flag
    pub fn set(&self, enabled: bool) -> Result<()> {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
        if let Some(path) = &self.inner.path {
            PersistedState {
                extension_enabled: enabled,
                updated_at: Some(Utc::now()),
            }
            .write(path)?;
        }
        Ok(())
    }

    /// Re-read the persisted value. Returns the new value if it changed.
    pub fn reload(&self) -> Option<bool> {
        let path = self.inner.path.as_ref()?;
        let persisted = match PersistedState::read(path) {
            Ok(state) => state.extension_enabled,
            Err(e) => {
                debug!(error = %e, "Keeping current enable flag");
                return None;
            }
        };

        let previous = self.inner.enabled.swap(persisted, Ordering::SeqCst);
        (previous != persisted).then_some(persisted)
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────
// Lifecycle Controller
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Whether the push stream is used at all
    pub push_enabled: bool,
    pub poll_interval: Duration,
    pub keepalive_interval: Duration,
}

impl From<&WorkerConfig> for LifecycleConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            push_enabled: config.coordinator.push_enabled,
            poll_interval: Duration::from_millis(config.poller.interval_ms),
            keepalive_interval: Duration::from_millis(config.lifecycle.keepalive_interval_ms),
        }
    }
}

pub struct Lifecycle {
    flag: EnabledFlag,
    connector: Arc<Connector>,
    poller: Arc<Poller>,
    hosts: Arc<HostManager>,
    tracker: Arc<TaskTracker>,
    config: LifecycleConfig,
    poll_schedule: Mutex<Option<JoinHandle<()>>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
}

impl Lifecycle {
    pub fn new(
        flag: EnabledFlag,
        connector: Arc<Connector>,
        poller: Arc<Poller>,
        hosts: Arc<HostManager>,
        tracker: Arc<TaskTracker>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            flag,
            connector,
            poller,
            hosts,
            tracker,
            config,
            poll_schedule: Mutex::new(None),
            keepalive: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Process start: keep-alive always runs, task sources only when enabled
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let period = self.config.keepalive_interval;
        *self.keepalive.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.keepalive_tick().await;
            }
        }));

        if self.flag.is_enabled() {
            self.activate();
        } else {
            info!("Worker is disabled; run 'linkgen-worker enable' to start taking tasks");
        }
    }

    /// Persist the flag and start or stop the task sources accordingly
    pub fn set_enabled(self: &Arc<Self>, enabled: bool) -> Result<()> {
        self.flag.set(enabled)?;
        info!(enabled = enabled, "Worker enable flag changed");
        self.apply(enabled);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.is_enabled()
    }

    /// Stop everything without touching the persisted flag
    pub fn shutdown(&self) {
        if let Some(handle) = self.keepalive.lock().take() {
            handle.abort();
        }
        self.deactivate();
    }

    fn apply(self: &Arc<Self>, enabled: bool) {
        if enabled {
            self.activate();
        } else {
            self.deactivate();
        }
    }

    fn activate(self: &Arc<Self>) {
        self.active.store(true, Ordering::SeqCst);
        if self.config.push_enabled {
            self.connector.connect();
        }

        let mut schedule = self.poll_schedule.lock();
        if schedule.is_none() {
            *schedule = Some(self.poller.spawn_schedule(self.config.poll_interval));
        }
        drop(schedule);

        let poller = Arc::clone(&self.poller);
        tokio::spawn(async move {
            poller.poll().await;
        });
        info!(push = self.config.push_enabled, "Task sources started");
    }

    fn deactivate(&self) {
        self.connector.disable();
        if let Some(handle) = self.poll_schedule.lock().take() {
            handle.abort();
        }
        if self.active.swap(false, Ordering::SeqCst) {
            info!("Task sources stopped");
        }
    }

    async fn keepalive_tick(self: &Arc<Self>) {
        let host_alive = self.hosts.probe().await;
        let host_id = self.hosts.current_host_id().await;
        let stats = self.tracker.stats();
        debug!(
            host_alive = host_alive,
            host_id = ?host_id,
            connection = ?self.connector.state(),
            active = ?self.tracker.active_ids(),
            in_flight = stats.in_flight,
            completed = stats.completed,
            failed = stats.failed,
            "Keep-alive"
        );

        if let Some(enabled) = self.flag.reload() {
            info!(enabled = enabled, "Enable flag changed on disk");
            self.apply(enabled);
            return;
        }

        if self.flag.is_enabled() && self.config.push_enabled {
            self.connector.connect();
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
