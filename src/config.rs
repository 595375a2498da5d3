//! Configuration system for the link generation worker
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (LINKGEN_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity
    pub worker: WorkerSettings,

    /// Coordinator connection settings
    pub coordinator: CoordinatorSettings,

    /// Fallback poller settings
    pub poller: PollerSettings,

    /// Execution host settings
    pub host: HostSettings,

    /// Task executor settings
    pub executor: ExecutorSettings,

    /// Enable flag persistence and keep-alive
    pub lifecycle: LifecycleSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Data storage paths
    pub storage: StorageSettings,
}

/// Worker identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Name reported as `sender` in shipped log records (defaults to hostname)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Coordinator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Base URL; `/stream`, `/pending-tasks`, `/result` and `/log` hang off it
    pub url: String,

    /// Open the push stream. Disable for coordinators without streaming support.
    pub push_enabled: bool,

    /// Fixed delay before reconnecting the push stream
    pub reconnect_delay_ms: u64,

    /// Silence on the push stream longer than this counts as a stall
    pub watchdog_silence_ms: u64,

    /// How often the watchdog checks for silence
    pub watchdog_check_ms: u64,

    /// Timeout for plain request/response calls
    pub request_timeout_ms: u64,

    /// TCP/TLS connect timeout
    pub connect_timeout_ms: u64,
}

/// Fallback poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerSettings {
    /// Backlog poll period
    pub interval_ms: u64,
}

/// Execution host settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Chrome DevTools HTTP endpoint of the browser holding the session
    pub cdp_url: String,

    /// URL pattern (`*` wildcard) an existing tab must match to be reused
    pub target_pattern: String,

    /// Page opened when no matching tab exists
    pub provision_url: String,

    /// Page function implementing the link capability
    pub capability: String,

    /// Upper bound on waiting for a provisioned tab to finish loading
    pub ready_timeout_ms: u64,

    /// Extra delay after a fresh tab loads, for its own scripts to initialize
    pub settle_delay_ms: u64,
}

/// Dispatch strategy for the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStrategy {
    /// Evaluate the capability in the host directly
    Direct,
    /// Post a correlated message into the host and wait for the answer
    Relay,
}

impl std::str::FromStr for DispatchStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(DispatchStrategy::Direct),
            "relay" => Ok(DispatchStrategy::Relay),
            other => Err(Error::config_field_invalid(
                "executor.strategy",
                format!("Unknown dispatch strategy '{}'. Must be 'direct' or 'relay'", other),
            )),
        }
    }
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchStrategy::Direct => write!(f, "direct"),
            DispatchStrategy::Relay => write!(f, "relay"),
        }
    }
}

/// Task executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Dispatch strategy
    pub strategy: DispatchStrategy,

    /// Upper bound on one capability call
    pub response_timeout_ms: u64,

    /// Delay between reloading the host and retrying
    pub retry_settle_ms: u64,

    /// Retries after a transport failure (0 disables retry)
    pub max_transport_retries: u32,

    /// Prefix of the per-task attribution token
    pub sub_id_prefix: String,
}

/// Enable flag and keep-alive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Keep-alive period
    pub keepalive_interval_ms: u64,

    /// Persisted enable flag (relative paths resolve against `storage.data_dir`)
    pub state_file: String,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn (or warning), error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,

    /// Ship log records to the coordinator's `/log` endpoint
    pub remote: bool,

    /// Minimum level shipped to the coordinator
    pub remote_level: String,
}

/// Storage path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory
    pub data_dir: String,
}

// Default implementations

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:3000/api/extension".to_string(),
            push_enabled: true,
            reconnect_delay_ms: 5_000,
            watchdog_silence_ms: 40_000,
            watchdog_check_ms: 10_000,
            request_timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            cdp_url: "http://127.0.0.1:9222".to_string(),
            target_pattern: "https://affiliate.shopee.vn/*".to_string(),
            provision_url: "https://affiliate.shopee.vn/offer/custom_link".to_string(),
            capability: "generateOfferLink".to_string(),
            ready_timeout_ms: 15_000,
            settle_delay_ms: 3_000,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::Direct,
            response_timeout_ms: 15_000,
            retry_settle_ms: 3_000,
            max_transport_retries: 1,
            sub_id_prefix: "ht24h".to_string(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 15_000,
            state_file: "state.json".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
            remote: true,
            remote_level: "info".to_string(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.linkgen/worker".to_string(),
        }
    }
}

impl CoordinatorSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn watchdog_silence(&self) -> Duration {
        Duration::from_millis(self.watchdog_silence_ms)
    }

    pub fn watchdog_check(&self) -> Duration {
        Duration::from_millis(self.watchdog_check_ms)
    }
}

impl WorkerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        // 1. Load from config file if it exists
        let config_file = Self::find_config_file(config_path)?;
        if let Some(path) = config_file {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|e| Error::IoRead {
                path: path.clone(),
                source: e,
            })?;
            config = toml::from_str(&content).map_err(|e| {
                Error::config_parse(format!("{}: {}", path.display(), e.message()), Some(e))
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        // 2. Apply environment variable overrides
        config.apply_env_overrides();

        // 3. Expand paths
        config.expand_paths();

        // 4. Validate
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // If explicit path provided, use it (error if not found)
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("linkgen-worker.toml"),
            PathBuf::from("config.toml"),
            dirs::config_dir()
                .map(|p| p.join("linkgen").join("worker.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".linkgen").join("worker.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/linkgen/worker.toml"),
        ];

        for path in &search_paths {
            if path.is_file() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LINKGEN_WORKER_NAME") {
            self.worker.name = Some(val);
        }

        // Coordinator settings
        if let Ok(val) = std::env::var("LINKGEN_COORDINATOR_URL") {
            self.coordinator.url = val;
        }
        if let Ok(val) = std::env::var("LINKGEN_PUSH_ENABLED") {
            self.coordinator.push_enabled = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("LINKGEN_RECONNECT_DELAY_MS") {
            if let Ok(n) = val.parse() {
                self.coordinator.reconnect_delay_ms = n;
            }
        }

        // Poller settings
        if let Ok(val) = std::env::var("LINKGEN_POLL_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                self.poller.interval_ms = n;
            }
        }

        // Host settings
        if let Ok(val) = std::env::var("LINKGEN_CDP_URL") {
            self.host.cdp_url = val;
        }
        if let Ok(val) = std::env::var("LINKGEN_TARGET_PATTERN") {
            self.host.target_pattern = val;
        }
        if let Ok(val) = std::env::var("LINKGEN_PROVISION_URL") {
            self.host.provision_url = val;
        }

        // Executor settings
        if let Ok(val) = std::env::var("LINKGEN_STRATEGY") {
            if let Ok(strategy) = val.parse() {
                self.executor.strategy = strategy;
            }
        }
        if let Ok(val) = std::env::var("LINKGEN_MAX_TRANSPORT_RETRIES") {
            if let Ok(n) = val.parse() {
                self.executor.max_transport_retries = n;
            }
        }

        // Logging settings
        if let Ok(val) = std::env::var("LINKGEN_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("LINKGEN_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("LINKGEN_LOG_JSON") {
            self.logging.json_format = parse_bool(&val);
        }
        if let Ok(val) = std::env::var("LINKGEN_LOG_REMOTE") {
            self.logging.remote = parse_bool(&val);
        }

        // Storage settings
        if let Ok(val) = std::env::var("LINKGEN_DATA_DIR") {
            self.storage.data_dir = val;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);
        self.lifecycle.state_file = expand_path(&self.lifecycle.state_file);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.coordinator.url).map_err(|e| {
            Error::config_field_invalid("coordinator.url", format!("Invalid coordinator URL: {}", e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config_field_invalid(
                "coordinator.url",
                "Coordinator URL must start with http:// or https://",
            ));
        }

        url::Url::parse(&self.host.cdp_url).map_err(|e| {
            Error::config_field_invalid("host.cdp_url", format!("Invalid DevTools URL: {}", e))
        })?;

        if self.host.target_pattern.is_empty() {
            return Err(Error::config_field_invalid(
                "host.target_pattern",
                "Target pattern cannot be empty",
            ));
        }

        if self.host.capability.is_empty()
            || !self
                .host
                .capability
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$' || c == '.')
        {
            return Err(Error::config_field_invalid(
                "host.capability",
                "Capability must be a plain JavaScript function name",
            ));
        }

        let non_zero = [
            ("coordinator.reconnect_delay_ms", self.coordinator.reconnect_delay_ms),
            ("coordinator.watchdog_check_ms", self.coordinator.watchdog_check_ms),
            ("poller.interval_ms", self.poller.interval_ms),
            ("executor.response_timeout_ms", self.executor.response_timeout_ms),
            ("lifecycle.keepalive_interval_ms", self.lifecycle.keepalive_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(Error::config_field_invalid(field, format!("{} must be greater than 0", field)));
            }
        }

        if self.coordinator.watchdog_silence_ms <= self.coordinator.watchdog_check_ms {
            return Err(Error::config_field_invalid(
                "coordinator.watchdog_silence_ms",
                "watchdog_silence_ms must be greater than watchdog_check_ms",
            ));
        }

        // "warning" is the coordinator's spelling
        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        for (field, level) in [
            ("logging.level", &self.logging.level),
            ("logging.remote_level", &self.logging.remote_level),
        ] {
            if !valid_levels.contains(&level.to_lowercase().as_str()) {
                return Err(Error::config_field_invalid(
                    field,
                    format!(
                        "Invalid log level '{}'. Must be one of: {}",
                        level,
                        valid_levels.join(", ")
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Get the data directory as a PathBuf
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    /// Location of the persisted enable flag
    pub fn state_file(&self) -> PathBuf {
        let path = Path::new(&self.lifecycle.state_file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    /// Name used as `sender` for shipped log records
    pub fn sender_name(&self) -> String {
        self.worker.name.clone().unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .map(|h| format!("linkgen-worker@{}", h))
                .unwrap_or_else(|| "linkgen-worker".to_string())
        })
    }
}

fn parse_bool(val: &str) -> bool {
    val.eq_ignore_ascii_case("true") || val == "1"
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".linkgen")
                .join("worker.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::IoWrite {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|e| Error::IoWrite {
        path: config_path.clone(),
        source: e,
    })?;

    println!("Configuration file created: {}", config_path.display());
    Ok(())
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Link generation worker configuration

[worker]
# Name reported to the coordinator's /log endpoint (defaults to hostname)
# name = "office-laptop"

[coordinator]
# Base URL; /stream, /pending-tasks, /result and /log are appended
url = "http://localhost:3000/api/extension"

# Open the push stream (set false for coordinators without streaming)
push_enabled = true

# Fixed delay before reconnecting the push stream
reconnect_delay_ms = 5000

# No message (task or ping) for this long counts as a stalled stream
watchdog_silence_ms = 40000
watchdog_check_ms = 10000

request_timeout_ms = 15000
connect_timeout_ms = 10000

[poller]
# Backlog poll period. Use 2000-5000 when push_enabled = false.
interval_ms = 60000

[host]
# Chromium started with --remote-debugging-port=9222
cdp_url = "http://127.0.0.1:9222"
target_pattern = "https://affiliate.shopee.vn/*"
provision_url = "https://affiliate.shopee.vn/offer/custom_link"

# Page function called as capability(itemId, shopId, subId, originalUrl)
capability = "generateOfferLink"

ready_timeout_ms = 15000
settle_delay_ms = 3000

[executor]
# "direct" evaluates the capability in the tab, "relay" posts a TASK message
strategy = "direct"
response_timeout_ms = 15000
retry_settle_ms = 3000
max_transport_retries = 1
sub_id_prefix = "ht24h"

[lifecycle]
keepalive_interval_ms = 15000
# Relative paths resolve against storage.data_dir
state_file = "state.json"

[logging]
# Log level: trace, debug, info, warn (or warning), error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.linkgen/worker/logs/worker.log"

max_file_size_mb = 100
max_files = 5
json_format = false

# Ship records to the coordinator's /log endpoint
remote = true
remote_level = "info"

[storage]
data_dir = "~/.linkgen/worker"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert_eq!(config.coordinator.url, "http://localhost:3000/api/extension");
        assert_eq!(config.coordinator.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(config.coordinator.watchdog_silence(), Duration::from_secs(40));
        assert_eq!(config.coordinator.watchdog_check(), Duration::from_secs(10));
        assert_eq!(config.executor.strategy, DispatchStrategy::Direct);
        assert_eq!(config.executor.max_transport_retries, 1);
        assert_eq!(config.host.ready_timeout_ms, 15_000);
    }

    #[test]
    fn test_env_override() {
        env::set_var("LINKGEN_COORDINATOR_URL", "https://coord.example.com/api/extension");
        env::set_var("LINKGEN_STRATEGY", "relay");
        env::set_var("LINKGEN_PUSH_ENABLED", "false");

        let mut config = WorkerConfig::default();
        config.apply_env_overrides();

        assert_eq!(config.coordinator.url, "https://coord.example.com/api/extension");
        assert_eq!(config.executor.strategy, DispatchStrategy::Relay);
        assert!(!config.coordinator.push_enabled);

        env::remove_var("LINKGEN_COORDINATOR_URL");
        env::remove_var("LINKGEN_STRATEGY");
        env::remove_var("LINKGEN_PUSH_ENABLED");
    }

    #[test]
    fn test_validation_invalid_url() {
        let mut config = WorkerConfig::default();
        config.coordinator.url = "ws://invalid.com".to_string();
        assert!(config.validate().is_err());

        config.coordinator.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_watchdog_ordering() {
        let mut config = WorkerConfig::default();
        config.coordinator.watchdog_silence_ms = 5_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_zero_interval() {
        let mut config = WorkerConfig::default();
        config.poller.interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poller.interval_ms"));
    }

    #[test]
    fn test_validation_capability_name() {
        let mut config = WorkerConfig::default();
        config.host.capability = "alert(1);x".to_string();
        assert!(config.validate().is_err());

        config.host.capability = "window.afl.generateOfferLink".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let mut config = WorkerConfig::default();
        config.logging.remote_level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.remote_level = "WARNING".to_string();
        config.logging.level = "warn".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_valid_config() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_state_file_resolution() {
        let mut config = WorkerConfig::default();
        config.storage.data_dir = "/var/lib/linkgen".to_string();
        assert_eq!(config.state_file(), PathBuf::from("/var/lib/linkgen/state.json"));

        config.lifecycle.state_file = "/tmp/flag.json".to_string();
        assert_eq!(config.state_file(), PathBuf::from("/tmp/flag.json"));
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("Relay".parse::<DispatchStrategy>().unwrap(), DispatchStrategy::Relay);
        assert!("sideways".parse::<DispatchStrategy>().is_err());
    }

    #[test]
    fn test_default_config_template_parses() {
        let parsed: WorkerConfig = toml::from_str(&generate_default_config()).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.poller.interval_ms, 60_000);
        assert_eq!(parsed.host.capability, "generateOfferLink");
    }

    #[test]
    fn test_parse_config_file() {
        let config_str = r#"
[coordinator]
url = "https://coord.example.com/api/extension"
push_enabled = false

[poller]
interval_ms = 2000

[executor]
strategy = "relay"
max_transport_retries = 0
"#;

        let config: WorkerConfig = toml::from_str(config_str).unwrap();

        assert!(!config.coordinator.push_enabled);
        assert_eq!(config.poller.interval_ms, 2000);
        assert_eq!(config.executor.strategy, DispatchStrategy::Relay);
        assert_eq!(config.executor.max_transport_retries, 0);
        // untouched sections keep defaults
        assert_eq!(config.host.settle_delay_ms, 3_000);
    }
}
