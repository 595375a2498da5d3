//! Error types for the link generation worker
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - Transport vs. business classification for the retry policy
//! - User-friendly messages with suggestions
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for worker operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Connection errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    ConnectionLost = 303,

    // Protocol errors (4xx)
    ProtocolMalformed = 401,

    // Execution errors (5xx)
    ExecutionTimeout = 501,
    ExecutionTransport = 504,
    DuplicateListener = 505,

    // Execution host errors (6xx)
    HostUnavailable = 600,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Connection errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Execution errors
            600..=699 => 60, // Host errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the worker
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // ─────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────

    /// Connection failed
    #[error("Failed to connect to {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Connection lost mid-stream
    #[error("Lost connection: {message}")]
    ConnectionLost { message: String },

    // ─────────────────────────────────────────────────────────────
    // Execution Errors
    // ─────────────────────────────────────────────────────────────

    /// The host did not answer a dispatched task in time
    #[error("Task {request_id} timed out after {timeout_secs}s")]
    ResponseTimeout { request_id: String, timeout_secs: u64 },

    /// The request never reached the capability, or the answer never came back
    #[error("Execution transport failure: {message}")]
    HostTransport { message: String },

    /// A response waiter for this request is already outstanding
    #[error("A response listener is already registered for {request_id}")]
    DuplicateListener { request_id: String },

    // ─────────────────────────────────────────────────────────────
    // Host Errors
    // ─────────────────────────────────────────────────────────────

    /// Execution host could not be located or provisioned
    #[error("Execution host unavailable: {message}")]
    HostUnavailable { message: String },

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,
            Error::Http(e) if e.is_timeout() => ErrorCode::ConnectionTimeout,
            Error::Http(_) => ErrorCode::ConnectionFailed,
            Error::WebSocket(_) => ErrorCode::ConnectionFailed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionLost { .. } => ErrorCode::ConnectionLost,

            Error::ResponseTimeout { .. } => ErrorCode::ExecutionTimeout,
            Error::HostTransport { .. } => ErrorCode::ExecutionTransport,
            Error::DuplicateListener { .. } => ErrorCode::DuplicateListener,

            Error::HostUnavailable { .. } => ErrorCode::HostUnavailable,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Whether a dispatch failed on the way to or from the host, as opposed
    /// to the capability answering with a failure. Only these are retried.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::ResponseTimeout { .. }
                | Error::HostTransport { .. }
                | Error::ConnectionLost { .. }
                | Error::WebSocket(_)
        )
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'linkgen-worker config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'linkgen-worker config validate' to see details."
            ),
            Error::ConfigValidation { .. } | Error::Config(_) => Some(
                "Review the configuration file and fix the invalid values."
            ),

            Error::ConnectionFailed { .. } | Error::Http(_) => Some(
                "Check your network connection and verify the coordinator URL is correct."
            ),
            Error::ConnectionLost { .. } => Some(
                "The stream was interrupted. The worker reconnects automatically."
            ),

            Error::HostUnavailable { .. } => Some(
                "Start Chromium with --remote-debugging-port and log in to the affiliate site, then check 'host.cdp_url'."
            ),
            Error::ResponseTimeout { .. } => Some(
                "The host tab did not answer. Increase 'executor.response_timeout_ms' or reload the tab."
            ),

            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        let code = self.code();
        format!("[{}] {}", code.as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors (for ergonomic error creation)
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound { path: path.into() }
    }

    /// Create a config parse error
    pub fn config_parse(message: impl Into<String>, source: Option<toml::de::Error>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            source,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a connection lost error
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Error::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a host unavailable error
    pub fn host_unavailable(message: impl Into<String>) -> Self {
        Error::HostUnavailable {
            message: message.into(),
        }
    }

    /// Create a transport failure error
    pub fn host_transport(message: impl Into<String>) -> Self {
        Error::HostTransport {
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_format() {
        assert_eq!(ErrorCode::ConfigNotFound.as_str(), "E100");
        assert_eq!(ErrorCode::ConnectionFailed.as_str(), "E300");
        assert_eq!(ErrorCode::HostUnavailable.as_str(), "E600");
        assert_eq!(ErrorCode::InternalError.as_str(), "E900");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(ErrorCode::ConfigNotFound.exit_code(), 10);
        assert_eq!(ErrorCode::IoRead.exit_code(), 20);
        assert_eq!(ErrorCode::ConnectionFailed.exit_code(), 30);
        assert_eq!(ErrorCode::ExecutionTimeout.exit_code(), 50);
        assert_eq!(ErrorCode::HostUnavailable.exit_code(), 60);
        assert_eq!(ErrorCode::InternalError.exit_code(), 90);
    }

    #[test]
    fn test_error_display() {
        let err = Error::config_not_found("/path/to/config.toml");
        assert!(err.to_string().contains("/path/to/config.toml"));

        let err = Error::ResponseTimeout {
            request_id: "r1".into(),
            timeout_secs: 15,
        };
        assert_eq!(err.to_string(), "Task r1 timed out after 15s");
    }

    #[test]
    fn test_transport_classification() {
        assert!(Error::host_transport("tab closed").is_transport());
        assert!(Error::connection_lost("eof").is_transport());
        assert!(Error::ResponseTimeout { request_id: "r".into(), timeout_secs: 15 }.is_transport());
        // a DevTools socket that cannot be opened is retried after reload
        let ws = Error::from(tokio_tungstenite::tungstenite::Error::ConnectionClosed);
        assert!(ws.is_transport());
        assert_eq!(ws.code(), ErrorCode::ConnectionFailed);

        assert!(!Error::host_unavailable("no tab").is_transport());
        assert!(!Error::Internal("bad".into()).is_transport());
        assert!(!Error::DuplicateListener { request_id: "r".into() }.is_transport());
    }

    #[test]
    fn test_error_suggestions() {
        let err = Error::config_not_found("/test");
        assert!(err.suggestion().unwrap().contains("config init"));

        let err = Error::host_unavailable("no tab");
        assert!(err.suggestion().unwrap().contains("remote-debugging-port"));

        assert!(Error::Internal("x".into()).suggestion().is_none());
    }

    #[test]
    fn test_format_for_terminal() {
        let err = Error::config_not_found("/test/config.toml");
        let formatted = err.format_for_terminal();

        assert!(formatted.contains("E100"));
        assert!(formatted.contains("\x1b[31m"));
        assert!(formatted.contains("Hint"));
    }

    #[test]
    fn test_format_for_log() {
        let err = Error::host_unavailable("provisioning refused");
        let formatted = err.format_for_log();

        assert!(formatted.contains("[E600]"));
        assert!(formatted.contains("provisioning refused"));
        assert!(!formatted.contains("\x1b["));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();

        assert_eq!(err.code(), ErrorCode::IoNotFound);
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: Error = json_err.into();
        assert_eq!(err.code(), ErrorCode::ProtocolMalformed);
    }
}
