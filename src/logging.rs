//! Logging infrastructure using tracing + tracing-subscriber
//!
//! Features:
//! - Console output with colors
//! - File logging with rotation (daily or hourly)
//! - JSON format option
//! - Per-module log levels via RUST_LOG
//! - Optional shipping of this crate's records to the coordinator

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::coordinator::CoordinatorApi;
use crate::error::{Error, Result};
use crate::protocol::LogRecord;

const CRATE_TARGET: &str = "linkgen_worker";

/// Records waiting to be shipped; newer records are dropped when full
const SHIP_QUEUE_SIZE: usize = 256;

/// Guards that must be held for the lifetime of the application
/// to ensure logs are flushed properly
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
    shipper: Option<LogShipper>,
}

impl LogGuards {
    /// Take the remote shipper, if remote logging is enabled
    pub fn take_shipper(&mut self) -> Option<LogShipper> {
        self.shipper.take()
    }
}

/// Initialize the logging system
///
/// Returns guards that must be kept alive for the duration of the program.
/// When dropped, these guards will flush any remaining log entries.
pub fn init_logging(
    settings: &LoggingSettings,
    verbose: u8,
    quiet: bool,
    sender: &str,
) -> Result<LogGuards> {
    // Determine the effective log level
    let level = determine_level(settings, verbose, quiet);

    // Build the environment filter
    let env_filter = build_env_filter(level)?;

    // Create the console layer
    let console_layer = build_console_layer(settings.json_format);

    // Create the file layer if configured
    let (file_layer, file_guard) = if let Some(ref log_file) = settings.file {
        let (layer, guard) = build_file_layer(
            log_file,
            settings.max_file_size_mb,
            settings.max_files,
            settings.json_format,
        )?;
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    // Create the remote layer if configured
    let (remote, shipper) = if settings.remote {
        let (layer, shipper) = remote_layer(sender, parse_level(&settings.remote_level));
        (Some(layer), Some(shipper))
    } else {
        (None, None)
    };

    // Combine layers and initialize
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .with(remote)
        .init();

    tracing::info!(
        level = %level,
        file = ?settings.file,
        json = settings.json_format,
        remote = settings.remote,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
        shipper,
    })
}

/// Determine the effective log level based on settings and CLI flags
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Parse a log level string
fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the environment filter with support for RUST_LOG
fn build_env_filter(cli_level: Level) -> Result<EnvFilter> {
    let base_filter = cli_level.to_string().to_lowercase();

    let directive = |d: &str| {
        d.parse::<Directive>()
            .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", d, e)))
    };

    // Allow RUST_LOG to override for specific modules
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&base_filter))
        // Always show our own crate's logs at the configured level
        .add_directive(directive(&format!("{}={}", CRATE_TARGET, base_filter))?)
        // Reduce noise from dependencies
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("reqwest=warn")?)
        .add_directive(directive("tokio_tungstenite=warn")?)
        .add_directive(directive("tungstenite=warn")?);

    Ok(filter)
}

/// Build the console output layer
fn build_console_layer<S>(json_format: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_target(false)
                .with_ansi(true)
                .compact(),
        )
    }
}

/// Build the file logging layer with rotation
fn build_file_layer<S>(
    log_file: &str,
    max_size_mb: u64,
    max_files: u32,
    json_format: bool,
) -> Result<(Box<dyn Layer<S> + Send + Sync>, WorkerGuard)>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let path = Path::new(log_file);

    // Ensure the directory exists
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Config(format!(
                "Failed to create log directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }

    let directory = path.parent().unwrap_or(Path::new("."));
    let file_name = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("worker");

    // tracing-appender rotates by time only; small size budgets rotate hourly
    let rotation = if max_size_mb > 0 && max_size_mb < 10 {
        Rotation::HOURLY
    } else {
        Rotation::DAILY
    };

    let file_appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file_name)
        .filename_suffix("log")
        .max_log_files(max_files.max(1) as usize)
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to create log file appender: {}", e)))?;

    // Make it non-blocking
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let layer: Box<dyn Layer<S> + Send + Sync> = if json_format {
        Box::new(
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_line_number(true)
                .with_ansi(false),
        )
    };

    Ok((layer, guard))
}

/// Console-only logging for short-lived commands (config, enable, status)
pub fn init_simple(level: Level) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────
// Remote Shipping
// ─────────────────────────────────────────────────────────────────

/// Copies this crate's events into a bounded queue. Never blocks the
/// logging call site.
pub struct RemoteLogLayer {
    sender: Arc<str>,
    min_level: Level,
    tx: mpsc::Sender<LogRecord>,
}

/// Drains the queue filled by [`RemoteLogLayer`]
pub struct LogShipper {
    rx: mpsc::Receiver<LogRecord>,
}

fn remote_layer(sender: &str, min_level: Level) -> (RemoteLogLayer, LogShipper) {
    let (tx, rx) = mpsc::channel(SHIP_QUEUE_SIZE);
    (
        RemoteLogLayer {
            sender: Arc::from(sender),
            min_level,
            tx,
        },
        LogShipper { rx },
    )
}

impl RemoteLogLayer {
    fn wants(&self, target: &str, level: &Level) -> bool {
        // more verbose levels compare greater
        *level <= self.min_level
            && target.starts_with(CRATE_TARGET)
            // records about shipping itself would feed back into the queue
            && !target.starts_with("linkgen_worker::logging")
    }
}

impl<S: Subscriber> Layer<S> for RemoteLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if !self.wants(meta.target(), meta.level()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            message: visitor.finish(),
            level: wire_level(meta.level()).to_string(),
            sender: self.sender.to_string(),
        };
        // full queue: drop the record
        let _ = self.tx.try_send(record);
    }
}

/// Level names the coordinator's `/log` endpoint expects
fn wire_level(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        _ => "DEBUG",
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl LogShipper {
    /// Post queued records until the queue closes. Delivery failures are ignored.
    pub fn spawn(mut self, api: Arc<dyn CoordinatorApi>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(record) = self.rx.recv().await {
                let _ = api.post_log(&record).await;
            }
        })
    }
}
