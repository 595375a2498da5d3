//! Link generation worker
//!
//! Entry point for the worker binary. The worker listens to the
//! coordinator for generate_link tasks (push stream with a polling
//! fallback), runs each one on a browser execution host, and reports
//! the outcome back.

mod cli;
mod config;
mod coordinator;
mod error;
mod executor;
mod host;
mod lifecycle;
mod logging;
mod protocol;
mod version;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::config::WorkerConfig;
use crate::coordinator::{
    Connector, ConnectorConfig, CoordinatorApi, HttpCoordinator, Poller, ResultReporter,
};
use crate::error::{Error, Result};
use crate::executor::{Dispatcher, ExecutorConfig, PendingResponses, TaskExecutor};
use crate::host::{CdpHostProvider, HostManager, HostManagerConfig};
use crate::lifecycle::{EnabledFlag, Lifecycle, LifecycleConfig, PersistedState};

/// Bound on each reachability check made by `status`
const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }
}

fn run_command(cli: Cli) -> Result<()> {
    let simple_level = if cli.quiet {
        tracing::Level::ERROR
    } else {
        tracing::Level::WARN
    };

    match cli.command {
        Commands::Version => {
            version::print_version();
            Ok(())
        }
        Commands::Config { subcommand } => {
            logging::init_simple(simple_level)?;
            handle_config_command(subcommand)
        }
        Commands::Enable { config } => {
            logging::init_simple(simple_level)?;
            set_enabled(config.as_deref(), true)
        }
        Commands::Disable { config } => {
            logging::init_simple(simple_level)?;
            set_enabled(config.as_deref(), false)
        }
        Commands::Status { config } => {
            logging::init_simple(simple_level)?;
            print_status(config.as_deref())
        }
        Commands::Run { config, enable } => {
            let config = WorkerConfig::load(config.as_deref())?;
            run_worker(config, enable, cli.verbose, cli.quiet)
        }
    }
}

/// Run the worker until Ctrl+C
fn run_worker(config: WorkerConfig, enable: bool, verbose: u8, quiet: bool) -> Result<()> {
    // One cooperative scheduler: callbacks never race each other
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async move {
        // The guards must be kept alive for the lifetime of the program
        let mut log_guards = logging::init_logging(
            &config.logging,
            verbose,
            quiet,
            &config.sender_name(),
        )?;

        let build = version::BUILD;
        info!(
            version = %build.full_version(),
            target = %build.target,
            profile = %build.profile,
            "Starting link generation worker"
        );

        async_worker_main(config, enable, &mut log_guards).await
    })
}

async fn async_worker_main(
    config: WorkerConfig,
    enable: bool,
    log_guards: &mut logging::LogGuards,
) -> Result<()> {
    ensure_data_dir(&config)?;

    info!(
        sender = %config.sender_name(),
        coordinator_url = %config.coordinator.url,
        push = config.coordinator.push_enabled,
        strategy = %config.executor.strategy,
        "Configuration loaded"
    );

    let flag = EnabledFlag::load(config.state_file());

    let api: Arc<dyn CoordinatorApi> = Arc::new(HttpCoordinator::new(&config.coordinator)?);
    let log_shipper = log_guards.take_shipper().map(|s| s.spawn(Arc::clone(&api)));

    let responses = Arc::new(PendingResponses::new());
    let provider = Arc::new(CdpHostProvider::new(&config.host, Arc::clone(&responses))?);
    let hosts = Arc::new(HostManager::new(
        provider,
        HostManagerConfig::from(&config.host),
    ));

    let reporter = Arc::new(ResultReporter::new(Arc::clone(&api)));
    let executor = Arc::new(TaskExecutor::new(
        ExecutorConfig::from(&config.executor),
        Arc::clone(&hosts),
        responses,
        reporter,
        flag.clone(),
    ));
    let tracker = executor.tracker();

    let dispatcher = Arc::new(Dispatcher::new(executor, flag.clone()));
    let poller = Arc::new(Poller::new(Arc::clone(&api), Arc::clone(&dispatcher)));
    let connector = Arc::new(Connector::new(
        api,
        Arc::clone(&dispatcher),
        Arc::clone(&poller),
        flag.clone(),
        ConnectorConfig::from(&config.coordinator),
    ));

    let lifecycle = Arc::new(Lifecycle::new(
        flag,
        connector,
        poller,
        hosts,
        Arc::clone(&tracker),
        LifecycleConfig::from(&config),
    ));
    lifecycle.start();
    if enable && !lifecycle.is_enabled() {
        lifecycle.set_enabled(true)?;
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for shutdown signal: {}", e)))?;
    info!("Shutdown signal received");

    lifecycle.shutdown();
    if let Some(handle) = log_shipper {
        handle.abort();
    }

    let stats = tracker.stats();
    info!(
        completed = stats.completed,
        failed = stats.failed,
        abandoned = stats.abandoned,
        retries = stats.retries,
        duplicates = dispatcher.duplicates(),
        "Worker shutting down"
    );

    Ok(())
}

/// Ensure the data directory holding the state file exists
fn ensure_data_dir(config: &WorkerConfig) -> Result<()> {
    let path = config.data_dir();
    if !path.exists() {
        std::fs::create_dir_all(&path).map_err(|e| Error::IoWrite {
            path: path.clone(),
            source: e,
        })?;
        info!(path = %path.display(), "Created directory");
    }
    Ok(())
}

/// Persist the enabled flag. A running worker picks it up on its next keep-alive.
fn set_enabled(config_path: Option<&str>, enabled: bool) -> Result<()> {
    let config = WorkerConfig::load(config_path)?;
    ensure_data_dir(&config)?;

    let flag = EnabledFlag::load(config.state_file());
    flag.set(enabled)?;

    if let Some(path) = flag.path() {
        println!(
            "Worker {} ({})",
            if enabled { "enabled" } else { "disabled" },
            path.display()
        );
    }
    Ok(())
}

fn print_status(config_path: Option<&str>) -> Result<()> {
    let config = WorkerConfig::load(config_path)?;
    let state_file = config.state_file();

    let state = match PersistedState::read(&state_file) {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "State file unreadable, showing default");
            PersistedState::default()
        }
    };

    println!("Enabled:      {}", state.extension_enabled);
    if let Some(updated) = state.updated_at {
        println!("Updated:      {}", updated.to_rfc3339());
    }
    println!("State file:   {}", state_file.display());
    println!("Sender:       {}", config.sender_name());
    println!("Coordinator:  {}", config.coordinator.url);
    println!(
        "Push stream:  {}",
        if config.coordinator.push_enabled { "on" } else { "off (polling only)" }
    );
    println!("Poll every:   {}s", config.poller.interval_ms / 1000);
    println!("Host:         {}", config.host.cdp_url);
    println!("Strategy:     {}", config.executor.strategy);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;
    let (server, tabs) = runtime.block_on(async {
        tokio::join!(check_coordinator(&config), count_host_tabs(&config))
    });

    println!(
        "Server:       {}",
        match server {
            Ok(()) => "reachable".to_string(),
            Err(e) => format!("unreachable ({})", e),
        }
    );
    println!(
        "Host tabs:    {}",
        match tabs {
            Ok(0) => "none open".to_string(),
            Ok(n) => format!("{} open", n),
            Err(e) => format!("unavailable ({})", e),
        }
    );

    Ok(())
}

/// Open the push stream once and drop it
async fn check_coordinator(config: &WorkerConfig) -> Result<()> {
    let api = HttpCoordinator::new(&config.coordinator)?;
    match tokio::time::timeout(STATUS_CHECK_TIMEOUT, api.open_stream()).await {
        Ok(stream) => stream.map(drop),
        Err(_) => Err(Error::connection_failed(
            &config.coordinator.url,
            format!("no answer within {}s", STATUS_CHECK_TIMEOUT.as_secs()),
        )),
    }
}

/// Count open browser tabs matching the host pattern
async fn count_host_tabs(config: &WorkerConfig) -> Result<usize> {
    let provider = CdpHostProvider::new(&config.host, Arc::new(PendingResponses::new()))?;
    match tokio::time::timeout(
        STATUS_CHECK_TIMEOUT,
        provider.count_matching(&config.host.target_pattern),
    )
    .await
    {
        Ok(count) => count,
        Err(_) => Err(Error::connection_failed(
            &config.host.cdp_url,
            format!("no answer within {}s", STATUS_CHECK_TIMEOUT.as_secs()),
        )),
    }
}

/// Handle configuration subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = WorkerConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            config::init_config(path.as_deref(), force)?;
        }
        ConfigSubcommand::Validate { config } => {
            WorkerConfig::load(config.as_deref())?;
            println!("Configuration is valid.");
        }
    }

    Ok(())
}
