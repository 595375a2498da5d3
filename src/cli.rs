//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the link generation worker.

use clap::{Parser, Subcommand};

/// Link generation worker
///
/// Listens to the coordinator for generate_link tasks, runs them on a
/// browser execution host, and reports the resulting links back.
#[derive(Parser, Debug)]
#[command(name = "linkgen-worker")]
#[command(author, version, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the worker
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker (connects to the coordinator and processes tasks)
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "LINKGEN_CONFIG")]
        config: Option<String>,

        /// Turn task processing on (persisted) if it was disabled
        #[arg(long)]
        enable: bool,
    },

    /// Turn task processing on (persisted)
    Enable {
        /// Path to configuration file
        #[arg(short, long, env = "LINKGEN_CONFIG")]
        config: Option<String>,
    },

    /// Turn task processing off (persisted)
    Disable {
        /// Path to configuration file
        #[arg(short, long, env = "LINKGEN_CONFIG")]
        config: Option<String>,
    },

    /// Show the persisted enabled flag and effective settings
    Status {
        /// Path to configuration file
        #[arg(short, long, env = "LINKGEN_CONFIG")]
        config: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}
