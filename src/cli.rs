//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Local proxy relay manager with health-monitored upstream failover
#[derive(Parser, Debug)]
#[command(name = "relayguard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "RELAYGUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "RELAYGUARD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "RELAYGUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the monitoring daemon (default)
    Serve,

    /// Configuration management commands
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Import a vless:// share link as an endpoint's upstream
    ImportVless {
        /// The vless:// URI
        #[arg(required = true)]
        uri: String,

        /// Endpoint listen port receiving the upstream
        #[arg(short, long, required = true)]
        port: u16,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load and validate the configuration
    Check,

    /// Print the effective configuration as YAML
    Show,

    /// Print the rendered proxy engine configuration as JSON
    Render,
}
