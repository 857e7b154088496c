//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// jwt-gate - JWT authentication with single-live-token revocation checks
#[derive(Parser, Debug)]
#[command(name = "jwt-gate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "JWT_GATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "JWT_GATE_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "JWT_GATE_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "JWT_GATE_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "JWT_GATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (defaults to `serve`)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Sign a token for a configured consumer
    Sign {
        /// Issuer key of the consumer (`jwt_auth.key`)
        #[arg(short, long)]
        key: String,

        /// Extra claims as a JSON object, e.g. '{"sub":"u1"}'
        #[arg(long)]
        payload: Option<String>,
    },

    /// Validate the configuration and exit
    Check,
}
