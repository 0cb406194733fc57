//! Command-line argument parsing for the tether client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether client command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tether", about = "Resilient single-connection transport client")]
pub struct CliArgs {
    /// Remote endpoint (`tcp://host:port` or `host:port`).
    #[arg(long)]
    pub url: Option<String>,

    /// Connect on startup.
    #[arg(long)]
    pub auto_connect: Option<bool>,

    /// Reconnect automatically after a lost connection.
    #[arg(long)]
    pub auto_reconnect: Option<bool>,

    /// Credential sent after every open.
    #[arg(long)]
    pub auth_token: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Send one request with this event name once connected.
    #[arg(long)]
    pub send: Option<String>,

    /// Payload for `--send`, sent as UTF-8 bytes.
    #[arg(long, requires = "send")]
    pub data: Option<String>,

    /// Timeout for `--send` in milliseconds.
    #[arg(long, requires = "send")]
    pub timeout_ms: Option<u64>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref url) = args.url {
            self.connection.url = url.clone();
        }
        if let Some(auto) = args.auto_connect {
            self.connection.auto_connect = auto;
        }
        if let Some(auto) = args.auto_reconnect {
            self.connection.auto_reconnect = auto;
        }
        if let Some(ref token) = args.auth_token {
            self.connection.auth_token = Some(token.clone());
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
