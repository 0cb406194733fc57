//! Configuration for the tether transport client.
//!
//! Settings persist to disk as a RON file, can be overridden from the
//! command line via clap, and stay forward/backward compatible: missing
//! sections fall back to defaults and unknown fields are ignored.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    Config, ConnectionConfig, DebugConfig, HeartbeatConfig, ReconnectConfig, RequestConfig,
    TransportConfig,
};
pub use error::ConfigError;
