//! Daemon error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

/// Exit codes for process termination.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum DaemonError {
    #[error(transparent)]
    #[diagnostic(
        code(farelink::config),
        help("Check the config file (farelinkd --config PATH) and FARELINK_* environment overrides.")
    )]
    Config(#[from] farelink_config::ConfigError),

    #[error("could not initialize the relay client")]
    #[diagnostic(
        code(farelink::relay_init),
        help("Verify relay.url and the TLS settings in the [relay] section.")
    )]
    RelayInit(#[source] farelink_relay::RelayError),

    #[error("failed to bind {addr}")]
    #[diagnostic(
        code(farelink::bind),
        help("Is another process already listening on this address?")
    )]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DaemonError {
    /// Map this error to a process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => exit_code::USAGE,
            Self::Bind { .. } => exit_code::CONNECTION,
            Self::RelayInit(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}
