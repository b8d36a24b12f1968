//! Voice CLI Library
//!
//! Shared functionality for the voice command-line tools.

pub mod config;
pub mod stats;

pub use config::{ClientSettings, Config, ConfigError, ServerSettings};
pub use stats::{format_buffer_stats, format_bytes, format_connection_stats, format_datagram_stats};

use tracing_subscriber::EnvFilter;

/// Initialize logging; `RUST_LOG` overrides the default level
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
