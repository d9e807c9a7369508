//! Server KDL parsing.

use anyhow::Result;
use tracing::trace;

use crate::server::*;

use super::{get_int_entry, get_string_entry};

/// Parse server configuration block
pub fn parse_server_config(node: &kdl::KdlNode) -> Result<ServerConfig> {
    trace!("Parsing server configuration block");

    let graceful_shutdown_timeout_secs = match get_int_entry(node, "graceful-shutdown-timeout-secs") {
        Some(v) => u64::try_from(v).map_err(|_| {
            anyhow::anyhow!("graceful-shutdown-timeout-secs must be non-negative, got {}", v)
        })?,
        None => default_graceful_shutdown_timeout(),
    };

    let config = ServerConfig {
        listen: get_string_entry(node, "listen").unwrap_or_else(default_listen),
        graceful_shutdown_timeout_secs,
    };

    trace!(
        listen = %config.listen,
        graceful_shutdown_timeout_secs = config.graceful_shutdown_timeout_secs,
        "Parsed server configuration"
    );

    Ok(config)
}
