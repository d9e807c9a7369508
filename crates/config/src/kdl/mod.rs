//! KDL configuration parsing.

mod discovery;
mod mesh;
mod server;

use anyhow::{Context, Result};
use kdl::{KdlDocument, KdlNode, KdlValue};
use tracing::{debug, trace, warn};

use crate::Config;

pub use discovery::parse_discovery_config;
pub use mesh::parse_mesh;
pub use server::parse_server_config;

/// Parse a full configuration document.
pub fn parse_document(source: &str) -> Result<Config> {
    let doc = source
        .parse::<KdlDocument>()
        .map_err(|e| anyhow::anyhow!("{:?}", miette::Report::new(e)))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        let name = node.name().value();
        trace!(block = %name, "Parsing top-level block");
        match name {
            "server" => {
                config.server = parse_server_config(node).context("invalid 'server' block")?;
            }
            "discovery" => {
                config.discovery =
                    parse_discovery_config(node).context("invalid 'discovery' block")?;
            }
            "mesh" => {
                config.mesh = parse_mesh(node).context("invalid 'mesh' block")?;
            }
            other => {
                warn!(block = %other, "Ignoring unknown top-level configuration block");
            }
        }
    }

    debug!(
        listen = %config.server.listen,
        services = config.mesh.services.len(),
        endpoints = config.mesh.endpoints.len(),
        routes = config.mesh.routes.len(),
        listeners = config.mesh.listeners.len(),
        "Parsed configuration document"
    );

    Ok(config)
}

// =============================================================================
// Helpers
// =============================================================================

/// Child nodes of `node`, empty when it has no block.
pub(crate) fn children(node: &KdlNode) -> &[KdlNode] {
    node.children().map(|doc| doc.nodes()).unwrap_or(&[])
}

/// Positional arguments of a node.
pub(crate) fn args(node: &KdlNode) -> impl Iterator<Item = &KdlValue> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .map(|e| e.value())
}

/// First positional argument as a string.
pub(crate) fn get_first_arg_string(node: &KdlNode) -> Option<String> {
    args(node).next().and_then(|v| v.as_string()).map(str::to_string)
}

/// Named property `key=value`.
pub(crate) fn get_prop<'a>(node: &'a KdlNode, key: &str) -> Option<&'a KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value() == key).unwrap_or(false))
        .map(|e| e.value())
}

pub(crate) fn get_prop_string(node: &KdlNode, key: &str) -> Option<String> {
    get_prop(node, key)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

pub(crate) fn get_prop_int(node: &KdlNode, key: &str) -> Option<i128> {
    get_prop(node, key).and_then(|v| v.as_integer())
}

/// First argument of the child node `name`, as a string.
pub(crate) fn get_string_entry(node: &KdlNode, name: &str) -> Option<String> {
    children(node)
        .iter()
        .find(|n| n.name().value() == name)
        .and_then(get_first_arg_string)
}

/// First argument of the child node `name`, as an integer.
pub(crate) fn get_int_entry(node: &KdlNode, name: &str) -> Option<i128> {
    children(node)
        .iter()
        .find(|n| n.name().value() == name)
        .and_then(|n| args(n).next())
        .and_then(|v| v.as_integer())
}

/// Convert a KDL integer into a port number.
pub(crate) fn to_port(value: i128, what: &str) -> Result<u16> {
    u16::try_from(value).map_err(|_| anyhow::anyhow!("{} port {} is out of range 0-65535", what, value))
}
