//! Discovery KDL parsing.

use anyhow::Result;
use tracing::trace;

use crate::discovery::{DiscoveryConfig, ResourceKind, WildcardPolicy};

use super::{args, children, get_int_entry};

/// Parse discovery configuration block
pub fn parse_discovery_config(node: &kdl::KdlNode) -> Result<DiscoveryConfig> {
    trace!("Parsing discovery configuration block");
    let mut config = DiscoveryConfig::default();

    if let Some(v) = get_int_entry(node, "debounce-after-ms") {
        config.debounce_after_ms = non_negative(v, "debounce-after-ms")?;
    }
    if let Some(v) = get_int_entry(node, "debounce-max-ms") {
        config.debounce_max_ms = non_negative(v, "debounce-max-ms")?;
    }
    if let Some(v) = get_int_entry(node, "send-buffer") {
        config.send_buffer = non_negative(v, "send-buffer")? as usize;
    }

    for child in children(node) {
        if child.name().value() != "wildcard" {
            continue;
        }
        let values: Vec<&str> = args(child).filter_map(|v| v.as_string()).collect();
        let [kind, policy] = values.as_slice() else {
            return Err(anyhow::anyhow!(
                "wildcard takes a resource kind and a policy, e.g., wildcard \"routes\" \"explicit\""
            ));
        };
        let kind: ResourceKind = kind.parse().map_err(anyhow::Error::msg)?;
        let policy: WildcardPolicy = policy.parse().map_err(anyhow::Error::msg)?;
        trace!(kind = %kind, policy = ?policy, "Parsed wildcard policy");
        config.wildcard.set(kind, policy);
    }

    trace!(
        debounce_after_ms = config.debounce_after_ms,
        debounce_max_ms = config.debounce_max_ms,
        send_buffer = config.send_buffer,
        "Parsed discovery configuration"
    );

    Ok(config)
}

fn non_negative(value: i128, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow::anyhow!("{} must be non-negative, got {}", field, value))
}
