//! Discovery engine settings: debounce thresholds, stream buffering and
//! per-type wildcard handling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The four resource kinds served over ADS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Listeners,
    Routes,
    Clusters,
    Endpoints,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Listeners,
        ResourceKind::Routes,
        ResourceKind::Clusters,
        ResourceKind::Endpoints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Listeners => "listeners",
            ResourceKind::Routes => "routes",
            ResourceKind::Clusters => "clusters",
            ResourceKind::Endpoints => "endpoints",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "listeners" | "listener" | "lds" => Ok(ResourceKind::Listeners),
            "routes" | "route" | "rds" => Ok(ResourceKind::Routes),
            "clusters" | "cluster" | "cds" => Ok(ResourceKind::Clusters),
            "endpoints" | "endpoint" | "eds" => Ok(ResourceKind::Endpoints),
            other => Err(format!(
                "unknown resource kind '{}'. Valid kinds: listeners, routes, clusters, endpoints",
                other
            )),
        }
    }
}

/// How an empty resource-name list is interpreted for a resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WildcardPolicy {
    /// Empty list subscribes to every resource of the type
    All,
    /// Empty list subscribes to nothing; names must be given
    Explicit,
}

impl FromStr for WildcardPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "wildcard" => Ok(WildcardPolicy::All),
            "explicit" | "none" => Ok(WildcardPolicy::Explicit),
            other => Err(format!(
                "unknown wildcard policy '{}'. Valid policies: all, explicit",
                other
            )),
        }
    }
}

/// Wildcard policy for each resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WildcardPolicies {
    pub listeners: WildcardPolicy,
    pub routes: WildcardPolicy,
    pub clusters: WildcardPolicy,
    pub endpoints: WildcardPolicy,
}

impl WildcardPolicies {
    pub fn get(&self, kind: ResourceKind) -> WildcardPolicy {
        match kind {
            ResourceKind::Listeners => self.listeners,
            ResourceKind::Routes => self.routes,
            ResourceKind::Clusters => self.clusters,
            ResourceKind::Endpoints => self.endpoints,
        }
    }

    pub fn set(&mut self, kind: ResourceKind, policy: WildcardPolicy) {
        match kind {
            ResourceKind::Listeners => self.listeners = policy,
            ResourceKind::Routes => self.routes = policy,
            ResourceKind::Clusters => self.clusters = policy,
            ResourceKind::Endpoints => self.endpoints = policy,
        }
    }
}

impl Default for WildcardPolicies {
    // Envoy requests LDS and CDS as wildcards; RDS and EDS always name
    // the resources they need.
    fn default() -> Self {
        Self {
            listeners: WildcardPolicy::All,
            routes: WildcardPolicy::Explicit,
            clusters: WildcardPolicy::All,
            endpoints: WildcardPolicy::Explicit,
        }
    }
}

/// Discovery engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Quiet period after the last change before a push
    #[serde(default = "default_debounce_after_ms")]
    pub debounce_after_ms: u64,

    /// Upper bound between the first unflushed change and its push
    #[serde(default = "default_debounce_max_ms")]
    pub debounce_max_ms: u64,

    /// Outbound responses buffered per stream before sends block
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    #[serde(default)]
    pub wildcard: WildcardPolicies,
}

fn default_debounce_after_ms() -> u64 { 100 }
fn default_debounce_max_ms() -> u64 { 10_000 }
fn default_send_buffer() -> usize { 32 }

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            debounce_after_ms: default_debounce_after_ms(),
            debounce_max_ms: default_debounce_max_ms(),
            send_buffer: default_send_buffer(),
            wildcard: WildcardPolicies::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn debounce_after(&self) -> Duration {
        Duration::from_millis(self.debounce_after_ms)
    }

    pub fn debounce_max(&self) -> Duration {
        Duration::from_millis(self.debounce_max_ms)
    }

    /// Short thresholds for tests.
    pub fn fast() -> Self {
        Self {
            debounce_after_ms: 10,
            debounce_max_ms: 100,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_discovery_config() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.debounce_after(), Duration::from_millis(100));
        assert_eq!(config.debounce_max(), Duration::from_secs(10));
        assert_eq!(config.send_buffer, 32);
    }

    #[test]
    fn test_default_wildcard_policies() {
        let policies = WildcardPolicies::default();
        assert_eq!(policies.get(ResourceKind::Listeners), WildcardPolicy::All);
        assert_eq!(policies.get(ResourceKind::Clusters), WildcardPolicy::All);
        assert_eq!(policies.get(ResourceKind::Routes), WildcardPolicy::Explicit);
        assert_eq!(policies.get(ResourceKind::Endpoints), WildcardPolicy::Explicit);
    }

    #[test]
    fn test_parse_kind_and_policy() {
        assert_eq!("EDS".parse::<ResourceKind>(), Ok(ResourceKind::Endpoints));
        assert_eq!("route".parse::<ResourceKind>(), Ok(ResourceKind::Routes));
        assert!("secrets".parse::<ResourceKind>().is_err());

        assert_eq!("all".parse::<WildcardPolicy>(), Ok(WildcardPolicy::All));
        assert_eq!("explicit".parse::<WildcardPolicy>(), Ok(WildcardPolicy::Explicit));
        assert!("sometimes".parse::<WildcardPolicy>().is_err());
    }
}
