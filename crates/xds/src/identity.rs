//! Proxy identity derived from the Envoy node.

use std::collections::BTreeMap;
use std::net::IpAddr;

use beacon_common::NodeId;
use beacon_config::ProxyKind;
use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::google::protobuf::value::Kind;
use serde::Serialize;

use crate::error::XdsError;

/// Who is on the other end of a stream.
///
/// Node ids follow the `kind~ip~id~domain` convention, e.g.
/// `sidecar~10.1.1.1~reviews-v1.default~default.svc.cluster.local`. Ids
/// that don't follow it are accepted as-is with an unknown kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyIdentity {
    pub node_id: NodeId,
    pub kind: ProxyKind,
    pub ip: Option<IpAddr>,
    pub cluster: String,
    /// String-valued node metadata.
    pub metadata: BTreeMap<String, String>,
}

impl ProxyIdentity {
    pub fn new(node_id: impl Into<String>) -> Self {
        let node_id = NodeId::new(node_id);
        let mut parts = node_id.as_str().split('~');
        let (kind, ip) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(ip), Some(_), Some(_)) => {
                (kind.parse().unwrap_or_default(), ip.parse().ok())
            }
            _ => (ProxyKind::Unknown, None),
        };
        Self {
            node_id,
            kind,
            ip,
            cluster: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Build the identity from the node of a request.
    pub fn from_node(node: &Node) -> Result<Self, XdsError> {
        if node.id.is_empty() {
            return Err(XdsError::MalformedRequest("node id is empty".to_string()));
        }
        let mut identity = Self::new(node.id.clone());
        identity.cluster = node.cluster.clone();
        if let Some(metadata) = &node.metadata {
            identity.metadata = metadata
                .fields
                .iter()
                .filter_map(|(key, value)| match &value.kind {
                    Some(Kind::StringValue(s)) => Some((key.clone(), s.clone())),
                    _ => None,
                })
                .collect();
        }
        Ok(identity)
    }

    pub fn with_kind(mut self, kind: ProxyKind) -> Self {
        self.kind = kind;
        self
    }
}
