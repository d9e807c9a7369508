//! Resource type URLs, encoded resources and subscriptions.

use std::collections::BTreeSet;
use std::fmt;

use beacon_config::{ResourceKind, WildcardPolicy};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::error::GenerateError;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

/// Resource name Envoy sends to ask for everything explicitly.
pub const WILDCARD_NAME: &str = "*";

/// Type URL for a built-in resource kind.
pub fn type_url_for(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Listeners => LISTENER_TYPE_URL,
        ResourceKind::Routes => ROUTE_TYPE_URL,
        ResourceKind::Clusters => CLUSTER_TYPE_URL,
        ResourceKind::Endpoints => ENDPOINT_TYPE_URL,
    }
}

/// Built-in resource kind for a type URL.
pub fn kind_for(type_url: &str) -> Option<ResourceKind> {
    ResourceKind::ALL
        .into_iter()
        .find(|kind| type_url_for(*kind) == type_url)
}

/// Short label for logs and metrics: `lds`, `rds`, `cds`, `eds`, or the
/// trailing message name for any other type.
pub fn type_label(type_url: &str) -> &str {
    match kind_for(type_url) {
        Some(ResourceKind::Listeners) => "lds",
        Some(ResourceKind::Routes) => "rds",
        Some(ResourceKind::Clusters) => "cds",
        Some(ResourceKind::Endpoints) => "eds",
        None => type_url.rsplit('/').next().unwrap_or(type_url),
    }
}

/// A named, encoded resource ready to be placed in a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub name: String,
    pub payload: Any,
}

impl Resource {
    pub fn new(name: impl Into<String>, payload: Any) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    /// Encode a protobuf message under the given type URL.
    pub fn encode<M: Message>(
        name: impl Into<String>,
        type_url: &str,
        message: &M,
    ) -> Result<Self, GenerateError> {
        let name = name.into();
        let mut value = Vec::with_capacity(message.encoded_len());
        message
            .encode(&mut value)
            .map_err(|e| GenerateError::Encode {
                resource: name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self::new(
            name,
            Any {
                type_url: type_url.to_string(),
                value,
            },
        ))
    }
}

/// The set of resource names a connection wants for one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Every resource of the type.
    Wildcard,
    /// Only the named resources. Empty means nothing.
    Names(BTreeSet<String>),
}

impl Default for Subscription {
    fn default() -> Self {
        Subscription::Names(BTreeSet::new())
    }
}

impl Subscription {
    /// Interpret the resource names of a request.
    ///
    /// An empty list means "everything" only where the type's policy is
    /// [`WildcardPolicy::All`]; a literal `*` always does.
    pub fn from_request(names: &[String], policy: WildcardPolicy) -> Self {
        if names.iter().any(|n| n == WILDCARD_NAME) {
            return Subscription::Wildcard;
        }
        if names.is_empty() {
            return match policy {
                WildcardPolicy::All => Subscription::Wildcard,
                WildcardPolicy::Explicit => Subscription::default(),
            };
        }
        Subscription::Names(names.iter().cloned().collect())
    }

    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Subscription::Names(names.into_iter().map(Into::into).collect())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, Subscription::Wildcard)
    }

    /// True when the subscription selects nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Subscription::Names(names) if names.is_empty())
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Subscription::Wildcard => true,
            Subscription::Names(names) => names.contains(name),
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscription::Wildcard => write!(f, "*"),
            Subscription::Names(names) => {
                let names: Vec<&str> = names.iter().map(String::as_str).collect();
                write!(f, "[{}]", names.join(","))
            }
        }
    }
}
