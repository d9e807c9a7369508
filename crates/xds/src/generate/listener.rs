//! LDS: listeners, with an HTTP connection manager fetching routes over
//! ADS when a route configuration is attached.

use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager, http_filter, HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::google::protobuf::Any;

use super::{ads_config_source, socket_address, GenerateRequest, ResourceGenerator};
use crate::error::GenerateError;
use crate::mesh::MeshSnapshot;
use crate::resource::{Resource, LISTENER_TYPE_URL};
use beacon_config::ListenerSpec;

const HTTP_CONNECTION_MANAGER: &str = "envoy.filters.network.http_connection_manager";
const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER: &str = "envoy.filters.http.router";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

pub struct ListenerGenerator;

impl ResourceGenerator for ListenerGenerator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        mesh: &MeshSnapshot,
    ) -> Result<Vec<Resource>, GenerateError> {
        mesh.listeners
            .values()
            .filter(|l| l.applies_to.map_or(true, |kind| kind == request.proxy.kind))
            .filter(|l| request.subscription.contains(&l.name))
            .map(build_listener)
            .collect()
    }
}

fn build_listener(spec: &ListenerSpec) -> Result<Resource, GenerateError> {
    let filter_chains = match &spec.route_config {
        Some(route_config) => vec![http_filter_chain(spec, route_config)?],
        None => Vec::new(),
    };
    let listener = Listener {
        name: spec.name.clone(),
        address: Some(socket_address(&spec.address, spec.port)),
        filter_chains,
        ..Default::default()
    };
    Resource::encode(&spec.name, LISTENER_TYPE_URL, &listener)
}

fn http_filter_chain(spec: &ListenerSpec, route_config: &str) -> Result<FilterChain, GenerateError> {
    let manager = HttpConnectionManager {
        stat_prefix: spec.name.clone(),
        route_specifier: Some(http_connection_manager::RouteSpecifier::Rds(Rds {
            config_source: Some(ads_config_source()),
            route_config_name: route_config.to_string(),
        })),
        http_filters: vec![HttpFilter {
            name: ROUTER.to_string(),
            config_type: Some(http_filter::ConfigType::TypedConfig(Any {
                type_url: ROUTER_TYPE_URL.to_string(),
                value: Vec::new(),
            })),
            ..Default::default()
        }],
        ..Default::default()
    };
    let typed_config = Resource::encode(&spec.name, HTTP_CONNECTION_MANAGER_TYPE_URL, &manager)?.payload;

    Ok(FilterChain {
        filters: vec![Filter {
            name: HTTP_CONNECTION_MANAGER.to_string(),
            config_type: Some(filter::ConfigType::TypedConfig(typed_config)),
        }],
        ..Default::default()
    })
}
