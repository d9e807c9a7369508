//! RDS: route configurations.

use envoy_types::pb::envoy::config::route::v3::{
    route, route_action, route_match, Route, RouteAction, RouteConfiguration, RouteMatch,
    VirtualHost,
};

use super::{GenerateRequest, ResourceGenerator};
use crate::error::GenerateError;
use crate::mesh::MeshSnapshot;
use crate::resource::{Resource, ROUTE_TYPE_URL};

/// Builds one route configuration per requested name.
///
/// Every virtual host forwards all paths to its cluster. A virtual host
/// naming a cluster the mesh doesn't have fails the whole pass rather
/// than handing the proxy a route to nowhere.
pub struct RouteGenerator;

impl ResourceGenerator for RouteGenerator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        mesh: &MeshSnapshot,
    ) -> Result<Vec<Resource>, GenerateError> {
        let mut resources = Vec::new();
        for spec in mesh
            .routes
            .values()
            .filter(|r| request.subscription.contains(&r.name))
        {
            let mut virtual_hosts = Vec::with_capacity(spec.virtual_hosts.len());
            for vhost in &spec.virtual_hosts {
                if !mesh.has_cluster(&vhost.cluster) {
                    return Err(GenerateError::MissingReference {
                        resource: spec.name.clone(),
                        reference: vhost.cluster.clone(),
                    });
                }
                virtual_hosts.push(VirtualHost {
                    name: vhost.name.clone(),
                    domains: vhost.domains.clone(),
                    routes: vec![Route {
                        r#match: Some(RouteMatch {
                            path_specifier: Some(route_match::PathSpecifier::Prefix("/".to_string())),
                            ..Default::default()
                        }),
                        action: Some(route::Action::Route(RouteAction {
                            cluster_specifier: Some(route_action::ClusterSpecifier::Cluster(
                                vhost.cluster.clone(),
                            )),
                            ..Default::default()
                        })),
                        ..Default::default()
                    }],
                    ..Default::default()
                });
            }

            let config = RouteConfiguration {
                name: spec.name.clone(),
                virtual_hosts,
                ..Default::default()
            };
            resources.push(Resource::encode(&spec.name, ROUTE_TYPE_URL, &config)?);
        }
        Ok(resources)
    }
}
