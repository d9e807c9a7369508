//! EDS: load assignments for requested clusters.

use beacon_config::parse_outbound_cluster_name;
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use tracing::trace;

use super::{socket_address, GenerateRequest, ResourceGenerator};
use crate::error::GenerateError;
use crate::mesh::MeshSnapshot;
use crate::resource::{Resource, Subscription, ENDPOINT_TYPE_URL};

pub struct EndpointGenerator;

impl ResourceGenerator for EndpointGenerator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        mesh: &MeshSnapshot,
    ) -> Result<Vec<Resource>, GenerateError> {
        let clusters: Vec<String> = match request.subscription {
            Subscription::Wildcard => mesh.clusters().map(|(name, _, _)| name).collect(),
            Subscription::Names(names) => names.iter().cloned().collect(),
        };

        let mut resources = Vec::with_capacity(clusters.len());
        for cluster_name in clusters {
            let Some((service, port)) = parse_outbound_cluster_name(&cluster_name)
                .and_then(|(hostname, port)| mesh.cluster(hostname, port))
            else {
                trace!(cluster = %cluster_name, "No service behind requested cluster");
                continue;
            };

            let lb_endpoints = mesh
                .endpoints_for(&service.hostname, &port.name)
                .into_iter()
                .map(|instance| LbEndpoint {
                    host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(Endpoint {
                        address: Some(socket_address(&instance.address, instance.port)),
                        ..Default::default()
                    })),
                    ..Default::default()
                })
                .collect();

            let assignment = ClusterLoadAssignment {
                cluster_name: cluster_name.clone(),
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints,
                    ..Default::default()
                }],
                ..Default::default()
            };
            resources.push(Resource::encode(cluster_name, ENDPOINT_TYPE_URL, &assignment)?);
        }
        Ok(resources)
    }
}
