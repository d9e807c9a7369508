//! CDS: one EDS cluster per service port.

use envoy_types::pb::envoy::config::cluster::v3::{cluster, Cluster};

use super::{ads_config_source, GenerateRequest, ResourceGenerator};
use crate::error::GenerateError;
use crate::mesh::MeshSnapshot;
use crate::resource::{Resource, CLUSTER_TYPE_URL};

pub struct ClusterGenerator;

impl ResourceGenerator for ClusterGenerator {
    fn generate(
        &self,
        request: &GenerateRequest<'_>,
        mesh: &MeshSnapshot,
    ) -> Result<Vec<Resource>, GenerateError> {
        mesh.clusters()
            .filter(|(name, _, _)| request.subscription.contains(name))
            .map(|(name, _, _)| {
                let cluster = Cluster {
                    name: name.clone(),
                    cluster_discovery_type: Some(cluster::ClusterDiscoveryType::Type(
                        cluster::DiscoveryType::Eds as i32,
                    )),
                    eds_cluster_config: Some(cluster::EdsClusterConfig {
                        eds_config: Some(ads_config_source()),
                        service_name: name.clone(),
                    }),
                    ..Default::default()
                };
                Resource::encode(name, CLUSTER_TYPE_URL, &cluster)
            })
            .collect()
    }
}
