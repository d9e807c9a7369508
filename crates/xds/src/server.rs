//! gRPC transport for the aggregated discovery service.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
    AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, trace};

use crate::discovery::DiscoveryServer;
use crate::error::XdsError;

/// ADS gRPC server.
pub struct AdsServer {
    discovery: DiscoveryServer,
}

impl AdsServer {
    pub fn new(discovery: DiscoveryServer) -> Self {
        debug!("Creating ADS gRPC server");
        Self { discovery }
    }

    /// Get the tonic service.
    pub fn into_service(self) -> AggregatedDiscoveryServiceServer<AdsService> {
        trace!("Converting to tonic ADS service");
        AggregatedDiscoveryServiceServer::new(AdsService {
            discovery: self.discovery,
        })
    }

    /// Serve on `addr` until `shutdown` resolves.
    pub async fn run<F>(self, addr: SocketAddr, shutdown: F) -> Result<(), XdsError>
    where
        F: Future<Output = ()> + Send,
    {
        info!(address = %addr, "ADS server listening");

        tonic::transport::Server::builder()
            .add_service(self.into_service())
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| {
                error!(error = %e, "ADS server error");
                XdsError::Transport(format!("ADS server error: {}", e))
            })
    }
}

/// Implements the generated ADS trait on top of [`DiscoveryServer`].
pub struct AdsService {
    discovery: DiscoveryServer,
}

type ResponseStream = Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
type DeltaResponseStream = Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaResponseStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let peer = request.remote_addr();
        let inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(self.discovery.config().send_buffer.max(1));
        let discovery = self.discovery.clone();

        trace!(peer = ?peer, "Starting ADS stream");
        tokio::spawn(async move {
            discovery.serve_stream(inbound, tx, peer).await;
        });

        let output_stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(output_stream) as Self::StreamAggregatedResourcesStream))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("incremental xDS is not supported"))
    }
}
