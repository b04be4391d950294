//! The runner service: a bidirectional-streaming gRPC surface over the
//! execution engine in `runbook-core`.

mod execution;
mod service;

pub use service::Runner;

use std::net::SocketAddr;

use runbook_protocol::RunnerServiceServer;
use tonic::transport::Server;
use tracing::info;

/// Runs the gRPC server until the process is stopped.
pub async fn serve(addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    info!("runner service listening on {addr}");
    Server::builder()
        .add_service(RunnerServiceServer::new(Runner::default()))
        .serve(addr)
        .await
}
