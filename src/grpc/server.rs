use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::launcher_service::LauncherService;
use crate::launcher::FrameLauncher;
use crate::proto::launcher_service_server::LauncherServiceServer;

pub struct GrpcServer {
    addr: SocketAddr,
    launcher: Arc<FrameLauncher>,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, launcher: Arc<FrameLauncher>) -> Self {
        Self { addr, launcher }
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        let service = LauncherService::new(self.launcher.clone());

        tracing::info!(addr = %self.addr, "Starting gRPC server");

        Server::builder()
            .add_service(LauncherServiceServer::new(service))
            .serve_with_shutdown(self.addr, async move { shutdown.cancelled().await })
            .await
    }

    /// Serve on an already bound listener. The configured address is ignored.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let service = LauncherService::new(self.launcher.clone());

        if let Ok(addr) = listener.local_addr() {
            tracing::info!(addr = %addr, "Starting gRPC server");
        }

        Server::builder()
            .add_service(LauncherServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await
    }
}
