use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::grpc::worker_service::WorkerGrpcService;
use crate::proto::worker_service_server::WorkerServiceServer;
use crate::tls::TlsIdentity;
use crate::worker::Worker;

pub struct GrpcServer<W> {
    addr: SocketAddr,
    worker: Arc<W>,
    tls_identity: Option<TlsIdentity>,
}

impl<W: Worker> GrpcServer<W> {
    pub fn new(addr: SocketAddr, worker: Arc<W>, tls_identity: Option<TlsIdentity>) -> Self {
        Self {
            addr,
            worker,
            tls_identity,
        }
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener, shutdown).await?;
        Ok(())
    }

    /// Serve on an already bound listener until `shutdown` fires. Open
    /// output streams end as part of the shutdown.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), tonic::transport::Error> {
        let service = WorkerGrpcService::new(self.worker, shutdown.clone());

        let mut builder = Server::builder();
        if let Some(identity) = &self.tls_identity {
            builder = builder.tls_config(identity.server_tls_config())?;
            tracing::info!("mTLS enabled for the worker API");
        } else {
            tracing::warn!("TLS disabled: callers cannot present a role and will be rejected");
        }

        let addr = listener.local_addr().unwrap_or(self.addr);
        tracing::info!(addr = %addr, "Starting gRPC server");

        builder
            .add_service(WorkerServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled_owned())
            .await
    }
}
