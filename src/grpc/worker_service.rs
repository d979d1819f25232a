use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::auth::{self, Operation};
use crate::grpc::status_to_proto;
use crate::proto::worker_service_server::WorkerService;
use crate::proto::{
    QueryRequest, QueryResponse, StartRequest, StartResponse, StopRequest, StopResponse,
    StreamRequest, StreamResponse,
};
use crate::worker::{Command, JobId, Worker};

/// Chunks buffered between a subscription and the HTTP/2 stream.
const STREAM_BUFFER: usize = 16;

type OutputStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<StreamResponse, Status>> + Send>>;

/// gRPC adapter over a [`Worker`]. Every call is authorized before the
/// worker sees it.
pub struct WorkerGrpcService<W> {
    worker: Arc<W>,
    /// Parent of every stream's cancellation token.
    shutdown: CancellationToken,
}

impl<W: Worker> WorkerGrpcService<W> {
    pub fn new(worker: Arc<W>, shutdown: CancellationToken) -> Self {
        Self { worker, shutdown }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, Status> {
    Ok(raw.parse::<JobId>()?)
}

#[tonic::async_trait]
impl<W: Worker> WorkerService for WorkerGrpcService<W> {
    type StreamStream = OutputStream;

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<StartResponse>, Status> {
        let role = auth::check(&request, Operation::Start)?;
        let req = request.into_inner();

        let mut command = Command::new(req.name, req.args);
        if let Some(resources) = req.resources {
            command = command.with_resources(resources.into());
        }

        let job_id = self.worker.start(command).await?;
        tracing::debug!(job_id = %job_id, role = %role, "Start accepted");

        Ok(Response::new(StartResponse {
            job_id: job_id.to_string(),
        }))
    }

    async fn stop(&self, request: Request<StopRequest>) -> Result<Response<StopResponse>, Status> {
        auth::check(&request, Operation::Stop)?;
        let job_id = parse_job_id(&request.get_ref().job_id)?;

        self.worker.stop(&job_id).await?;
        Ok(Response::new(StopResponse {}))
    }

    async fn query(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<QueryResponse>, Status> {
        auth::check(&request, Operation::Query)?;
        let job_id = parse_job_id(&request.get_ref().job_id)?;

        let status = self.worker.query(&job_id).await?;
        Ok(Response::new(status_to_proto(&job_id, &status)))
    }

    async fn stream(
        &self,
        request: Request<StreamRequest>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        auth::check(&request, Operation::Stream)?;
        let job_id = parse_job_id(&request.get_ref().job_id)?;

        let cancel = self.shutdown.child_token();
        let mut subscription = self.worker.stream(&job_id, cancel.clone()).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = tx.closed() => {
                        tracing::debug!(job_id = %job_id, "Stream client went away");
                        cancel.cancel();
                        break;
                    }
                    next = subscription.next() => next,
                };

                let item = match next {
                    Some(Ok(chunk)) => Ok(StreamResponse { chunk }),
                    Some(Err(e)) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Ending stream");
                        Err(Status::from(e))
                    }
                    None => break,
                };
                let last = item.is_err();
                if tx.send(item).await.is_err() || last {
                    break;
                }
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::StreamStream
        ))
    }
}
