//! gRPC surface of the worker.
//!
//! [`WorkerGrpcService`] authorizes each call from the peer certificate and
//! forwards it to a [`Worker`](crate::worker::Worker).
//! [`GrpcServer`] hosts it behind mTLS.

pub mod server;
pub mod worker_service;

pub use server::GrpcServer;
pub use worker_service::WorkerGrpcService;

use crate::proto;
use crate::worker::{JobId, JobStatus, ResourceSpec};

impl From<proto::ResourceSpec> for ResourceSpec {
    fn from(spec: proto::ResourceSpec) -> Self {
        Self {
            cpu_weight: spec.cpu_weight,
            cpu_millis: spec.cpu_millis,
            memory_bytes: spec.memory_bytes,
            io_weight: spec.io_weight,
        }
    }
}

impl From<ResourceSpec> for proto::ResourceSpec {
    fn from(spec: ResourceSpec) -> Self {
        Self {
            cpu_weight: spec.cpu_weight,
            cpu_millis: spec.cpu_millis,
            memory_bytes: spec.memory_bytes,
            io_weight: spec.io_weight,
        }
    }
}

pub(crate) fn status_to_proto(job_id: &JobId, status: &JobStatus) -> proto::QueryResponse {
    proto::QueryResponse {
        job_id: job_id.to_string(),
        pid: status.pid,
        exit_code: status.exit_code_or_sentinel(),
        exited: status.exited,
        signaled: status.signaled,
        signal: status.signal,
        started_at_ms: status.started_at.timestamp_millis(),
        finished_at_ms: status.finished_at.map(|t| t.timestamp_millis()),
    }
}
