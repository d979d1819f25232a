//! Job supervision on a single worker host.
//!
//! - **Registry**: starts processes, tracks them by id, stops them
//! - **Output**: captures each job's combined stdout/stderr, persists it and
//!   fans it out to any number of readers
//!
//! # Components
//!
//! - [`JobRegistry`]: the [`Worker`] implementation backing the gRPC service
//! - [`Job`]: one managed process and its observable status
//! - [`OutputBroadcaster`]: single-writer, multi-reader output fan-out
//!
//! # Lifecycle
//!
//! 1. `start` validates the command and prepares an isolation boundary
//! 2. The process is spawned inside the boundary and its own process group
//! 3. A capture task reads the output pipe until EOF
//! 4. A monitor task waits for exit, lets capture drain, releases the
//!    boundary and records the final status

pub mod job;
pub mod output;
pub mod registry;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use job::{Command, Job, JobId, JobStatus, ResourceSpec};
pub use output::{OutputBroadcaster, Subscription};
pub use registry::JobRegistry;

/// Operations a worker exposes to authorized callers.
#[tonic::async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Launch `command` and return the id of the new job.
    async fn start(&self, command: Command) -> Result<JobId>;

    /// Terminate the job's process group, escalating to SIGKILL after the
    /// grace period. Succeeds without effect on a job that already exited.
    async fn stop(&self, job_id: &JobId) -> Result<()>;

    async fn query(&self, job_id: &JobId) -> Result<JobStatus>;

    /// Subscribe to the job's output from the first byte. The subscription
    /// ends when the output does or when `cancel` fires.
    async fn stream(&self, job_id: &JobId, cancel: CancellationToken) -> Result<Subscription>;
}
