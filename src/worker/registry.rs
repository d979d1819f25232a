use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, setpgid, Pid};
use tokio::net::unix::pipe;
use tokio::process::Child;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::isolation::{self, Boundary, IsolationError, ResourceController};
use crate::worker::job::{Command, Job, JobId, JobStatus};
use crate::worker::output::{self, LogFile, OutputBroadcaster, Subscription};
use crate::worker::Worker;

/// Owns every job this worker has started.
///
/// The id -> job map is written only by `start`; a job's status only by its
/// exit monitor. Everything else reads.
#[derive(Debug)]
pub struct JobRegistry {
    config: WorkerConfig,
    controller: Arc<dyn ResourceController>,
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    closing: AtomicBool,
}

impl JobRegistry {
    pub fn new(config: WorkerConfig, controller: Arc<dyn ResourceController>) -> Self {
        Self {
            config,
            controller,
            jobs: RwLock::new(HashMap::new()),
            closing: AtomicBool::new(false),
        }
    }

    /// Build a registry with the resource controller selected in `config`.
    pub fn from_config(config: WorkerConfig) -> std::result::Result<Self, IsolationError> {
        let controller = isolation::controller_from_config(&config.isolation)?;
        Ok(Self::new(config, controller))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| WorkerError::NotFound(job_id.to_string()))
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Where the captured output of `job_id` is persisted.
    pub fn log_path(&self, job_id: &JobId) -> PathBuf {
        LogFile::path_for(&self.config.log_dir, job_id)
    }

    /// Stop every job that is still running and refuse new ones. Used when
    /// the worker exits.
    pub async fn shutdown(self: &Arc<Self>) {
        self.closing.store(true, Ordering::SeqCst);
        let running: Vec<JobId> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| !job.status().exited)
            .map(|job| job.id())
            .collect();

        tracing::info!(jobs = running.len(), "Stopping running jobs");

        let mut stops = JoinSet::new();
        for job_id in running {
            let registry = Arc::clone(self);
            stops.spawn(async move { (job_id, registry.stop(&job_id).await) });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((job_id, Err(e))) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to stop job during shutdown")
                }
                Err(e) => tracing::error!(error = %e, "Stop task failed during shutdown"),
                Ok((_, Ok(()))) => {}
            }
        }
    }

    /// Spawn the process with combined stdout/stderr on one pipe, inside its
    /// own process group, attached to `boundary`.
    fn launch(&self, command: &Command, boundary: &Boundary) -> Result<(Child, u32, pipe::Receiver)> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| WorkerError::LaunchFailed(format!("cannot create output pipe: {}", e)))?;
        let reader = pipe::Receiver::from_owned_fd(read_end)
            .map_err(|e| WorkerError::LaunchFailed(format!("cannot watch output pipe: {}", e)))?;
        let stderr = write_end
            .try_clone()
            .map_err(|e| WorkerError::LaunchFailed(format!("cannot share output pipe: {}", e)))?;

        // The parent's copies of the write end live in `cmd` and close when
        // it drops at the end of this function, so EOF follows process exit.
        let mut cmd = tokio::process::Command::new(&command.name);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr));

        // Own process group, so stop can signal every descendant at once.
        unsafe {
            cmd.pre_exec(|| {
                setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
                Ok(())
            });
        }

        self.controller.attach(boundary, &mut cmd)?;

        let child = cmd
            .spawn()
            .map_err(|e| WorkerError::LaunchFailed(format!("{}: {}", command.name, e)))?;
        let pid = child.id().ok_or_else(|| {
            WorkerError::LaunchFailed(format!("{}: exited before it was tracked", command.name))
        })?;

        Ok((child, pid, reader))
    }
}

#[tonic::async_trait]
impl Worker for JobRegistry {
    async fn start(&self, command: Command) -> Result<JobId> {
        command.validate()?;
        if self.closing.load(Ordering::SeqCst) {
            return Err(WorkerError::LaunchFailed(
                "worker is shutting down".to_string(),
            ));
        }

        let job_id = JobId::new();
        let boundary = self
            .controller
            .prepare(&job_id, &command.resources)
            .map_err(|e| {
                tracing::warn!(job_id = %job_id, error = %e, "Isolation setup failed");
                WorkerError::from(e)
            })?;

        let (child, pid, reader) = match self.launch(&command, &boundary) {
            Ok(launched) => launched,
            Err(e) => {
                tracing::warn!(job_id = %job_id, command = %command.name, error = %e, "Job launch failed");
                release_boundary(self.controller.clone(), job_id, boundary).await;
                return Err(e);
            }
        };

        let output = OutputBroadcaster::new(self.config.subscriber_queue_capacity);
        let log = LogFile::create(self.log_path(&job_id)).await;
        let capture = tokio::spawn(output::capture(
            job_id,
            reader,
            log,
            output.clone(),
            self.config.read_buffer_size,
        ));

        tracing::info!(job_id = %job_id, pid, command = %command.name, args = ?command.args, "Job started");

        let job = Arc::new(Job::new(job_id, command, pid, output, boundary));
        self.jobs.write().await.insert(job_id, job.clone());

        tokio::spawn(monitor(
            job,
            child,
            capture,
            self.controller.clone(),
            self.config.drain_timeout(),
        ));

        // A shutdown that collected running jobs before the insert missed this one.
        if self.closing.load(Ordering::SeqCst) {
            tracing::warn!(job_id = %job_id, "Worker began shutting down during start, stopping job");
            if let Err(e) = self.stop(&job_id).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to stop job during shutdown");
            }
        }

        Ok(job_id)
    }

    async fn stop(&self, job_id: &JobId) -> Result<()> {
        let job = self.get(job_id).await?;
        let _stopping = job.stop_lock.lock().await;

        let status = job.status();
        if status.exited {
            return Ok(());
        }

        tracing::info!(job_id = %job_id, pid = status.pid, "Stopping job");
        signal_group(status.pid, Signal::SIGTERM);
        if job.wait_exited(self.config.grace_period()).await {
            return Ok(());
        }

        tracing::warn!(
            job_id = %job_id,
            pid = status.pid,
            grace_period_ms = self.config.grace_period_ms,
            "Job did not exit after SIGTERM, killing"
        );
        signal_group(status.pid, Signal::SIGKILL);
        if let Some(Err(e)) = job.with_boundary(|boundary| self.controller.kill(boundary)) {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to kill isolation group");
        }
        if job.wait_exited(self.config.kill_timeout()).await {
            return Ok(());
        }

        Err(WorkerError::StopFailed {
            job_id: job_id.to_string(),
            reason: format!("process {} still running after SIGKILL", status.pid),
        })
    }

    async fn query(&self, job_id: &JobId) -> Result<JobStatus> {
        Ok(self.get(job_id).await?.status())
    }

    async fn stream(&self, job_id: &JobId, cancel: CancellationToken) -> Result<Subscription> {
        let job = self.get(job_id).await?;
        Ok(job.output().subscribe(cancel))
    }
}

/// Wait for the process, let its output drain, release its isolation group,
/// then publish the final status. Observers never see `exited` before the
/// last chunk has been captured.
async fn monitor(
    job: Arc<Job>,
    mut child: Child,
    capture: JoinHandle<()>,
    controller: Arc<dyn ResourceController>,
    drain_timeout: Duration,
) {
    let job_id = job.id();
    let exit = match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to wait for job process");
            None
        }
    };

    let abort = capture.abort_handle();
    if tokio::time::timeout(drain_timeout, capture).await.is_err() {
        tracing::warn!(job_id = %job_id, "Output pipe still open after exit, closing capture");
        abort.abort();
    }
    job.output().close();

    if let Some(boundary) = job.take_boundary() {
        release_boundary(controller, job_id, boundary).await;
    }

    job.record_exit(exit);
    tracing::info!(job_id = %job_id, status = %job.status(), "Job finished");
}

async fn release_boundary(
    controller: Arc<dyn ResourceController>,
    job_id: JobId,
    boundary: Boundary,
) {
    match tokio::task::spawn_blocking(move || controller.release(boundary)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to release isolation group")
        }
        Err(e) => tracing::error!(job_id = %job_id, error = %e, "Isolation release task failed"),
    }
}

fn signal_group(pid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, signal = %signal, error = %e, "Failed to signal job"),
    }
}
