use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::isolation::Boundary;
use crate::worker::output::OutputBroadcaster;

/// Accepted range for `cpu.weight` and `io.weight`.
pub const WEIGHT_RANGE: std::ops::RangeInclusive<u32> = 1..=10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = WorkerError;

    /// Ids are opaque to callers; anything that is not one of ours is unknown.
    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| WorkerError::NotFound(s.to_string()))
    }
}

/// Resource limits for one job. Unset fields leave the host default in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Relative CPU share (`cpu.weight`).
    pub cpu_weight: Option<u32>,
    /// Hard CPU ceiling in millicores (`cpu.max`).
    pub cpu_millis: Option<u32>,
    /// Memory ceiling in bytes (`memory.max`).
    pub memory_bytes: Option<u64>,
    /// Relative IO share (`io.weight`).
    pub io_weight: Option<u32>,
}

impl ResourceSpec {
    pub fn is_empty(&self) -> bool {
        self.cpu_weight.is_none()
            && self.cpu_millis.is_none()
            && self.memory_bytes.is_none()
            && self.io_weight.is_none()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(weight) = self.cpu_weight {
            if !WEIGHT_RANGE.contains(&weight) {
                return Err(WorkerError::InvalidArgument(format!(
                    "cpu_weight must be within 1..=10000, got {}",
                    weight
                )));
            }
        }
        if let Some(weight) = self.io_weight {
            if !WEIGHT_RANGE.contains(&weight) {
                return Err(WorkerError::InvalidArgument(format!(
                    "io_weight must be within 1..=10000, got {}",
                    weight
                )));
            }
        }
        if self.cpu_millis == Some(0) {
            return Err(WorkerError::InvalidArgument(
                "cpu_millis must be positive".to_string(),
            ));
        }
        if self.memory_bytes == Some(0) {
            return Err(WorkerError::InvalidArgument(
                "memory_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// An immutable request to run a program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub args: Vec<String>,
    pub resources: ResourceSpec,
}

impl Command {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
            resources: ResourceSpec::default(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceSpec) -> Self {
        self.resources = resources;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WorkerError::InvalidArgument(
                "command name cannot be empty".to_string(),
            ));
        }
        if self.name.contains('\0') || self.args.iter().any(|a| a.contains('\0')) {
            return Err(WorkerError::InvalidArgument(
                "command contains a NUL byte".to_string(),
            ));
        }
        self.resources.validate()
    }
}

/// Point-in-time view of a job's process.
///
/// `exit_code` is set only when the process exited on its own; a signal
/// termination sets `signaled` and `signal` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub exited: bool,
    pub signaled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobStatus {
    pub fn running(pid: u32) -> Self {
        Self {
            pid,
            exit_code: None,
            signal: None,
            exited: false,
            signaled: false,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the process's termination. Only the first call has an effect.
    pub(crate) fn finish(&mut self, exit: Option<ExitStatus>) {
        if self.exited {
            return;
        }
        self.exited = true;
        self.finished_at = Some(Utc::now());
        if let Some(status) = exit {
            self.exit_code = status.code();
            self.signal = status.signal();
            self.signaled = status.signal().is_some();
        }
    }

    /// Wire form of the exit code: -1 unless the process exited on its own.
    pub fn exit_code_or_sentinel(&self) -> i32 {
        self.exit_code.unwrap_or(-1)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.exited, self.exit_code, self.signal) {
            (false, _, _) => write!(f, "running"),
            (true, Some(code), _) => write!(f, "exited({})", code),
            (true, None, Some(sig)) => write!(f, "signaled({})", sig),
            (true, None, None) => write!(f, "exited(unknown)"),
        }
    }
}

/// A managed process instance and the state shared by its tasks.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    command: Command,
    status: watch::Sender<JobStatus>,
    output: OutputBroadcaster,
    /// Taken by whichever path releases it first.
    boundary: Mutex<Option<Boundary>>,
    /// Serializes concurrent `stop` calls on the same job.
    pub(crate) stop_lock: tokio::sync::Mutex<()>,
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        command: Command,
        pid: u32,
        output: OutputBroadcaster,
        boundary: Boundary,
    ) -> Self {
        let (status, _) = watch::channel(JobStatus::running(pid));
        Self {
            id,
            command,
            status,
            output,
            boundary: Mutex::new(Some(boundary)),
            stop_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    pub fn output(&self) -> &OutputBroadcaster {
        &self.output
    }

    pub(crate) fn record_exit(&self, exit: Option<ExitStatus>) {
        self.status.send_modify(|status| status.finish(exit));
    }

    /// Wait until the job is observed as exited, up to `within`.
    pub(crate) async fn wait_exited(&self, within: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(within, rx.wait_for(|s| s.exited))
            .await
            .map(|seen| seen.is_ok());
        matches!(waited, Ok(true))
    }

    pub(crate) fn take_boundary(&self) -> Option<Boundary> {
        self.boundary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub(crate) fn with_boundary<T>(&self, f: impl FnOnce(&Boundary) -> T) -> Option<T> {
        self.boundary
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_is_rejected() {
        let err = Command::new("  ", Vec::<String>::new()).validate().unwrap_err();
        assert!(matches!(err, WorkerError::InvalidArgument(_)));
    }

    #[test]
    fn resource_ranges_are_checked() {
        let cmd = Command::new("true", Vec::<String>::new()).with_resources(ResourceSpec {
            cpu_weight: Some(0),
            ..Default::default()
        });
        assert!(matches!(
            cmd.validate(),
            Err(WorkerError::InvalidArgument(_))
        ));

        let cmd = Command::new("true", Vec::<String>::new()).with_resources(ResourceSpec {
            io_weight: Some(10_001),
            ..Default::default()
        });
        assert!(cmd.validate().is_err());

        let cmd = Command::new("true", Vec::<String>::new()).with_resources(ResourceSpec {
            cpu_weight: Some(100),
            cpu_millis: Some(500),
            memory_bytes: Some(64 * 1024 * 1024),
            io_weight: Some(100),
        });
        assert!(cmd.validate().is_ok());
        assert!(!cmd.resources.is_empty());
    }

    #[test]
    fn unknown_job_id_is_not_found() {
        let err = "unknown-id".parse::<JobId>().unwrap_err();
        assert!(matches!(err, WorkerError::NotFound(id) if id == "unknown-id"));

        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn finish_distinguishes_exit_from_signal() {
        let mut status = JobStatus::running(42);
        assert_eq!(status.exit_code_or_sentinel(), -1);
        assert_eq!(status.to_string(), "running");

        // Raw wait statuses: exit code lives in the high byte, signal in the low bits.
        status.finish(Some(ExitStatus::from_raw(3 << 8)));
        assert!(status.exited);
        assert!(!status.signaled);
        assert_eq!(status.exit_code, Some(3));

        let mut killed = JobStatus::running(43);
        killed.finish(Some(ExitStatus::from_raw(9)));
        assert!(killed.exited);
        assert!(killed.signaled);
        assert_eq!(killed.exit_code, None);
        assert_eq!(killed.signal, Some(9));
        assert_eq!(killed.exit_code_or_sentinel(), -1);
        assert_eq!(killed.to_string(), "signaled(9)");
    }

    #[test]
    fn finish_is_recorded_once() {
        let mut status = JobStatus::running(7);
        status.finish(Some(ExitStatus::from_raw(0)));
        let first = status;
        status.finish(Some(ExitStatus::from_raw(9)));
        assert_eq!(status, first);
        assert_eq!(status.exit_code, Some(0));
    }
}
