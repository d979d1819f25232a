//! Per-job resource isolation.
//!
//! A [`ResourceController`] turns a [`ResourceSpec`] into an isolation
//! boundary, binds a process to it before the process runs any caller code,
//! and tears it down after the process is gone.
//!
//! # Implementations
//!
//! - [`CgroupController`]: one cgroup v2 group per job
//! - [`NoopController`]: no isolation, for hosts without cgroup v2

pub mod cgroup;
pub mod noop;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use cgroups_rs::Cgroup;
use thiserror::Error;

use crate::config::{IsolationBackend, IsolationConfig};
use crate::worker::job::{JobId, ResourceSpec};

pub use cgroup::CgroupController;
pub use noop::NoopController;

#[derive(Error, Debug)]
pub enum IsolationError {
    #[error("cgroup v2 is not available: {0}")]
    Unsupported(String),

    #[error("failed to create isolation group {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: cgroups_rs::error::Error,
    },

    #[error("failed to apply {setting}={value}: {source}")]
    Limit {
        setting: &'static str,
        value: String,
        #[source]
        source: cgroups_rs::error::Error,
    },

    #[error("{0}")]
    Attach(String),

    #[error("failed to tear down isolation group {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: cgroups_rs::error::Error,
    },
}

/// Handle to one job's isolation group. Not `Clone`: releasing consumes it,
/// so a boundary is torn down at most once.
pub struct Boundary {
    name: String,
    path: Option<PathBuf>,
    cgroup: Option<Cgroup>,
}

impl Boundary {
    /// A boundary with no backing group.
    pub fn detached(name: String) -> Self {
        Self {
            name,
            path: None,
            cgroup: None,
        }
    }

    pub(crate) fn with_cgroup(name: String, path: PathBuf, cgroup: Cgroup) -> Self {
        Self {
            name,
            path: Some(path),
            cgroup: Some(cgroup),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem location of the group, if the controller created one.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub(crate) fn cgroup(&self) -> Option<&Cgroup> {
        self.cgroup.as_ref()
    }
}

impl fmt::Debug for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Boundary")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish()
    }
}

pub trait ResourceController: Send + Sync + std::fmt::Debug {
    /// Create a uniquely named group for `job_id` and apply every limit set
    /// in `spec`.
    fn prepare(&self, job_id: &JobId, spec: &ResourceSpec) -> Result<Boundary, IsolationError>;

    /// Arrange for the process spawned from `command` to join `boundary`
    /// before it executes the target program.
    fn attach(
        &self,
        boundary: &Boundary,
        command: &mut tokio::process::Command,
    ) -> Result<(), IsolationError>;

    /// Forcefully terminate every process still in the group.
    fn kill(&self, _boundary: &Boundary) -> Result<(), IsolationError> {
        Ok(())
    }

    /// Remove the group. Only call once the job's process has exited.
    fn release(&self, boundary: Boundary) -> Result<(), IsolationError>;
}

/// Build the controller selected by `config`.
pub fn controller_from_config(
    config: &IsolationConfig,
) -> Result<Arc<dyn ResourceController>, IsolationError> {
    match config.backend {
        IsolationBackend::Cgroup => Ok(Arc::new(CgroupController::new(
            config.cgroup_root.clone(),
        )?)),
        IsolationBackend::Noop => Ok(Arc::new(NoopController::new())),
    }
}
