use std::os::fd::{FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use cgroups_rs::blkio::BlkIoController;
use cgroups_rs::cpu::CpuController;
use cgroups_rs::memory::MemController;
use cgroups_rs::{hierarchies, Cgroup, Hierarchy};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;

use super::{Boundary, IsolationError, ResourceController};
use crate::worker::job::{JobId, ResourceSpec};

/// CFS period in microseconds.
const CPU_PERIOD_US: u64 = 100_000;
const RELEASE_ATTEMPTS: u32 = 50;
const RELEASE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Isolates each job in its own cgroup v2 group under a dedicated parent.
#[derive(Debug)]
pub struct CgroupController {
    root: PathBuf,
    /// `root` relative to the cgroup2 mount.
    parent: PathBuf,
}

impl CgroupController {
    /// Create (or reuse) the parent group. Controllers are delegated down to
    /// each job group when it is created.
    pub fn new(root: PathBuf) -> Result<Self, IsolationError> {
        let hierarchy = hierarchies::auto();
        if !hierarchy.v2() {
            return Err(IsolationError::Unsupported(
                "host is not running the unified cgroup2 hierarchy".to_string(),
            ));
        }

        let mount = hierarchy.root();
        let parent = match root.strip_prefix(&mount) {
            Ok(relative) if relative.components().next().is_some() => relative.to_path_buf(),
            _ => {
                return Err(IsolationError::Unsupported(format!(
                    "{} is not a group below the cgroup2 mount {}",
                    root.display(),
                    mount.display()
                )))
            }
        };

        Cgroup::new(hierarchy, &parent).map_err(|source| IsolationError::Create {
            name: parent.display().to_string(),
            source,
        })?;

        tracing::info!(root = %root.display(), "cgroup isolation ready");
        Ok(Self { root, parent })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceController for CgroupController {
    fn prepare(&self, job_id: &JobId, spec: &ResourceSpec) -> Result<Boundary, IsolationError> {
        let name = format!("job-{}", job_id);
        let cgroup = Cgroup::new(hierarchies::auto(), self.parent.join(&name)).map_err(
            |source| IsolationError::Create {
                name: name.clone(),
                source,
            },
        )?;

        if let Err(e) = apply_limits(&cgroup, spec) {
            if let Err(cleanup) = cgroup.delete() {
                tracing::warn!(cgroup = %name, error = %cleanup, "Failed to remove half-configured cgroup");
            }
            return Err(e);
        }

        let path = self.root.join(&name);
        tracing::debug!(job_id = %job_id, path = %path.display(), "Created cgroup");
        Ok(Boundary::with_cgroup(name, path, cgroup))
    }

    fn attach(
        &self,
        boundary: &Boundary,
        command: &mut tokio::process::Command,
    ) -> Result<(), IsolationError> {
        let path = boundary.path().ok_or_else(|| {
            IsolationError::Attach(format!("boundary {} has no cgroup", boundary.name()))
        })?;
        join_on_exec(&path.join("cgroup.procs"), command)
    }

    fn kill(&self, boundary: &Boundary) -> Result<(), IsolationError> {
        let Some(cgroup) = boundary.cgroup() else {
            return Ok(());
        };

        for member in cgroup.procs() {
            let pid = Pid::from_raw(member.pid as i32);
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    tracing::warn!(cgroup = %boundary.name(), pid = %pid, error = %e, "Failed to kill cgroup member")
                }
            }
        }
        Ok(())
    }

    fn release(&self, boundary: Boundary) -> Result<(), IsolationError> {
        let (Some(cgroup), Some(path)) = (boundary.cgroup(), boundary.path()) else {
            return Ok(());
        };

        let mut attempt = 0;
        loop {
            if !path.exists() {
                return Ok(());
            }
            match cgroup.delete() {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "Removed cgroup");
                    return Ok(());
                }
                // Still populated, e.g. by a descendant that outlived the job.
                Err(_) if attempt < RELEASE_ATTEMPTS => {
                    if attempt == 0 {
                        if let Err(e) = self.kill(&boundary) {
                            tracing::warn!(path = %path.display(), error = %e, "Failed to empty cgroup");
                        }
                    }
                    attempt += 1;
                    std::thread::sleep(RELEASE_RETRY_DELAY);
                }
                Err(source) => {
                    return Err(IsolationError::Release {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
    }
}

/// Make the process spawned from `command` move itself into the group whose
/// `cgroup.procs` is at `procs` before it executes the target program.
///
/// The file is opened here, so a group that cannot be joined fails the
/// attach rather than the spawn.
pub fn join_on_exec(
    procs: &Path,
    command: &mut tokio::process::Command,
) -> Result<(), IsolationError> {
    let fd = open(procs, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty()).map_err(|e| {
        IsolationError::Attach(format!("cannot join {}: {}", procs.display(), e))
    })?;
    // SAFETY: `open` just returned this descriptor and nothing else owns it.
    let procs = unsafe { OwnedFd::from_raw_fd(fd) };

    // Runs in the child between fork and exec. Writing "0" moves the writing
    // process itself.
    unsafe {
        command.pre_exec(move || {
            nix::unistd::write(&procs, b"0")?;
            Ok(())
        });
    }
    Ok(())
}

fn apply_limits(cgroup: &Cgroup, spec: &ResourceSpec) -> Result<(), IsolationError> {
    if let Some(weight) = spec.cpu_weight {
        cgroup
            .controller_of::<CpuController>()
            .ok_or_else(|| unavailable("cpu"))?
            .set_shares(u64::from(weight))
            .map_err(limit_error("cpu.weight", weight))?;
    }
    if let Some(millis) = spec.cpu_millis {
        let quota = cpu_quota(millis);
        cgroup
            .controller_of::<CpuController>()
            .ok_or_else(|| unavailable("cpu"))?
            .set_cfs_quota_and_period(Some(quota), Some(CPU_PERIOD_US))
            .map_err(limit_error("cpu.max", format!("{} {}", quota, CPU_PERIOD_US)))?;
    }
    if let Some(bytes) = spec.memory_bytes {
        cgroup
            .controller_of::<MemController>()
            .ok_or_else(|| unavailable("memory"))?
            .set_limit(i64::try_from(bytes).unwrap_or(i64::MAX))
            .map_err(limit_error("memory.max", bytes))?;
    }
    if let Some(weight) = spec.io_weight {
        cgroup
            .controller_of::<BlkIoController>()
            .ok_or_else(|| unavailable("io"))?
            .set_weight(u64::from(weight))
            .map_err(limit_error("io.weight", weight))?;
    }
    Ok(())
}

fn unavailable(controller: &str) -> IsolationError {
    IsolationError::Unsupported(format!("the {} controller is not available", controller))
}

fn limit_error(
    setting: &'static str,
    value: impl ToString,
) -> impl FnOnce(cgroups_rs::error::Error) -> IsolationError {
    let value = value.to_string();
    move |source| IsolationError::Limit {
        setting,
        value,
        source,
    }
}

/// CFS quota in microseconds per [`CPU_PERIOD_US`] for `millis` millicores.
fn cpu_quota(millis: u32) -> i64 {
    (u64::from(millis) * CPU_PERIOD_US / 1000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_quota_scales_with_millicores() {
        assert_eq!(cpu_quota(1000), 100_000);
        assert_eq!(cpu_quota(250), 25_000);
        assert_eq!(cpu_quota(2500), 250_000);
    }

    #[test]
    fn rejects_root_outside_the_cgroup_mount() {
        let dir = tempfile::tempdir().unwrap();
        let err = CgroupController::new(dir.path().join("job-worker")).unwrap_err();
        assert!(matches!(err, IsolationError::Unsupported(_)));
    }

    #[test]
    fn join_fails_when_the_group_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = tokio::process::Command::new("true");
        let err = join_on_exec(&dir.path().join("cgroup.procs"), &mut cmd).unwrap_err();
        assert!(matches!(err, IsolationError::Attach(_)));
    }

    #[test]
    fn join_fails_when_procs_is_not_writable() {
        let dir = tempfile::tempdir().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::create_dir(&procs).unwrap();

        let mut cmd = tokio::process::Command::new("true");
        let err = join_on_exec(&procs, &mut cmd).unwrap_err();
        assert!(matches!(err, IsolationError::Attach(_)));
    }

    #[tokio::test]
    async fn child_writes_itself_into_procs() {
        let dir = tempfile::tempdir().unwrap();
        let procs = dir.path().join("cgroup.procs");
        std::fs::write(&procs, "").unwrap();

        let mut cmd = tokio::process::Command::new("true");
        join_on_exec(&procs, &mut cmd).unwrap();
        let status = cmd.status().await.unwrap();

        assert!(status.success());
        assert_eq!(std::fs::read_to_string(&procs).unwrap(), "0");
    }
}
