use super::{Boundary, IsolationError, ResourceController};
use crate::worker::job::{JobId, ResourceSpec};

/// Runs jobs without any isolation group.
///
/// It cannot honor limits, so a job that asks for any is refused rather than
/// started unconstrained.
#[derive(Debug, Default)]
pub struct NoopController;

impl NoopController {
    pub fn new() -> Self {
        Self
    }
}

impl ResourceController for NoopController {
    fn prepare(&self, job_id: &JobId, spec: &ResourceSpec) -> Result<Boundary, IsolationError> {
        if !spec.is_empty() {
            return Err(IsolationError::Unsupported(
                "resource limits requested but isolation is disabled on this worker".to_string(),
            ));
        }
        Ok(Boundary::detached(format!("job-{}", job_id)))
    }

    fn attach(
        &self,
        _boundary: &Boundary,
        _command: &mut tokio::process::Command,
    ) -> Result<(), IsolationError> {
        Ok(())
    }

    fn release(&self, _boundary: Boundary) -> Result<(), IsolationError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_jobs_without_limits() {
        let controller = NoopController::new();
        let job_id = JobId::new();
        let boundary = controller.prepare(&job_id, &ResourceSpec::default()).unwrap();
        assert_eq!(boundary.name(), format!("job-{}", job_id));
        assert!(boundary.path().is_none());
        controller.release(boundary).unwrap();
    }

    #[test]
    fn refuses_limits_it_cannot_enforce() {
        let spec = ResourceSpec {
            memory_bytes: Some(1 << 20),
            ..Default::default()
        };
        let err = NoopController::new()
            .prepare(&JobId::new(), &spec)
            .unwrap_err();
        assert!(matches!(err, IsolationError::Unsupported(_)));
    }
}
