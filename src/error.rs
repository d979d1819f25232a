use thiserror::Error;

use crate::auth::IdentityError;
use crate::isolation::IsolationError;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Resource setup failed: {0}")]
    ResourceSetupFailed(String),

    #[error("Failed to attach process to isolation group: {0}")]
    AttachFailed(String),

    #[error("Failed to launch process: {0}")]
    LaunchFailed(String),

    #[error("Failed to stop job {job_id}: {reason}")]
    StopFailed { job_id: String, reason: String },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Permission denied: role {role} may not call {operation}")]
    PermissionDenied { role: String, operation: String },

    #[error("Subscriber fell behind and was dropped")]
    SlowConsumer,
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl From<IsolationError> for WorkerError {
    fn from(err: IsolationError) -> Self {
        match err {
            IsolationError::Attach(msg) => WorkerError::AttachFailed(msg),
            other => WorkerError::ResourceSetupFailed(other.to_string()),
        }
    }
}

impl From<IdentityError> for WorkerError {
    fn from(err: IdentityError) -> Self {
        WorkerError::Unauthenticated(err.to_string())
    }
}

impl From<WorkerError> for tonic::Status {
    fn from(err: WorkerError) -> Self {
        let message = err.to_string();
        match err {
            WorkerError::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            WorkerError::NotFound(_) => tonic::Status::not_found(message),
            WorkerError::ResourceSetupFailed(_)
            | WorkerError::AttachFailed(_)
            | WorkerError::LaunchFailed(_) => tonic::Status::failed_precondition(message),
            WorkerError::StopFailed { .. } => tonic::Status::internal(message),
            WorkerError::Unauthenticated(_) => tonic::Status::unauthenticated(message),
            WorkerError::PermissionDenied { .. } => tonic::Status::permission_denied(message),
            WorkerError::SlowConsumer => tonic::Status::resource_exhausted(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn status_codes_follow_taxonomy() {
        let cases = [
            (WorkerError::InvalidArgument("x".into()), Code::InvalidArgument),
            (WorkerError::NotFound("x".into()), Code::NotFound),
            (WorkerError::ResourceSetupFailed("x".into()), Code::FailedPrecondition),
            (WorkerError::AttachFailed("x".into()), Code::FailedPrecondition),
            (WorkerError::LaunchFailed("x".into()), Code::FailedPrecondition),
            (WorkerError::Unauthenticated("x".into()), Code::Unauthenticated),
            (WorkerError::SlowConsumer, Code::ResourceExhausted),
        ];
        for (err, code) in cases {
            assert_eq!(tonic::Status::from(err).code(), code);
        }

        let denied = WorkerError::PermissionDenied {
            role: "reader".into(),
            operation: "stop".into(),
        };
        let status = tonic::Status::from(denied);
        assert_eq!(status.code(), Code::PermissionDenied);
        assert!(status.message().contains("reader"));
    }

    #[test]
    fn attach_errors_keep_their_kind() {
        let err: WorkerError = IsolationError::Attach("gone".into()).into();
        assert!(matches!(err, WorkerError::AttachFailed(_)));

        let err: WorkerError = IsolationError::Unsupported("no cgroup2".into()).into();
        assert!(matches!(err, WorkerError::ResourceSetupFailed(_)));
    }
}
