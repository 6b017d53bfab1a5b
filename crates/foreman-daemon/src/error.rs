//! Orchestrator error taxonomy.
//!
//! Every public operation of the daemon returns [`OrchestratorError`] on
//! failure. The type is `Clone` so that one failed spawn can be delivered to
//! every caller waiting on it.

use crate::policy::SpawnPathway;

/// Result type alias using [`OrchestratorError`].
pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestratorError {
    /// The spawn pathway is disallowed for this profile. Never retried.
    #[error("Spawn policy denies {pathway} spawn of worker '{profile_id}'")]
    PolicyDenied {
        profile_id: String,
        pathway: SpawnPathway,
    },

    /// The worker process did not become ready in time. Safe to retry.
    #[error("Worker '{profile_id}' did not become ready within {timeout_ms}ms")]
    StartupTimeout { profile_id: String, timeout_ms: u64 },

    #[error("Worker '{worker_id}' failed {attempts} health probes: {reason}")]
    HealthCheckExhausted {
        worker_id: String,
        attempts: u32,
        reason: String,
    },

    /// The worker answered with an error. The instance stays usable.
    #[error("Worker '{worker_id}' request failed: {message}")]
    WorkerRequestFailed { worker_id: String, message: String },

    /// An await deadline passed. The job itself is untouched.
    #[error("Job {job_id} did not finish within {timeout_ms}ms")]
    JobTimeout { job_id: String, timeout_ms: u64 },

    #[error("Workflow limits exceeded: {message}")]
    WorkflowLimitsExceeded { message: String },

    #[error("No worker available for this task")]
    NoWorkerAvailable,

    #[error("Unknown worker profile: {profile_id}")]
    ProfileNotFound { profile_id: String },

    #[error("Worker not running: {worker_id}")]
    WorkerNotFound { worker_id: String },

    #[error("Unknown workflow: {workflow_id}")]
    WorkflowNotFound { workflow_id: String },

    #[error("Job not found: {job_id}")]
    JobNotFound { job_id: String },

    #[error("Failed to spawn worker '{profile_id}': {reason}")]
    SpawnFailed { profile_id: String, reason: String },

    #[error("Worker capacity reached ({current}/{max})")]
    CapacityExhausted { current: usize, max: usize },

    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },
}

impl OrchestratorError {
    /// Stable machine-readable code for tool responses.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PolicyDenied { .. } => "policy_denied",
            Self::StartupTimeout { .. } => "startup_timeout",
            Self::HealthCheckExhausted { .. } => "health_check_exhausted",
            Self::WorkerRequestFailed { .. } => "worker_request_failed",
            Self::JobTimeout { .. } => "job_timeout",
            Self::WorkflowLimitsExceeded { .. } => "workflow_limits_exceeded",
            Self::NoWorkerAvailable => "no_worker_available",
            Self::ProfileNotFound { .. } => "profile_not_found",
            Self::WorkerNotFound { .. } => "worker_not_found",
            Self::WorkflowNotFound { .. } => "workflow_not_found",
            Self::JobNotFound { .. } => "job_not_found",
            Self::SpawnFailed { .. } => "spawn_failed",
            Self::CapacityExhausted { .. } => "capacity_exhausted",
            Self::InvalidArguments { .. } => "invalid_arguments",
        }
    }

    /// Whether a caller may reasonably retry the same operation.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. }
                | Self::SpawnFailed { .. }
                | Self::CapacityExhausted { .. }
                | Self::JobTimeout { .. }
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_denied_message_names_pathway() {
        let err = OrchestratorError::PolicyDenied {
            profile_id: "vision".to_string(),
            pathway: SpawnPathway::OnDemand,
        };
        assert_eq!(
            err.to_string(),
            "Spawn policy denies on-demand spawn of worker 'vision'"
        );
        assert_eq!(err.code(), "policy_denied");
        assert!(!err.is_retryable());
    }

    #[test]
    fn worker_error_is_surfaced_verbatim() {
        let err = OrchestratorError::WorkerRequestFailed {
            worker_id: "coder".to_string(),
            message: "model overloaded (529)".to_string(),
        };
        assert!(err.to_string().ends_with("model overloaded (529)"));
    }

    #[test]
    fn startup_timeout_is_retryable() {
        let err = OrchestratorError::StartupTimeout {
            profile_id: "coder".to_string(),
            timeout_ms: 100,
        };
        assert!(err.is_retryable());
    }
}
