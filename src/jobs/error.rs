//! Error types for the job manager.

use thiserror::Error;

use crate::vault::VaultError;

/// Errors returned by [`JobManager`](super::JobManager) operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// A download for the same manuscript is already queued or running.
    #[error("a download for this manuscript is already active (job {job_id})")]
    AlreadyActive { job_id: String },

    /// No job with this id is registered.
    #[error("job not found: {0}")]
    NotFound(String),

    /// The requested transition is not allowed from the job's current status.
    #[error("job {job_id} cannot {action} while {status}")]
    InvalidState {
        job_id: String,
        action: &'static str,
        status: String,
    },

    /// The job has not reached a terminal status yet.
    #[error("job {job_id} is still {status}")]
    NotTerminal { job_id: String, status: String },

    /// The ledger rejected a write the operation depends on.
    #[error("ledger error: {0}")]
    Ledger(#[from] VaultError),
}

pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_job_error_display() {
        let error = JobError::AlreadyActive {
            job_id: "ab12cd34".to_string(),
        };
        assert!(error.to_string().contains("ab12cd34"));

        let error = JobError::InvalidState {
            job_id: "x".to_string(),
            action: "resume",
            status: "running".to_string(),
        };
        assert_eq!(error.to_string(), "job x cannot resume while running");
    }

    #[test]
    fn test_job_error_from_vault_error() {
        let error: JobError = VaultError::JobNotFound("gone".to_string()).into();
        assert!(matches!(error, JobError::Ledger(_)));
    }
}
