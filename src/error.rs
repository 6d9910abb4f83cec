use thiserror::Error;

use crate::state_machine::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum AeroError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Invalid job transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Invalid ramp plan: {0}")]
    InvalidRampPlan(String),

    #[error("Job {id} cannot be retried while {status:?}")]
    NotRetryable { id: JobId, status: JobStatus },

    #[error("Job `{0}` has no aerodynamic result to report")]
    MissingResult(String),

    #[error("Queue is closed to new jobs")]
    QueueClosed,

    #[error("Execution worker panicked")]
    WorkerPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// What a single call against the solver engine can report back.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// One scripted command failed. `recoverable` errors are worth repeating
    /// (transient meshing warnings, busy license checks).
    #[error("command `{command}` failed: {message}")]
    Command {
        command: String,
        message: String,
        recoverable: bool,
    },

    /// Floating-point error or residual blow-up during iteration.
    #[error("divergence at iteration {iteration}: {message}")]
    Divergence { iteration: u64, message: String },

    /// No engine session could be acquired.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EngineError::Command {
                recoverable: true,
                ..
            }
        )
    }
}

/// Classifies a job or stage failure for retry and reporting decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// A single engine command failed and was not absorbed by the local retry.
    EngineCommand,
    /// A stage could not complete after local retries.
    StageFailure,
    /// Numerical blow-up that the restart policy could not absorb.
    DivergenceFault,
    /// The engine session could not be acquired.
    ResourceUnavailable,
}

impl FailureKind {
    /// Kind of a single engine call failure, before any escalation.
    pub fn of(err: &EngineError) -> Self {
        match err {
            EngineError::Command { .. } => FailureKind::EngineCommand,
            EngineError::Divergence { .. } => FailureKind::DivergenceFault,
            EngineError::Unavailable(_) => FailureKind::ResourceUnavailable,
        }
    }

    /// Kind recorded on the job once the owning stage gives up. A command
    /// failure that survives the local retry becomes a stage failure.
    pub fn escalated(self) -> Self {
        match self {
            FailureKind::EngineCommand => FailureKind::StageFailure,
            other => other,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::EngineCommand => write!(f, "EngineCommandError"),
            FailureKind::StageFailure => write!(f, "StageFailure"),
            FailureKind::DivergenceFault => write!(f, "DivergenceFault"),
            FailureKind::ResourceUnavailable => write!(f, "ResourceUnavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::StageFailure.to_string(), "StageFailure");
        assert_eq!(FailureKind::DivergenceFault.to_string(), "DivergenceFault");
        assert_eq!(
            FailureKind::ResourceUnavailable.to_string(),
            "ResourceUnavailable"
        );
    }

    #[test]
    fn only_flagged_command_errors_are_recoverable() {
        let transient = EngineError::Command {
            command: "generate-volume-mesh".into(),
            message: "skewed cells".into(),
            recoverable: true,
        };
        let hard = EngineError::Command {
            command: "import-geometry".into(),
            message: "file not found".into(),
            recoverable: false,
        };
        let diverged = EngineError::Divergence {
            iteration: 10,
            message: "floating point exception".into(),
        };
        assert!(transient.is_recoverable());
        assert!(!hard.is_recoverable());
        assert!(!diverged.is_recoverable());
    }

    #[test]
    fn command_errors_escalate_to_stage_failure() {
        let err = EngineError::Command {
            command: "save-mesh".into(),
            message: "disk full".into(),
            recoverable: false,
        };
        assert_eq!(FailureKind::of(&err), FailureKind::EngineCommand);
        assert_eq!(FailureKind::of(&err).escalated(), FailureKind::StageFailure);
        let unavailable = EngineError::Unavailable("no license".into());
        assert_eq!(
            FailureKind::of(&unavailable).escalated(),
            FailureKind::ResourceUnavailable
        );
    }

    #[test]
    fn engine_error_display() {
        let err = EngineError::Divergence {
            iteration: 1200,
            message: "floating point exception".into(),
        };
        assert_eq!(
            err.to_string(),
            "divergence at iteration 1200: floating point exception"
        );
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AeroError>();
        assert_send_sync::<EngineError>();
    }
}
