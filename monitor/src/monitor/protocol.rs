//! SubTaskMonitor error types
//!
//! Ordinary sub-task failure and timeout are not errors: they resolve a
//! completion handle with a FAILED record. What is left here is engine
//! misuse, submission failure and consistency violations raised by
//! misbehaving collaborators.

use crate::gateway::GatewayError;

/// Errors that can occur in SubTaskMonitor
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum MonitorError {
    /// submit while the engine is not running
    #[error("sub-task monitor is not running")]
    NotRunning,
    #[error("sub-task monitor is already running")]
    AlreadyRunning,
    /// A stopped engine cannot be restarted
    #[error("sub-task monitor has been stopped")]
    AlreadyStopped,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A spec with this id is already in flight
    #[error("spec already in flight: {0}")]
    DuplicateSpec(String),
    /// The gateway refused the task and no fallback applied
    #[error("failed to submit a task for spec[{spec_id}]: {source}")]
    Submission {
        spec_id: String,
        #[source]
        source: GatewayError,
    },
    #[error("gateway call failed: {0}")]
    Gateway(#[from] GatewayError),
    /// A task reported success without pushing its report first
    #[error("missing report from task[{0}]")]
    MissingReport(String),
    /// Two reports for one task carried different payloads
    #[error(
        "task[{task_id}] sent two or more reports and previous report[{previous}] is different from the current one[{current}]"
    )]
    ConflictingReport {
        task_id: String,
        previous: String,
        current: String,
    },
    #[error("unknown status[{status}] for task[{task_id}]")]
    UnknownStatus { task_id: String, status: String },
    /// A status answer was for a different task than the one in flight
    #[error("status for task[{actual}] does not belong to running task[{expected}]")]
    StatusMismatch { expected: String, actual: String },
    /// The unit of work left the engine without a terminal record (shutdown)
    #[error("spec[{0}] was abandoned before completion")]
    Abandoned(String),
    #[error("progress actor unavailable: {0}")]
    Progress(String),
}

impl MonitorError {
    /// True for errors that indicate a bug in a collaborator.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            MonitorError::MissingReport(_)
                | MonitorError::ConflictingReport { .. }
                | MonitorError::UnknownStatus { .. }
                | MonitorError::StatusMismatch { .. }
        )
    }
}
