//! Execution gateway - the remote service that runs sub-tasks
//!
//! The engine only needs three calls from it:
//! - `run_task`: accept a runnable task
//! - `task_status`: report the current status of a task, cancelled ones included
//! - `cancel_task`: idempotent, best-effort cancellation
//!
//! ## Implementations
//!
//! - [`LocalGateway`]: runs tasks in-process on tokio tasks (tests, demo binary)
//! - [`RetryingGateway`]: wraps any gateway with a fixed-delay retry policy

pub mod local;
pub mod retry;

pub use local::{LocalGateway, TaskBehavior};
pub use retry::{RetryPolicy, RetryingGateway};

use async_trait::async_trait;
use shared_types::TaskStatusResponse;

use crate::work_unit::SubTask;

/// Errors returned by an execution gateway
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum GatewayError {
    /// The gateway cannot resolve the task's type identifier
    #[error("unrecognized task type: {0}")]
    UnknownTaskType(String),
    /// The gateway could not be reached
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    /// An error raised further down the gateway's call chain
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<GatewayError>,
    },
}

impl GatewayError {
    pub fn wrap(context: impl Into<String>, source: GatewayError) -> Self {
        GatewayError::Wrapped {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True if an [`GatewayError::UnknownTaskType`] appears anywhere in the chain.
    pub fn is_unknown_task_type(&self) -> bool {
        match self {
            GatewayError::UnknownTaskType(_) => true,
            GatewayError::Wrapped { source, .. } => source.is_unknown_task_type(),
            _ => false,
        }
    }

    /// True if the failure is transport level and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Unavailable(_) => true,
            GatewayError::Wrapped { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Remote service capable of running, reporting and cancelling sub-tasks.
#[async_trait]
pub trait ExecutionGateway: Send + Sync + 'static {
    async fn run_task(&self, task: &SubTask) -> Result<(), GatewayError>;

    /// Must answer for cancelled tasks too, with their terminal status.
    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, GatewayError>;

    async fn cancel_task(&self, task_id: &str) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_task_type_found_through_chain() {
        let err = GatewayError::wrap(
            "failed to decode task payload",
            GatewayError::wrap(
                "request failed",
                GatewayError::UnknownTaskType("partial_dimension_cardinality".to_string()),
            ),
        );
        assert!(err.is_unknown_task_type());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_other_errors_are_not_unknown_type() {
        assert!(!GatewayError::Rejected("bad payload".to_string()).is_unknown_task_type());
        assert!(!GatewayError::wrap("ctx", GatewayError::NotFound("t".to_string()))
            .is_unknown_task_type());
    }

    #[test]
    fn test_unavailable_is_retryable() {
        let err = GatewayError::wrap("status", GatewayError::Unavailable("refused".to_string()));
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "status: gateway unavailable: refused");
    }
}
