//! Shared types between the supervision engine and its consumers
//!
//! These types cross process boundaries:
//! - status answers coming back from an execution gateway
//! - progress and health snapshots handed to job coordinators and dashboards
//!
//! Serializable with serde for JSON over HTTP, exported to TypeScript with ts-rs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Attempt status
// ============================================================================

/// Remote status of one sub-task attempt
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum AttemptState {
    Running,
    Succeeded,
    Failed,
    /// Any code this build does not understand.
    #[serde(other)]
    Unknown,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Failed)
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptState::Running => write!(f, "RUNNING"),
            AttemptState::Succeeded => write!(f, "SUCCEEDED"),
            AttemptState::Failed => write!(f, "FAILED"),
            AttemptState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Snapshot of one attempt as reported by the execution gateway.
///
/// Immutable once captured; the engine stores these in attempt histories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct AttemptRecord {
    /// Remote task id of the attempt
    pub task_id: String,

    pub group_id: Option<String>,

    pub task_type: Option<String>,

    /// When the gateway first saw the task
    pub created_at: DateTime<Utc>,

    /// Missing when the gateway answered without a status code
    pub state: Option<AttemptState>,

    /// Run time in milliseconds, once known
    pub duration_ms: Option<i64>,

    pub error_msg: Option<String>,
}

impl AttemptRecord {
    pub fn new(task_id: impl Into<String>, state: Option<AttemptState>) -> Self {
        Self {
            task_id: task_id.into(),
            group_id: None,
            task_type: None,
            created_at: Utc::now(),
            state,
            duration_ms: None,
            error_msg: None,
        }
    }

    pub fn running(task_id: impl Into<String>) -> Self {
        Self::new(task_id, Some(AttemptState::Running))
    }

    pub fn succeeded(task_id: impl Into<String>) -> Self {
        Self::new(task_id, Some(AttemptState::Succeeded))
    }

    pub fn failed(task_id: impl Into<String>, error_msg: impl Into<String>) -> Self {
        Self::new(task_id, Some(AttemptState::Failed)).with_error(error_msg)
    }

    pub fn with_state(mut self, state: AttemptState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_error(mut self, error_msg: impl Into<String>) -> Self {
        self.error_msg = Some(error_msg.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self.task_type = Some(task_type.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_some_and(AttemptState::is_terminal)
    }
}

/// Gateway answer to a status query
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export)]
pub struct TaskStatusResponse {
    pub task_id: String,
    /// `None` when the gateway does not know the task (yet)
    pub status: Option<AttemptRecord>,
}

// ============================================================================
// Progress
// ============================================================================

/// Counter snapshot of a supervision engine.
///
/// `failed` counts failed attempts, not failed units of work, so with retries
/// `succeeded + failed` can exceed the number of submitted units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct MonitorProgress {
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// `succeeded + failed`
    pub complete: u64,
    /// `running + complete`
    pub total: u64,
    pub estimated_expected_succeeded: u64,
}

impl MonitorProgress {
    pub fn new(running: u64, succeeded: u64, failed: u64, estimated: u64) -> Self {
        let complete = succeeded + failed;
        Self {
            running,
            succeeded,
            failed,
            complete,
            total: running + complete,
            estimated_expected_succeeded: estimated,
        }
    }
}

/// Progress plus poll-loop health
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct MonitorHealth {
    pub progress: MonitorProgress,
    /// Attempts cancelled because the engine was stopped
    pub canceled: u64,
    /// Poll-cycle errors observed so far
    pub poll_failures: u64,
    pub last_poll_failure: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================
