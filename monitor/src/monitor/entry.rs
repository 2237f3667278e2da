//! In-flight tracking record for one unit of work.
//!
//! A `MonitorEntry` is a value: the engine never mutates one in place. Each
//! retry and each RUNNING observation produces a new entry that replaces the
//! old one in the in-flight map, so attempt histories already handed out stay
//! untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use shared_types::AttemptRecord;
use tokio::time::Instant;

use super::completion::{CompletionEvent, CompletionHistory};
use super::protocol::MonitorError;
use crate::work_unit::{SubTask, WorkUnitSpec};

#[derive(Clone)]
pub struct MonitorEntry {
    spec: Arc<dyn WorkUnitSpec>,
    running_task: Arc<SubTask>,
    /// Last status observed for `running_task`
    running_status: Option<AttemptRecord>,
    /// Past attempts, oldest first; the running attempt is not included
    past_attempts: Vec<AttemptRecord>,
    /// Started with the first attempt, not reset on retry
    started_at: Instant,
    /// The running attempt's failure already reached the progress counters
    failure_counted: bool,
}

impl MonitorEntry {
    pub(crate) fn new(
        spec: Arc<dyn WorkUnitSpec>,
        running_task: SubTask,
        running_status: Option<AttemptRecord>,
    ) -> Self {
        Self {
            spec,
            running_task: Arc::new(running_task),
            running_status,
            past_attempts: Vec::new(),
            started_at: Instant::now(),
            failure_counted: false,
        }
    }

    /// Entry for the next attempt, with `last_failed` moved into the history.
    pub(crate) fn with_new_running_task(
        &self,
        task: SubTask,
        status: Option<AttemptRecord>,
        last_failed: AttemptRecord,
    ) -> Self {
        let mut past_attempts = self.past_attempts.clone();
        past_attempts.push(last_failed);
        Self {
            spec: Arc::clone(&self.spec),
            running_task: Arc::new(task),
            running_status: status,
            past_attempts,
            started_at: self.started_at,
            failure_counted: false,
        }
    }

    /// Entry whose running attempt has been counted as failed.
    pub(crate) fn with_failure_counted(&self) -> Self {
        Self {
            failure_counted: true,
            ..self.clone()
        }
    }

    /// Zero based number of the attempt that would follow the running one.
    pub(crate) fn next_attempt(&self) -> Result<u32, MonitorError> {
        u32::try_from(self.num_tries()).map_err(|_| {
            MonitorError::InvalidConfig(format!(
                "attempt number for spec[{}] does not fit in u32",
                self.spec_id()
            ))
        })
    }

    /// Entry with a fresh status for the same attempt.
    pub(crate) fn with_running_status(&self, status: AttemptRecord) -> Result<Self, MonitorError> {
        self.ensure_running_task(&status)?;
        Ok(Self {
            running_status: Some(status),
            ..self.clone()
        })
    }

    /// Reject status answers that belong to another task.
    pub(crate) fn ensure_running_task(&self, status: &AttemptRecord) -> Result<(), MonitorError> {
        if status.task_id != self.running_task.id {
            return Err(MonitorError::StatusMismatch {
                expected: self.running_task.id.clone(),
                actual: status.task_id.clone(),
            });
        }
        Ok(())
    }

    /// Close the entry with its terminal record.
    pub(crate) fn complete(self, last_status: AttemptRecord) -> (CompletionHistory, CompletionEvent) {
        let mut attempts = self.past_attempts;
        attempts.push(last_status.clone());
        let history = CompletionHistory::new(Arc::clone(&self.spec), attempts);
        let event = CompletionEvent {
            spec: self.spec,
            last_status,
        };
        (history, event)
    }

    pub fn spec(&self) -> &Arc<dyn WorkUnitSpec> {
        &self.spec
    }

    pub fn spec_id(&self) -> &str {
        self.spec.id()
    }

    pub fn running_task(&self) -> &SubTask {
        &self.running_task
    }

    pub fn task_id(&self) -> &str {
        &self.running_task.id
    }

    pub fn running_status(&self) -> Option<&AttemptRecord> {
        self.running_status.as_ref()
    }

    pub fn past_attempts(&self) -> &[AttemptRecord] {
        &self.past_attempts
    }

    /// Attempts made so far, the running one included.
    pub fn num_tries(&self) -> usize {
        self.past_attempts.len() + 1
    }

    pub fn failure_counted(&self) -> bool {
        self.failure_counted
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl fmt::Debug for MonitorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorEntry")
            .field("spec_id", &self.spec.id())
            .field("task_id", &self.running_task.id)
            .field("running_status", &self.running_status)
            .field("past_attempts", &self.past_attempts.len())
            .field("failure_counted", &self.failure_counted)
            .field("elapsed", &self.elapsed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::completion::completion_channel;
    use crate::work_unit::{InputSplit, PartitionSpec};
    use shared_types::AttemptState;

    fn entry() -> MonitorEntry {
        let spec: Arc<dyn WorkUnitSpec> = Arc::new(PartitionSpec::new(
            "spec-0",
            "group",
            "job",
            InputSplit::new(0),
            "new_type",
            "old_type",
        ));
        let task = spec.new_sub_task(0);
        let status = AttemptRecord::running(&task.id);
        MonitorEntry::new(spec, task, Some(status))
    }

    #[test]
    fn test_retry_replaces_without_touching_original() {
        let first = entry();
        let failed = AttemptRecord::failed(first.task_id(), "boom");
        let next_task = first.spec().new_sub_task(1);

        let second = first.with_new_running_task(next_task, None, failed);

        assert_eq!(first.num_tries(), 1);
        assert!(first.past_attempts().is_empty());
        assert_eq!(second.num_tries(), 2);
        assert_eq!(second.past_attempts()[0].state, Some(AttemptState::Failed));
        assert_eq!(second.task_id(), "new_type_spec-0_1");
        assert_eq!(second.started_at, first.started_at);
    }

    #[test]
    fn test_status_for_other_task_is_rejected() {
        let entry = entry();
        let err = entry
            .with_running_status(AttemptRecord::running("someone-else"))
            .unwrap_err();
        assert!(matches!(err, MonitorError::StatusMismatch { .. }));

        let updated = entry
            .with_running_status(AttemptRecord::running(entry.task_id()).with_error("slow"))
            .unwrap();
        assert_eq!(
            updated.running_status().unwrap().error_msg.as_deref(),
            Some("slow")
        );
    }

    #[tokio::test]
    async fn test_complete_builds_history_and_resolves() {
        let first = entry();
        let (tx, mut handle) = completion_channel(first.spec_id());
        let failed = AttemptRecord::failed(first.task_id(), "boom");
        let second =
            first.with_new_running_task(first.spec().new_sub_task(1), None, failed);

        let (history, event) = second.complete(AttemptRecord::succeeded("new_type_spec-0_1"));
        tx.send_replace(Some(event));

        assert_eq!(history.attempt_history().len(), 2);
        assert_eq!(
            history.last_attempt().unwrap().state,
            Some(AttemptState::Succeeded)
        );
        assert!(handle.wait().await.unwrap().is_success());
    }

    #[test]
    fn test_failure_flag_resets_with_new_attempt() {
        let first = entry();
        let counted = first.with_failure_counted();
        assert!(!first.failure_counted());
        assert!(counted.failure_counted());
        assert_eq!(counted.task_id(), first.task_id());

        let failed = AttemptRecord::failed(counted.task_id(), "boom");
        let second = counted.with_new_running_task(counted.spec().new_sub_task(1), None, failed);
        assert!(!second.failure_counted());
    }

    #[test]
    fn test_next_attempt_follows_history() {
        let first = entry();
        assert_eq!(first.next_attempt().unwrap(), 1);

        let failed = AttemptRecord::failed(first.task_id(), "boom");
        let second = first.with_new_running_task(first.spec().new_sub_task(1), None, failed);
        assert_eq!(second.next_attempt().unwrap(), 2);
        assert_eq!(second.running_task().attempt + 1, second.next_attempt().unwrap());
    }
}
