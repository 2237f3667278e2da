//! Terminal outcomes: completion histories, events and handles.

use std::fmt;
use std::sync::Arc;

use shared_types::{AttemptRecord, AttemptState};
use tokio::sync::watch;

use super::protocol::MonitorError;
use crate::work_unit::WorkUnitSpec;

/// Every attempt made for a finished unit of work, oldest first.
///
/// The last record is the terminal one. Created once, never mutated.
#[derive(Debug, Clone)]
pub struct CompletionHistory {
    spec: Arc<dyn WorkUnitSpec>,
    attempts: Vec<AttemptRecord>,
}

impl CompletionHistory {
    pub(crate) fn new(spec: Arc<dyn WorkUnitSpec>, attempts: Vec<AttemptRecord>) -> Self {
        Self { spec, attempts }
    }

    pub fn spec(&self) -> &Arc<dyn WorkUnitSpec> {
        &self.spec
    }

    pub fn attempt_history(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn last_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }
}

/// What a completion handle resolves with.
///
/// Failure after exhausted retries, and timeout, are reported here as a
/// FAILED `last_status`, not as an error.
#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub spec: Arc<dyn WorkUnitSpec>,
    pub last_status: AttemptRecord,
}

impl CompletionEvent {
    pub fn last_state(&self) -> AttemptState {
        self.last_status.state.unwrap_or(AttemptState::Failed)
    }

    pub fn is_success(&self) -> bool {
        self.last_state() == AttemptState::Succeeded
    }
}

/// Owned by the engine alone; dropping it abandons every waiting handle.
pub(crate) type CompletionSender = watch::Sender<Option<CompletionEvent>>;

pub(crate) fn completion_channel(spec_id: &str) -> (CompletionSender, CompletionHandle) {
    let (tx, rx) = watch::channel(None);
    (
        tx,
        CompletionHandle {
            spec_id: spec_id.to_string(),
            rx,
        },
    )
}

/// Resolves once per unit of work. Clone it to wait from several places.
#[derive(Clone)]
pub struct CompletionHandle {
    spec_id: String,
    rx: watch::Receiver<Option<CompletionEvent>>,
}

impl CompletionHandle {
    pub fn spec_id(&self) -> &str {
        &self.spec_id
    }

    /// Wait for the terminal outcome.
    ///
    /// Fails with [`MonitorError::Abandoned`] if the engine dropped the unit
    /// of work without finishing it, which only happens on `stop()`.
    pub async fn wait(&mut self) -> Result<CompletionEvent, MonitorError> {
        let resolved = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| MonitorError::Abandoned(self.spec_id.clone()))?;
        resolved
            .clone()
            .ok_or_else(|| MonitorError::Abandoned(self.spec_id.clone()))
    }

    /// The outcome, if already resolved.
    pub fn try_get(&self) -> Option<CompletionEvent> {
        self.rx.borrow().clone()
    }
}

impl fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("spec_id", &self.spec_id)
            .field("resolved", &self.rx.borrow().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_unit::{InputSplit, PartitionSpec};

    fn event() -> CompletionEvent {
        let spec: Arc<dyn WorkUnitSpec> = Arc::new(PartitionSpec::new(
            "spec-0",
            "group",
            "job",
            InputSplit::new(0),
            "new_type",
            "old_type",
        ));
        CompletionEvent {
            spec,
            last_status: AttemptRecord::succeeded("new_type_spec-0_0"),
        }
    }

    #[tokio::test]
    async fn test_every_clone_sees_the_outcome() {
        let (tx, handle) = completion_channel("spec-0");
        let mut first = handle.clone();
        let mut second = handle;

        tx.send_replace(Some(event()));

        assert!(first.wait().await.unwrap().is_success());
        assert!(second.wait().await.unwrap().is_success());
        assert!(second.try_get().is_some());
    }

    #[tokio::test]
    async fn test_outcome_survives_sender_drop() {
        let (tx, mut handle) = completion_channel("spec-0");
        tx.send_replace(Some(event()));
        drop(tx);

        let resolved = handle.wait().await.unwrap();
        assert_eq!(resolved.spec.id(), "spec-0");
    }

    #[tokio::test]
    async fn test_dropped_sender_abandons_waiters() {
        let (tx, mut handle) = completion_channel("spec-0");
        drop(tx);

        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, MonitorError::Abandoned("spec-0".to_string()));
        assert!(handle.try_get().is_none());
    }

    #[test]
    fn test_missing_state_reads_as_failed() {
        let mut event = event();
        event.last_status.state = None;
        assert_eq!(event.last_state(), AttemptState::Failed);
        assert!(!event.is_success());
    }
}
