//! In-process execution gateway.
//!
//! Each accepted [`SubTask`] runs on its own tokio task through a caller
//! supplied [`TaskBehavior`]. The behavior decides the terminal state and may
//! push reports into a `ReportInbox` the same way a remote worker would.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use shared_types::{AttemptRecord, AttemptState, TaskStatusResponse};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::{ExecutionGateway, GatewayError};
use crate::work_unit::SubTask;

/// Runs one sub-task to completion and returns its terminal state.
pub type TaskBehavior = Arc<dyn Fn(SubTask) -> BoxFuture<'static, AttemptState> + Send + Sync>;

pub struct LocalGateway {
    behavior: TaskBehavior,
    /// `None` accepts every task type
    accepted_types: Option<HashSet<String>>,
    tasks: Arc<DashMap<String, AttemptRecord>>,
    cancelled: Arc<DashSet<String>>,
    /// Abort handles of behaviors still running; each removes itself on exit
    running: Arc<DashMap<String, AbortHandle>>,
    submitted: DashMap<String, SubTask>,
    run_calls: DashMap<String, u32>,
    cancel_calls: DashMap<String, u32>,
}

impl LocalGateway {
    pub fn new(behavior: TaskBehavior) -> Self {
        Self {
            behavior,
            accepted_types: None,
            tasks: Arc::new(DashMap::new()),
            cancelled: Arc::new(DashSet::new()),
            running: Arc::new(DashMap::new()),
            submitted: DashMap::new(),
            run_calls: DashMap::new(),
            cancel_calls: DashMap::new(),
        }
    }

    /// Build from an async closure.
    pub fn from_fn<F, Fut>(behavior: F) -> Self
    where
        F: Fn(SubTask) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = AttemptState> + Send + 'static,
    {
        Self::new(Arc::new(move |task| Box::pin(behavior(task))))
    }

    /// Reject every task type not in `types` with an unknown-type error.
    pub fn with_accepted_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Tasks accepted so far, by task id.
    pub fn submitted_tasks(&self) -> Vec<SubTask> {
        self.submitted.iter().map(|e| e.value().clone()).collect()
    }

    pub fn run_count(&self, task_id: &str) -> u32 {
        self.run_calls.get(task_id).map(|c| *c).unwrap_or(0)
    }

    pub fn cancel_count(&self, task_id: &str) -> u32 {
        self.cancel_calls.get(task_id).map(|c| *c).unwrap_or(0)
    }

    /// Behaviors that have not finished yet.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn total_cancel_count(&self) -> u32 {
        self.cancel_calls.iter().map(|e| *e.value()).sum()
    }

    fn accepts(&self, task_type: &str) -> bool {
        self.accepted_types
            .as_ref()
            .map_or(true, |types| types.contains(task_type))
    }
}

#[async_trait]
impl ExecutionGateway for LocalGateway {
    async fn run_task(&self, task: &SubTask) -> Result<(), GatewayError> {
        *self.run_calls.entry(task.id.clone()).or_insert(0) += 1;

        if !self.accepts(&task.task_type) {
            return Err(GatewayError::wrap(
                format!("failed to decode task[{}]", task.id),
                GatewayError::UnknownTaskType(task.task_type.clone()),
            ));
        }

        let record = AttemptRecord::running(&task.id).with_group(&task.group_id, &task.task_type);
        self.tasks.insert(task.id.clone(), record);
        self.submitted.insert(task.id.clone(), task.clone());

        let behavior = Arc::clone(&self.behavior);
        let tasks = Arc::clone(&self.tasks);
        let cancelled = Arc::clone(&self.cancelled);
        let running = Arc::clone(&self.running);
        let task = task.clone();
        let task_id = task.id.clone();
        // held until the abort handle is registered, so the task never
        // deregisters before it was registered
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let task_id = task.id.clone();
            let _ = registered_rx.await;
            let state = behavior(task).await;
            running.remove(&task_id);
            if cancelled.contains(&task_id) {
                return;
            }
            if let Some(mut record) = tasks.get_mut(&task_id) {
                let elapsed = Utc::now() - record.created_at;
                record.state = Some(state);
                record.duration_ms = Some(elapsed.num_milliseconds());
                if state == AttemptState::Failed {
                    record.error_msg = Some("sub-task reported failure".to_string());
                }
            }
        });
        self.running.insert(task_id, handle.abort_handle());
        let _ = registered_tx.send(());
        Ok(())
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, GatewayError> {
        let status = self.tasks.get(task_id).map(|entry| {
            let record = entry.value().clone();
            if self.cancelled.contains(task_id) {
                record
                    .with_state(AttemptState::Failed)
                    .with_error("cancelled")
            } else {
                record
            }
        });
        Ok(TaskStatusResponse {
            task_id: task_id.to_string(),
            status,
        })
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), GatewayError> {
        *self.cancel_calls.entry(task_id.to_string()).or_insert(0) += 1;
        self.cancelled.insert(task_id.to_string());
        if let Some((_, handle)) = self.running.remove(task_id) {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_unit::{InputSplit, PartitionSpec, WorkUnitSpec};
    use std::time::Duration;

    fn spec() -> PartitionSpec {
        PartitionSpec::new(
            "spec-0",
            "group",
            "job",
            InputSplit::new(0),
            "new_type",
            "old_type",
        )
    }

    async fn wait_for_state(gateway: &LocalGateway, task_id: &str, state: AttemptState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let response = gateway.task_status(task_id).await.unwrap();
                if response.status.and_then(|s| s.state) == Some(state) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task never reached expected state");
    }

    #[tokio::test]
    async fn test_runs_behavior_to_terminal_state() {
        let gateway = LocalGateway::from_fn(|_task| async { AttemptState::Succeeded });
        let task = spec().new_sub_task(0);

        gateway.run_task(&task).await.unwrap();
        wait_for_state(&gateway, &task.id, AttemptState::Succeeded).await;

        assert_eq!(gateway.run_count(&task.id), 1);
        assert_eq!(gateway.submitted_tasks().len(), 1);
        assert_eq!(gateway.running_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_status_for_unsubmitted_task() {
        let gateway = LocalGateway::from_fn(|_task| async { AttemptState::Succeeded });
        let response = gateway.task_status("never-submitted").await.unwrap();
        assert!(response.status.is_none());
    }

    #[tokio::test]
    async fn test_rejects_unaccepted_type_with_wrapped_marker() {
        let gateway = LocalGateway::from_fn(|_task| async { AttemptState::Succeeded })
            .with_accepted_types(["old_type"]);

        let err = gateway.run_task(&spec().new_sub_task(0)).await.unwrap_err();
        assert!(err.is_unknown_task_type());

        let fallback = spec().new_sub_task_with_backward_compatible_type(0);
        gateway.run_task(&fallback).await.unwrap();
        assert_eq!(gateway.submitted_tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_task_reports_failed() {
        let gateway = LocalGateway::from_fn(|_task| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            AttemptState::Succeeded
        });
        let task = spec().new_sub_task(0);
        gateway.run_task(&task).await.unwrap();

        assert_eq!(gateway.running_count(), 1);
        gateway.cancel_task(&task.id).await.unwrap();
        gateway.cancel_task(&task.id).await.unwrap();
        assert_eq!(gateway.running_count(), 0);

        let status = gateway.task_status(&task.id).await.unwrap().status.unwrap();
        assert_eq!(status.state, Some(AttemptState::Failed));
        assert_eq!(status.error_msg.as_deref(), Some("cancelled"));
        assert_eq!(gateway.cancel_count(&task.id), 2);
        assert_eq!(gateway.total_cancel_count(), 2);
    }
}
