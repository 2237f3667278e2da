//! SubTaskMonitor - supervises remote sub-tasks until each reaches a terminal outcome
//!
//! The SubTaskMonitor is the engine that:
//! - Submits one attempt per work unit through the execution gateway
//! - Polls every in-flight attempt on a single fixed-period loop
//! - Retries failed attempts up to `max_retry` times
//! - Cancels work units that outlive `task_timeout`
//! - Resolves exactly one completion handle per work unit
//!
//! ## State Machine (per work unit)
//!
//! ```text
//! submit → Running ──SUCCEEDED──────────────→ Succeeded (history)
//!            │  ↑
//!            │  └──FAILED, retries left──→ Running (new attempt)
//!            ├─────FAILED, no retries────→ Failed (history)
//!            ├─────timeout───────────────→ Failed (history, cancelled)
//!            └─────stop()────────────────→ Cancelled (no history)
//! ```
//!
//! A work unit is always visible either in the in-flight map or in the
//! completion histories: histories are written before the in-flight entry is
//! removed, and both happen before the completion handle resolves.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let monitor = SubTaskMonitor::<PartitionReport>::new(gateway, config).await?;
//! monitor.start(Duration::from_millis(100)).await?;
//! let mut handle = monitor.submit(Arc::new(spec)).await?;
//! let outcome = handle.wait().await?;
//! monitor.stop().await;
//! ```

pub mod completion;
pub mod entry;
pub mod protocol;
pub mod reports;

#[cfg(test)]
mod tests;

pub use completion::{CompletionEvent, CompletionHandle, CompletionHistory};
pub use entry::MonitorEntry;
pub use protocol::MonitorError;
pub use reports::{PartitionReport, ReportInbox, SubTaskReport};

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use ractor::{Actor, ActorRef};
use shared_types::{AttemptRecord, AttemptState, MonitorHealth, MonitorProgress};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::actors::{ProgressActor, ProgressArguments, ProgressMsg};
use crate::config::MonitorConfig;
use crate::gateway::ExecutionGateway;
use crate::work_unit::{SubTask, WorkUnitSpec};
use completion::{completion_channel, CompletionSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Created,
    Running,
    Stopped,
}

struct Lifecycle {
    state: LifecycleState,
    poller: Option<JoinHandle<()>>,
}

pub struct SubTaskMonitor<R: SubTaskReport> {
    gateway: Arc<dyn ExecutionGateway>,
    config: MonitorConfig,
    /// spec id -> in-flight entry
    running_tasks: DashMap<String, MonitorEntry>,
    /// spec id -> history of a finished work unit
    task_histories: DashMap<String, CompletionHistory>,
    /// spec id -> sender behind the caller's completion handle
    completions: DashMap<String, CompletionSender>,
    reports: ReportInbox<R>,
    /// Owns all task counters
    progress: ActorRef<ProgressMsg>,
    /// Running flag; also makes submit, retry and stop mutually exclusive
    lifecycle: Mutex<Lifecycle>,
}

impl<R: SubTaskReport> SubTaskMonitor<R> {
    pub async fn new(
        gateway: Arc<dyn ExecutionGateway>,
        config: MonitorConfig,
    ) -> Result<Arc<Self>, MonitorError> {
        Self::with_reports(gateway, config, ReportInbox::new()).await
    }

    /// Build around an inbox that workers may already hold a handle to.
    pub async fn with_reports(
        gateway: Arc<dyn ExecutionGateway>,
        config: MonitorConfig,
        reports: ReportInbox<R>,
    ) -> Result<Arc<Self>, MonitorError> {
        let (progress, _handle) = Actor::spawn(
            None,
            ProgressActor,
            ProgressArguments {
                estimated_total: config.estimated_total,
            },
        )
        .await
        .map_err(|e| MonitorError::Progress(e.to_string()))?;

        tracing::info!(
            estimated_total = config.estimated_total,
            max_retry = config.max_retry,
            task_timeout = ?config.task_timeout,
            "SubTaskMonitor initialized"
        );

        Ok(Arc::new(Self {
            gateway,
            config,
            running_tasks: DashMap::new(),
            task_histories: DashMap::new(),
            completions: DashMap::new(),
            reports,
            progress,
            lifecycle: Mutex::new(Lifecycle {
                state: LifecycleState::Created,
                poller: None,
            }),
        }))
    }

    /// Begin polling every `period`. An engine starts at most once.
    pub async fn start(self: &Arc<Self>, period: Duration) -> Result<(), MonitorError> {
        if period.is_zero() {
            return Err(MonitorError::InvalidConfig(
                "poll period must be positive".to_string(),
            ));
        }

        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            LifecycleState::Running => return Err(MonitorError::AlreadyRunning),
            LifecycleState::Stopped => return Err(MonitorError::AlreadyStopped),
            LifecycleState::Created => {}
        }

        lifecycle.state = LifecycleState::Running;
        lifecycle.poller = Some(tokio::spawn(run_poll_loop(Arc::downgrade(self), period)));
        tracing::info!(period_ms = period.as_millis() as u64, "SubTaskMonitor started");
        Ok(())
    }

    /// Cancel every in-flight work unit and halt polling. No-op once stopped.
    ///
    /// Cancelled work units get no completion history; their handles resolve
    /// with [`MonitorError::Abandoned`].
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == LifecycleState::Stopped {
            return;
        }
        lifecycle.state = LifecycleState::Stopped;

        if let Some(poller) = lifecycle.poller.take() {
            poller.abort();
            let _ = poller.await;
        }

        let spec_ids: Vec<String> = self
            .running_tasks
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for spec_id in spec_ids {
            let Some((_, entry)) = self.running_tasks.remove(&spec_id) else {
                continue;
            };
            self.completions.remove(&spec_id);
            tracing::info!(
                task_id = %entry.task_id(),
                spec_id = %spec_id,
                "Request to cancel sub-task"
            );
            if let Err(e) = self.gateway.cancel_task(entry.task_id()).await {
                tracing::warn!(task_id = %entry.task_id(), error = %e, "Failed to cancel sub-task");
            }
            // a counted failure already left the running count
            if !entry.failure_counted() {
                self.record(ProgressMsg::TaskCanceled);
            }
        }

        match self.progress().await {
            Ok(progress) if progress.running > 0 => tracing::warn!(
                running = progress.running,
                "Inconsistent state: running tasks still not zero after cancelling all in-flight work"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read progress after stop"),
        }

        tracing::info!("SubTaskMonitor stopped");
    }

    /// Submit a work unit. The handle resolves when an attempt succeeds or
    /// the last allowed attempt fails.
    pub async fn submit(
        &self,
        spec: Arc<dyn WorkUnitSpec>,
    ) -> Result<CompletionHandle, MonitorError> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != LifecycleState::Running {
            return Err(MonitorError::NotRunning);
        }

        let spec_id = spec.id().to_string();
        if self.running_tasks.contains_key(&spec_id) {
            return Err(MonitorError::DuplicateSpec(spec_id));
        }

        let task = self.submit_task(&spec, 0).await?;
        tracing::info!(task_id = %task.id, spec_id = %spec_id, "Submitted a new task for spec");
        self.record(ProgressMsg::TaskStarted);

        let status = self.initial_status(&task.id).await;
        let (completion, handle) = completion_channel(&spec_id);
        self.completions.insert(spec_id.clone(), completion);
        self.running_tasks
            .insert(spec_id, MonitorEntry::new(spec, task, status));
        Ok(handle)
    }

    /// Store a report pushed by a sub-task worker.
    pub fn collect_report(&self, report: R) -> Result<(), MonitorError> {
        self.reports.collect(report)
    }

    pub fn reports(&self) -> &ReportInbox<R> {
        &self.reports
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.state == LifecycleState::Running
    }

    // =========================================================================
    // Status queries
    // =========================================================================

    /// Remote ids of the attempts currently in flight.
    pub fn running_task_ids(&self) -> HashSet<String> {
        self.running_tasks
            .iter()
            .map(|e| e.value().task_id().to_string())
            .collect()
    }

    pub fn running_specs(&self) -> Vec<Arc<dyn WorkUnitSpec>> {
        self.running_tasks
            .iter()
            .map(|e| Arc::clone(e.value().spec()))
            .collect()
    }

    pub fn running_entry(&self, spec_id: &str) -> Option<MonitorEntry> {
        self.running_tasks.get(spec_id).map(|e| e.value().clone())
    }

    pub fn complete_specs(&self) -> Vec<Arc<dyn WorkUnitSpec>> {
        self.task_histories
            .iter()
            .map(|e| Arc::clone(e.value().spec()))
            .collect()
    }

    pub fn complete_history(&self, spec_id: &str) -> Option<CompletionHistory> {
        self.task_histories.get(spec_id).map(|e| e.value().clone())
    }

    pub async fn progress(&self) -> Result<MonitorProgress, MonitorError> {
        ractor::call!(self.progress, |reply| ProgressMsg::GetProgress { reply })
            .map_err(|e| MonitorError::Progress(e.to_string()))
    }

    pub async fn health(&self) -> Result<MonitorHealth, MonitorError> {
        ractor::call!(self.progress, |reply| ProgressMsg::GetHealth { reply })
            .map_err(|e| MonitorError::Progress(e.to_string()))
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Run attempt `attempt` of `spec`, falling back to the backward
    /// compatible task type when the gateway does not know the current one.
    async fn submit_task(
        &self,
        spec: &Arc<dyn WorkUnitSpec>,
        attempt: u32,
    ) -> Result<SubTask, MonitorError> {
        let task = spec.new_sub_task(attempt);
        match self.gateway.run_task(&task).await {
            Ok(()) => Ok(task),
            Err(e) if e.is_unknown_task_type() => {
                tracing::warn!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %e,
                    "Got an unknown task type error; retrying with a backward compatible type"
                );
                let fallback = spec.new_sub_task_with_backward_compatible_type(attempt);
                self.gateway
                    .run_task(&fallback)
                    .await
                    .map_err(|source| MonitorError::Submission {
                        spec_id: spec.id().to_string(),
                        source,
                    })?;
                Ok(fallback)
            }
            Err(source) => Err(MonitorError::Submission {
                spec_id: spec.id().to_string(),
                source,
            }),
        }
    }

    async fn initial_status(&self, task_id: &str) -> Option<AttemptRecord> {
        match self.gateway.task_status(task_id).await {
            Ok(response) => response.status,
            Err(e) => {
                tracing::warn!(task_id, error = %e, "Failed to fetch status of submitted task");
                None
            }
        }
    }

    /// Submit the next attempt for a failed work unit. Runs on the poll loop.
    ///
    /// The failure is counted here, under the lifecycle lock, and only once
    /// per attempt: a rejected resubmission leaves a counted entry behind.
    async fn retry(
        &self,
        entry: MonitorEntry,
        last_failed: AttemptRecord,
    ) -> Result<(), MonitorError> {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.state != LifecycleState::Running {
            return Ok(());
        }

        let entry = if entry.failure_counted() {
            entry
        } else {
            self.record_failure(&entry, &last_failed);
            let counted = entry.with_failure_counted();
            self.running_tasks
                .insert(counted.spec_id().to_string(), counted.clone());
            counted
        };

        let attempt = entry.next_attempt()?;
        tracing::info!(
            spec_id = %entry.spec_id(),
            tries = entry.num_tries(),
            max_retry = self.config.max_retry,
            "Retrying spec"
        );
        let task = self.submit_task(entry.spec(), attempt).await?;
        tracing::info!(
            task_id = %task.id,
            spec_id = %entry.spec_id(),
            attempt,
            "Submitted a new task for retrying spec"
        );
        self.record(ProgressMsg::TaskStarted);

        let status = self.initial_status(&task.id).await;
        let next = entry.with_new_running_task(task, status, last_failed);
        self.running_tasks.insert(next.spec_id().to_string(), next);
        Ok(())
    }

    // =========================================================================
    // Poll cycle
    // =========================================================================

    /// Visit every in-flight entry once. Errors are isolated per entry.
    async fn poll_running_tasks(&self) {
        let entries: Vec<MonitorEntry> = self
            .running_tasks
            .iter()
            .map(|e| e.value().clone())
            .collect();

        for entry in entries {
            let spec_id = entry.spec_id().to_string();
            let task_id = entry.task_id().to_string();
            if let Err(e) = self.check_entry(entry).await {
                tracing::error!(
                    spec_id = %spec_id,
                    task_id = %task_id,
                    consistency_violation = e.is_consistency_violation(),
                    error = %e,
                    "Error while monitoring sub-task"
                );
                self.record(ProgressMsg::PollFailure(format!("task[{task_id}]: {e}")));
            }
        }
    }

    async fn check_entry(&self, entry: MonitorEntry) -> Result<(), MonitorError> {
        if let Some(timeout) = self.config.task_timeout {
            let elapsed = entry.elapsed();
            if elapsed > timeout {
                self.cancel_timed_out(entry, elapsed, timeout).await;
                return Ok(());
            }
        }

        let response = self.gateway.task_status(entry.task_id()).await?;
        let Some(status) = response.status else {
            tracing::debug!(task_id = %entry.task_id(), "Gateway has no status for task yet");
            return Ok(());
        };
        entry.ensure_running_task(&status)?;

        match status.state {
            Some(AttemptState::Succeeded) => {
                if !self.reports.contains(entry.task_id()) {
                    return Err(MonitorError::MissingReport(entry.task_id().to_string()));
                }
                self.record(ProgressMsg::TaskSucceeded);
                self.finalize(entry, status);
            }
            Some(AttemptState::Failed) => {
                // reports of failed attempts are never used
                self.reports.discard(entry.task_id());

                let max_retry = usize::try_from(self.config.max_retry).unwrap_or(usize::MAX);
                if entry.past_attempts().len() < max_retry {
                    self.retry(entry, status).await?;
                } else {
                    if !entry.failure_counted() {
                        self.record_failure(&entry, &status);
                    }
                    tracing::error!(
                        spec_id = %entry.spec_id(),
                        tries = entry.num_tries(),
                        "Spec failed after exhausting retries"
                    );
                    self.finalize(entry, status);
                }
            }
            Some(AttemptState::Running) => {
                let updated = entry.with_running_status(status)?;
                if let Some(mut slot) = self.running_tasks.get_mut(updated.spec_id()) {
                    *slot = updated;
                }
            }
            other => {
                return Err(MonitorError::UnknownStatus {
                    task_id: entry.task_id().to_string(),
                    status: other.map_or_else(|| "<none>".to_string(), |s| s.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Timeout is terminal: no retry, whatever budget is left.
    async fn cancel_timed_out(&self, entry: MonitorEntry, elapsed: Duration, timeout: Duration) {
        let task_id = entry.task_id().to_string();
        tracing::warn!(
            task_id = %task_id,
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "Cancelling task that ran past its timeout"
        );

        if let Err(e) = self.gateway.cancel_task(&task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to cancel timed out task");
        }
        let cancelled = match self.gateway.task_status(&task_id).await {
            Ok(response) => response.status,
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to fetch status of cancelled task");
                None
            }
        };

        self.reports.discard(&task_id);
        if !entry.failure_counted() {
            self.record(ProgressMsg::TaskFailed);
        }
        self.finalize(entry, timed_out_record(&task_id, cancelled, elapsed));
    }

    fn finalize(&self, entry: MonitorEntry, last_status: AttemptRecord) {
        let spec_id = entry.spec_id().to_string();
        let (history, event) = entry.complete(last_status);
        self.task_histories.insert(spec_id.clone(), history);
        self.running_tasks.remove(&spec_id);
        match self.completions.remove(&spec_id) {
            Some((_, completion)) => {
                completion.send_replace(Some(event));
            }
            None => tracing::warn!(spec_id = %spec_id, "No completion handle for finished spec"),
        }
    }

    fn record_failure(&self, entry: &MonitorEntry, status: &AttemptRecord) {
        tracing::warn!(
            task_id = %entry.task_id(),
            spec_id = %entry.spec_id(),
            error = ?status.error_msg,
            "Sub-task failed"
        );
        self.record(ProgressMsg::TaskFailed);
    }

    fn record(&self, msg: ProgressMsg) {
        if let Err(e) = self.progress.cast(msg) {
            tracing::warn!(error = %e, "Failed to update progress counters");
        }
    }
}

impl<R: SubTaskReport> Drop for SubTaskMonitor<R> {
    fn drop(&mut self) {
        if let Some(poller) = self.lifecycle.get_mut().poller.take() {
            poller.abort();
        }
        self.progress.stop(None);
    }
}

async fn run_poll_loop<R: SubTaskReport>(monitor: Weak<SubTaskMonitor<R>>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(monitor) = monitor.upgrade() else {
            tracing::debug!("SubTaskMonitor dropped; poll loop exiting");
            break;
        };
        monitor.poll_running_tasks().await;
    }
}

/// Terminal record for a timed out attempt; always FAILED.
fn timed_out_record(
    task_id: &str,
    cancelled: Option<AttemptRecord>,
    elapsed: Duration,
) -> AttemptRecord {
    let reason = format!("timed out after {} ms", elapsed.as_millis());
    match cancelled {
        Some(record) if record.task_id == task_id => {
            if record.state == Some(AttemptState::Failed) {
                record
            } else {
                record.with_state(AttemptState::Failed).with_error(reason)
            }
        }
        _ => AttemptRecord::failed(task_id, reason),
    }
}
