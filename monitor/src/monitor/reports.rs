//! Report inbox - out-of-band results pushed by sub-task workers.
//!
//! Workers may push the same report more than once because of transport
//! retries outside the engine's control. A repeated report must be equal to
//! the stored one; anything else means a worker produced divergent output.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::protocol::MonitorError;

/// Result payload a sub-task pushes back to the engine.
pub trait SubTaskReport: fmt::Debug + Clone + PartialEq + Send + Sync + 'static {
    fn task_id(&self) -> &str;
}

/// Stock report carrying an opaque JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionReport {
    pub task_id: String,
    pub payload: serde_json::Value,
}

impl PartitionReport {
    pub fn new(task_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            payload,
        }
    }
}

impl SubTaskReport for PartitionReport {
    fn task_id(&self) -> &str {
        &self.task_id
    }
}

/// Cloneable handle to a shared, deduplicating report store keyed by task id.
pub struct ReportInbox<R> {
    reports: Arc<DashMap<String, R>>,
}

impl<R> Clone for ReportInbox<R> {
    fn clone(&self) -> Self {
        Self {
            reports: Arc::clone(&self.reports),
        }
    }
}

impl<R: SubTaskReport> Default for ReportInbox<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: SubTaskReport> ReportInbox<R> {
    pub fn new() -> Self {
        Self {
            reports: Arc::new(DashMap::new()),
        }
    }

    /// Idempotent upsert. The compare happens under the key's shard lock.
    pub fn collect(&self, report: R) -> Result<(), MonitorError> {
        let task_id = report.task_id().to_string();
        match self.reports.entry(task_id) {
            Entry::Occupied(existing) => {
                tracing::warn!(task_id = %existing.key(), "Received duplicate report");
                if existing.get() != &report {
                    return Err(MonitorError::ConflictingReport {
                        task_id: existing.key().clone(),
                        previous: format!("{:?}", existing.get()),
                        current: format!("{report:?}"),
                    });
                }
                Ok(())
            }
            Entry::Vacant(slot) => {
                tracing::debug!(task_id = %slot.key(), "Collected report");
                slot.insert(report);
                Ok(())
            }
        }
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.reports.contains_key(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<R> {
        self.reports.get(task_id).map(|r| r.value().clone())
    }

    /// Drop the report of a failed or cancelled task.
    pub fn discard(&self, task_id: &str) -> Option<R> {
        self.reports.remove(task_id).map(|(_, report)| report)
    }

    pub fn snapshot(&self) -> HashMap<String, R> {
        self.reports
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_duplicate_equal_report_is_accepted() {
        let inbox = ReportInbox::new();
        let report = PartitionReport::new("task-1", json!({"rows": 10}));

        inbox.collect(report.clone()).unwrap();
        inbox.collect(report.clone()).unwrap();

        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox.get("task-1"), Some(report));
    }

    #[test]
    fn test_conflicting_report_is_rejected() {
        let inbox = ReportInbox::new();
        inbox
            .collect(PartitionReport::new("task-1", json!({"rows": 10})))
            .unwrap();

        let err = inbox
            .collect(PartitionReport::new("task-1", json!({"rows": 11})))
            .unwrap_err();

        assert!(err.is_consistency_violation());
        match err {
            MonitorError::ConflictingReport { task_id, .. } => assert_eq!(task_id, "task-1"),
            other => panic!("Expected ConflictingReport, got {:?}", other),
        }
        // first report wins
        assert_eq!(inbox.get("task-1").unwrap().payload, json!({"rows": 10}));
    }

    #[test]
    fn test_discard_and_shared_handles() {
        let inbox: ReportInbox<PartitionReport> = ReportInbox::new();
        let worker_side = inbox.clone();
        worker_side
            .collect(PartitionReport::new("task-2", json!(null)))
            .unwrap();

        assert!(inbox.contains("task-2"));
        assert!(inbox.discard("task-2").is_some());
        assert!(inbox.discard("task-2").is_none());
        assert!(worker_side.is_empty());
        assert!(inbox.snapshot().is_empty());
    }
}
