use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shared_types::AttemptState;

use crate::config::MonitorConfig;
use crate::gateway::LocalGateway;
use crate::monitor::{
    CompletionEvent, CompletionHandle, MonitorError, PartitionReport, ReportInbox, SubTaskMonitor,
};
use crate::work_unit::{InputSplit, PartitionSpec, SubTask, WorkUnitSpec};

pub(crate) const POLL_PERIOD: Duration = Duration::from_millis(10);
pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) type TestMonitor = SubTaskMonitor<PartitionReport>;

pub(crate) fn spec(id: &str) -> Arc<dyn WorkUnitSpec> {
    Arc::new(PartitionSpec::new(
        id,
        "group-a",
        "supervisor-1",
        InputSplit::new(json!({ "partition": id })),
        "new_type",
        "old_type",
    ))
}

/// Attempts below `failures` fail; later ones report and succeed.
pub(crate) fn scripted_gateway(inbox: &ReportInbox<PartitionReport>, failures: u32) -> LocalGateway {
    let inbox = inbox.clone();
    LocalGateway::from_fn(move |task: SubTask| {
        let inbox = inbox.clone();
        async move {
            if task.attempt < failures {
                return AttemptState::Failed;
            }
            inbox
                .collect(PartitionReport::new(&task.id, json!({ "spec": task.spec_id })))
                .unwrap();
            AttemptState::Succeeded
        }
    })
}

/// Every attempt runs until cancelled.
pub(crate) fn hanging_gateway() -> LocalGateway {
    LocalGateway::from_fn(|_task| async {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        AttemptState::Succeeded
    })
}

pub(crate) async fn setup_monitor(
    gateway: Arc<LocalGateway>,
    inbox: ReportInbox<PartitionReport>,
    config: MonitorConfig,
) -> Arc<TestMonitor> {
    let monitor = SubTaskMonitor::with_reports(gateway, config, inbox)
        .await
        .unwrap();
    monitor.start(POLL_PERIOD).await.unwrap();
    monitor
}

pub(crate) async fn wait_for(handle: &mut CompletionHandle) -> Result<CompletionEvent, MonitorError> {
    tokio::time::timeout(WAIT, handle.wait())
        .await
        .expect("completion handle never resolved")
}

pub(crate) async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
