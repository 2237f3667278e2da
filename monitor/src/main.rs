use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shared_types::AttemptState;
use subtask_monitor::config::env_parse;
use subtask_monitor::{
    InputSplit, LocalGateway, MonitorConfig, PartitionReport, PartitionSpec, ReportInbox,
    RetryPolicy, RetryingGateway, SubTask, SubTaskMonitor, WorkUnitSpec,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DEMO_UNITS: u64 = 4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "subtask_monitor=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = MonitorConfig::from_env()?;
    if config.estimated_total == 0 {
        config.estimated_total = DEFAULT_DEMO_UNITS;
    }
    let failures: u32 = env_parse("SUBTASK_DEMO_FAILURES", 1)?;
    let runtime = Duration::from_millis(env_parse("SUBTASK_DEMO_RUNTIME_MS", 200u64)?);

    let supervisor_id = format!("demo_{}", ulid::Ulid::new());
    info!(
        supervisor_id = %supervisor_id,
        units = config.estimated_total,
        max_retry = config.max_retry,
        failures,
        "subtask-monitor demo starting"
    );

    // Workers push into the same inbox the engine reads.
    let inbox: ReportInbox<PartitionReport> = ReportInbox::new();
    let worker_inbox = inbox.clone();
    let local = LocalGateway::from_fn(move |task: SubTask| {
        let inbox = worker_inbox.clone();
        async move {
            tokio::time::sleep(runtime).await;
            if task.attempt < failures {
                return AttemptState::Failed;
            }
            let report = PartitionReport::new(
                &task.id,
                json!({ "spec": task.spec_id, "attempt": task.attempt }),
            );
            match inbox.collect(report) {
                Ok(()) => AttemptState::Succeeded,
                Err(e) => {
                    tracing::error!(task_id = %task.id, error = %e, "Worker failed to push report");
                    AttemptState::Failed
                }
            }
        }
    });
    let gateway = Arc::new(RetryingGateway::new(local, RetryPolicy::unlimited()));

    let poll_period = config.poll_period;
    let units = config.estimated_total;
    let monitor = SubTaskMonitor::with_reports(gateway, config, inbox).await?;
    monitor.start(poll_period).await?;

    let mut handles = Vec::new();
    for i in 0..units {
        let spec: Arc<dyn WorkUnitSpec> = Arc::new(PartitionSpec::new(
            format!("{supervisor_id}_partition_{i}"),
            "demo",
            supervisor_id.as_str(),
            InputSplit::new(json!({ "partition": i })),
            "partial_index",
            "partial_index_legacy",
        ));
        handles.push(monitor.submit(spec).await?);
    }

    let outcomes = futures::future::join_all(handles.iter_mut().map(|h| h.wait())).await;
    for outcome in outcomes {
        match outcome {
            Ok(event) => info!(
                spec_id = %event.spec.id(),
                task_id = %event.last_status.task_id,
                state = %event.last_state(),
                "Work unit finished"
            ),
            Err(e) => tracing::warn!(error = %e, "Work unit did not finish"),
        }
    }

    let health = monitor.health().await?;
    info!(
        running = health.progress.running,
        succeeded = health.progress.succeeded,
        failed = health.progress.failed,
        complete = health.progress.complete,
        poll_failures = health.poll_failures,
        "Final progress"
    );

    monitor.stop().await;
    Ok(())
}
