//! Fixed-delay retry wrapper for gateways.
//!
//! Gateway unavailability should stall the engine rather than fail it, so the
//! demo binary wraps its gateway with [`RetryPolicy::unlimited`].

use std::time::Duration;

use async_trait::async_trait;
use shared_types::TaskStatusResponse;

use super::{ExecutionGateway, GatewayError};
use crate::work_unit::SubTask;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per call, `None` for no limit
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn unlimited() -> Self {
        Self {
            max_attempts: None,
            delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }

    fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unlimited()
    }
}

pub struct RetryingGateway<G> {
    inner: G,
    policy: RetryPolicy,
}

impl<G: ExecutionGateway> RetryingGateway<G> {
    pub fn new(inner: G, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, GatewayError>> + Send,
        T: Send,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.policy.allows(attempt) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = self.policy.delay.as_millis() as u64,
                        error = %e,
                        "Gateway call failed; retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<G: ExecutionGateway> ExecutionGateway for RetryingGateway<G> {
    async fn run_task(&self, task: &SubTask) -> Result<(), GatewayError> {
        self.with_retry("run_task", || self.inner.run_task(task)).await
    }

    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse, GatewayError> {
        self.with_retry("task_status", || self.inner.task_status(task_id)).await
    }

    async fn cancel_task(&self, task_id: &str) -> Result<(), GatewayError> {
        self.with_retry("cancel_task", || self.inner.cancel_task(task_id)).await
    }
}
