//! ProgressActor - single owner of the engine's task counters
//!
//! Submission, retry, the poll loop and shutdown never touch the counters
//! directly; they cast messages here. Snapshots are read with `call!`.
//!
//! ## Counting rules
//!
//! - `TaskStarted`: every attempt, retries included, counts as running
//! - `TaskSucceeded` / `TaskFailed` / `TaskCanceled`: move one attempt out of running
//! - failed attempts are counted even when the unit of work is retried

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{MonitorHealth, MonitorProgress};

#[derive(Debug, Default)]
pub struct ProgressActor;

#[derive(Debug, Clone)]
pub struct ProgressArguments {
    /// Expected number of succeeded units, for progress logs
    pub estimated_total: u64,
}

#[derive(Debug, Default)]
pub struct ProgressState {
    estimated_total: u64,
    running: u64,
    succeeded: u64,
    failed: u64,
    canceled: u64,
    poll_failures: u64,
    last_poll_failure: Option<String>,
}

impl ProgressState {
    fn progress(&self) -> MonitorProgress {
        MonitorProgress::new(
            self.running,
            self.succeeded,
            self.failed,
            self.estimated_total,
        )
    }

    fn health(&self) -> MonitorHealth {
        MonitorHealth {
            progress: self.progress(),
            canceled: self.canceled,
            poll_failures: self.poll_failures,
            last_poll_failure: self.last_poll_failure.clone(),
        }
    }
}

#[derive(Debug)]
pub enum ProgressMsg {
    /// An attempt was accepted by the gateway
    TaskStarted,
    TaskSucceeded,
    /// An attempt failed or timed out
    TaskFailed,
    /// An attempt was cancelled by shutdown
    TaskCanceled,
    /// A poll-cycle error for one entry
    PollFailure(String),
    GetProgress {
        reply: RpcReplyPort<MonitorProgress>,
    },
    GetHealth {
        reply: RpcReplyPort<MonitorHealth>,
    },
}

#[async_trait]
impl Actor for ProgressActor {
    type Msg = ProgressMsg;
    type State = ProgressState;
    type Arguments = ProgressArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            estimated_total = args.estimated_total,
            "ProgressActor starting"
        );
        Ok(ProgressState {
            estimated_total: args.estimated_total,
            ..ProgressState::default()
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            ProgressMsg::TaskStarted => {
                state.running += 1;
            }
            ProgressMsg::TaskSucceeded => {
                state.running = state.running.saturating_sub(1);
                state.succeeded += 1;
                tracing::info!(
                    "[{}/{}] tasks succeeded",
                    state.succeeded,
                    state.estimated_total
                );
            }
            ProgressMsg::TaskFailed => {
                state.running = state.running.saturating_sub(1);
                state.failed += 1;
            }
            ProgressMsg::TaskCanceled => {
                state.running = state.running.saturating_sub(1);
                state.canceled += 1;
            }
            ProgressMsg::PollFailure(failure) => {
                state.poll_failures += 1;
                state.last_poll_failure = Some(failure);
            }
            ProgressMsg::GetProgress { reply } => {
                let _ = reply.send(state.progress());
            }
            ProgressMsg::GetHealth { reply } => {
                let _ = reply.send(state.health());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::debug!(
            actor_id = %myself.get_id(),
            running = state.running,
            succeeded = state.succeeded,
            failed = state.failed,
            canceled = state.canceled,
            "ProgressActor stopped"
        );
        Ok(())
    }
}
