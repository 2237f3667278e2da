//! Sub-task supervision engine
//!
//! This crate drives a batch of independent work units through a remote
//! execution gateway: it submits one attempt per unit, polls them, retries
//! failures up to a bound, times out stragglers and hands each caller a
//! completion handle.

pub mod actors;
pub mod config;
pub mod gateway;
pub mod monitor;
pub mod work_unit;

pub use config::MonitorConfig;
pub use gateway::{ExecutionGateway, GatewayError, LocalGateway, RetryPolicy, RetryingGateway};
pub use monitor::{
    CompletionEvent, CompletionHandle, CompletionHistory, MonitorEntry, MonitorError,
    PartitionReport, ReportInbox, SubTaskMonitor, SubTaskReport,
};
pub use work_unit::{InputSplit, PartitionSpec, SubTask, WorkUnitSpec};
