//! Work unit descriptors and the runnable sub-tasks they produce.
//!
//! A descriptor is created by the job coordinator before any submission and
//! never mutated afterwards. Every attempt the engine makes is built from it
//! through [`WorkUnitSpec::new_sub_task`], or through the backward compatible
//! variant when the gateway does not know the current task type.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque reference to the input partition a work unit reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct InputSplit(pub serde_json::Value);

impl InputSplit {
    pub fn new(value: impl Into<serde_json::Value>) -> Self {
        Self(value.into())
    }
}

/// Concrete runnable task for one attempt, as shipped to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubTask {
    /// Remote task id, unique per attempt
    pub id: String,
    /// Type identifier the gateway dispatches on
    pub task_type: String,
    pub group_id: String,
    pub supervisor_task_id: String,
    /// Id of the work unit this attempt belongs to
    pub spec_id: String,
    /// Zero based
    pub attempt: u32,
    pub context: HashMap<String, serde_json::Value>,
    pub input_split: InputSplit,
}

/// Immutable description of one partition of a job.
///
/// Both task builders must be pure functions of the descriptor and the
/// attempt number.
pub trait WorkUnitSpec: fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> &str;

    fn group_id(&self) -> &str;

    /// Job that owns this work unit
    fn supervisor_task_id(&self) -> &str;

    fn context(&self) -> &HashMap<String, serde_json::Value>;

    fn input_split(&self) -> &InputSplit;

    fn new_sub_task(&self, attempt: u32) -> SubTask;

    /// Same work, expressed with a task type older gateways understand.
    fn new_sub_task_with_backward_compatible_type(&self, attempt: u32) -> SubTask;
}

/// Stock descriptor: one input partition processed by a typed sub-task.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSpec {
    id: String,
    group_id: String,
    supervisor_task_id: String,
    context: HashMap<String, serde_json::Value>,
    input_split: InputSplit,
    task_type: String,
    legacy_task_type: String,
}

impl PartitionSpec {
    pub fn new(
        id: impl Into<String>,
        group_id: impl Into<String>,
        supervisor_task_id: impl Into<String>,
        input_split: InputSplit,
        task_type: impl Into<String>,
        legacy_task_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            group_id: group_id.into(),
            supervisor_task_id: supervisor_task_id.into(),
            context: HashMap::new(),
            input_split,
            task_type: task_type.into(),
            legacy_task_type: legacy_task_type.into(),
        }
    }

    pub fn with_context(mut self, context: HashMap<String, serde_json::Value>) -> Self {
        self.context = context;
        self
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn legacy_task_type(&self) -> &str {
        &self.legacy_task_type
    }

    fn build(&self, task_type: &str, attempt: u32) -> SubTask {
        SubTask {
            id: sub_task_id(task_type, &self.id, attempt),
            task_type: task_type.to_string(),
            group_id: self.group_id.clone(),
            supervisor_task_id: self.supervisor_task_id.clone(),
            spec_id: self.id.clone(),
            attempt,
            context: self.context.clone(),
            input_split: self.input_split.clone(),
        }
    }
}

impl WorkUnitSpec for PartitionSpec {
    fn id(&self) -> &str {
        &self.id
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn supervisor_task_id(&self) -> &str {
        &self.supervisor_task_id
    }

    fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    fn input_split(&self) -> &InputSplit {
        &self.input_split
    }

    fn new_sub_task(&self, attempt: u32) -> SubTask {
        self.build(&self.task_type, attempt)
    }

    fn new_sub_task_with_backward_compatible_type(&self, attempt: u32) -> SubTask {
        self.build(&self.legacy_task_type, attempt)
    }
}

/// Deterministic remote id for an attempt.
pub fn sub_task_id(task_type: &str, spec_id: &str, attempt: u32) -> String {
    format!("{task_type}_{spec_id}_{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> PartitionSpec {
        PartitionSpec::new(
            "spec-0",
            "group-a",
            "job-1",
            InputSplit::new(serde_json::json!({"partition": 0})),
            "partial_dimension_cardinality",
            "partial_index_generic",
        )
    }

    #[test]
    fn test_new_sub_task_is_pure() {
        let spec = spec();
        assert_eq!(spec.new_sub_task(2), spec.new_sub_task(2));
        assert_ne!(spec.new_sub_task(0).id, spec.new_sub_task(1).id);
    }

    #[test]
    fn test_sub_task_carries_descriptor_fields() {
        let task = spec().new_sub_task(1);
        assert_eq!(task.id, "partial_dimension_cardinality_spec-0_1");
        assert_eq!(task.spec_id, "spec-0");
        assert_eq!(task.supervisor_task_id, "job-1");
        assert_eq!(task.group_id, "group-a");
        assert_eq!(task.attempt, 1);
        assert_eq!(task.input_split.0["partition"], 0);
    }

    #[test]
    fn test_backward_compatible_variant_uses_legacy_type() {
        let spec = spec();
        let task = spec.new_sub_task_with_backward_compatible_type(0);
        assert_eq!(task.task_type, "partial_index_generic");
        assert_eq!(task.attempt, 0);
        assert_ne!(task.id, spec.new_sub_task(0).id);
    }

    #[test]
    fn test_context_is_copied_into_tasks() {
        let mut context = HashMap::new();
        context.insert("priority".to_string(), serde_json::json!(50));
        let task = spec().with_context(context).new_sub_task(0);
        assert_eq!(task.context["priority"], 50);
    }
}
