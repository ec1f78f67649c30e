//! Workflow domain types for journalflow.
//!
//! Defines the immutable workflow template (`WorkflowDefinition` and its
//! `WorkflowStep` nodes), the mutable runtime record of one execution
//! (`WorkflowInstance` with its append-only `ExecutionLogEntry` list), and the
//! `StepResult` returned by every step execution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::InstanceError;

/// Key-value data visible to conditions and handlers.
pub type ContextMap = HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// An immutable, named graph of steps.
///
/// Registered once with the definition store and shared by reference across
/// every instance started from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Lookup key in the definition store (e.g. "trade-review").
    pub id: String,
    /// Human-readable name. Not required to be unique.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the application event that starts this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_event: Option<String>,
    /// Steps in declaration order. Ids are unique within the definition.
    pub steps: Vec<WorkflowStep>,
    /// Default variables seeded into every instance context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: ContextMap,
}

impl WorkflowDefinition {
    /// Create an empty definition with the given id and name.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            trigger_event: None,
            steps: Vec::new(),
            variables: HashMap::new(),
        }
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }

    pub fn with_trigger_event(mut self, event: impl Into<String>) -> Self {
        self.trigger_event = Some(event.into());
        self
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// The step execution begins at: the first `Start` step, or the first
    /// declared step when none is typed `Start`.
    pub fn start_step(&self) -> Option<&WorkflowStep> {
        self.steps
            .iter()
            .find(|s| s.step_type == StepType::Start)
            .or_else(|| self.steps.first())
    }
}

// ---------------------------------------------------------------------------
// Workflow Step
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Step id, unique within its definition.
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Boolean expression evaluated by `Decision` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Type-specific parameters (`action`, `duration`, `workflow_id`, ...).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, Value>,
    /// Branch targets. For `Decision`: `[when_true, when_false]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    /// Step to jump to when this step fails after all attempts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            step_type,
            condition: None,
            parameters: HashMap::new(),
            next_steps: Vec::new(),
            error_handler: None,
            max_retries: None,
            timeout_secs: None,
        }
    }

    /// Shorthand for an `Action` step bound to `action`.
    pub fn action(id: impl Into<String>, name: impl Into<String>, action: &str) -> Self {
        Self::new(id, name, StepType::Action).with_parameter("action", Value::from(action))
    }

    pub fn with_next(mut self, step_id: impl Into<String>) -> Self {
        self.next_steps.push(step_id.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_error_handler(mut self, step_id: impl Into<String>) -> Self {
        self.error_handler = Some(step_id.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    pub fn parameter_u64(&self, key: &str) -> Option<u64> {
        self.parameters.get(key).and_then(Value::as_u64)
    }

    pub fn parameter_bool(&self, key: &str) -> Option<bool> {
        self.parameters.get(key).and_then(Value::as_bool)
    }

    /// Number of attempts the retry executor makes: `max(1, max_retries)`.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.unwrap_or(0).max(1)
    }

    /// Every step id this step points at (branch targets and error handler).
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.next_steps
            .iter()
            .map(String::as_str)
            .chain(self.error_handler.as_deref())
    }
}

/// The kind of step, which governs its execution semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Start,
    End,
    Action,
    Decision,
    Loop,
    Parallel,
    Wait,
    SubWorkflow,
}

// ---------------------------------------------------------------------------
// Instance status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    /// Completed, Failed and Cancelled are final.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    /// Running and Paused instances are reported by `list_active`.
    pub fn is_active(self) -> bool {
        matches!(self, InstanceStatus::Running | InstanceStatus::Paused)
    }

    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        match (self, next) {
            (Created, Running) | (Created, Failed) | (Created, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Failed) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution log
// ---------------------------------------------------------------------------

/// One append-only record in an instance's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub step_id: String,
    pub step_name: String,
    pub message: String,
    pub is_error: bool,
    /// 1-based attempt number for entries written by the retry executor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl ExecutionLogEntry {
    pub fn new(step: &WorkflowStep, message: impl Into<String>, is_error: bool) -> Self {
        Self {
            timestamp: Utc::now(),
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            message: message.into(),
            is_error,
            attempt: None,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }
}

// ---------------------------------------------------------------------------
// Workflow Instance
// ---------------------------------------------------------------------------

/// Runtime state of one execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance id.
    pub id: Uuid,
    pub definition_id: String,
    /// Instance that launched this one through a SubWorkflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub status: InstanceStatus,
    /// Set only while the instance is Running or Paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub context: ContextMap,
    pub logs: Vec<ExecutionLogEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl WorkflowInstance {
    /// Create a new instance in `Created` status.
    ///
    /// The context starts from the definition's default variables, then the
    /// caller-supplied values are laid over them.
    pub fn new(definition: &WorkflowDefinition, initial_context: ContextMap) -> Self {
        let mut context = definition.variables.clone();
        context.extend(initial_context);
        Self {
            id: Uuid::now_v7(),
            definition_id: definition.id.clone(),
            parent_id: None,
            status: InstanceStatus::Created,
            current_step: None,
            context,
            logs: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
            error_message: None,
        }
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Move to `next`, enforcing the lifecycle graph.
    ///
    /// Entering a terminal status stamps `ended_at` and clears `current_step`.
    pub fn transition(&mut self, next: InstanceStatus) -> Result<(), InstanceError> {
        if !self.status.can_transition_to(next) {
            return Err(InstanceError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.current_step = None;
        }
        Ok(())
    }

    /// Append a log entry. Entries are never removed or rewritten.
    pub fn append_log(&mut self, entry: ExecutionLogEntry) {
        self.logs.push(entry);
    }

    /// Merge a step's output into the context, overwriting existing keys.
    pub fn merge_output(&mut self, output: &ContextMap) {
        for (key, value) in output {
            self.context.insert(key.clone(), value.clone());
        }
    }

    /// The context as a JSON object, the shape expressions evaluate against.
    pub fn context_value(&self) -> Value {
        Value::Object(
            self.context
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    /// Log entries written for `step_id`, in order.
    pub fn logs_for_step<'a>(
        &'a self,
        step_id: &'a str,
    ) -> impl Iterator<Item = &'a ExecutionLogEntry> + 'a {
        self.logs.iter().filter(move |e| e.step_id == step_id)
    }
}

// ---------------------------------------------------------------------------
// Step Result
// ---------------------------------------------------------------------------

/// Outcome of one step execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Merged into the instance context on success.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output: ContextMap,
    /// Branch outcome of a Decision step. Not merged into the context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<bool>,
}

impl StepResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn decided(decision: bool) -> Self {
        Self {
            success: true,
            decision: Some(decision),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }

    /// The error message, or a generic one for failures without a message.
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "step failed without an error message".to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition::new("trade-review", "Trade Review")
            .with_variable("risk", json!(0))
            .with_variable("currency", json!("USD"))
            .with_step(WorkflowStep::new("begin", "Begin", StepType::Start).with_next("check"))
            .with_step(
                WorkflowStep::new("check", "Check Risk", StepType::Decision)
                    .with_condition("risk > 5")
                    .with_next("warn")
                    .with_next("done"),
            )
            .with_step(WorkflowStep::action("warn", "Warn", "notify").with_next("done"))
            .with_step(WorkflowStep::new("done", "Done", StepType::End))
    }

    #[test]
    fn start_step_prefers_start_type() {
        let def = WorkflowDefinition::new("wf", "wf")
            .with_step(WorkflowStep::action("a", "A", "noop"))
            .with_step(WorkflowStep::new("s", "S", StepType::Start));
        assert_eq!(def.start_step().unwrap().id, "s");
    }

    #[test]
    fn start_step_falls_back_to_first() {
        let def = WorkflowDefinition::new("wf", "wf")
            .with_step(WorkflowStep::action("a", "A", "noop"))
            .with_step(WorkflowStep::action("b", "B", "noop"));
        assert_eq!(def.start_step().unwrap().id, "a");
        assert!(WorkflowDefinition::new("empty", "empty").start_step().is_none());
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let step = WorkflowStep::action("a", "A", "noop");
        assert_eq!(step.max_attempts(), 1);
        assert_eq!(step.clone().with_max_retries(0).max_attempts(), 1);
        assert_eq!(step.with_max_retries(3).max_attempts(), 3);
    }

    #[test]
    fn references_include_error_handler() {
        let step = WorkflowStep::action("a", "A", "noop")
            .with_next("b")
            .with_error_handler("recover");
        let refs: Vec<&str> = step.references().collect();
        assert_eq!(refs, vec!["b", "recover"]);
    }

    #[test]
    fn instance_context_overlays_initial_values() {
        let def = sample_definition();
        let instance = WorkflowInstance::new(&def, HashMap::from([("risk".to_string(), json!(8))]));
        assert_eq!(instance.context["risk"], json!(8));
        assert_eq!(instance.context["currency"], json!("USD"));
        assert_eq!(instance.status, InstanceStatus::Created);
        assert!(instance.current_step.is_none());
    }

    #[test]
    fn terminal_transition_clears_current_step() {
        let def = sample_definition();
        let mut instance = WorkflowInstance::new(&def, HashMap::new());
        instance.transition(InstanceStatus::Running).unwrap();
        instance.current_step = Some("check".to_string());
        instance.transition(InstanceStatus::Completed).unwrap();
        assert!(instance.current_step.is_none());
        assert!(instance.ended_at.is_some());
    }

    #[test]
    fn terminal_status_cannot_be_left() {
        let def = sample_definition();
        let mut instance = WorkflowInstance::new(&def, HashMap::new());
        instance.transition(InstanceStatus::Running).unwrap();
        instance.transition(InstanceStatus::Failed).unwrap();
        let err = instance.transition(InstanceStatus::Running).unwrap_err();
        assert_eq!(
            err,
            InstanceError::InvalidTransition {
                from: InstanceStatus::Failed,
                to: InstanceStatus::Running,
            }
        );
    }

    #[test]
    fn active_and_terminal_statuses() {
        assert!(InstanceStatus::Running.is_active());
        assert!(InstanceStatus::Paused.is_active());
        assert!(!InstanceStatus::Created.is_active());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Paused.is_terminal());
    }

    #[test]
    fn merge_output_overwrites_keys() {
        let def = sample_definition();
        let mut instance = WorkflowInstance::new(&def, HashMap::new());
        let result = StepResult::ok()
            .with_output("risk", json!(3))
            .with_output("checked", json!(true));
        instance.merge_output(&result.output);
        assert_eq!(instance.context["risk"], json!(3));
        assert_eq!(instance.context["checked"], json!(true));
        assert_eq!(instance.context_value()["currency"], json!("USD"));
    }

    #[test]
    fn logs_for_step_filters_by_id() {
        let def = sample_definition();
        let mut instance = WorkflowInstance::new(&def, HashMap::new());
        let warn = def.step("warn").unwrap();
        let done = def.step("done").unwrap();
        instance.append_log(ExecutionLogEntry::new(warn, "attempt 1/2 failed", true).with_attempt(1));
        instance.append_log(ExecutionLogEntry::new(done, "reached end", false));
        instance.append_log(ExecutionLogEntry::new(warn, "attempt 2/2 succeeded", false).with_attempt(2));
        let attempts: Vec<Option<u32>> = instance.logs_for_step("warn").map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![Some(1), Some(2)]);
    }

    #[test]
    fn step_result_constructors() {
        let failed = StepResult::failure("boom");
        assert!(!failed.success);
        assert_eq!(failed.error_message(), "boom");
        let decided = StepResult::decided(false);
        assert!(decided.success);
        assert_eq!(decided.decision, Some(false));
        assert!(!StepResult::default().error_message().is_empty());
    }

    #[test]
    fn definition_deserializes_from_yaml() {
        let yaml = r#"
id: trade-review
name: Trade Review
trigger_event: trade_saved
variables:
  risk: 0
steps:
  - id: begin
    name: Begin
    type: start
    next_steps: [check]
  - id: check
    name: Check Risk
    type: decision
    condition: "risk > 5"
    next_steps: [warn, done]
  - id: warn
    name: Warn
    type: action
    parameters:
      action: notify
    max_retries: 3
    timeout_secs: 10
    error_handler: done
    next_steps: [done]
  - id: done
    name: Done
    type: end
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.trigger_event.as_deref(), Some("trade_saved"));
        assert_eq!(def.steps.len(), 4);
        let warn = def.step("warn").unwrap();
        assert_eq!(warn.step_type, StepType::Action);
        assert_eq!(warn.parameter_str("action"), Some("notify"));
        assert_eq!(warn.max_retries, Some(3));
        assert_eq!(warn.timeout_secs, Some(10));
        assert_eq!(def.step("check").unwrap().condition.as_deref(), Some("risk > 5"));
    }

    #[test]
    fn sub_workflow_step_type_serializes_snake_case() {
        let json = serde_json::to_string(&StepType::SubWorkflow).unwrap();
        assert_eq!(json, "\"sub_workflow\"");
    }
}
