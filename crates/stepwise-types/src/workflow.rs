//! Workflow definition and execution-state types.
//!
//! A `WorkflowDefinition` is the static, ordered list of steps loaded at
//! startup. A `WorkflowExecution` is the mutable working state of one run;
//! every checkpoint stores a full serialized copy of it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Prefix for the bus topic that carries a workflow's lifecycle events.
///
/// Kept distinct from plain agent ids so "agent work item" and "workflow
/// lifecycle event" channels never collide.
pub const WORKFLOW_TOPIC_PREFIX: &str = "workflow:";

/// Build the lifecycle topic for a workflow definition id.
pub fn workflow_topic(workflow_id: &str) -> String {
    format!("{WORKFLOW_TOPIC_PREFIX}{workflow_id}")
}

// ---------------------------------------------------------------------------
// WorkflowDefinition
// ---------------------------------------------------------------------------

/// A static pipeline: a total order of steps, each bound to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier (e.g. "content-pipeline").
    pub id: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Step names in execution order.
    pub steps: Vec<String>,
    /// Step name -> agent id.
    pub agents: BTreeMap<String, String>,
}

impl WorkflowDefinition {
    /// Build a definition from `(step, agent)` pairs, preserving their order.
    pub fn from_pairs<I, S, A>(id: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, A)>,
        S: Into<String>,
        A: Into<String>,
    {
        let mut steps = Vec::new();
        let mut agents = BTreeMap::new();
        for (step, agent) in pairs {
            let step = step.into();
            agents.insert(step.clone(), agent.into());
            steps.push(step);
        }
        Self {
            id: id.into(),
            description: None,
            steps,
            agents,
        }
    }

    /// Check structural invariants: non-empty id and steps, unique step
    /// names, and an agent for every step.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.id.trim().is_empty() {
            return Err(DefinitionError::EmptyId);
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::NoSteps(self.id.clone()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.as_str()) {
                return Err(DefinitionError::DuplicateStep {
                    workflow_id: self.id.clone(),
                    step: step.clone(),
                });
            }
            match self.agents.get(step) {
                Some(agent) if !agent.trim().is_empty() => {}
                _ => {
                    return Err(DefinitionError::UnmappedStep {
                        workflow_id: self.id.clone(),
                        step: step.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// First step of the pipeline.
    pub fn first_step(&self) -> Option<&str> {
        self.steps.first().map(String::as_str)
    }

    /// The step that follows `step`, or `None` if `step` is the last one.
    pub fn next_step(&self, step: &str) -> Option<&str> {
        let idx = self.steps.iter().position(|s| s == step)?;
        self.steps.get(idx + 1).map(String::as_str)
    }

    /// Agent id bound to a step.
    pub fn agent_for(&self, step: &str) -> Option<&str> {
        self.agents.get(step).map(String::as_str)
    }

    /// Bus topic for this workflow's lifecycle events.
    pub fn topic(&self) -> String {
        workflow_topic(&self.id)
    }
}

/// Structural problems in a workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("workflow id must not be empty")]
    EmptyId,

    #[error("workflow '{0}' has no steps")]
    NoSteps(String),

    #[error("workflow '{workflow_id}' lists step '{step}' more than once")]
    DuplicateStep { workflow_id: String, step: String },

    #[error("workflow '{workflow_id}' has no agent mapped for step '{step}'")]
    UnmappedStep { workflow_id: String, step: String },
}

// ---------------------------------------------------------------------------
// Execution status and transitions
// ---------------------------------------------------------------------------

/// Lifecycle state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, checkpoint v1 written, no step has finished yet.
    Pending,
    /// Stepping through the definition.
    Running,
    /// Every step finished successfully.
    Completed,
    /// A step failed; the execution can be resumed or rolled back.
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown execution status '{other}'")),
        }
    }
}

/// The state transition that produced a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    /// Initial checkpoint of a new execution.
    Started,
    /// A step finished and its result was merged.
    StepCompleted { step: String },
    /// A step failed; the execution stopped.
    StepFailed { step: String, error: String },
    /// State restored from an older version.
    RolledBack { to_version: u32 },
}

impl Transition {
    /// Short label for tables and logs.
    pub fn label(&self) -> String {
        match self {
            Self::Started => "started".to_string(),
            Self::StepCompleted { step } => format!("completed {step}"),
            Self::StepFailed { step, .. } => format!("failed {step}"),
            Self::RolledBack { to_version } => format!("rolled back to v{to_version}"),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// In-memory working state of one execution.
///
/// Owned by the engine for the duration of a run and snapshotted into a
/// checkpoint on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Next step to run; `None` once every step has completed.
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    /// Step name -> that step's agent result.
    pub agent_results: BTreeMap<String, Value>,
    /// Cross-step data; each agent receives it as input.
    pub context: Map<String, Value>,
    /// What produced the snapshot this state was last saved as.
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Checkpoint version this state was loaded from or last saved as
    /// (0 before the first save).
    #[serde(default)]
    pub version: u32,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    /// Build the initial state for a new execution of `definition`.
    pub fn new(definition: &WorkflowDefinition, input: Value) -> Self {
        let now = Utc::now();
        Self {
            execution_id: new_execution_id(&definition.id),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Pending,
            current_step: definition.first_step().map(str::to_string),
            completed_steps: Vec::new(),
            agent_results: BTreeMap::new(),
            context: input_to_context(input),
            transition: Transition::Started,
            error: None,
            version: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Whether `step` already finished in this execution.
    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|s| s == step)
    }

    /// Context snapshot passed to the next agent.
    pub fn context_value(&self) -> Value {
        Value::Object(self.context.clone())
    }

    /// Merge a successful step result and advance to `next_step`.
    ///
    /// Object results are shallow-merged into the context so later steps see
    /// their keys; any other value is stored under the step name.
    pub fn record_step(&mut self, step: &str, result: Value, next_step: Option<&str>) {
        match &result {
            Value::Object(fields) => {
                for (key, value) in fields {
                    self.context.insert(key.clone(), value.clone());
                }
            }
            other => {
                self.context.insert(step.to_string(), other.clone());
            }
        }
        self.agent_results.insert(step.to_string(), result);
        if !self.is_step_completed(step) {
            self.completed_steps.push(step.to_string());
        }
        self.current_step = next_step.map(str::to_string);
        self.status = if next_step.is_some() {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Completed
        };
        self.transition = Transition::StepCompleted {
            step: step.to_string(),
        };
        self.error = None;
        self.updated_at = Utc::now();
    }

    /// Mark the execution failed at `step`. `current_step` stays on the
    /// failed step so a resume retries it.
    pub fn mark_failed(&mut self, step: &str, error: impl Into<String>) {
        let error = error.into();
        self.status = ExecutionStatus::Failed;
        self.current_step = Some(step.to_string());
        self.transition = Transition::StepFailed {
            step: step.to_string(),
            error: error.clone(),
        };
        self.error = Some(error);
        self.updated_at = Utc::now();
    }

    /// Cheap summary: counts and key names only.
    pub fn summary(&self) -> StateSummary {
        StateSummary {
            completed_step_count: self.completed_steps.len(),
            agent_result_keys: self.agent_results.keys().cloned().collect(),
            context_keys: self.context.keys().cloned().collect(),
        }
    }
}

/// Key names and counts describing a state snapshot without its payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub completed_step_count: usize,
    pub agent_result_keys: Vec<String>,
    pub context_keys: Vec<String>,
}

/// Allocate a unique execution id derived from the definition id.
///
/// UUIDv7 is time-ordered, so ids for one workflow sort by start time.
pub fn new_execution_id(workflow_id: &str) -> String {
    format!("{workflow_id}-{}", Uuid::now_v7().simple())
}

fn input_to_context(input: Value) -> Map<String, Value> {
    match input {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> WorkflowDefinition {
        WorkflowDefinition::from_pairs(
            "content",
            [("analyst", "analyst-agent"), ("developer", "dev-agent"), ("tester", "qa-agent")],
        )
    }

    #[test]
    fn from_pairs_preserves_order() {
        let def = pipeline();
        assert_eq!(def.steps, vec!["analyst", "developer", "tester"]);
        assert_eq!(def.agent_for("developer"), Some("dev-agent"));
        assert_eq!(def.first_step(), Some("analyst"));
        assert_eq!(def.next_step("analyst"), Some("developer"));
        assert_eq!(def.next_step("tester"), None);
        assert_eq!(def.topic(), "workflow:content");
    }

    #[test]
    fn validate_accepts_well_formed_definition() {
        assert!(pipeline().validate().is_ok());
    }

    #[test]
    fn validate_rejects_structural_errors() {
        let empty = WorkflowDefinition::from_pairs("x", Vec::<(&str, &str)>::new());
        assert_eq!(empty.validate(), Err(DefinitionError::NoSteps("x".to_string())));

        let mut dup = pipeline();
        dup.steps.push("analyst".to_string());
        assert!(matches!(dup.validate(), Err(DefinitionError::DuplicateStep { .. })));

        let mut unmapped = pipeline();
        unmapped.agents.remove("tester");
        assert!(matches!(
            unmapped.validate(),
            Err(DefinitionError::UnmappedStep { ref step, .. }) if step == "tester"
        ));

        let no_id = WorkflowDefinition::from_pairs(" ", [("a", "b")]);
        assert_eq!(no_id.validate(), Err(DefinitionError::EmptyId));
    }

    #[test]
    fn new_execution_starts_pending_at_first_step() {
        let exec = WorkflowExecution::new(&pipeline(), json!({"topic": "rust"}));
        assert!(exec.execution_id.starts_with("content-"));
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.current_step.as_deref(), Some("analyst"));
        assert!(exec.completed_steps.is_empty());
        assert_eq!(exec.context["topic"], "rust");
        assert_eq!(exec.version, 0);
    }

    #[test]
    fn scalar_input_is_wrapped() {
        let exec = WorkflowExecution::new(&pipeline(), json!("brief"));
        assert_eq!(exec.context["input"], "brief");

        let exec = WorkflowExecution::new(&pipeline(), Value::Null);
        assert!(exec.context.is_empty());
    }

    #[test]
    fn execution_ids_are_unique() {
        let a = new_execution_id("wf");
        let b = new_execution_id("wf");
        assert_ne!(a, b);
    }

    #[test]
    fn record_step_merges_object_results() {
        let def = pipeline();
        let mut exec = WorkflowExecution::new(&def, json!({"topic": "rust"}));
        exec.record_step("analyst", json!({"requirements": ["fast"]}), def.next_step("analyst"));

        assert_eq!(exec.status, ExecutionStatus::Running);
        assert_eq!(exec.current_step.as_deref(), Some("developer"));
        assert_eq!(exec.completed_steps, vec!["analyst"]);
        assert_eq!(exec.context["requirements"], json!(["fast"]));
        assert_eq!(exec.context["topic"], "rust");
        assert_eq!(exec.agent_results["analyst"], json!({"requirements": ["fast"]}));
    }

    #[test]
    fn record_last_step_completes() {
        let def = WorkflowDefinition::from_pairs("one", [("only", "agent")]);
        let mut exec = WorkflowExecution::new(&def, json!({}));
        exec.record_step("only", json!(42), None);

        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.current_step.is_none());
        assert_eq!(exec.context["only"], 42);
    }

    #[test]
    fn mark_failed_keeps_failed_step_current() {
        let def = pipeline();
        let mut exec = WorkflowExecution::new(&def, json!({}));
        exec.record_step("analyst", json!({}), def.next_step("analyst"));
        exec.mark_failed("developer", "compiler exploded");

        assert_eq!(exec.status, ExecutionStatus::Failed);
        assert_eq!(exec.current_step.as_deref(), Some("developer"));
        assert_eq!(exec.error.as_deref(), Some("compiler exploded"));
        assert!(matches!(exec.transition, Transition::StepFailed { ref step, .. } if step == "developer"));
    }

    #[test]
    fn summary_lists_keys_only() {
        let def = pipeline();
        let mut exec = WorkflowExecution::new(&def, json!({"topic": "rust"}));
        exec.record_step("analyst", json!({"requirements": "x".repeat(4096)}), def.next_step("analyst"));

        let summary = exec.summary();
        assert_eq!(summary.completed_step_count, 1);
        assert_eq!(summary.agent_result_keys, vec!["analyst"]);
        assert_eq!(summary.context_keys, vec!["requirements", "topic"]);
    }

    #[test]
    fn status_parses_from_storage_strings() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("paused".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn transition_serializes_with_kind_tag() {
        let json = serde_json::to_value(Transition::RolledBack { to_version: 2 }).unwrap();
        assert_eq!(json, json!({"kind": "rolled_back", "to_version": 2}));
    }
}
