//! Message bus envelope types.
//!
//! `BusMessage` is the wire shape shared by every bus adapter:
//! `{taskId, agentId, input|result, metadata: {event_type, timestamp}, timestamp}`.
//! In-process and broker-backed buses serialize it identically.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::workflow_topic;

/// Lifecycle event kinds announced for a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowResumed,
    WorkflowRolledBack,
}

impl WorkflowEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowRolledBack => "workflow_rolled_back",
        }
    }
}

impl fmt::Display for WorkflowEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow_started" => Ok(Self::WorkflowStarted),
            "workflow_completed" => Ok(Self::WorkflowCompleted),
            "workflow_failed" => Ok(Self::WorkflowFailed),
            "workflow_resumed" => Ok(Self::WorkflowResumed),
            "workflow_rolled_back" => Ok(Self::WorkflowRolledBack),
            other => Err(format!("unknown workflow event type '{other}'")),
        }
    }
}

/// Envelope metadata. Field names stay snake_case on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub event_type: WorkflowEventKind,
    pub timestamp: DateTime<Utc>,
}

/// A task or result envelope carried by the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    /// Execution id or a per-step correlation id.
    pub task_id: String,
    /// Agent id, or a `workflow:<id>` topic for lifecycle events.
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub metadata: MessageMetadata,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// A task envelope addressed to an agent or topic.
    pub fn task(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        event_type: WorkflowEventKind,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            input: Some(input),
            result: None,
            metadata: MessageMetadata {
                event_type,
                timestamp: now,
            },
            timestamp: now,
        }
    }

    /// A lifecycle event for an execution, addressed to `workflow:<workflow_id>`.
    ///
    /// `workflow_started` carries the execution input under `input`; every
    /// other kind carries its payload under `result`.
    pub fn lifecycle(
        execution_id: &str,
        workflow_id: &str,
        event_type: WorkflowEventKind,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        let (input, result) = match event_type {
            WorkflowEventKind::WorkflowStarted => (Some(payload), None),
            _ => (None, Some(payload)),
        };
        Self {
            task_id: execution_id.to_string(),
            agent_id: workflow_topic(workflow_id),
            input,
            result,
            metadata: MessageMetadata {
                event_type,
                timestamp: now,
            },
            timestamp: now,
        }
    }

    pub fn event_type(&self) -> WorkflowEventKind {
        self.metadata.event_type
    }

    /// The payload regardless of which slot carries it.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.result.as_ref().or(self.input.as_ref())
    }
}
