//! Checkpoint and audit-trail types.
//!
//! A checkpoint is an immutable snapshot of a `WorkflowExecution` at one
//! version. Summaries carry only counts and key names so history listings
//! stay cheap regardless of state size.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::WorkflowEventKind;
use crate::workflow::{ExecutionStatus, StateSummary, Transition, WorkflowExecution};

/// A durable snapshot of one execution at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub execution_id: String,
    /// Starts at 1; gap-free per execution id.
    pub version: u32,
    pub state: WorkflowExecution,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Build the history row for this checkpoint.
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            execution_id: self.execution_id.clone(),
            version: self.version,
            created_at: self.created_at,
            status: self.state.status,
            current_step: self.state.current_step.clone(),
            completed_steps: self.state.completed_steps.clone(),
            transition: self.state.transition.clone(),
            summary: self.state.summary(),
        }
    }
}

/// One row of `history()`: everything except the full state payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub execution_id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub transition: Transition,
    pub summary: StateSummary,
}

/// Latest-checkpoint view of one execution, used for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub current_step: Option<String>,
    pub latest_version: u32,
    pub updated_at: DateTime<Utc>,
}

/// A recorded lifecycle event (the audit table counterpart of a bus message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// UUIDv7 event ID.
    pub id: Uuid,
    pub execution_id: String,
    pub event_type: WorkflowEventKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(
        execution_id: impl Into<String>,
        event_type: WorkflowEventKind,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id: execution_id.into(),
            event_type,
            payload,
            created_at: Utc::now(),
        }
    }
}
