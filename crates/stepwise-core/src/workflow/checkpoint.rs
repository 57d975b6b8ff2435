//! Checkpoint store port and an in-memory implementation.
//!
//! Checkpoints are append-only: `save` assigns `max(version) + 1` for the
//! execution id and never overwrites a row. The state passed to `save` carries
//! the version it was derived from; if another writer advanced the timeline in
//! the meantime the save fails with `ConcurrentConflict`.

use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use stepwise_types::checkpoint::{Checkpoint, CheckpointSummary, ExecutionSummary, WorkflowEvent};
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{ExecutionStatus, WorkflowExecution};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("no checkpoints for execution '{0}'")]
    ExecutionNotFound(String),

    #[error("execution '{execution_id}' has no checkpoint version {version}")]
    VersionNotFound { execution_id: String, version: u32 },

    #[error("concurrent checkpoint conflict for execution '{execution_id}' at version {version}")]
    ConcurrentConflict { execution_id: String, version: u32 },

    #[error("checkpoint storage error: {0}")]
    Storage(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

impl From<RepositoryError> for CheckpointError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Serialization(e) => Self::Serialization(e),
            other => Self::Storage(other.to_string()),
        }
    }
}

/// Versioned, append-only persistence of execution state plus the lifecycle
/// audit table.
///
/// Implementations live in stepwise-infra (e.g., `SqliteCheckpointStore`).
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint and return its version.
    fn save(
        &self,
        execution_id: &str,
        state: &WorkflowExecution,
    ) -> impl Future<Output = Result<u32, CheckpointError>> + Send;

    fn load_latest(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Result<Checkpoint, CheckpointError>> + Send;

    fn load_version(
        &self,
        execution_id: &str,
        version: u32,
    ) -> impl Future<Output = Result<Checkpoint, CheckpointError>> + Send;

    /// Every checkpoint's summary in version order. Never loads full state.
    fn history(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Result<Vec<CheckpointSummary>, CheckpointError>> + Send;

    /// Latest checkpoint of every execution, optionally filtered by status,
    /// most recently updated first.
    fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> impl Future<Output = Result<Vec<ExecutionSummary>, CheckpointError>> + Send;

    fn record_event(
        &self,
        event: &WorkflowEvent,
    ) -> impl Future<Output = Result<(), CheckpointError>> + Send;

    /// Events for one execution, oldest first.
    fn list_events(
        &self,
        execution_id: &str,
    ) -> impl Future<Output = Result<Vec<WorkflowEvent>, CheckpointError>> + Send;

    /// Cheap reachability check.
    fn ping(&self) -> impl Future<Output = Result<(), CheckpointError>> + Send;
}

// ---------------------------------------------------------------------------
// InMemoryCheckpointStore
// ---------------------------------------------------------------------------

/// Process-local store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Vec<Checkpoint>>>,
    events: RwLock<Vec<WorkflowEvent>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, execution_id: &str, state: &WorkflowExecution) -> Result<u32, CheckpointError> {
        let mut all = self.checkpoints.write().await;
        let timeline = all.entry(execution_id.to_string()).or_default();
        let latest = timeline.last().map(|c| c.version).unwrap_or(0);
        if state.version != latest {
            return Err(CheckpointError::ConcurrentConflict {
                execution_id: execution_id.to_string(),
                version: latest + 1,
            });
        }

        let version = latest + 1;
        let mut snapshot = state.clone();
        snapshot.version = version;
        timeline.push(Checkpoint {
            execution_id: execution_id.to_string(),
            version,
            state: snapshot,
            created_at: Utc::now(),
        });
        Ok(version)
    }

    async fn load_latest(&self, execution_id: &str) -> Result<Checkpoint, CheckpointError> {
        self.checkpoints
            .read()
            .await
            .get(execution_id)
            .and_then(|timeline| timeline.last().cloned())
            .ok_or_else(|| CheckpointError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn load_version(&self, execution_id: &str, version: u32) -> Result<Checkpoint, CheckpointError> {
        let all = self.checkpoints.read().await;
        let timeline = all
            .get(execution_id)
            .ok_or_else(|| CheckpointError::ExecutionNotFound(execution_id.to_string()))?;
        timeline
            .iter()
            .find(|c| c.version == version)
            .cloned()
            .ok_or_else(|| CheckpointError::VersionNotFound {
                execution_id: execution_id.to_string(),
                version,
            })
    }

    async fn history(&self, execution_id: &str) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        self.checkpoints
            .read()
            .await
            .get(execution_id)
            .filter(|timeline| !timeline.is_empty())
            .map(|timeline| timeline.iter().map(Checkpoint::summary).collect())
            .ok_or_else(|| CheckpointError::ExecutionNotFound(execution_id.to_string()))
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionSummary>, CheckpointError> {
        let all = self.checkpoints.read().await;
        let mut summaries: Vec<ExecutionSummary> = all
            .values()
            .filter_map(|timeline| timeline.last())
            .filter(|latest| status.is_none_or(|s| latest.state.status == s))
            .map(|latest| ExecutionSummary {
                execution_id: latest.execution_id.clone(),
                workflow_id: latest.state.workflow_id.clone(),
                status: latest.state.status,
                current_step: latest.state.current_step.clone(),
                latest_version: latest.version,
                updated_at: latest.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn record_event(&self, event: &WorkflowEvent) -> Result<(), CheckpointError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, execution_id: &str) -> Result<Vec<WorkflowEvent>, CheckpointError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), CheckpointError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use stepwise_types::message::WorkflowEventKind;
    use stepwise_types::workflow::WorkflowDefinition;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::from_pairs("wf", [("a", "agent-a"), ("b", "agent-b")])
    }

    #[tokio::test]
    async fn versions_start_at_one_and_increase() {
        let store = InMemoryCheckpointStore::new();
        let def = definition();
        let mut state = WorkflowExecution::new(&def, json!({}));
        let id = state.execution_id.clone();

        let v1 = store.save(&id, &state).await.unwrap();
        state.version = v1;
        state.record_step("a", json!({"x": 1}), Some("b"));
        let v2 = store.save(&id, &state).await.unwrap();

        assert_eq!((v1, v2), (1, 2));
        let latest = store.load_latest(&id).await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.state.version, 2);
        assert_eq!(latest.state.completed_steps, vec!["a"]);

        let first = store.load_version(&id, 1).await.unwrap();
        assert!(first.state.completed_steps.is_empty());
    }

    #[tokio::test]
    async fn stale_state_is_a_conflict() {
        let store = InMemoryCheckpointStore::new();
        let state = WorkflowExecution::new(&definition(), json!({}));
        let id = state.execution_id.clone();

        store.save(&id, &state).await.unwrap();
        let err = store.save(&id, &state).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ConcurrentConflict { version: 2, .. }));
        assert_eq!(store.history(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_saves_never_share_a_version() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut state = WorkflowExecution::new(&definition(), json!({}));
        let id = state.execution_id.clone();
        state.version = store.save(&id, &state).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let state = state.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { store.save(&id, &state).await }));
        }

        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(v) => {
                    assert_eq!(v, 2);
                    ok += 1;
                }
                Err(CheckpointError::ConcurrentConflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn missing_execution_and_version() {
        let store = InMemoryCheckpointStore::new();
        assert!(matches!(
            store.load_latest("nope").await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            store.history("nope").await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));

        let state = WorkflowExecution::new(&definition(), json!({}));
        store.save(&state.execution_id, &state).await.unwrap();
        assert!(matches!(
            store.load_version(&state.execution_id, 7).await,
            Err(CheckpointError::VersionNotFound { version: 7, .. })
        ));
    }

    #[tokio::test]
    async fn list_executions_filters_on_latest_status() {
        let store = InMemoryCheckpointStore::new();
        let def = definition();

        let running = WorkflowExecution::new(&def, json!({}));
        store.save(&running.execution_id, &running).await.unwrap();

        let mut failed = WorkflowExecution::new(&def, json!({}));
        failed.version = store.save(&failed.execution_id, &failed).await.unwrap();
        failed.mark_failed("a", "boom");
        store.save(&failed.execution_id, &failed).await.unwrap();

        let all = store.list_executions(None).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_failed = store.list_executions(Some(ExecutionStatus::Failed)).await.unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].execution_id, failed.execution_id);
        assert_eq!(only_failed[0].latest_version, 2);
    }

    #[tokio::test]
    async fn events_are_listed_per_execution() {
        let store = InMemoryCheckpointStore::new();
        store
            .record_event(&WorkflowEvent::new("e1", WorkflowEventKind::WorkflowStarted, json!({})))
            .await
            .unwrap();
        store
            .record_event(&WorkflowEvent::new("e2", WorkflowEventKind::WorkflowStarted, json!({})))
            .await
            .unwrap();
        store
            .record_event(&WorkflowEvent::new("e1", WorkflowEventKind::WorkflowCompleted, json!({})))
            .await
            .unwrap();

        let events = store.list_events("e1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event_type, WorkflowEventKind::WorkflowCompleted);
        assert!(store.ping().await.is_ok());
    }
}
