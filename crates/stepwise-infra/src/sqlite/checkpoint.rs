//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `stepwise-core` using sqlx with split
//! read/write pools. Each checkpoint is a full JSON snapshot of the execution
//! state plus denormalised columns (`status`, `current_step`,
//! `completed_steps`, `transition`, `summary`) so history listings never
//! deserialise the state blob. Rows are append-only.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepwise_core::workflow::{CheckpointError, CheckpointStore};
use stepwise_types::checkpoint::{Checkpoint, CheckpointSummary, ExecutionSummary, WorkflowEvent};
use stepwise_types::error::RepositoryError;
use stepwise_types::message::WorkflowEventKind;
use stepwise_types::workflow::{ExecutionStatus, WorkflowExecution};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url`, running migrations.
    pub async fn connect(database_url: &str) -> Result<Self, CheckpointError> {
        let pool = DatabasePool::new(database_url)
            .await
            .map_err(|e| CheckpointError::Storage(e.to_string()))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    execution_id: String,
    version: i64,
    state: String,
    created_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            version: row.try_get("version")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_checkpoint(self) -> Result<Checkpoint, RepositoryError> {
        let state: WorkflowExecution = serde_json::from_str(&self.state)
            .map_err(|e| RepositoryError::Serialization(format!("invalid state JSON: {e}")))?;
        Ok(Checkpoint {
            execution_id: self.execution_id,
            version: self.version as u32,
            state,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct SummaryRow {
    execution_id: String,
    version: i64,
    status: String,
    current_step: Option<String>,
    completed_steps: String,
    transition: String,
    summary: String,
    created_at: String,
}

impl SummaryRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            version: row.try_get("version")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            completed_steps: row.try_get("completed_steps")?,
            transition: row.try_get("transition")?,
            summary: row.try_get("summary")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_summary(self) -> Result<CheckpointSummary, RepositoryError> {
        Ok(CheckpointSummary {
            execution_id: self.execution_id,
            version: self.version as u32,
            created_at: parse_datetime(&self.created_at)?,
            status: parse_status(&self.status)?,
            current_step: self.current_step,
            completed_steps: parse_json(&self.completed_steps, "completed_steps")?,
            transition: parse_json(&self.transition, "transition")?,
            summary: parse_json(&self.summary, "summary")?,
        })
    }
}

struct ExecutionRow {
    execution_id: String,
    workflow_id: String,
    status: String,
    current_step: Option<String>,
    version: i64,
    created_at: String,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_summary(self) -> Result<ExecutionSummary, RepositoryError> {
        Ok(ExecutionSummary {
            execution_id: self.execution_id,
            workflow_id: self.workflow_id,
            status: parse_status(&self.status)?,
            current_step: self.current_step,
            latest_version: self.version as u32,
            updated_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct EventRow {
    id: String,
    execution_id: String,
    event_type: String,
    payload: String,
    created_at: String,
}

impl EventRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_event(self) -> Result<WorkflowEvent, RepositoryError> {
        let event_type: WorkflowEventKind = self
            .event_type
            .parse()
            .map_err(RepositoryError::Query)?;
        Ok(WorkflowEvent {
            id: parse_uuid(&self.id)?,
            execution_id: self.execution_id,
            event_type,
            payload: parse_json(&self.payload, "payload")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so `ORDER BY created_at` sorts chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_status(s: &str) -> Result<ExecutionStatus, RepositoryError> {
    s.parse().map_err(RepositoryError::Query)
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s)
        .map_err(|e| RepositoryError::Serialization(format!("invalid {column} JSON: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|e| RepositoryError::Serialization(format!("serialize {what}: {e}")))
}

fn query_error(e: sqlx::Error) -> CheckpointError {
    CheckpointError::from(RepositoryError::Query(e.to_string()))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, execution_id: &str, state: &WorkflowExecution) -> Result<u32, CheckpointError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let (latest,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version), 0) FROM checkpoints WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;

        let latest = latest as u32;
        if state.version != latest {
            return Err(CheckpointError::ConcurrentConflict {
                execution_id: execution_id.to_string(),
                version: latest + 1,
            });
        }

        let version = latest + 1;
        let mut snapshot = state.clone();
        snapshot.version = version;

        let state_json = to_json(&snapshot, "state")?;
        let completed_steps = to_json(&snapshot.completed_steps, "completed_steps")?;
        let transition = to_json(&snapshot.transition, "transition")?;
        let summary = to_json(&snapshot.summary(), "summary")?;

        let inserted = sqlx::query(
            r#"INSERT INTO checkpoints
               (execution_id, version, workflow_id, status, current_step, completed_steps,
                transition, summary, state, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution_id)
        .bind(version as i64)
        .bind(&snapshot.workflow_id)
        .bind(snapshot.status.as_str())
        .bind(&snapshot.current_step)
        .bind(&completed_steps)
        .bind(&transition)
        .bind(&summary)
        .bind(&state_json)
        .bind(format_datetime(&Utc::now()))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(CheckpointError::ConcurrentConflict {
                    execution_id: execution_id.to_string(),
                    version,
                });
            }
            Err(e) => return Err(query_error(e)),
        }

        tx.commit().await.map_err(query_error)?;

        tracing::debug!(
            execution_id,
            version,
            status = %snapshot.status,
            bytes = state_json.len(),
            "checkpoint row written"
        );
        Ok(version)
    }

    async fn load_latest(&self, execution_id: &str) -> Result<Checkpoint, CheckpointError> {
        let row = sqlx::query(
            "SELECT execution_id, version, state, created_at FROM checkpoints WHERE execution_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(execution_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?
        .ok_or_else(|| CheckpointError::ExecutionNotFound(execution_id.to_string()))?;

        let r = CheckpointRow::from_row(&row).map_err(query_error)?;
        Ok(r.into_checkpoint()?)
    }

    async fn load_version(&self, execution_id: &str, version: u32) -> Result<Checkpoint, CheckpointError> {
        let row = sqlx::query(
            "SELECT execution_id, version, state, created_at FROM checkpoints WHERE execution_id = ? AND version = ?",
        )
        .bind(execution_id)
        .bind(version as i64)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = CheckpointRow::from_row(&row).map_err(query_error)?;
                Ok(r.into_checkpoint()?)
            }
            None => {
                // Distinguish an unknown execution from a missing version.
                let (count,): (i64,) =
                    sqlx::query_as("SELECT COUNT(*) FROM checkpoints WHERE execution_id = ?")
                        .bind(execution_id)
                        .fetch_one(&self.pool.reader)
                        .await
                        .map_err(query_error)?;
                if count == 0 {
                    Err(CheckpointError::ExecutionNotFound(execution_id.to_string()))
                } else {
                    Err(CheckpointError::VersionNotFound {
                        execution_id: execution_id.to_string(),
                        version,
                    })
                }
            }
        }
    }

    async fn history(&self, execution_id: &str) -> Result<Vec<CheckpointSummary>, CheckpointError> {
        let rows = sqlx::query(
            r#"SELECT execution_id, version, status, current_step, completed_steps,
                      transition, summary, created_at
               FROM checkpoints WHERE execution_id = ? ORDER BY version ASC"#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        if rows.is_empty() {
            return Err(CheckpointError::ExecutionNotFound(execution_id.to_string()));
        }

        let mut history = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = SummaryRow::from_row(row).map_err(query_error)?;
            history.push(r.into_summary()?);
        }
        Ok(history)
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionSummary>, CheckpointError> {
        let status = status.map(|s| s.as_str());
        let rows = sqlx::query(
            r#"SELECT c.execution_id, c.workflow_id, c.status, c.current_step, c.version, c.created_at
               FROM checkpoints c
               JOIN (SELECT execution_id, MAX(version) AS version
                     FROM checkpoints GROUP BY execution_id) latest
                 ON latest.execution_id = c.execution_id AND latest.version = c.version
               WHERE (? IS NULL OR c.status = ?)
               ORDER BY c.created_at DESC"#,
        )
        .bind(status)
        .bind(status)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut executions = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = ExecutionRow::from_row(row).map_err(query_error)?;
            executions.push(r.into_summary()?);
        }
        Ok(executions)
    }

    async fn record_event(&self, event: &WorkflowEvent) -> Result<(), CheckpointError> {
        let payload = to_json(&event.payload, "event payload")?;

        sqlx::query(
            "INSERT INTO workflow_events (id, execution_id, event_type, payload, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(&event.execution_id)
        .bind(event.event_type.as_str())
        .bind(&payload)
        .bind(format_datetime(&event.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn list_events(&self, execution_id: &str) -> Result<Vec<WorkflowEvent>, CheckpointError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_events WHERE execution_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = EventRow::from_row(row).map_err(query_error)?;
            events.push(r.into_event()?);
        }
        Ok(events)
    }

    async fn ping(&self) -> Result<(), CheckpointError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool.reader)
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use stepwise_core::agent::{Agent, AgentRegistry};
    use stepwise_core::bus::{BoxMessageBus, InMemoryMessageBus};
    use stepwise_core::circuit::CircuitBreaker;
    use stepwise_core::workflow::{EngineError, WorkflowEngine};
    use stepwise_types::agent::AgentError;
    use stepwise_types::workflow::{Transition, WorkflowDefinition};

    async fn test_store() -> SqliteCheckpointStore {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        SqliteCheckpointStore::connect(&url).await.unwrap()
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::from_pairs("content", [("draft", "writer"), ("review", "editor")])
    }

    #[tokio::test]
    async fn test_save_and_load_versions() {
        let store = test_store().await;
        let def = definition();
        let mut state = WorkflowExecution::new(&def, json!({"topic": "rust"}));
        let id = state.execution_id.clone();

        state.version = store.save(&id, &state).await.unwrap();
        assert_eq!(state.version, 1);

        state.record_step("draft", json!({"text": "hello"}), def.next_step("draft"));
        assert_eq!(store.save(&id, &state).await.unwrap(), 2);

        let latest = store.load_latest(&id).await.unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.state.version, 2);
        assert_eq!(latest.state.context["text"], "hello");
        assert_eq!(latest.state.current_step.as_deref(), Some("review"));

        let first = store.load_version(&id, 1).await.unwrap();
        assert_eq!(first.state.status, ExecutionStatus::Pending);
        assert_eq!(first.state.context["topic"], "rust");
    }

    #[tokio::test]
    async fn test_stale_save_conflicts_and_writes_nothing() {
        let store = test_store().await;
        let state = WorkflowExecution::new(&definition(), json!({}));
        let id = state.execution_id.clone();

        store.save(&id, &state).await.unwrap();
        let err = store.save(&id, &state).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ConcurrentConflict { version: 2, .. }));
        assert_eq!(store.history(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_saves_yield_one_winner() {
        let store = Arc::new(test_store().await);
        let mut state = WorkflowExecution::new(&definition(), json!({}));
        let id = state.execution_id.clone();
        state.version = store.save(&id, &state).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let store = store.clone();
            let state = state.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move { store.save(&id, &state).await }));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 2);
                    winners += 1;
                }
                Err(CheckpointError::ConcurrentConflict { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(winners, 1);

        let versions: Vec<u32> = store.history(&id).await.unwrap().iter().map(|h| h.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_history_uses_denormalised_columns() {
        let store = test_store().await;
        let def = definition();
        let mut state = WorkflowExecution::new(&def, json!({"topic": "rust"}));
        let id = state.execution_id.clone();
        state.version = store.save(&id, &state).await.unwrap();
        state.record_step("draft", json!("plain text"), def.next_step("draft"));
        state.version = store.save(&id, &state).await.unwrap();
        state.mark_failed("review", "editor unavailable");
        store.save(&id, &state).await.unwrap();

        let history = store.history(&id).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].transition, Transition::Started);
        assert_eq!(history[1].completed_steps, vec!["draft"]);
        assert_eq!(history[1].summary.context_keys, vec!["draft", "topic"]);
        assert_eq!(history[2].status, ExecutionStatus::Failed);
        assert_eq!(history[2].current_step.as_deref(), Some("review"));
        assert!(matches!(
            history[2].transition,
            Transition::StepFailed { ref error, .. } if error == "editor unavailable"
        ));
    }

    #[tokio::test]
    async fn test_not_found_cases() {
        let store = test_store().await;
        assert!(matches!(
            store.load_latest("ghost").await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            store.load_version("ghost", 1).await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));
        assert!(matches!(
            store.history("ghost").await,
            Err(CheckpointError::ExecutionNotFound(_))
        ));

        let state = WorkflowExecution::new(&definition(), json!({}));
        store.save(&state.execution_id, &state).await.unwrap();
        assert!(matches!(
            store.load_version(&state.execution_id, 4).await,
            Err(CheckpointError::VersionNotFound { version: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_list_executions_reads_latest_row() {
        let store = test_store().await;
        let def = definition();

        let pending = WorkflowExecution::new(&def, json!({}));
        store.save(&pending.execution_id, &pending).await.unwrap();

        let mut failed = WorkflowExecution::new(&def, json!({}));
        failed.version = store.save(&failed.execution_id, &failed).await.unwrap();
        failed.mark_failed("draft", "boom");
        store.save(&failed.execution_id, &failed).await.unwrap();

        let all = store.list_executions(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].execution_id, failed.execution_id);

        let only_failed = store.list_executions(Some(ExecutionStatus::Failed)).await.unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].latest_version, 2);
        assert_eq!(only_failed[0].current_step.as_deref(), Some("draft"));

        assert!(
            store
                .list_executions(Some(ExecutionStatus::Completed))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_events_round_trip_in_order() {
        let store = test_store().await;
        for kind in [WorkflowEventKind::WorkflowStarted, WorkflowEventKind::WorkflowFailed] {
            store
                .record_event(&WorkflowEvent::new("exec-1", kind, json!({"step": "draft"})))
                .await
                .unwrap();
        }
        store
            .record_event(&WorkflowEvent::new("exec-2", WorkflowEventKind::WorkflowStarted, json!({})))
            .await
            .unwrap();

        let events = store.list_events("exec-1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, WorkflowEventKind::WorkflowStarted);
        assert_eq!(events[1].event_type, WorkflowEventKind::WorkflowFailed);
        assert_eq!(events[1].payload["step"], "draft");
        assert!(store.list_events("exec-3").await.unwrap().is_empty());
        assert!(store.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("durable.db").display());
        let state = WorkflowExecution::new(&definition(), json!({"k": 1}));

        {
            let store = SqliteCheckpointStore::connect(&url).await.unwrap();
            store.save(&state.execution_id, &state).await.unwrap();
            store.pool().close().await;
        }

        let reopened = SqliteCheckpointStore::connect(&url).await.unwrap();
        let latest = reopened.load_latest(&state.execution_id).await.unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(latest.state.context["k"], 1);
    }

    // -- engine over SQLite ----------------------------------------------------

    struct StepAgent {
        id: &'static str,
        calls: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl Agent for StepAgent {
        fn id(&self) -> &str {
            self.id
        }

        async fn invoke(&self, _input: Value) -> Result<Value, AgentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(AgentError::failed(format!("{} failed", self.id)));
            }
            Ok(json!({ "by": self.id }))
        }
    }

    struct Fixture {
        engine: WorkflowEngine<SqliteCheckpointStore>,
        calls: Vec<Arc<AtomicUsize>>,
        fail_b: Arc<AtomicBool>,
    }

    async fn fixture() -> Fixture {
        let mut registry = AgentRegistry::new();
        let mut calls = Vec::new();
        let fail_b = Arc::new(AtomicBool::new(false));
        for id in ["agent-a", "agent-b", "agent-c"] {
            let counter = Arc::new(AtomicUsize::new(0));
            let fail = if id == "agent-b" {
                fail_b.clone()
            } else {
                Arc::new(AtomicBool::new(false))
            };
            registry.register(StepAgent {
                id,
                calls: counter.clone(),
                fail,
            });
            calls.push(counter);
        }

        let definition =
            WorkflowDefinition::from_pairs("abc", [("A", "agent-a"), ("B", "agent-b"), ("C", "agent-c")]);
        let engine = WorkflowEngine::new(
            vec![definition],
            registry,
            CircuitBreaker::new(5, Duration::from_secs(60)),
            Arc::new(test_store().await),
            BoxMessageBus::new(InMemoryMessageBus::default()),
        )
        .unwrap();
        engine.initialize().await.unwrap();

        Fixture {
            engine,
            calls,
            fail_b,
        }
    }

    async fn versions(engine: &WorkflowEngine<SqliteCheckpointStore>, id: &str) -> Vec<u32> {
        engine
            .get_workflow_history(id)
            .await
            .unwrap()
            .iter()
            .map(|h| h.version)
            .collect()
    }

    #[tokio::test]
    async fn test_engine_success_writes_four_checkpoints() {
        let f = fixture().await;
        let outcome = f.engine.execute_workflow("abc", json!({})).await.unwrap();

        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(versions(&f.engine, &outcome.execution_id).await, vec![1, 2, 3, 4]);
        let events = f.engine.get_workflow_events(&outcome.execution_id).await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_engine_fail_then_resume() {
        let f = fixture().await;
        f.fail_b.store(true, Ordering::SeqCst);

        let err = f.engine.execute_workflow("abc", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::AgentInvocation { ref step, .. } if step == "B"));
        let id = err.execution_id().unwrap().to_string();
        assert_eq!(versions(&f.engine, &id).await, vec![1, 2, 3]);

        let failed = f.engine.list_executions(Some(ExecutionStatus::Failed)).await.unwrap();
        assert_eq!(failed.len(), 1);

        f.fail_b.store(false, Ordering::SeqCst);
        let outcome = f.engine.resume_workflow(&id).await.unwrap();
        assert_eq!(outcome.completed_steps, vec!["A", "B", "C"]);
        assert_eq!(versions(&f.engine, &id).await, vec![1, 2, 3, 4, 5]);
        assert_eq!(f.calls[0].load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_engine_rollback_appends_versions() {
        let f = fixture().await;
        let id = f.engine.execute_workflow("abc", json!({})).await.unwrap().execution_id;

        let outcome = f.engine.rollback_workflow(&id, 2).await.unwrap();
        assert_eq!(outcome.checkpoint_version, 7);

        let history = f.engine.get_workflow_history(&id).await.unwrap();
        assert_eq!(history.len(), 7);
        assert_eq!(history[4].transition, Transition::RolledBack { to_version: 2 });
        assert_eq!(f.calls[0].load(Ordering::SeqCst), 1);
        assert_eq!(f.calls[1].load(Ordering::SeqCst), 2);
        assert_eq!(f.calls[2].load(Ordering::SeqCst), 2);
        assert!(f.engine.health_check().await);
    }
}
