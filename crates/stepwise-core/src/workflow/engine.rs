//! Workflow engine: sequential step execution with durable checkpoints.
//!
//! The `WorkflowEngine` drives one execution at a time per call, stepping
//! through a definition's steps in order. Every state transition is written to
//! the `CheckpointStore` before the engine moves on, so an execution can be
//! resumed from its latest checkpoint or rolled back to an older one.
//!
//! # Execution flow
//!
//! 1. Allocate an execution id, save checkpoint v1 (`pending`), publish
//!    `workflow_started`.
//! 2. For each remaining step: resolve the agent, call it through the circuit
//!    breaker with the accumulated context, merge the result, save a checkpoint.
//! 3. On failure: save a `failed` checkpoint, publish `workflow_failed`, return
//!    the error with the execution id and step attached.
//! 4. On success: the checkpoint after the last step is the terminal
//!    `completed` one; publish `workflow_completed`.
//!
//! Lifecycle events go to the bus and the audit table. Both are best-effort:
//! failures are logged and never fail a step. Checkpoint writes are not: a
//! step whose checkpoint failed to persist stops the execution.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use stepwise_types::agent::AgentError;
use stepwise_types::checkpoint::{CheckpointSummary, ExecutionSummary, WorkflowEvent};
use stepwise_types::circuit::CircuitStats;
use stepwise_types::message::{BusMessage, WorkflowEventKind};
use stepwise_types::workflow::{
    DefinitionError, ExecutionStatus, Transition, WorkflowDefinition, WorkflowExecution,
};
use thiserror::Error;

use crate::agent::AgentRegistry;
use crate::bus::{BoxMessageBus, BusHealth};
use crate::circuit::{CircuitBreaker, CircuitError};

use super::checkpoint::{CheckpointError, CheckpointStore};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by `execute_workflow`, `resume_workflow` and
/// `rollback_workflow`. Step-level variants carry the execution id and step
/// so operators can find the checkpoint to resume or roll back from.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow '{0}'")]
    UnknownWorkflow(String),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(#[from] DefinitionError),

    #[error("execution {execution_id}: step '{step}' references unknown agent '{agent_id}'")]
    UnknownAgent {
        execution_id: String,
        step: String,
        agent_id: String,
    },

    #[error(
        "execution {execution_id}: circuit open for agent '{agent_id}' at step '{step}' (retry in {retry_in:?})"
    )]
    CircuitOpen {
        execution_id: String,
        step: String,
        agent_id: String,
        retry_in: Duration,
    },

    #[error("execution {execution_id}: step '{step}' failed: {source}")]
    AgentInvocation {
        execution_id: String,
        step: String,
        agent_id: String,
        #[source]
        source: AgentError,
    },

    #[error("execution {execution_id}: step '{step}' timed out after {timeout:?}")]
    StepTimeout {
        execution_id: String,
        step: String,
        agent_id: String,
        timeout: Duration,
    },

    #[error("execution {execution_id}: concurrent checkpoint conflict at version {version}")]
    ConcurrentCheckpointConflict { execution_id: String, version: u32 },

    #[error(
        "execution '{execution_id}' not found{}",
        .version.map(|v| format!(" at version {v}")).unwrap_or_default()
    )]
    NotFound {
        execution_id: String,
        version: Option<u32>,
    },

    #[error("execution {execution_id}: checkpoint store failure: {source}")]
    Checkpoint {
        execution_id: String,
        step: Option<String>,
        #[source]
        source: CheckpointError,
    },

    #[error("workflow engine not initialized")]
    NotInitialized,

    #[error("workflow engine initialization failed: {0}")]
    Initialization(String),
}

impl EngineError {
    pub fn execution_id(&self) -> Option<&str> {
        match self {
            Self::UnknownAgent { execution_id, .. }
            | Self::CircuitOpen { execution_id, .. }
            | Self::AgentInvocation { execution_id, .. }
            | Self::StepTimeout { execution_id, .. }
            | Self::ConcurrentCheckpointConflict { execution_id, .. }
            | Self::NotFound { execution_id, .. }
            | Self::Checkpoint { execution_id, .. } => Some(execution_id),
            _ => None,
        }
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            Self::UnknownAgent { step, .. }
            | Self::CircuitOpen { step, .. }
            | Self::AgentInvocation { step, .. }
            | Self::StepTimeout { step, .. } => Some(step),
            Self::Checkpoint { step, .. } => step.as_deref(),
            _ => None,
        }
    }
}

fn store_error(execution_id: &str, step: Option<&str>, err: CheckpointError) -> EngineError {
    match err {
        CheckpointError::ExecutionNotFound(_) => EngineError::NotFound {
            execution_id: execution_id.to_string(),
            version: None,
        },
        CheckpointError::VersionNotFound { version, .. } => EngineError::NotFound {
            execution_id: execution_id.to_string(),
            version: Some(version),
        },
        CheckpointError::ConcurrentConflict { version, .. } => {
            EngineError::ConcurrentCheckpointConflict {
                execution_id: execution_id.to_string(),
                version,
            }
        }
        other => EngineError::Checkpoint {
            execution_id: execution_id.to_string(),
            step: step.map(str::to_string),
            source: other,
        },
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Aggregated result of a successful execute/resume/rollback call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub completed_steps: Vec<String>,
    pub agent_results: BTreeMap<String, Value>,
    /// Version of the checkpoint the outcome was read from.
    pub checkpoint_version: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Wall time of this call.
    pub duration_ms: u64,
}

impl WorkflowOutcome {
    fn from_state(state: &WorkflowExecution, elapsed: Duration) -> Self {
        Self {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            completed_steps: state.completed_steps.clone(),
            agent_results: state.agent_results.clone(),
            checkpoint_version: state.version,
            started_at: state.started_at,
            finished_at: state.updated_at,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Per-subsystem health, logged and aggregated by `health_report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub bus: BusHealth,
    pub agents: BTreeMap<String, bool>,
    pub open_circuits: Vec<String>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Orchestrates executions over a checkpoint store, a circuit breaker, an
/// agent registry and a message bus.
///
/// Generic over `S: CheckpointStore` so it runs against SQLite in production
/// and the in-memory store in tests.
pub struct WorkflowEngine<S: CheckpointStore> {
    definitions: BTreeMap<String, Arc<WorkflowDefinition>>,
    registry: Arc<AgentRegistry>,
    breaker: Arc<CircuitBreaker>,
    store: Arc<S>,
    bus: Arc<BoxMessageBus>,
    step_timeout: Duration,
    initialized: AtomicBool,
}

impl<S: CheckpointStore> WorkflowEngine<S> {
    /// Build an engine. Definitions are validated here and immutable afterwards.
    pub fn new(
        definitions: Vec<WorkflowDefinition>,
        registry: AgentRegistry,
        breaker: CircuitBreaker,
        store: Arc<S>,
        bus: BoxMessageBus,
    ) -> Result<Self, EngineError> {
        let mut by_id = BTreeMap::new();
        for definition in definitions {
            definition.validate()?;
            let id = definition.id.clone();
            if by_id.insert(id.clone(), Arc::new(definition)).is_some() {
                tracing::warn!(workflow = %id, "duplicate workflow definition replaced");
            }
        }

        Ok(Self {
            definitions: by_id,
            registry: Arc::new(registry),
            breaker: Arc::new(breaker),
            store,
            bus: Arc::new(bus),
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            initialized: AtomicBool::new(false),
        })
    }

    /// Override the per-step timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn bus(&self) -> &BoxMessageBus {
        &self.bus
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Loaded definitions, sorted by id.
    pub fn definitions(&self) -> Vec<&WorkflowDefinition> {
        self.definitions.values().map(|d| d.as_ref()).collect()
    }

    pub fn definition(&self, id: &str) -> Option<&WorkflowDefinition> {
        self.definitions.get(id).map(|d| d.as_ref())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Connect the bus and initialize every agent. Idempotent.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        if self.is_initialized() {
            return Ok(());
        }
        self.bus
            .connect()
            .await
            .map_err(|e| EngineError::Initialization(e.to_string()))?;
        self.registry
            .initialize()
            .await
            .map_err(|e| EngineError::Initialization(e.to_string()))?;
        self.initialized.store(true, Ordering::Release);

        tracing::info!(
            workflows = self.definitions.len(),
            agents = self.registry.len(),
            bus = self.bus.name(),
            "workflow engine initialized"
        );
        Ok(())
    }

    /// Clean up agents and disconnect the bus.
    pub async fn shutdown(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.registry.cleanup().await;
        self.bus.disconnect().await;
        tracing::info!("workflow engine shut down");
    }

    fn ensure_initialized(&self) -> Result<(), EngineError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(EngineError::NotInitialized)
        }
    }

    fn lookup(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.definitions
            .get(definition_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkflow(definition_id.to_string()))
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Start a new execution of `definition_id` with `input` as the initial
    /// context and run it to completion or first failure.
    pub async fn execute_workflow(
        &self,
        definition_id: &str,
        input: Value,
    ) -> Result<WorkflowOutcome, EngineError> {
        self.ensure_initialized()?;
        let definition = self.lookup(definition_id)?;
        let started = Instant::now();
        let mut state = WorkflowExecution::new(&definition, input);

        tracing::info!(
            execution_id = %state.execution_id,
            workflow = %definition.id,
            steps = definition.steps.len(),
            "starting workflow execution"
        );

        self.persist(&mut state, None).await?;
        let input = state.context_value();
        self.emit(&state, WorkflowEventKind::WorkflowStarted, input).await;

        self.run_steps(&definition, state, started).await
    }

    /// Continue an execution from its latest checkpoint. Steps already
    /// completed are not re-run. Resuming a completed execution returns its
    /// stored outcome without writing anything.
    pub async fn resume_workflow(&self, execution_id: &str) -> Result<WorkflowOutcome, EngineError> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let checkpoint = self
            .store
            .load_latest(execution_id)
            .await
            .map_err(|e| store_error(execution_id, None, e))?;
        let definition = self.lookup(&checkpoint.state.workflow_id)?;

        let mut state = checkpoint.state;
        state.version = checkpoint.version;

        let Some(from_step) = state.current_step.clone() else {
            tracing::info!(
                execution_id,
                version = checkpoint.version,
                "execution already completed, nothing to resume"
            );
            return Ok(WorkflowOutcome::from_state(&state, started.elapsed()));
        };

        tracing::info!(
            execution_id,
            version = checkpoint.version,
            step = %from_step,
            status = %state.status,
            "resuming workflow"
        );
        self.emit(
            &state,
            WorkflowEventKind::WorkflowResumed,
            json!({
                "resumed_from_version": checkpoint.version,
                "resumed_from_step": from_step,
            }),
        )
        .await;

        state.status = ExecutionStatus::Running;
        state.error = None;
        self.run_steps(&definition, state, started).await
    }

    /// Restore the state of `to_version` as a new checkpoint and continue
    /// from there. Newer checkpoints stay in history.
    pub async fn rollback_workflow(
        &self,
        execution_id: &str,
        to_version: u32,
    ) -> Result<WorkflowOutcome, EngineError> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let target = self
            .store
            .load_version(execution_id, to_version)
            .await
            .map_err(|e| store_error(execution_id, None, e))?;
        let latest = self
            .store
            .load_latest(execution_id)
            .await
            .map_err(|e| store_error(execution_id, None, e))?;
        let definition = self.lookup(&target.state.workflow_id)?;

        let mut state = target.state;
        state.version = latest.version;
        state.transition = Transition::RolledBack { to_version };
        state.error = None;
        state.status = if state.current_step.is_some() {
            ExecutionStatus::Running
        } else {
            ExecutionStatus::Completed
        };
        state.updated_at = Utc::now();

        let new_version = self.persist(&mut state, None).await?;
        tracing::info!(
            execution_id,
            to_version,
            from_version = latest.version,
            new_version,
            step = ?state.current_step,
            "rolled back workflow"
        );
        self.emit(
            &state,
            WorkflowEventKind::WorkflowRolledBack,
            json!({
                "rolled_back_to_version": to_version,
                "resumed_from_step": state.current_step,
                "new_version": new_version,
            }),
        )
        .await;

        if state.current_step.is_none() {
            return Ok(WorkflowOutcome::from_state(&state, started.elapsed()));
        }
        self.run_steps(&definition, state, started).await
    }

    /// Checkpoint audit trail in version order. Read-only.
    pub async fn get_workflow_history(
        &self,
        execution_id: &str,
    ) -> Result<Vec<CheckpointSummary>, EngineError> {
        self.store
            .history(execution_id)
            .await
            .map_err(|e| store_error(execution_id, None, e))
    }

    pub async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<ExecutionSummary>, EngineError> {
        self.store
            .list_executions(status)
            .await
            .map_err(|e| store_error("*", None, e))
    }

    /// Recorded lifecycle events for one execution, oldest first.
    pub async fn get_workflow_events(
        &self,
        execution_id: &str,
    ) -> Result<Vec<WorkflowEvent>, EngineError> {
        self.store
            .list_events(execution_id)
            .await
            .map_err(|e| store_error(execution_id, None, e))
    }

    pub fn get_circuit_breaker_stats(&self) -> Vec<CircuitStats> {
        self.breaker.stats()
    }

    pub fn reset_circuit(&self, agent_id: &str) -> bool {
        self.breaker.reset(agent_id)
    }

    /// Check every subsystem; each failing check is logged.
    pub async fn health_report(&self) -> HealthReport {
        let (store_reachable, store_error) = match self.store.ping().await {
            Ok(()) => (true, None),
            Err(e) => {
                tracing::warn!(subsystem = "checkpoint_store", error = %e, "health check failed");
                (false, Some(e.to_string()))
            }
        };

        let bus = self.bus.health_check().await;
        if !bus.healthy {
            tracing::warn!(
                subsystem = "message_bus",
                bus = self.bus.name(),
                error = bus.error.as_deref().unwrap_or("unhealthy"),
                "health check failed"
            );
        }

        let agents = self.registry.get_all_agents_health().await;
        for (agent_id, healthy) in &agents {
            if !healthy {
                tracing::warn!(subsystem = "agent", agent_id = %agent_id, "health check failed");
            }
        }

        let open_circuits = self.breaker.open_circuits();
        for agent_id in &open_circuits {
            tracing::warn!(subsystem = "circuit_breaker", agent_id = %agent_id, "circuit open");
        }

        let healthy = store_reachable
            && bus.healthy
            && agents.values().all(|healthy| *healthy)
            && open_circuits.is_empty();

        HealthReport {
            healthy,
            store_reachable,
            store_error,
            bus,
            agents,
            open_circuits,
        }
    }

    pub async fn health_check(&self) -> bool {
        self.health_report().await.healthy
    }

    // -----------------------------------------------------------------------
    // Step loop
    // -----------------------------------------------------------------------

    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        mut state: WorkflowExecution,
        started: Instant,
    ) -> Result<WorkflowOutcome, EngineError> {
        while let Some(step) = state.current_step.clone() {
            if state.is_step_completed(&step) {
                tracing::debug!(execution_id = %state.execution_id, step = %step, "step already completed, skipping");
                state.current_step = definition.next_step(&step).map(str::to_string);
                continue;
            }

            let Some(agent_id) = definition.agent_for(&step) else {
                let err = EngineError::InvalidDefinition(DefinitionError::UnmappedStep {
                    workflow_id: definition.id.clone(),
                    step: step.clone(),
                });
                return Err(self.fail(state, &step, err).await);
            };

            state.status = ExecutionStatus::Running;
            tracing::debug!(
                execution_id = %state.execution_id,
                step = %step,
                agent_id,
                "invoking step"
            );

            match self.invoke_step(&state, &step, agent_id).await {
                Ok(result) => {
                    state.record_step(&step, result, definition.next_step(&step));
                    if let Err(err) = self.persist(&mut state, Some(&step)).await {
                        self.announce_failure(&state, &step, &err).await;
                        return Err(err);
                    }
                }
                Err(err) => return Err(self.fail(state, &step, err).await),
            }
        }

        self.complete(state, started).await
    }

    async fn invoke_step(
        &self,
        state: &WorkflowExecution,
        step: &str,
        agent_id: &str,
    ) -> Result<Value, EngineError> {
        let agent = self
            .registry
            .resolve(agent_id)
            .map_err(|_| EngineError::UnknownAgent {
                execution_id: state.execution_id.clone(),
                step: step.to_string(),
                agent_id: agent_id.to_string(),
            })?;

        let input = state.context_value();
        let timeout = self.step_timeout;
        let result = self
            .breaker
            .call(agent_id, || async move {
                match tokio::time::timeout(timeout, agent.invoke(input)).await {
                    Ok(result) => result,
                    Err(_) => Err(AgentError::Timeout(timeout.as_millis() as u64)),
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(CircuitError::Open { retry_in, .. }) => Err(EngineError::CircuitOpen {
                execution_id: state.execution_id.clone(),
                step: step.to_string(),
                agent_id: agent_id.to_string(),
                retry_in,
            }),
            Err(CircuitError::Inner(AgentError::Timeout(_))) => Err(EngineError::StepTimeout {
                execution_id: state.execution_id.clone(),
                step: step.to_string(),
                agent_id: agent_id.to_string(),
                timeout,
            }),
            Err(CircuitError::Inner(source)) => Err(EngineError::AgentInvocation {
                execution_id: state.execution_id.clone(),
                step: step.to_string(),
                agent_id: agent_id.to_string(),
                source,
            }),
        }
    }

    async fn complete(
        &self,
        mut state: WorkflowExecution,
        started: Instant,
    ) -> Result<WorkflowOutcome, EngineError> {
        // Only reachable without a terminal checkpoint when trailing steps
        // were skipped as already completed.
        if state.status != ExecutionStatus::Completed {
            state.status = ExecutionStatus::Completed;
            state.updated_at = Utc::now();
            self.persist(&mut state, None).await?;
        }

        let elapsed = started.elapsed();
        self.emit(
            &state,
            WorkflowEventKind::WorkflowCompleted,
            json!({
                "duration_ms": elapsed.as_millis() as u64,
                "completed_steps": state.completed_steps,
                "agent_results": state.agent_results,
            }),
        )
        .await;

        tracing::info!(
            execution_id = %state.execution_id,
            workflow = %state.workflow_id,
            steps = state.completed_steps.len(),
            version = state.version,
            duration_ms = elapsed.as_millis() as u64,
            "workflow completed"
        );
        Ok(WorkflowOutcome::from_state(&state, elapsed))
    }

    /// Persist a failed checkpoint and announce the failure. Returns the
    /// error to surface: the checkpoint error if the write failed, else `err`.
    async fn fail(&self, mut state: WorkflowExecution, step: &str, err: EngineError) -> EngineError {
        state.mark_failed(step, err.to_string());
        if let Err(store_err) = self.persist(&mut state, Some(step)).await {
            tracing::error!(
                execution_id = %state.execution_id,
                step,
                error = %err,
                checkpoint_error = %store_err,
                "failed to persist failure checkpoint"
            );
            self.announce_failure(&state, step, &store_err).await;
            return store_err;
        }
        self.announce_failure(&state, step, &err).await;
        err
    }

    async fn announce_failure(&self, state: &WorkflowExecution, step: &str, err: &EngineError) {
        tracing::error!(
            execution_id = %state.execution_id,
            workflow = %state.workflow_id,
            step,
            version = state.version,
            error = %err,
            "workflow failed"
        );
        self.emit(
            state,
            WorkflowEventKind::WorkflowFailed,
            json!({ "error": err.to_string(), "step": step }),
        )
        .await;
    }

    /// Save `state` and adopt the assigned version. `step` is the step whose
    /// outcome is being recorded, attached to storage errors.
    async fn persist(
        &self,
        state: &mut WorkflowExecution,
        step: Option<&str>,
    ) -> Result<u32, EngineError> {
        let execution_id = state.execution_id.clone();
        let version = self
            .store
            .save(&execution_id, state)
            .await
            .map_err(|e| store_error(&execution_id, step, e))?;
        state.version = version;

        tracing::debug!(
            execution_id = %execution_id,
            version,
            status = %state.status,
            step = ?state.current_step,
            "checkpoint saved"
        );
        Ok(version)
    }

    async fn emit(&self, state: &WorkflowExecution, kind: WorkflowEventKind, payload: Value) {
        let message =
            BusMessage::lifecycle(&state.execution_id, &state.workflow_id, kind, payload.clone());
        self.bus.publish_result(message).await;

        let event = WorkflowEvent::new(&state.execution_id, kind, payload);
        if let Err(e) = self.store.record_event(&event).await {
            tracing::warn!(
                execution_id = %state.execution_id,
                event_type = %kind,
                error = %e,
                "failed to record workflow event"
            );
        }
    }
}
