//! Per-agent circuit breaker.
//!
//! Each agent id gets its own lazily-created state machine:
//!
//! - `Closed`: calls pass through; consecutive failures are counted and the
//!   breaker opens once the count reaches `failure_threshold`.
//! - `Open`: calls are rejected without reaching the agent until `cool_down`
//!   has elapsed since the breaker opened.
//! - `HalfOpen`: exactly one trial call is in flight. Success closes the
//!   breaker; failure (or dropping the trial) reopens it.
//!
//! Only the trial permit moves a breaker out of `HalfOpen`. Every trip and
//! reset bumps a generation; a call admitted under an earlier generation
//! that finishes late only updates the counters.
//!
//! State lives in a `DashMap` so different agents never contend. The lock for
//! one agent is held only while acquiring a permit or recording an outcome,
//! never across the agent call itself.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stepwise_types::circuit::{CircuitMode, CircuitStats};
use stepwise_types::config::CircuitBreakerConfig;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default consecutive failures before opening.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open breaker waits before allowing a trial call.
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(60);

/// Result of a breaker-wrapped call.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call; the agent was not invoked.
    #[error("circuit open for agent '{agent_id}' (retry in {retry_in:?})")]
    Open { agent_id: String, retry_in: Duration },

    /// The call went through and the wrapped operation failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Copy)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct AgentCircuit {
    state: CircuitState,
    consecutive_failures: u32,
    trial_in_flight: bool,
    generation: u64,
    total_calls: u64,
    total_failures: u64,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl AgentCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            trial_in_flight: false,
            generation: 0,
            total_calls: 0,
            total_failures: 0,
            last_failure_at: None,
            opened_at: None,
            last_error: None,
        }
    }

    fn mode(&self) -> CircuitMode {
        match self.state {
            CircuitState::Closed => CircuitMode::Closed,
            CircuitState::Open { .. } => CircuitMode::Open,
            CircuitState::HalfOpen => CircuitMode::HalfOpen,
        }
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open {
            opened_at: Instant::now(),
        };
        self.opened_at = Some(Utc::now());
        self.trial_in_flight = false;
        self.generation += 1;
    }
}

/// Failure-isolation state machines for every agent the engine has called.
///
/// Owned by (or injected into) one engine instance; never global, so engines
/// in different tests never share breaker state.
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: DashMap<String, AgentCircuit>,
    failure_threshold: u32,
    cool_down: Duration,
}

impl CircuitBreaker {
    /// Create a breaker. A threshold of 0 is treated as 1.
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            circuits: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
            cool_down,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cool_down())
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn cool_down(&self) -> Duration {
        self.cool_down
    }

    /// Run `f` under the breaker for `agent_id`.
    ///
    /// Returns `CircuitError::Open` without calling `f` when the breaker is
    /// open, or when it is half-open and another trial is already in flight.
    pub async fn call<F, Fut, T, E>(&self, agent_id: &str, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut permit = self.acquire(agent_id)?;
        let result = f().await;
        match &result {
            Ok(_) => permit.settle(None),
            Err(e) => permit.settle(Some(e.to_string())),
        }
        result.map_err(CircuitError::Inner)
    }

    fn acquire<E>(&self, agent_id: &str) -> Result<CallPermit<'_>, CircuitError<E>> {
        let mut circuit = self
            .circuits
            .entry(agent_id.to_string())
            .or_insert_with(AgentCircuit::new);

        let trial = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed < self.cool_down {
                    return Err(CircuitError::Open {
                        agent_id: agent_id.to_string(),
                        retry_in: self.cool_down - elapsed,
                    });
                }
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                info!(agent_id, "circuit half-open, allowing trial call");
                true
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    debug!(agent_id, "trial call already in flight, rejecting");
                    return Err(CircuitError::Open {
                        agent_id: agent_id.to_string(),
                        retry_in: Duration::ZERO,
                    });
                }
                circuit.trial_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            breaker: self,
            agent_id: agent_id.to_string(),
            generation: circuit.generation,
            trial,
            settled: false,
        })
    }

    fn record_success(&self, agent_id: &str, permit: Admission) {
        let Some(mut circuit) = self.circuits.get_mut(agent_id) else {
            return;
        };
        circuit.total_calls += 1;

        match circuit.state {
            CircuitState::HalfOpen if permit.is_current_trial(circuit.generation) => {
                circuit.state = CircuitState::Closed;
                circuit.consecutive_failures = 0;
                circuit.trial_in_flight = false;
                circuit.opened_at = None;
                info!(agent_id, "trial call succeeded, circuit closed");
            }
            CircuitState::Closed => {
                circuit.consecutive_failures = 0;
            }
            // Admitted before the breaker opened: not the trial.
            CircuitState::HalfOpen | CircuitState::Open { .. } => {
                debug!(agent_id, "late success ignored for circuit state");
            }
        }
    }

    fn record_failure(&self, agent_id: &str, error: String, permit: Admission) {
        let Some(mut circuit) = self.circuits.get_mut(agent_id) else {
            return;
        };
        circuit.total_calls += 1;
        circuit.total_failures += 1;
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        circuit.last_failure_at = Some(Utc::now());
        circuit.last_error = Some(error);

        match circuit.state {
            CircuitState::Closed => {
                if circuit.consecutive_failures >= self.failure_threshold {
                    circuit.trip();
                    warn!(
                        agent_id,
                        failures = circuit.consecutive_failures,
                        cool_down_secs = self.cool_down.as_secs_f64(),
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen if permit.is_current_trial(circuit.generation) => {
                circuit.trip();
                warn!(agent_id, "trial call failed, circuit reopened");
            }
            CircuitState::HalfOpen | CircuitState::Open { .. } => {
                debug!(agent_id, "late failure ignored for circuit state");
            }
        }
    }

    /// Current mode for one agent (`Closed` if never called).
    pub fn mode(&self, agent_id: &str) -> CircuitMode {
        self.circuits
            .get(agent_id)
            .map(|c| c.mode())
            .unwrap_or(CircuitMode::Closed)
    }

    /// Snapshot of one agent's breaker.
    pub fn stats_for(&self, agent_id: &str) -> Option<CircuitStats> {
        self.circuits
            .get(agent_id)
            .map(|c| self.snapshot(agent_id, &c))
    }

    /// Snapshot of every known breaker, sorted by agent id.
    pub fn stats(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> = self
            .circuits
            .iter()
            .map(|entry| self.snapshot(entry.key(), entry.value()))
            .collect();
        stats.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        stats
    }

    /// Agent ids whose breaker is currently open.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuits
            .iter()
            .filter(|entry| matches!(entry.state, CircuitState::Open { .. }))
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }

    /// Force an agent's breaker back to closed. Returns false if the agent
    /// has never been called.
    pub fn reset(&self, agent_id: &str) -> bool {
        let Some(mut circuit) = self.circuits.get_mut(agent_id) else {
            return false;
        };
        circuit.state = CircuitState::Closed;
        circuit.consecutive_failures = 0;
        circuit.trial_in_flight = false;
        circuit.opened_at = None;
        circuit.generation += 1;
        info!(agent_id, "circuit manually reset");
        true
    }

    fn snapshot(&self, agent_id: &str, circuit: &AgentCircuit) -> CircuitStats {
        let retry_after = match circuit.state {
            CircuitState::Open { .. } => circuit
                .opened_at
                .and_then(|at| chrono::Duration::from_std(self.cool_down).ok().map(|d| at + d)),
            _ => None,
        };
        CircuitStats {
            agent_id: agent_id.to_string(),
            mode: circuit.mode(),
            consecutive_failures: circuit.consecutive_failures,
            total_calls: circuit.total_calls,
            total_failures: circuit.total_failures,
            last_failure_at: circuit.last_failure_at,
            opened_at: circuit.opened_at,
            retry_after,
            last_error: circuit.last_error.clone(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOL_DOWN)
    }
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

impl Admission {
    fn is_current_trial(&self, generation: u64) -> bool {
        self.trial && self.generation == generation
    }
}

/// Admission ticket for one call. A trial permit dropped without an outcome
/// (the caller's future was cancelled) reopens the breaker.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    agent_id: String,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn admission(&self) -> Admission {
        Admission {
            generation: self.generation,
            trial: self.trial,
        }
    }

    fn settle(&mut self, error: Option<String>) {
        self.settled = true;
        let admission = self.admission();
        match error {
            None => self.breaker.record_success(&self.agent_id, admission),
            Some(e) => self.breaker.record_failure(&self.agent_id, e, admission),
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            let admission = self.admission();
            self.breaker
                .record_failure(&self.agent_id, "trial call abandoned".to_string(), admission);
        }
    }
}
