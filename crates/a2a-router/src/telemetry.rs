//! Telemetry hooks
//!
//! The router reports every call, attempt, retry, expiry and breaker
//! transition through a [`TelemetrySink`]. Storage and export belong to the
//! sink; the router only emits.

use a2a_common::{CallOutcome, CircuitState, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A call was accepted and enqueued
    CallStarted {
        call_id: Uuid,
        agent: String,
        priority: Priority,
        /// Always 0; retries are reported as `RequestRetried`
        attempt: u32,
    },
    /// The caller observed a terminal result
    CallCompleted {
        call_id: Uuid,
        agent: String,
        priority: Priority,
        /// Handler invocations made for the call
        attempts: u32,
        outcome: CallOutcome,
        latency_ms: f64,
    },
    /// One dispatch of a request finished, whether or not the caller still waits
    AttemptCompleted {
        call_id: Uuid,
        agent: String,
        priority: Priority,
        attempt: u32,
        outcome: CallOutcome,
        latency_ms: f64,
        abandoned: bool,
    },
    RequestRetried {
        call_id: Uuid,
        agent: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// A queued request passed its deadline before dispatch
    RequestExpired {
        call_id: Uuid,
        agent: String,
        priority: Priority,
        queued_ms: f64,
    },
    #[serde(rename = "circuit_breaker_state_changed")]
    CircuitStateChanged {
        agent: String,
        from: CircuitState,
        to: CircuitState,
    },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::CallStarted { .. } => "call_started",
            TelemetryEvent::CallCompleted { .. } => "call_completed",
            TelemetryEvent::AttemptCompleted { .. } => "attempt_completed",
            TelemetryEvent::RequestRetried { .. } => "request_retried",
            TelemetryEvent::RequestExpired { .. } => "request_expired",
            TelemetryEvent::CircuitStateChanged { .. } => "circuit_breaker_state_changed",
        }
    }

    pub fn agent(&self) -> &str {
        match self {
            TelemetryEvent::CallStarted { agent, .. }
            | TelemetryEvent::CallCompleted { agent, .. }
            | TelemetryEvent::AttemptCompleted { agent, .. }
            | TelemetryEvent::RequestRetried { agent, .. }
            | TelemetryEvent::RequestExpired { agent, .. }
            | TelemetryEvent::CircuitStateChanged { agent, .. } => agent,
        }
    }
}

/// Receives telemetry from the router. Must be cheap and must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

/// Default sink: structured logs plus `metrics` counters and histograms
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::CallStarted { call_id, agent, priority, attempt } => {
                debug!(call_id = %call_id, agent = %agent, priority = %priority, attempt, "Call started");
                metrics::counter!("a2a_calls_started_total", "agent" => agent).increment(1);
            }
            TelemetryEvent::CallCompleted { call_id, agent, priority, attempts, outcome, latency_ms } => {
                debug!(
                    call_id = %call_id,
                    agent = %agent,
                    priority = %priority,
                    attempts = attempts,
                    outcome = %outcome,
                    latency_ms = latency_ms,
                    "Call completed"
                );
                metrics::counter!(
                    "a2a_calls_total",
                    "agent" => agent.clone(),
                    "outcome" => outcome.as_str()
                )
                .increment(1);
                metrics::histogram!("a2a_call_latency_ms", "agent" => agent).record(latency_ms);
            }
            TelemetryEvent::AttemptCompleted { call_id, agent, attempt, outcome, latency_ms, abandoned, .. } => {
                debug!(
                    call_id = %call_id,
                    agent = %agent,
                    attempt = attempt,
                    outcome = %outcome,
                    latency_ms = latency_ms,
                    abandoned = abandoned,
                    "Attempt completed"
                );
                metrics::counter!(
                    "a2a_attempts_total",
                    "agent" => agent.clone(),
                    "outcome" => outcome.as_str()
                )
                .increment(1);
                metrics::histogram!("a2a_attempt_latency_ms", "agent" => agent).record(latency_ms);
            }
            TelemetryEvent::RequestRetried { call_id, agent, attempt, delay_ms } => {
                debug!(call_id = %call_id, agent = %agent, attempt = attempt, delay_ms = delay_ms, "Request retried");
                metrics::counter!("a2a_retries_total", "agent" => agent).increment(1);
            }
            TelemetryEvent::RequestExpired { call_id, agent, priority, queued_ms } => {
                debug!(
                    call_id = %call_id,
                    agent = %agent,
                    priority = %priority,
                    queued_ms = queued_ms,
                    "Request expired in queue"
                );
                metrics::counter!("a2a_requests_expired_total", "agent" => agent).increment(1);
            }
            TelemetryEvent::CircuitStateChanged { agent, from, to } => {
                debug!(agent = %agent, from = %from, to = %to, "Circuit transition recorded");
                metrics::counter!(
                    "a2a_circuit_transitions_total",
                    "agent" => agent.clone(),
                    "to" => to.as_str()
                )
                .increment(1);
                let open = if to == CircuitState::Closed { 0.0 } else { 1.0 };
                metrics::gauge!("a2a_circuit_open", "agent" => agent).set(open);
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn count_for(&self, name: &str, agent: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name && e.agent() == agent)
            .count()
    }

    /// Breaker transitions observed for `agent`, oldest first
    pub fn circuit_transitions(&self, agent: &str) -> Vec<(CircuitState, CircuitState)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::CircuitStateChanged { agent: a, from, to } if a == agent => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    /// Outcomes of completed calls for `agent`, oldest first
    pub fn call_outcomes(&self, agent: &str) -> Vec<CallOutcome> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TelemetryEvent::CallCompleted { agent: a, outcome, .. } if a == agent => Some(*outcome),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}
