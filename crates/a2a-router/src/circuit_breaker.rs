//! Per-agent circuit breaker
//!
//! CLOSED counts consecutive failures inside a trailing window and trips to
//! OPEN at the threshold. OPEN rejects until `reset_timeout` has passed since
//! the trip, then admits trial calls as HALF_OPEN. A successful trial closes
//! the breaker; a failed trial re-opens it and restarts the cooldown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use a2a_common::CircuitState;
use a2a_config::CircuitBreakerSettings;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::telemetry::{TelemetryEvent, TelemetrySink};

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Failures older than this are forgotten; `None` keeps them until a success
    pub failure_window: Option<Duration>,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&CircuitBreakerSettings::default())
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            reset_timeout: settings.reset_timeout(),
            failure_window: settings.failure_window(),
            half_open_max_calls: settings.half_open_max_calls.max(1),
        }
    }
}

/// How a call was let through the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// A HALF_OPEN probe; its outcome decides the next state
    Trial,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub agent: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub since_transition_ms: u64,
    /// Time until a trial is admitted, while OPEN
    pub retry_after_ms: Option<u64>,
}

struct BreakerState {
    state: CircuitState,
    failures: VecDeque<Instant>,
    last_transition_at: Instant,
    trials_in_flight: u32,
}

impl BreakerState {
    fn prune(&mut self, now: Instant, window: Option<Duration>) {
        if let Some(window) = window {
            while let Some(oldest) = self.failures.front() {
                if now.saturating_duration_since(*oldest) > window {
                    self.failures.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.last_transition_at = now;
        self.trials_in_flight = 0;
        if to != CircuitState::Open {
            self.failures.clear();
        }
        (from, to)
    }
}

pub struct CircuitBreaker {
    agent: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBreaker {
    pub fn new(agent: impl Into<String>, config: CircuitBreakerConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            agent: agent.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                last_transition_at: Instant::now(),
                trials_in_flight: 0,
            }),
            telemetry,
        }
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Ask to let one call through.
    ///
    /// Returns the admission kind, or the time left until a trial may run.
    /// An OPEN breaker whose cooldown has elapsed moves to HALF_OPEN here.
    pub fn try_acquire(&self) -> Result<Admission, Duration> {
        let now = Instant::now();
        let mut changed = None;

        let decision = {
            let mut inner = self.state.lock();
            match inner.state {
                CircuitState::Closed => Ok(Admission::Normal),
                CircuitState::Open => {
                    let elapsed = now.saturating_duration_since(inner.last_transition_at);
                    if elapsed >= self.config.reset_timeout {
                        changed = Some(inner.transition(CircuitState::HalfOpen, now));
                        inner.trials_in_flight = 1;
                        Ok(Admission::Trial)
                    } else {
                        Err(self.config.reset_timeout - elapsed)
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trials_in_flight < self.config.half_open_max_calls {
                        inner.trials_in_flight += 1;
                        Ok(Admission::Trial)
                    } else {
                        // Trial already running, its outcome is not known yet
                        Err(Duration::ZERO)
                    }
                }
            }
        };

        if let Some((from, to)) = changed {
            self.announce(from, to);
        }
        decision
    }

    pub fn record_success(&self, admission: Admission) {
        let now = Instant::now();
        let mut changed = None;
        {
            let mut inner = self.state.lock();
            match inner.state {
                CircuitState::Closed => inner.failures.clear(),
                CircuitState::HalfOpen if admission == Admission::Trial => {
                    changed = Some(inner.transition(CircuitState::Closed, now));
                }
                // Calls admitted before the trip do not close the breaker
                CircuitState::HalfOpen | CircuitState::Open => {}
            }
        }
        if let Some((from, to)) = changed {
            self.announce(from, to);
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let now = Instant::now();
        let mut changed = None;
        {
            let mut inner = self.state.lock();
            match inner.state {
                CircuitState::Closed => {
                    inner.failures.push_back(now);
                    inner.prune(now, self.config.failure_window);
                    if inner.failures.len() as u32 >= self.config.failure_threshold {
                        changed = Some(inner.transition(CircuitState::Open, now));
                    }
                }
                CircuitState::HalfOpen if admission == Admission::Trial => {
                    changed = Some(inner.transition(CircuitState::Open, now));
                }
                CircuitState::HalfOpen | CircuitState::Open => {}
            }
        }
        if let Some((from, to)) = changed {
            self.announce(from, to);
        }
    }

    pub fn snapshot(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let inner = self.state.lock();
        let since = now.saturating_duration_since(inner.last_transition_at);

        let failure_count = match self.config.failure_window {
            Some(window) => inner
                .failures
                .iter()
                .filter(|at| now.saturating_duration_since(**at) <= window)
                .count() as u32,
            None => inner.failures.len() as u32,
        };
        let retry_after_ms = (inner.state == CircuitState::Open)
            .then(|| self.config.reset_timeout.saturating_sub(since).as_millis() as u64);

        CircuitBreakerStats {
            agent: self.agent.clone(),
            state: inner.state,
            failure_count,
            since_transition_ms: since.as_millis() as u64,
            retry_after_ms,
        }
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                agent = %self.agent,
                from = %from,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(agent = %self.agent, from = %from, "Circuit breaker half-open, admitting trial"),
            CircuitState::Closed => info!(agent = %self.agent, from = %from, "Circuit breaker closed"),
        }
        self.telemetry.emit(TelemetryEvent::CircuitStateChanged {
            agent: self.agent.clone(),
            from,
            to,
        });
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("agent", &self.agent)
            .field("state", &self.state())
            .finish()
    }
}
