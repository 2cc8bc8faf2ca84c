//! Router - public API
//!
//! Accepts single and fan-out calls, enqueues them on the target agents'
//! pools and waits for resolution. Also exposes stats, health and in-flight
//! views over the pools, and coordinates graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a2a_common::{
    AgentStats, CallOptions, CallOutcome, CircuitState, HealthReport, HealthStatus, InFlightCall, RequestContext,
};
use a2a_config::RouterSettings;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::RouterError;
use crate::pending::{Completion, PendingCall};
use crate::pool::AgentPool;
use crate::queue::{deadline_after, Request};
use crate::registry::{AgentHandler, AgentOptions, AgentRegistry};
use crate::retry::RetryPolicy;
use crate::telemetry::{TelemetryEvent, TelemetrySink, TracingTelemetry};
use crate::Result;

/// Queue fill level at which an agent is reported unhealthy
const QUEUE_WARNING_RATIO: f64 = 0.8;
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of one agent call
#[derive(Debug)]
pub struct AgentResult {
    pub agent_name: String,
    pub result: std::result::Result<Value, RouterError>,
    pub latency_ms: f64,
    /// Handler invocations made for the call
    pub attempts: u32,
}

impl AgentResult {
    fn rejected(agent: &str, error: RouterError) -> Self {
        Self {
            agent_name: agent.to_string(),
            result: Err(error),
            latency_ms: 0.0,
            attempts: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn value(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&RouterError> {
        self.result.as_ref().err()
    }

    pub fn into_result(self) -> Result<Value> {
        self.result
    }
}

pub struct RouterBuilder {
    settings: RouterSettings,
    telemetry: Arc<dyn TelemetrySink>,
    retry: RetryPolicy,
    registry: AgentRegistry,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::from_settings(RouterSettings::default())
    }

    pub fn from_settings(settings: RouterSettings) -> Self {
        let retry = RetryPolicy::from(&settings.retry);
        Self {
            settings,
            telemetry: Arc::new(TracingTelemetry),
            retry,
            registry: AgentRegistry::new(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register an agent with explicit concurrency and timeout; everything
    /// else comes from the settings for `name`
    pub fn register_agent(
        &mut self,
        name: &str,
        handler: Arc<dyn AgentHandler>,
        max_concurrency: u32,
        timeout: Duration,
    ) -> Result<()> {
        let mut options = AgentOptions::from(self.settings.resolve_agent(name));
        options.max_concurrency = max_concurrency;
        options.timeout = timeout;
        self.registry.register(name, handler, options)
    }

    pub fn register_agent_with(&mut self, name: &str, handler: Arc<dyn AgentHandler>, options: AgentOptions) -> Result<()> {
        self.registry.register(name, handler, options)
    }

    /// Register an agent using only its configured settings
    pub fn register_configured(&mut self, name: &str, handler: Arc<dyn AgentHandler>) -> Result<()> {
        let options = AgentOptions::from(self.settings.resolve_agent(name));
        self.registry.register(name, handler, options)
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// Build the pools and spawn their dispatch loops. Must run inside a Tokio runtime.
    pub fn start(self) -> Router {
        let mut pools = IndexMap::with_capacity(self.registry.len());
        let mut loops = Vec::with_capacity(self.registry.len());

        for entry in self.registry.entries() {
            let pool = Arc::new(AgentPool::new(Arc::clone(entry), self.retry.clone(), Arc::clone(&self.telemetry)));
            if let Some(handle) = pool.start() {
                loops.push(handle);
            }
            pools.insert(entry.name.clone(), pool);
        }

        info!(agents = pools.len(), "Router started");

        Router {
            inner: Arc::new(RouterInner {
                pools,
                telemetry: self.telemetry,
                in_flight: DashMap::new(),
                shutting_down: AtomicBool::new(false),
                loops: Mutex::new(loops),
                settings: self.settings,
            }),
        }
    }
}

struct RouterInner {
    pools: IndexMap<String, Arc<AgentPool>>,
    telemetry: Arc<dyn TelemetrySink>,
    in_flight: DashMap<Uuid, Arc<PendingCall>>,
    shutting_down: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
    settings: RouterSettings,
}

impl RouterInner {
    fn emit_completed(&self, pending: &PendingCall, attempts: u32, outcome: CallOutcome, latency_ms: f64) {
        self.telemetry.emit(TelemetryEvent::CallCompleted {
            call_id: pending.id(),
            agent: pending.agent().to_string(),
            priority: pending.priority(),
            attempts,
            outcome,
            latency_ms,
        });
    }
}

/// Handle to one submitted call.
///
/// Dropping an unfinished handle abandons the call.
pub struct CallHandle {
    pending: Arc<PendingCall>,
    receiver: oneshot::Receiver<Completion>,
    deadline: Instant,
    inner: Arc<RouterInner>,
    finished: bool,
}

impl CallHandle {
    pub fn id(&self) -> Uuid {
        self.pending.id()
    }

    pub fn agent(&self) -> &str {
        self.pending.agent()
    }

    /// Wait for the result or the call deadline, whichever comes first
    pub async fn wait(mut self) -> AgentResult {
        let waited = tokio::time::timeout_at(self.deadline, &mut self.receiver).await;
        let completion = match waited {
            Ok(Ok(completion)) => completion,
            Ok(Err(_)) => self.cancelled(),
            Err(_) => {
                if self.pending.abandon() {
                    debug!(agent = %self.pending.agent(), call_id = %self.pending.id(), "Call timed out awaiting result");
                    Completion {
                        result: Err(RouterError::Timeout {
                            agent: self.pending.agent().to_string(),
                            elapsed: self.pending.started_at().elapsed(),
                        }),
                        attempts: 0,
                    }
                } else {
                    self.take_resolved()
                }
            }
        };
        self.finish(completion)
    }

    /// Abandon the call. A result already written is returned instead.
    pub fn cancel(mut self) -> AgentResult {
        let completion = if self.pending.abandon() {
            self.cancelled()
        } else {
            self.take_resolved()
        };
        self.finish(completion)
    }

    fn cancelled(&self) -> Completion {
        Completion {
            result: Err(RouterError::Cancelled {
                agent: self.pending.agent().to_string(),
            }),
            attempts: 0,
        }
    }

    fn take_resolved(&mut self) -> Completion {
        match self.receiver.try_recv() {
            Ok(completion) => completion,
            Err(_) => self.cancelled(),
        }
    }

    fn finish(&mut self, completion: Completion) -> AgentResult {
        self.finished = true;
        let latency_ms = self.pending.started_at().elapsed().as_secs_f64() * 1000.0;
        let outcome = match &completion.result {
            Ok(_) => CallOutcome::Success,
            Err(err) => err.outcome(),
        };
        self.inner
            .emit_completed(&self.pending, completion.attempts, outcome, latency_ms);

        AgentResult {
            agent_name: self.pending.agent().to_string(),
            result: completion.result,
            latency_ms,
            attempts: completion.attempts,
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.pending.id());
        if !self.finished && self.pending.abandon() {
            let latency_ms = self.pending.started_at().elapsed().as_secs_f64() * 1000.0;
            self.inner
                .emit_completed(&self.pending, 0, CallOutcome::Cancelled, latency_ms);
        }
    }
}

/// In-process agent router. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Enqueue one call and return a handle to await or cancel it
    pub fn submit(
        &self,
        agent: &str,
        payload: Arc<Value>,
        context: Arc<RequestContext>,
        options: &CallOptions,
    ) -> Result<CallHandle> {
        if self.is_shutting_down() {
            return Err(RouterError::ShutdownInProgress);
        }

        let pool = self
            .inner
            .pools
            .get(agent)
            .ok_or_else(|| RouterError::UnknownAgent { agent: agent.to_string() })?;

        let depth = pool.queue().len();
        let high_water = pool.options().queue_high_water;
        if depth >= high_water {
            let call_id = Uuid::new_v4();
            debug!(agent = %agent, depth, high_water, "Queue full, rejecting call");
            self.inner.telemetry.emit(TelemetryEvent::CallStarted {
                call_id,
                agent: agent.to_string(),
                priority: options.priority,
                attempt: 0,
            });
            self.inner.telemetry.emit(TelemetryEvent::CallCompleted {
                call_id,
                agent: agent.to_string(),
                priority: options.priority,
                attempts: 0,
                outcome: CallOutcome::QueueFull,
                latency_ms: 0.0,
            });
            return Err(RouterError::QueueFull {
                agent: agent.to_string(),
                depth,
                high_water,
            });
        }

        let deadline = deadline_after(Instant::now(), options.timeout);
        let max_retries = options.max_retries.unwrap_or(pool.options().max_retries);
        let (request, receiver) = Request::new(agent, payload, context, options.priority, deadline, max_retries);
        let pending = Arc::clone(request.pending());

        self.inner.telemetry.emit(TelemetryEvent::CallStarted {
            call_id: pending.id(),
            agent: agent.to_string(),
            priority: options.priority,
            attempt: 0,
        });
        self.inner.in_flight.insert(pending.id(), Arc::clone(&pending));

        let handle = CallHandle {
            pending,
            receiver,
            deadline,
            inner: Arc::clone(&self.inner),
            finished: false,
        };

        if pool.queue().push(request).is_err() {
            // Handle drop clears the in-flight entry
            drop(handle);
            return Err(RouterError::ShutdownInProgress);
        }
        Ok(handle)
    }

    /// Call one agent and wait for its result
    pub async fn call_agent(
        &self,
        agent: &str,
        payload: Value,
        context: RequestContext,
        options: CallOptions,
    ) -> Result<Value> {
        let handle = self.submit(agent, Arc::new(payload), Arc::new(context), &options)?;
        handle.wait().await.into_result()
    }

    /// Call one agent and keep latency and attempt details
    pub async fn call_agent_detailed(
        &self,
        agent: &str,
        payload: Value,
        context: RequestContext,
        options: CallOptions,
    ) -> AgentResult {
        match self.submit(agent, Arc::new(payload), Arc::new(context), &options) {
            Ok(handle) => handle.wait().await,
            Err(err) => AgentResult::rejected(agent, err),
        }
    }

    /// Fan a call out to several agents and wait for all of them.
    ///
    /// The map has one entry per distinct requested name, in request order.
    /// Per-agent failures are reported inside the entries.
    pub async fn call_multiple_agents<I, S>(
        &self,
        agents: I,
        payload: Value,
        context: RequestContext,
        options: CallOptions,
    ) -> IndexMap<String, AgentResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let payload = Arc::new(payload);
        let context = Arc::new(context);

        let mut slots: IndexMap<String, Option<AgentResult>> = IndexMap::new();
        let mut handles = Vec::new();

        for agent in agents {
            let agent = agent.as_ref();
            if slots.contains_key(agent) {
                continue;
            }
            match self.submit(agent, Arc::clone(&payload), Arc::clone(&context), &options) {
                Ok(handle) => {
                    slots.insert(agent.to_string(), None);
                    handles.push(handle);
                }
                Err(err) => {
                    slots.insert(agent.to_string(), Some(AgentResult::rejected(agent, err)));
                }
            }
        }

        for result in join_all(handles.into_iter().map(CallHandle::wait)).await {
            if let Some(slot) = slots.get_mut(&result.agent_name) {
                *slot = Some(result);
            }
        }

        slots
            .into_iter()
            .filter_map(|(agent, result)| result.map(|result| (agent, result)))
            .collect()
    }

    pub fn agents(&self) -> Vec<String> {
        self.inner.pools.keys().cloned().collect()
    }

    pub fn has_agent(&self, agent: &str) -> bool {
        self.inner.pools.contains_key(agent)
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.inner.settings
    }

    pub fn agent_stats(&self) -> Vec<AgentStats> {
        self.inner.pools.values().map(|pool| pool.get_stats()).collect()
    }

    pub fn agent_stats_for(&self, agent: &str) -> Option<AgentStats> {
        self.inner.pools.get(agent).map(|pool| pool.get_stats())
    }

    pub fn circuit_breakers(&self) -> Vec<CircuitBreakerStats> {
        self.inner
            .pools
            .values()
            .map(|pool| pool.breaker().snapshot())
            .collect()
    }

    pub fn health_report(&self) -> HealthReport {
        let stats = self.agent_stats();
        let mut issues = Vec::new();
        let mut unhealthy = 0u32;
        let mut open_circuits = 0u32;

        for agent in &stats {
            let mut healthy = true;

            if agent.circuit_state != CircuitState::Closed {
                healthy = false;
                if agent.circuit_state == CircuitState::Open {
                    open_circuits += 1;
                }
                issues.push(format!("Agent {} circuit breaker is {}", agent.agent, agent.circuit_state));
            }

            let utilization = agent.queue_utilization();
            if utilization >= QUEUE_WARNING_RATIO {
                healthy = false;
                issues.push(format!(
                    "Agent {} queue at {:.0}% of high water mark ({}/{})",
                    agent.agent,
                    utilization * 100.0,
                    agent.queue_depth,
                    agent.queue_high_water
                ));
            }

            if !healthy {
                unhealthy += 1;
            }
        }

        let total = stats.len() as u32;
        let status = if unhealthy == 0 {
            HealthStatus::Healthy
        } else if unhealthy * 2 >= total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Warning
        };

        HealthReport {
            status,
            agents_total: total,
            agents_healthy: total - unhealthy,
            agents_unhealthy: unhealthy,
            open_circuits,
            issues,
            generated_at: Utc::now(),
        }
    }

    /// Calls awaiting resolution, oldest first
    pub fn in_flight_calls(&self, limit: usize, agent_filter: Option<&str>) -> Vec<InFlightCall> {
        let mut calls: Vec<InFlightCall> = self
            .inner
            .in_flight
            .iter()
            .filter(|entry| agent_filter.map_or(true, |agent| entry.value().agent() == agent))
            .map(|entry| entry.value().to_in_flight())
            .collect();

        calls.sort_by(|a, b| b.elapsed_ms.cmp(&a.elapsed_ms));
        calls.truncate(limit);
        calls
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop admission, fail queued calls and wait up to `grace` for running
    /// handlers. Returns true if every pool drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return true;
        }
        info!(grace_ms = grace.as_millis() as u64, "Router shutting down");

        let failed: usize = self.inner.pools.values().map(|pool| pool.shutdown()).sum();
        if failed > 0 {
            info!(failed, "Failed queued calls on shutdown");
        }

        let loops = std::mem::take(&mut *self.inner.loops.lock());
        for handle in loops {
            let _ = handle.await;
        }

        let deadline = deadline_after(Instant::now(), grace);
        loop {
            if self.inner.pools.values().all(|pool| pool.is_fully_drained()) {
                info!("Router shutdown complete");
                return true;
            }
            if Instant::now() >= deadline {
                let active: u32 = self.inner.pools.values().map(|pool| pool.active_workers()).sum();
                warn!(active_handlers = active, "Shutdown grace period elapsed with handlers still running");
                return false;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}
