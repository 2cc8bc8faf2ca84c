//! AgentPool - per-agent dispatcher
//!
//! One dispatch loop per agent pulls from the agent's priority queue under a
//! semaphore sized to `max_concurrency`. Each handler invocation runs in its
//! own task that owns the permit, so a handler that overruns its timeout keeps
//! its slot until it actually returns.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a2a_common::{AgentStats, CallOutcome};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, CircuitBreaker};
use crate::error::{classify, ErrorKind, RouterError};
use crate::queue::{deadline_after, PriorityQueue, Request};
use crate::registry::{AgentEntry, AgentOptions};
use crate::retry::RetryPolicy;
use crate::telemetry::{TelemetryEvent, TelemetrySink};

#[derive(Debug, Default)]
struct PoolCounters {
    active_workers: AtomicU32,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

/// Counts a running handler for as long as it lives, panics included
struct ActiveGuard(Arc<PoolCounters>);

impl ActiveGuard {
    fn new(counters: Arc<PoolCounters>) -> Self {
        counters.active_workers.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

enum AttemptFailure {
    Handler(anyhow::Error),
    Panicked(JoinError),
    TimedOut,
}

impl AttemptFailure {
    fn kind(&self) -> ErrorKind {
        match self {
            AttemptFailure::Handler(err) => classify(err),
            AttemptFailure::Panicked(_) => ErrorKind::Fatal,
            AttemptFailure::TimedOut => ErrorKind::Transient,
        }
    }

    fn outcome(&self) -> CallOutcome {
        match self {
            AttemptFailure::TimedOut => CallOutcome::Timeout,
            _ => CallOutcome::Error,
        }
    }

    fn into_error(self, agent: &str, kind: ErrorKind, attempts: u32, elapsed: Duration) -> RouterError {
        let agent = agent.to_string();
        match self {
            AttemptFailure::TimedOut => RouterError::Timeout { agent, elapsed },
            AttemptFailure::Handler(err) if kind == ErrorKind::Transient => RouterError::HandlerTransient {
                agent,
                attempts,
                source: err.into(),
            },
            AttemptFailure::Handler(err) => RouterError::HandlerFatal {
                agent,
                source: err.into(),
            },
            AttemptFailure::Panicked(err) => RouterError::HandlerFatal {
                agent,
                source: anyhow::anyhow!("handler panicked: {err}").into(),
            },
        }
    }
}

/// Dispatcher for a single agent
pub struct AgentPool {
    entry: Arc<AgentEntry>,
    queue: Arc<PriorityQueue>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    telemetry: Arc<dyn TelemetrySink>,

    /// Handler concurrency bound
    semaphore: Arc<Semaphore>,

    running: AtomicBool,
    counters: Arc<PoolCounters>,
}

impl AgentPool {
    pub fn new(entry: Arc<AgentEntry>, retry: RetryPolicy, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let options = &entry.options;
        let queue = Arc::new(PriorityQueue::new(entry.name.clone(), telemetry.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            entry.name.clone(),
            options.circuit_breaker.clone(),
            telemetry.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(options.max_concurrency as usize));

        Self {
            entry,
            queue,
            breaker,
            retry,
            telemetry,
            semaphore,
            running: AtomicBool::new(false),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Spawn the dispatch loop. Returns `None` if it is already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }

        info!(
            agent = %self.entry.name,
            max_concurrency = self.entry.options.max_concurrency,
            timeout_ms = self.entry.options.timeout.as_millis() as u64,
            "Starting agent pool"
        );

        let pool = Arc::clone(self);
        Some(tokio::spawn(async move { pool.run().await }))
    }

    async fn run(self: Arc<Self>) {
        loop {
            let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let request = match self.queue.pop_wait().await {
                Some(request) => request,
                None => break,
            };

            let pool = Arc::clone(&self);
            tokio::spawn(async move { pool.process(request, permit).await });
        }

        debug!(agent = %self.entry.name, "Dispatch loop exited");
    }

    async fn process(self: Arc<Self>, request: Request, permit: OwnedSemaphorePermit) {
        let agent = self.entry.name.as_str();
        let pending = Arc::clone(request.pending());

        if pending.is_done() {
            debug!(agent = %agent, call_id = %request.id, "Skipping abandoned request");
            return;
        }

        let now = Instant::now();
        if request.is_expired(now) {
            self.queue.expire(request, now);
            return;
        }

        let admission = match self.breaker.try_acquire() {
            Ok(admission) => admission,
            Err(retry_after) => {
                self.counters.rejected.fetch_add(1, Ordering::SeqCst);
                debug!(
                    agent = %agent,
                    call_id = %request.id,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Circuit open, rejecting request"
                );
                self.emit_attempt(&request, CallOutcome::CircuitOpen, Duration::ZERO);
                pending.resolve(
                    Err(RouterError::CircuitOpen {
                        agent: agent.to_string(),
                        retry_after,
                    }),
                    request.attempt,
                );
                return;
            }
        };

        let attempt_deadline = request.deadline.min(deadline_after(now, self.entry.options.timeout));
        let started = Instant::now();

        let handler = Arc::clone(&self.entry.handler);
        let payload = Arc::clone(&request.payload);
        let context = Arc::clone(&request.context);
        let counters = Arc::clone(&self.counters);
        let task = tokio::spawn(async move {
            let _permit = permit;
            let _active = ActiveGuard::new(counters);
            handler.handle(payload, context).await
        });

        // On timeout the task is detached, not aborted
        let outcome = match tokio::time::timeout_at(attempt_deadline, task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(AttemptFailure::Handler(err)),
            Ok(Err(join_err)) => Err(AttemptFailure::Panicked(join_err)),
            Err(_) => Err(AttemptFailure::TimedOut),
        };
        let latency = started.elapsed();

        let failure = match outcome {
            Ok(value) => {
                self.breaker.record_success(admission);
                self.counters.succeeded.fetch_add(1, Ordering::SeqCst);
                self.emit_attempt(&request, CallOutcome::Success, latency);
                if !pending.resolve(Ok(value), request.attempt + 1) {
                    debug!(agent = %agent, call_id = %request.id, "Discarded late completion");
                }
                return;
            }
            Err(failure) => failure,
        };

        let kind = failure.kind();
        self.emit_attempt(&request, failure.outcome(), latency);

        if kind.is_retryable() && request.attempt < request.max_retries && !pending.is_done() {
            let delay = self.retry.delay_for(request.attempt);
            if deadline_after(Instant::now(), delay) < request.deadline {
                // A failed probe re-opens the breaker even though the call goes on
                if admission == Admission::Trial {
                    self.breaker.record_failure(admission);
                }
                self.schedule_retry(request, delay).await;
                return;
            }
        }

        self.breaker.record_failure(admission);
        self.counters.failed.fetch_add(1, Ordering::SeqCst);

        let attempts = request.attempt + 1;
        let error = failure.into_error(agent, kind, attempts, pending.started_at().elapsed());
        warn!(
            agent = %agent,
            call_id = %request.id,
            attempts = attempts,
            error = %error,
            "Agent call failed"
        );
        if !pending.resolve(Err(error), attempts) {
            debug!(agent = %agent, call_id = %request.id, "Discarded late failure");
        }
    }

    async fn schedule_retry(&self, mut request: Request, delay: Duration) {
        request.attempt += 1;
        debug!(
            agent = %self.entry.name,
            call_id = %request.id,
            attempt = request.attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying after transient failure"
        );
        self.telemetry.emit(TelemetryEvent::RequestRetried {
            call_id: request.id,
            agent: self.entry.name.clone(),
            attempt: request.attempt,
            delay_ms: delay.as_millis() as u64,
        });

        tokio::time::sleep(delay).await;

        if let Err(request) = self.queue.push(request) {
            request
                .pending()
                .resolve(Err(RouterError::ShutdownInProgress), request.attempt);
        }
    }

    fn emit_attempt(&self, request: &Request, outcome: CallOutcome, latency: Duration) {
        self.telemetry.emit(TelemetryEvent::AttemptCompleted {
            call_id: request.id,
            agent: self.entry.name.clone(),
            priority: request.priority,
            attempt: request.attempt,
            outcome,
            latency_ms: latency.as_secs_f64() * 1000.0,
            abandoned: request.pending().is_abandoned(),
        });
    }

    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn options(&self) -> &AgentOptions {
        &self.entry.options
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.counters.active_workers.load(Ordering::SeqCst)
    }

    /// Stop dispatching and fail every queued request. Returns how many were failed.
    pub fn shutdown(&self) -> usize {
        info!(agent = %self.entry.name, "Shutting down agent pool");
        self.running.store(false, Ordering::SeqCst);
        self.semaphore.close();
        self.queue.close()
    }

    /// No handler running and nothing queued
    pub fn is_fully_drained(&self) -> bool {
        self.active_workers() == 0 && self.queue.is_empty()
    }

    pub fn get_stats(&self) -> AgentStats {
        AgentStats {
            agent: self.entry.name.clone(),
            max_concurrency: self.entry.options.max_concurrency,
            active_workers: self.active_workers(),
            available_permits: self.semaphore.available_permits() as u32,
            queue_depth: self.queue.len() as u32,
            queue_high_water: self.entry.options.queue_high_water as u32,
            circuit_state: self.breaker.state(),
            succeeded: self.counters.succeeded.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            expired: self.queue.expired_count(),
        }
    }
}
