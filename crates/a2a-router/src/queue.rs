//! Per-agent priority queue
//!
//! Min-heap on `(priority, enqueued_at, seq)`. Expired entries are dropped
//! lazily on pop and resolved with a timeout so they never block live ones.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a2a_common::{Priority, RequestContext};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::RouterError;
use crate::pending::{Completion, PendingCall};
use crate::telemetry::{TelemetryEvent, TelemetrySink};

/// Stand-in for an unbounded timeout, the same horizon tokio uses for `sleep`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `now + timeout`, saturating to a far-future instant instead of overflowing
pub fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// One dispatch request for one agent
#[derive(Debug)]
pub struct Request {
    pub id: Uuid,
    pub target_agent: String,
    pub payload: Arc<Value>,
    pub context: Arc<RequestContext>,
    pub priority: Priority,
    /// Stamped by the queue on every push
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub attempt: u32,
    pub max_retries: u32,
    seq: u64,
    pending: Arc<PendingCall>,
}

impl Request {
    pub fn new(
        target_agent: impl Into<String>,
        payload: Arc<Value>,
        context: Arc<RequestContext>,
        priority: Priority,
        deadline: Instant,
        max_retries: u32,
    ) -> (Self, oneshot::Receiver<Completion>) {
        let id = Uuid::new_v4();
        let target_agent = target_agent.into();
        let (pending, rx) = PendingCall::new(id, target_agent.clone(), priority);

        let request = Self {
            id,
            target_agent,
            payload,
            context,
            priority,
            enqueued_at: Instant::now(),
            deadline,
            attempt: 0,
            max_retries,
            seq: 0,
            pending,
        };
        (request, rx)
    }

    pub fn pending(&self) -> &Arc<PendingCall> {
        &self.pending
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }

    fn key(&self) -> (Priority, Instant, u64) {
        (self.priority, self.enqueued_at, self.seq)
    }
}

struct Entry(Request);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.key() == other.0.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; reverse so the lowest key pops first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.0.key().cmp(&self.0.key())
    }
}

struct QueueState {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    closed: bool,
}

pub struct PriorityQueue {
    agent: String,
    state: Mutex<QueueState>,
    notify: Notify,
    telemetry: Arc<dyn TelemetrySink>,
    expired: AtomicU64,
}

impl PriorityQueue {
    pub fn new(agent: impl Into<String>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            agent: agent.into(),
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
            telemetry,
            expired: AtomicU64::new(0),
        }
    }

    /// Enqueue a request. Hands it back if the queue has been closed.
    pub fn push(&self, mut request: Request) -> Result<(), Request> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(request);
            }
            request.enqueued_at = Instant::now();
            request.seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Entry(request));
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority live request, resolving any expired ones on the way
    pub fn pop(&self) -> Option<Request> {
        let now = Instant::now();
        let mut expired = Vec::new();

        let next = {
            let mut state = self.state.lock();
            loop {
                match state.heap.pop() {
                    Some(Entry(request)) if request.is_expired(now) => expired.push(request),
                    Some(Entry(request)) => break Some(request),
                    None => break None,
                }
            }
        };

        for request in expired {
            self.expire(request, now);
        }
        next
    }

    /// Wait for the next live request. Returns `None` once the queue is closed.
    pub async fn pop_wait(&self) -> Option<Request> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(request) = self.pop() {
                return Some(request);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Requests dropped because their deadline passed while queued
    pub fn expired_count(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Stop accepting requests and fail everything still queued
    pub fn close(&self) -> usize {
        let drained: Vec<Request> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.heap.drain().map(|Entry(request)| request).collect()
        };
        let count = drained.len();

        for request in drained {
            request.pending.resolve(Err(RouterError::ShutdownInProgress), request.attempt);
        }
        self.notify.notify_waiters();

        if count > 0 {
            debug!(agent = %self.agent, count, "Failed queued requests on close");
        }
        count
    }

    pub(crate) fn expire(&self, request: Request, now: Instant) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        let queued = now.saturating_duration_since(request.enqueued_at);
        debug!(
            agent = %self.agent,
            call_id = %request.id,
            queued_ms = queued.as_millis() as u64,
            "Dropping expired request"
        );

        self.telemetry.emit(TelemetryEvent::RequestExpired {
            call_id: request.id,
            agent: self.agent.clone(),
            priority: request.priority,
            queued_ms: queued.as_secs_f64() * 1000.0,
        });

        let elapsed = now.saturating_duration_since(request.pending.started_at());
        request.pending.resolve(
            Err(RouterError::Timeout {
                agent: self.agent.clone(),
                elapsed,
            }),
            request.attempt,
        );
    }
}
