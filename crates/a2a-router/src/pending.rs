//! Single-write completion slot shared between a caller and the dispatcher

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use a2a_common::{InFlightCall, Priority};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::RouterError;

/// Terminal result written by the dispatcher
#[derive(Debug)]
pub struct Completion {
    pub result: Result<Value, RouterError>,
    /// Handler invocations made before resolution
    pub attempts: u32,
}

/// The caller side of one in-flight request.
///
/// The first of `resolve` or `abandon` wins; every later call is a no-op.
#[derive(Debug)]
pub struct PendingCall {
    id: Uuid,
    agent: String,
    priority: Priority,
    started_at: Instant,
    started_wall: DateTime<Utc>,
    slot: Mutex<Option<oneshot::Sender<Completion>>>,
    abandoned: AtomicBool,
}

impl PendingCall {
    pub fn new(id: Uuid, agent: impl Into<String>, priority: Priority) -> (Arc<Self>, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Self {
            id,
            agent: agent.into(),
            priority,
            started_at: Instant::now(),
            started_wall: Utc::now(),
            slot: Mutex::new(Some(tx)),
            abandoned: AtomicBool::new(false),
        });
        (pending, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn agent(&self) -> &str {
        &self.agent
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Write the terminal result. Returns false when the call was already
    /// resolved or abandoned, in which case the result is dropped.
    pub fn resolve(&self, result: Result<Value, RouterError>, attempts: u32) -> bool {
        // Send under the lock: once `abandon` fails the value is already in the channel
        let mut slot = self.slot.lock();
        match slot.take() {
            // The receiver may be gone if the handle was dropped mid-flight
            Some(tx) => {
                let _ = tx.send(Completion { result, attempts });
                true
            }
            None => false,
        }
    }

    /// Mark the call abandoned by its caller. Returns false if a result was
    /// already written.
    pub fn abandon(&self) -> bool {
        let sender = self.slot.lock().take();
        if sender.is_some() {
            self.abandoned.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// True once resolved or abandoned
    pub fn is_done(&self) -> bool {
        self.slot.lock().is_none()
    }

    pub fn to_in_flight(&self) -> InFlightCall {
        InFlightCall {
            call_id: self.id,
            agent: self.agent.clone(),
            priority: self.priority,
            started_at: self.started_wall,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}
