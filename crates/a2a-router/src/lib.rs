//! A2A Router
//!
//! In-process agent-to-agent router with:
//! - Router: single-target and fan-out calls with deadlines and cancellation
//! - AgentPool: per-agent dispatcher bounded by a concurrency semaphore
//! - PriorityQueue: priority/FIFO ordering with lazy expiry
//! - CircuitBreaker: per-agent CLOSED/OPEN/HALF_OPEN gate
//! - RetryPolicy: exponential backoff for transient handler failures
//! - Telemetry: event hooks with tracing, metrics and in-memory sinks
//! - Lifecycle: background health and slow-call reporting

pub mod circuit_breaker;
pub mod error;
pub mod lifecycle;
pub mod pending;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod router;
pub mod telemetry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
pub use error::{classify, ErrorKind, HandlerError, RouterError};
pub use lifecycle::{LifecycleConfig, LifecycleManager};
pub use pending::{Completion, PendingCall};
pub use pool::AgentPool;
pub use queue::{PriorityQueue, Request};
pub use registry::{handler_fn, AgentEntry, AgentHandler, AgentOptions, AgentRegistry, FnHandler};
pub use retry::RetryPolicy;
pub use router::{AgentResult, CallHandle, Router, RouterBuilder};
pub use telemetry::{NoopTelemetry, RecordingTelemetry, TelemetryEvent, TelemetrySink, TracingTelemetry};

// Shared call vocabulary
pub use a2a_common::{
    AgentStats, CallOptions, CallOutcome, CircuitState, HealthReport, HealthStatus, InFlightCall, Priority,
    RequestContext,
};

pub type Result<T> = std::result::Result<T, RouterError>;
