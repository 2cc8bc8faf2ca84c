use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Core Call Types
// ============================================================================

/// Dispatch priority. Lower numeric value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Priority::Critical),
            1 => Some(Priority::High),
            2 => Some(Priority::Normal),
            3 => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key-value bag passed through to handlers unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub priority: Priority,
    /// Overall budget, from submission to resolution
    pub timeout: Duration,
    /// Falls back to the agent's configured retry count when unset
    pub max_retries: Option<u32>,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            timeout: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Terminal outcome of a call or attempt, as reported to telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    Success,
    Error,
    CircuitOpen,
    Timeout,
    QueueFull,
    Cancelled,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Error => "error",
            CallOutcome::CircuitOpen => "circuit_open",
            CallOutcome::Timeout => "timeout",
            CallOutcome::QueueFull => "queue_full",
            CallOutcome::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Circuit Breaker Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// In-Flight Call Tracking
// ============================================================================

/// A call that has been submitted and not yet resolved
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InFlightCall {
    pub call_id: Uuid,
    pub agent: String,
    pub priority: Priority,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

// ============================================================================
// Health & Metrics Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    pub agent: String,
    pub max_concurrency: u32,
    pub active_workers: u32,
    pub available_permits: u32,
    pub queue_depth: u32,
    pub queue_high_water: u32,
    pub circuit_state: CircuitState,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub expired: u64,
}

impl AgentStats {
    /// Queue fill level relative to the high-water mark, in [0, 1+]
    pub fn queue_utilization(&self) -> f64 {
        if self.queue_high_water == 0 {
            return 0.0;
        }
        self.queue_depth as f64 / self.queue_high_water as f64
    }
}

/// Overall router health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All agents accepting work
    Healthy,
    /// Some agents tripped or saturated
    Warning,
    /// At least half of the agents tripped or saturated
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub agents_total: u32,
    pub agents_healthy: u32,
    pub agents_unhealthy: u32,
    pub open_circuits: u32,
    pub issues: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_orders_by_level() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
        assert_eq!(Priority::from_level(1), Some(Priority::High));
        assert_eq!(Priority::from_level(9), None);
        assert_eq!(Priority::Low.level(), 3);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"CRITICAL\"");
        assert_eq!(serde_json::to_string(&CircuitState::HalfOpen).unwrap(), "\"HALF_OPEN\"");
        assert_eq!(serde_json::to_string(&CallOutcome::QueueFull).unwrap(), "\"queue_full\"");
        assert_eq!(CircuitState::HalfOpen.as_str(), "HALF_OPEN");
    }

    #[test]
    fn test_request_context_builder() {
        let ctx = RequestContext::new()
            .with_session("s-1")
            .with_user("u-1")
            .with_metadata("locale", "en");
        assert_eq!(ctx.session_id.as_deref(), Some("s-1"));
        assert_eq!(ctx.user_id.as_deref(), Some("u-1"));
        assert_eq!(ctx.get("locale"), Some("en"));
        assert!(ctx.trace_id.is_none());
    }

    #[test]
    fn test_queue_utilization() {
        let stats = AgentStats {
            agent: "a".to_string(),
            max_concurrency: 1,
            active_workers: 0,
            available_permits: 1,
            queue_depth: 8,
            queue_high_water: 10,
            circuit_state: CircuitState::Closed,
            succeeded: 0,
            failed: 0,
            rejected: 0,
            expired: 0,
        };
        assert!((stats.queue_utilization() - 0.8).abs() < f64::EPSILON);
    }
}
