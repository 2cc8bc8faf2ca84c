//! Router error taxonomy and handler error classification

use std::io;
use std::time::Duration;

use a2a_common::CallOutcome;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Unknown agent: {agent}")]
    UnknownAgent { agent: String },

    #[error("Agent already registered: {agent}")]
    DuplicateAgent { agent: String },

    #[error("Invalid registration for agent '{agent}': {reason}")]
    InvalidRegistration { agent: String, reason: String },

    #[error("Circuit open for agent {agent}, retry after {retry_after:?}")]
    CircuitOpen { agent: String, retry_after: Duration },

    #[error("Call to agent {agent} timed out after {elapsed:?}")]
    Timeout { agent: String, elapsed: Duration },

    #[error("Queue full for agent {agent} (depth {depth}, high water {high_water})")]
    QueueFull { agent: String, depth: usize, high_water: usize },

    /// Retryable handler failure that exhausted its retries
    #[error("Agent {agent} failed after {attempts} attempts: {source}")]
    HandlerTransient {
        agent: String,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    /// Non-retryable handler failure
    #[error("Agent {agent} failed: {source}")]
    HandlerFatal {
        agent: String,
        #[source]
        source: BoxError,
    },

    #[error("Call to agent {agent} was cancelled")]
    Cancelled { agent: String },

    #[error("Shutdown in progress")]
    ShutdownInProgress,
}

impl RouterError {
    /// Telemetry outcome label for this error
    pub fn outcome(&self) -> CallOutcome {
        match self {
            RouterError::CircuitOpen { .. } => CallOutcome::CircuitOpen,
            RouterError::Timeout { .. } => CallOutcome::Timeout,
            RouterError::QueueFull { .. } => CallOutcome::QueueFull,
            RouterError::Cancelled { .. } => CallOutcome::Cancelled,
            _ => CallOutcome::Error,
        }
    }

    pub fn agent(&self) -> Option<&str> {
        match self {
            RouterError::UnknownAgent { agent }
            | RouterError::DuplicateAgent { agent }
            | RouterError::InvalidRegistration { agent, .. }
            | RouterError::CircuitOpen { agent, .. }
            | RouterError::Timeout { agent, .. }
            | RouterError::QueueFull { agent, .. }
            | RouterError::HandlerTransient { agent, .. }
            | RouterError::HandlerFatal { agent, .. }
            | RouterError::Cancelled { agent } => Some(agent),
            RouterError::ShutdownInProgress => None,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, RouterError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RouterError::Timeout { .. })
    }
}

/// Retry classification of a handler failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Expected to succeed on retry (timeouts, dropped connections)
    Transient,
    /// Structural failure, retrying cannot help
    Fatal,
    /// Not recognised; treated as fatal
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Error handlers return to tag a failure explicitly
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    kind: ErrorKind,
    message: String,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Classify a handler error by walking its cause chain.
///
/// The first explicit [`HandlerError`] tag wins. Elapsed timers and
/// connection-level I/O errors are transient. Anything else is `Unknown`.
pub fn classify(error: &anyhow::Error) -> ErrorKind {
    for cause in error.chain() {
        if let Some(tagged) = cause.downcast_ref::<HandlerError>() {
            return tagged.kind();
        }
        if cause.is::<tokio::time::error::Elapsed>() {
            return ErrorKind::Transient;
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if is_transient_io(io_err.kind()) {
                return ErrorKind::Transient;
            }
        }
    }
    ErrorKind::Unknown
}

fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
    )
}
