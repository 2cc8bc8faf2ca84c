//! Agent registry
//!
//! Maps agent names to handlers and their per-agent options. Registration
//! happens on the [`RouterBuilder`](crate::RouterBuilder) before any dispatch
//! loop starts; the started router only reads it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use a2a_common::RequestContext;
use a2a_config::ResolvedAgentSettings;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::info;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::RouterError;
use crate::Result;

/// An agent implementation
#[async_trait]
pub trait AgentHandler: Send + Sync {
    async fn handle(&self, payload: Arc<Value>, context: Arc<RequestContext>) -> anyhow::Result<Value>;
}

/// Adapts an async closure into an [`AgentHandler`]
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<Value>, Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> AgentHandler for FnHandler<F>
where
    F: Fn(Arc<Value>, Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, payload: Arc<Value>, context: Arc<RequestContext>) -> anyhow::Result<Value> {
        (self.0)(payload, context).await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOptions {
    pub max_concurrency: u32,
    /// Upper bound on a single handler invocation
    pub timeout: Duration,
    pub max_retries: u32,
    pub queue_high_water: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl AgentOptions {
    pub fn new(max_concurrency: u32, timeout: Duration) -> Self {
        Self {
            max_concurrency,
            timeout,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_queue_high_water(mut self, high_water: usize) -> Self {
        self.queue_high_water = high_water;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.circuit_breaker.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, reset_timeout: Duration) -> Self {
        self.circuit_breaker.reset_timeout = reset_timeout;
        self
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self::from(a2a_config::RouterSettings::default().resolve_agent(""))
    }
}

impl From<ResolvedAgentSettings> for AgentOptions {
    fn from(settings: ResolvedAgentSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency,
            timeout: settings.timeout,
            max_retries: settings.max_retries,
            queue_high_water: settings.queue_high_water,
            circuit_breaker: CircuitBreakerConfig::from(&settings.circuit_breaker),
        }
    }
}

pub struct AgentEntry {
    pub name: String,
    pub handler: Arc<dyn AgentHandler>,
    pub options: AgentOptions,
}

impl std::fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEntry")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct AgentRegistry {
    entries: IndexMap<String, Arc<AgentEntry>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, handler: Arc<dyn AgentHandler>, options: AgentOptions) -> Result<()> {
        let invalid = |reason: &str| RouterError::InvalidRegistration {
            agent: name.to_string(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if options.max_concurrency == 0 {
            return Err(invalid("max_concurrency must be > 0"));
        }
        if options.timeout.is_zero() {
            return Err(invalid("timeout must be > 0"));
        }
        if options.queue_high_water == 0 {
            return Err(invalid("queue_high_water must be > 0"));
        }
        if options.circuit_breaker.failure_threshold == 0 || options.circuit_breaker.half_open_max_calls == 0 {
            return Err(invalid("circuit breaker thresholds must be > 0"));
        }
        if self.entries.contains_key(name) {
            return Err(RouterError::DuplicateAgent { agent: name.to_string() });
        }

        info!(
            agent = %name,
            max_concurrency = options.max_concurrency,
            timeout_ms = options.timeout.as_millis() as u64,
            max_retries = options.max_retries,
            "Registered agent"
        );

        self.entries.insert(
            name.to_string(),
            Arc::new(AgentEntry {
                name: name.to_string(),
                handler,
                options,
            }),
        );
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Arc<AgentEntry>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Entries in registration order
    pub fn entries(&self) -> impl Iterator<Item = &Arc<AgentEntry>> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Arc<dyn AgentHandler> {
        Arc::new(handler_fn(|payload: Arc<Value>, _ctx| async move { Ok::<_, anyhow::Error>((*payload).clone()) }))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AgentRegistry::new();
        registry
            .register("nutrition", echo(), AgentOptions::new(1, Duration::from_millis(100)))
            .unwrap();
        registry.register("training", echo(), AgentOptions::default()).unwrap();

        let entry = registry.lookup("nutrition").unwrap();
        assert_eq!(entry.options.max_concurrency, 1);
        assert_eq!(entry.options.timeout, Duration::from_millis(100));
        assert!(registry.lookup("unknown").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["nutrition", "training"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = AgentRegistry::new();
        registry.register("a", echo(), AgentOptions::default()).unwrap();
        let err = registry.register("a", echo(), AgentOptions::default()).unwrap_err();
        assert!(matches!(err, RouterError::DuplicateAgent { ref agent } if agent == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_registration_rejected() {
        let mut registry = AgentRegistry::new();
        let zero_concurrency = registry.register("a", echo(), AgentOptions::new(0, Duration::from_secs(1)));
        assert!(matches!(zero_concurrency, Err(RouterError::InvalidRegistration { .. })));

        let zero_timeout = registry.register("b", echo(), AgentOptions::new(1, Duration::ZERO));
        assert!(matches!(zero_timeout, Err(RouterError::InvalidRegistration { .. })));

        let empty_name = registry.register(" ", echo(), AgentOptions::default());
        assert!(matches!(empty_name, Err(RouterError::InvalidRegistration { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_handler_fn_invokes_closure() {
        let handler = echo();
        let out = handler
            .handle(Arc::new(json!({ "meal": "lunch" })), Arc::new(RequestContext::new()))
            .await
            .unwrap();
        assert_eq!(out["meal"], "lunch");
    }
}
