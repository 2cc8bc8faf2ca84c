//! Router behaviour tests
//!
//! Tests for:
//! - Timeouts, circuit breaking and recovery through the public API
//! - Fan-out completeness and ordering
//! - Retry exhaustion and backoff
//! - Late completions after timeout or cancellation
//! - Concurrency bound, queue expiry and backpressure
//! - Configuration-driven registration

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use a2a_config::RouterSettings;
use a2a_router::{
    AgentHandler, AgentOptions, CallOptions, CallOutcome, CircuitState, HandlerError, Priority, PriorityQueue,
    RecordingTelemetry, Request, RequestContext, RetryPolicy, Router, RouterBuilder, RouterError, TelemetryEvent,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

enum Behaviour {
    Echo,
    Sleep(Duration),
    Unknown,
    Transient,
}

/// Mock agent that records invocations and peak concurrency
struct MockAgent {
    behaviour: Behaviour,
    failing: AtomicBool,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAgent {
    fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentHandler for MockAgent {
    async fn handle(&self, payload: Arc<Value>, _context: Arc<RequestContext>) -> anyhow::Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        let result = if self.failing.load(Ordering::SeqCst) {
            Err(anyhow::anyhow!("forced failure"))
        } else {
            match &self.behaviour {
                Behaviour::Echo => Ok((*payload).clone()),
                Behaviour::Sleep(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(json!("ok"))
                }
                Behaviour::Unknown => Err(anyhow::anyhow!("model returned garbage")),
                Behaviour::Transient => Err(HandlerError::transient("upstream 503").into()),
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn builder(telemetry: &Arc<RecordingTelemetry>) -> RouterBuilder {
    Router::builder()
        .with_telemetry(telemetry.clone())
        .with_retry_policy(RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40)).with_jitter(false))
}

fn opts(timeout_ms: u64) -> CallOptions {
    CallOptions::default().with_timeout(Duration::from_millis(timeout_ms))
}

async fn call(router: &Router, agent: &str, options: CallOptions) -> Result<Value, RouterError> {
    router
        .call_agent(agent, json!({ "from": "test" }), RequestContext::new(), options)
        .await
}

#[tokio::test(start_paused = true)]
async fn test_slow_handler_times_out_caller() {
    init_tracing();
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Sleep(Duration::from_millis(200)));

    let mut builder = builder(&telemetry);
    builder
        .register_agent("nutrition", agent.clone(), 1, Duration::from_millis(100))
        .unwrap();
    let router = builder.start();

    let err = call(&router, "nutrition", opts(50)).await.unwrap_err();
    assert!(err.is_timeout(), "expected timeout, got {err}");
    assert_eq!(telemetry.call_outcomes("nutrition"), vec![CallOutcome::Timeout]);

    // The late completion must be a silent no-op
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.calls(), 1);
    assert_eq!(router.in_flight_count(), 0);
    assert_eq!(router.agent_stats_for("nutrition").unwrap().active_workers, 0);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_after_threshold_failures() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Unknown);

    let mut builder = builder(&telemetry);
    builder
        .register_agent_with(
            "training",
            agent.clone(),
            AgentOptions::new(1, Duration::from_secs(1)).with_failure_threshold(3),
        )
        .unwrap();
    let router = builder.start();

    for _ in 0..3 {
        let err = call(&router, "training", opts(1_000)).await.unwrap_err();
        assert!(matches!(err, RouterError::HandlerFatal { .. }));
    }

    let err = call(&router, "training", opts(1_000)).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(agent.calls(), 3);
    assert_eq!(
        telemetry.circuit_transitions("training"),
        vec![(CircuitState::Closed, CircuitState::Open)]
    );

    let stats = router.agent_stats_for("training").unwrap();
    assert_eq!(stats.failed, 3);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.circuit_state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_through_single_trial() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Echo);
    agent.set_failing(true);

    let mut builder = builder(&telemetry);
    builder
        .register_agent_with(
            "training",
            agent.clone(),
            AgentOptions::new(1, Duration::from_secs(1))
                .with_failure_threshold(1)
                .with_reset_timeout(Duration::from_millis(100)),
        )
        .unwrap();
    let router = builder.start();

    call(&router, "training", opts(1_000)).await.unwrap_err();
    assert!(call(&router, "training", opts(1_000)).await.unwrap_err().is_circuit_open());

    // Failed trial re-opens and restarts the cooldown
    tokio::time::sleep(Duration::from_millis(100)).await;
    call(&router, "training", opts(1_000)).await.unwrap_err();
    assert_eq!(agent.calls(), 2);
    assert!(call(&router, "training", opts(1_000)).await.unwrap_err().is_circuit_open());

    // Successful trial closes
    agent.set_failing(false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    call(&router, "training", opts(1_000)).await.unwrap();
    call(&router, "training", opts(1_000)).await.unwrap();
    assert_eq!(agent.calls(), 4);

    assert_eq!(
        telemetry.circuit_transitions("training"),
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_fan_out_reports_every_agent() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let mut builder = builder(&telemetry);
    builder
        .register_agent(
            "a",
            Arc::new(a2a_router::handler_fn(|_payload, _ctx| async move {
                Ok::<_, anyhow::Error>(json!("X"))
            })),
            1,
            Duration::from_secs(1),
        )
        .unwrap();
    let router = builder.start();

    let results = router
        .call_multiple_agents(["a", "b"], json!({}), RequestContext::new(), opts(1_000))
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results["a"].value(), Some(&json!("X")));
    assert!(matches!(
        results["b"].error(),
        Some(RouterError::UnknownAgent { agent }) if agent == "b"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_is_complete_and_ordered() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let mut builder = builder(&telemetry);
    builder
        .register_agent("echo", MockAgent::new(Behaviour::Echo), 2, Duration::from_secs(1))
        .unwrap();
    builder
        .register_agent("slow", MockAgent::new(Behaviour::Sleep(Duration::from_secs(5))), 1, Duration::from_secs(10))
        .unwrap();
    builder
        .register_agent("broken", MockAgent::new(Behaviour::Unknown), 1, Duration::from_secs(1))
        .unwrap();
    let router = builder.start();

    let names = ["slow", "echo", "ghost", "broken", "echo"];
    let results = router
        .call_multiple_agents(names, json!({ "n": 1 }), RequestContext::new(), opts(200))
        .await;

    let keys: Vec<&str> = results.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["slow", "echo", "ghost", "broken"]);
    assert!(results["slow"].error().unwrap().is_timeout());
    assert_eq!(results["echo"].value(), Some(&json!({ "n": 1 })));
    assert!(matches!(results["ghost"].error(), Some(RouterError::UnknownAgent { .. })));
    assert!(matches!(results["broken"].error(), Some(RouterError::HandlerFatal { .. })));
    assert_eq!(results["echo"].attempts, 1);
    assert_eq!(results["echo"].agent_name, "echo");
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_exactly_max_retries() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Transient);

    let mut builder = builder(&telemetry);
    builder
        .register_agent("planner", agent.clone(), 1, Duration::from_secs(1))
        .unwrap();
    let router = builder.start();

    let result = router
        .call_agent_detailed("planner", json!({}), RequestContext::new(), opts(5_000).with_max_retries(3))
        .await;

    assert_eq!(agent.calls(), 4);
    assert_eq!(result.attempts, 4);
    assert!(matches!(
        result.error(),
        Some(RouterError::HandlerTransient { attempts: 4, .. })
    ));
    assert_eq!(telemetry.count_for("request_retried", "planner"), 3);
    assert_eq!(telemetry.count_for("attempt_completed", "planner"), 4);

    // Retries alone do not count against the breaker
    let stats = router.agent_stats_for("planner").unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.circuit_state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_when_backoff_overruns_deadline() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Transient);

    let mut builder = Router::builder()
        .with_telemetry(telemetry.clone())
        .with_retry_policy(RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(1)).with_jitter(false));
    builder
        .register_agent("planner", agent.clone(), 1, Duration::from_secs(1))
        .unwrap();
    let router = builder.start();

    let err = call(&router, "planner", opts(300).with_max_retries(5)).await.unwrap_err();
    assert!(matches!(err, RouterError::HandlerTransient { attempts: 1, .. }));
    assert_eq!(agent.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_transient_error_is_not_retried() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Unknown);

    let mut builder = builder(&telemetry);
    builder.register_agent("planner", agent.clone(), 1, Duration::from_secs(1)).unwrap();
    let router = builder.start();

    let err = call(&router, "planner", opts(5_000).with_max_retries(3)).await.unwrap_err();
    assert!(matches!(err, RouterError::HandlerFatal { .. }));
    assert_eq!(agent.calls(), 1);
    assert_eq!(telemetry.count("request_retried"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_holds_when_handlers_overrun() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Sleep(Duration::from_millis(100)));

    let mut builder = builder(&telemetry);
    builder
        .register_agent_with(
            "vision",
            agent.clone(),
            AgentOptions::new(2, Duration::from_millis(20))
                .with_max_retries(0)
                .with_failure_threshold(100),
        )
        .unwrap();
    let router = builder.start();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let handle = router
            .submit("vision", Arc::new(json!({})), Arc::new(RequestContext::new()), &opts(10_000))
            .unwrap();
        handles.push(handle);
    }

    for handle in handles {
        let result = handle.wait().await;
        assert!(result.error().unwrap().is_timeout());
    }

    assert_eq!(agent.calls(), 6);
    assert_eq!(agent.peak(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_request_is_resolved_and_skipped() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Sleep(Duration::from_millis(100)));

    let mut builder = builder(&telemetry);
    builder.register_agent("vision", agent.clone(), 1, Duration::from_secs(1)).unwrap();
    let router = builder.start();

    let ctx = Arc::new(RequestContext::new());
    let busy = router.submit("vision", Arc::new(json!(1)), ctx.clone(), &opts(10_000)).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    let short = router.submit("vision", Arc::new(json!(2)), ctx.clone(), &opts(30)).unwrap();
    let after = router.submit("vision", Arc::new(json!(3)), ctx, &opts(10_000)).unwrap();

    assert!(short.wait().await.error().unwrap().is_timeout());
    assert!(busy.wait().await.is_ok());
    assert!(after.wait().await.is_ok());

    assert_eq!(agent.calls(), 2);
    assert_eq!(telemetry.count_for("request_expired", "vision"), 1);
    assert_eq!(router.agent_stats_for("vision").unwrap().expired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_rejects_without_growing() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Sleep(Duration::from_secs(60)));

    let mut builder = builder(&telemetry);
    builder
        .register_agent_with(
            "vision",
            agent.clone(),
            AgentOptions::new(1, Duration::from_secs(120)).with_queue_high_water(2),
        )
        .unwrap();
    let router = builder.start();

    let ctx = Arc::new(RequestContext::new());
    let payload = Arc::new(json!({}));
    let options = opts(120_000);

    let mut handles = vec![router.submit("vision", payload.clone(), ctx.clone(), &options).unwrap()];
    tokio::time::sleep(Duration::from_millis(1)).await;
    handles.push(router.submit("vision", payload.clone(), ctx.clone(), &options).unwrap());
    handles.push(router.submit("vision", payload.clone(), ctx.clone(), &options).unwrap());

    let err = router.submit("vision", payload, ctx, &options).err().unwrap();
    assert!(matches!(err, RouterError::QueueFull { depth: 2, high_water: 2, .. }));
    assert_eq!(router.agent_stats_for("vision").unwrap().queue_depth, 2);
    assert_eq!(telemetry.call_outcomes("vision"), vec![CallOutcome::QueueFull]);

    let report = router.health_report();
    assert_eq!(report.agents_unhealthy, 1);
    assert!(report.issues[0].contains("queue"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_makes_late_completion_a_noop() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let agent = MockAgent::new(Behaviour::Sleep(Duration::from_millis(100)));

    let mut builder = builder(&telemetry);
    builder.register_agent("vision", agent.clone(), 1, Duration::from_secs(1)).unwrap();
    let router = builder.start();

    let handle = router
        .submit("vision", Arc::new(json!({})), Arc::new(RequestContext::new()), &opts(5_000))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let result = handle.cancel();
    assert!(matches!(result.result, Err(RouterError::Cancelled { .. })));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(agent.calls(), 1);

    // The handler still ran to completion and was counted
    let stats = router.agent_stats_for("vision").unwrap();
    assert_eq!(stats.succeeded, 1);
    let abandoned_attempts = telemetry
        .events()
        .into_iter()
        .filter(|e| matches!(e, TelemetryEvent::AttemptCompleted { abandoned: true, outcome: CallOutcome::Success, .. }))
        .count();
    assert_eq!(abandoned_attempts, 1);
    assert_eq!(telemetry.call_outcomes("vision"), vec![CallOutcome::Cancelled]);
}

#[tokio::test(start_paused = true)]
async fn test_priority_order_on_a_busy_agent() {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let seen = order.clone();
    let handler = a2a_router::handler_fn(move |payload: Arc<Value>, _ctx| {
        let seen = seen.clone();
        async move {
            seen.lock().push(payload["label"].as_str().unwrap_or_default().to_string());
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok::<_, anyhow::Error>(Value::Null)
        }
    });

    let mut builder = builder(&telemetry);
    builder.register_agent("ranker", Arc::new(handler), 1, Duration::from_secs(1)).unwrap();
    let router = builder.start();

    let ctx = Arc::new(RequestContext::new());
    let submit = |label: &str, priority: Priority| {
        router
            .submit(
                "ranker",
                Arc::new(json!({ "label": label })),
                ctx.clone(),
                &opts(10_000).with_priority(priority),
            )
            .unwrap()
    };

    let first = submit("blocker", Priority::Normal);
    tokio::time::sleep(Duration::from_millis(1)).await;
    let handles = vec![
        first,
        submit("low", Priority::Low),
        submit("high", Priority::High),
        submit("normal", Priority::Normal),
        submit("critical", Priority::Critical),
    ];
    futures::future::join_all(handles.into_iter().map(|h| h.wait())).await;

    assert_eq!(*order.lock(), vec!["blocker", "critical", "high", "normal", "low"]);
}

#[tokio::test]
async fn test_queue_pops_low_high_normal_as_high_normal_low() {
    let queue = PriorityQueue::new("any", Arc::new(RecordingTelemetry::new()));
    let mut receivers = Vec::new();
    for priority in [Priority::Low, Priority::High, Priority::Normal] {
        let (request, rx) = Request::new(
            "any",
            Arc::new(json!(null)),
            Arc::new(RequestContext::new()),
            priority,
            tokio::time::Instant::now() + Duration::from_secs(60),
            0,
        );
        queue.push(request).unwrap();
        receivers.push(rx);
    }

    let popped: Vec<Priority> = std::iter::from_fn(|| queue.pop()).map(|r| r.priority).collect();
    assert_eq!(popped, vec![Priority::High, Priority::Normal, Priority::Low]);
}

#[tokio::test]
async fn test_configured_agents_use_settings() {
    let settings = RouterSettings::from_toml_str(
        r#"
        [defaults]
        max_retries = 0

        [agents.nutrition]
        max_concurrency = 3
        timeout_ms = 250
        queue_high_water = 7
        "#,
    )
    .unwrap();
    settings.validate().unwrap();

    let telemetry = Arc::new(RecordingTelemetry::new());
    let mut builder = RouterBuilder::from_settings(settings).with_telemetry(telemetry);
    builder
        .register_configured("nutrition", MockAgent::new(Behaviour::Echo))
        .unwrap();
    builder
        .register_configured("training", MockAgent::new(Behaviour::Echo))
        .unwrap();
    let dup = builder.register_configured("training", MockAgent::new(Behaviour::Echo));
    assert!(matches!(dup, Err(RouterError::DuplicateAgent { .. })));

    let router = builder.start();
    let nutrition = router.agent_stats_for("nutrition").unwrap();
    assert_eq!(nutrition.max_concurrency, 3);
    assert_eq!(nutrition.queue_high_water, 7);

    let training = router.agent_stats_for("training").unwrap();
    assert_eq!(training.max_concurrency, 4);
    assert_eq!(training.queue_high_water, 1_000);
    assert_eq!(router.agents(), vec!["nutrition".to_string(), "training".to_string()]);
}
