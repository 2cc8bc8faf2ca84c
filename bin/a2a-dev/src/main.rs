//! A2A Router Development Binary
//!
//! Starts an in-process router with a handful of demo agents, then:
//! - Runs a single call and a fan-out across every agent
//! - Prints agent stats, the health report and rendered Prometheus metrics
//! - Optionally keeps the lifecycle tasks running until Ctrl+C

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use a2a_common::{CallOptions, Priority, RequestContext};
use a2a_config::RouterSettings;
use a2a_router::{handler_fn, HandlerError, LifecycleConfig, LifecycleManager, RouterBuilder};
use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// A2A Router development server
#[derive(Parser, Debug)]
#[command(name = "a2a-dev")]
#[command(about = "A2A Router development binary - demo agents behind an in-process router")]
struct Args {
    /// Router configuration file (TOML). Falls back to env-only settings.
    #[arg(long, env = "A2A_CONFIG_PATH")]
    config: Option<String>,

    /// Per-call timeout in milliseconds
    #[arg(long, env = "A2A_DEV_CALL_TIMEOUT_MS", default_value = "2000")]
    call_timeout_ms: u64,

    /// Keep running until Ctrl+C after the demo calls
    #[arg(long, env = "A2A_DEV_SERVE", default_value = "false")]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    info!("Starting A2A Router (development)");

    let metrics = PrometheusBuilder::new().install_recorder()?;

    // 1. Settings
    let settings = match &args.config {
        Some(path) => RouterSettings::load(path)?,
        None => {
            info!("No config file given - using defaults with environment overrides");
            RouterSettings::from_env()?
        }
    };
    let grace = settings.shutdown_grace();
    let lifecycle_config = LifecycleConfig::from(&settings.lifecycle);

    // 2. Agents
    let mut builder = RouterBuilder::from_settings(settings);
    register_demo_agents(&mut builder)?;
    let router = builder.start();
    info!(agents = ?router.agents(), "Router started");

    // 3. Lifecycle tasks
    let lifecycle = LifecycleManager::start(router.clone(), lifecycle_config);

    // 4. Demo traffic
    let options = CallOptions::default().with_timeout(Duration::from_millis(args.call_timeout_ms));
    let context = RequestContext::new()
        .with_session("dev-session")
        .with_user("dev-user");

    match router
        .call_agent(
            "nutrition",
            json!({ "meal": "oatmeal", "calories": 350 }),
            context.clone(),
            options.clone().with_priority(Priority::High),
        )
        .await
    {
        Ok(value) => info!(result = %value, "nutrition call succeeded"),
        Err(e) => warn!(error = %e, "nutrition call failed"),
    }

    let results = router
        .call_multiple_agents(
            router.agents(),
            json!({ "question": "plan my week" }),
            context,
            options,
        )
        .await;

    for (agent, result) in &results {
        match &result.result {
            Ok(value) => info!(
                agent = %agent,
                attempts = result.attempts,
                latency_ms = result.latency_ms,
                result = %value,
                "Fan-out result"
            ),
            Err(e) => warn!(
                agent = %agent,
                attempts = result.attempts,
                latency_ms = result.latency_ms,
                error = %e,
                "Fan-out failure"
            ),
        }
    }

    // 5. Snapshot
    println!("{}", serde_json::to_string_pretty(&router.agent_stats())?);
    println!("{}", serde_json::to_string_pretty(&router.health_report())?);
    println!("{}", metrics.render());

    if args.serve {
        info!("A2A Router running. Press Ctrl+C to shutdown.");
        shutdown_signal().await;
        info!("Shutdown signal received...");
    }

    // 6. Graceful shutdown
    lifecycle.shutdown().await;
    if !router.shutdown(grace).await {
        error!(grace_ms = grace.as_millis() as u64, "Calls still in flight after shutdown grace");
    }

    info!("A2A Router shutdown complete");
    Ok(())
}

fn register_demo_agents(builder: &mut RouterBuilder) -> Result<()> {
    builder.register_configured(
        "nutrition",
        Arc::new(handler_fn(|payload: Arc<Value>, context: Arc<RequestContext>| async move {
            anyhow::Ok(json!({
                "agent": "nutrition",
                "session": context.session_id.clone(),
                "echo": payload.as_ref().clone(),
            }))
        })),
    )?;

    builder.register_configured(
        "training",
        Arc::new(handler_fn(|_payload: Arc<Value>, _context: Arc<RequestContext>| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            anyhow::Ok(json!({ "agent": "training", "plan": ["run", "rest", "lift"] }))
        })),
    )?;

    // Fails transiently on every other invocation so retries show up in metrics
    let counter = Arc::new(AtomicU64::new(0));
    builder.register_configured(
        "sleep",
        Arc::new(handler_fn(move |_payload: Arc<Value>, _context: Arc<RequestContext>| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            async move {
                if n % 2 == 0 {
                    return Err(anyhow::Error::from(HandlerError::transient("sleep tracker unavailable")));
                }
                anyhow::Ok(json!({ "agent": "sleep", "hours": 7.5 }))
            }
        })),
    )?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
