//! Lifecycle Manager - Background tasks for the router
//!
//! Handles:
//! - Periodic health report logging
//! - Slow call detection for calls in flight past a threshold

use std::time::Duration;

use a2a_config::LifecycleSettings;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::router::Router;

/// Upper bound on slow calls logged per check
const SLOW_CALL_LOG_LIMIT: usize = 20;

/// Configuration for the lifecycle manager
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// Interval for health report generation
    pub health_report_interval: Duration,
    /// Calls in flight longer than this are reported
    pub slow_call_threshold: Duration,
    /// Interval for slow call checks
    pub slow_call_check_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self::from(&LifecycleSettings::default())
    }
}

impl From<&LifecycleSettings> for LifecycleConfig {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            health_report_interval: Duration::from_secs(settings.health_report_interval_secs.max(1)),
            slow_call_threshold: Duration::from_secs(settings.slow_call_threshold_secs),
            slow_call_check_interval: Duration::from_secs(settings.slow_call_check_interval_secs.max(1)),
        }
    }
}

/// Manages lifecycle tasks for the router
pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl LifecycleManager {
    /// Start all lifecycle tasks
    pub fn start(router: Router, config: LifecycleConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(2);

        // Health report logger
        {
            let router = router.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.health_report_interval;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let report = router.health_report();

                            if !report.issues.is_empty() {
                                warn!(
                                    status = ?report.status,
                                    unhealthy = report.agents_unhealthy,
                                    open_circuits = report.open_circuits,
                                    issues = ?report.issues,
                                    "Health report"
                                );
                            } else {
                                debug!(status = ?report.status, agents = report.agents_total, "Health report: OK");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Health report logger shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        // Slow call detector
        {
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.slow_call_check_interval;
            let threshold_ms = config.slow_call_threshold.as_millis() as u64;

            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let slow: Vec<_> = router
                                .in_flight_calls(usize::MAX, None)
                                .into_iter()
                                .take_while(|call| call.elapsed_ms >= threshold_ms)
                                .collect();

                            for call in slow.iter().take(SLOW_CALL_LOG_LIMIT) {
                                warn!(
                                    call_id = %call.call_id,
                                    agent = %call.agent,
                                    priority = %call.priority,
                                    elapsed_ms = call.elapsed_ms,
                                    "Slow call in flight"
                                );
                            }
                            if slow.len() > SLOW_CALL_LOG_LIMIT {
                                warn!(total = slow.len(), "More slow calls in flight than logged");
                            }
                        }
                        _ = shutdown_rx.recv() => {
                            info!("Slow call detector shutting down");
                            break;
                        }
                    }
                }
            }));
        }

        info!("Lifecycle manager started with all background tasks");

        Self { shutdown_tx, tasks }
    }

    /// Signal shutdown to all lifecycle tasks and wait for them to exit
    pub async fn shutdown(self) {
        info!("Lifecycle manager shutting down...");
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
