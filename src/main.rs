// src/main.rs
//! Agent Isolation Engine
//!
//! Runs the isolation services (metrics collector, health checker, engine
//! factory) as a standalone process, logging periodic health until Ctrl-C.

use agent_isolation_engine::observability::{init_metrics, init_tracing};
use agent_isolation_engine::runtime::InMemoryChannelFactory;
use agent_isolation_engine::service::{install_global, IsolationServices, ServiceCollaborators};
use agent_isolation_engine::utils::config::EngineConfig;
use agent_isolation_engine::HealthSeverity;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration first: it carries the log settings
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Agent Isolation Engine v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {:?}", config);

    let report_every = Duration::from_secs(config.health.check_interval_secs);
    let services = Arc::new(IsolationServices::with_collaborators(
        config,
        ServiceCollaborators {
            channel_factory: Some(Arc::new(InMemoryChannelFactory::new())),
            ..Default::default()
        },
    )?);
    if install_global(Arc::clone(&services)).is_err() {
        warn!("Isolation services were already installed globally");
    }
    services.start();

    let reporter = {
        let services = Arc::clone(&services);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(report_every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(status) = services.health().get_current_health() else {
                    continue;
                };
                let factory = services.factory().get_factory_metrics();
                match status.overall_health {
                    HealthSeverity::Healthy | HealthSeverity::Warning => info!(
                        overall = %status.overall_health,
                        isolation_score = status.isolation_score,
                        concurrent_users = status.concurrent_users,
                        engines_active = factory.engines_active,
                        "Isolation health"
                    ),
                    _ => error!(
                        overall = %status.overall_health,
                        isolation_score = status.isolation_score,
                        critical_violations_24h = status.critical_violations_24h,
                        engines_active = factory.engines_active,
                        "Isolation health degraded"
                    ),
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("Received shutdown signal, cleaning up...");

    reporter.abort();
    let report = services.shutdown().await;
    info!(
        cleaned = report.cleaned,
        abandoned = report.abandoned,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Shutdown complete"
    );
    Ok(())
}
