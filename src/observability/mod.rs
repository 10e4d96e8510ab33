// src/observability/mod.rs
//! Logging and metrics initialization
//!
//! Tracing goes through `tracing-subscriber` (pretty or JSON). Metrics use
//! the `metrics` facade; a Prometheus exporter is installed only when
//! `observability.metrics_addr` is configured.

use crate::utils::config::ObservabilitySettings;
use crate::utils::errors::{EngineError, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const ENGINES_CREATED: &str = "isolation_engines_created_total";
pub const ENGINES_CLEANED: &str = "isolation_engines_cleaned_total";
pub const ENGINES_REJECTED: &str = "isolation_engines_rejected_total";
pub const ENGINE_CLEANUP_FAILURES: &str = "isolation_engine_cleanup_failures_total";
pub const ENGINES_ACTIVE: &str = "isolation_engines_active";
pub const INSTANCE_CREATION_MS: &str = "isolation_instance_creation_ms";

pub const VIOLATIONS_TOTAL: &str = "isolation_violations_total";
pub const ISOLATION_SCORE: &str = "isolation_score_percent";
pub const CONCURRENT_USERS: &str = "isolation_concurrent_users";
pub const ACTIVE_REQUESTS: &str = "isolation_active_requests";

pub const ALERTS_EMITTED: &str = "isolation_alerts_emitted_total";
pub const ALERTS_SUPPRESSED: &str = "isolation_alerts_suppressed_total";
pub const ALERTS_DROPPED: &str = "isolation_alerts_dropped_total";

pub const HEALTH_CHECK_DURATION_MS: &str = "isolation_health_check_duration_ms";
pub const HEALTH_OVERALL: &str = "isolation_health_overall";
pub const PROBE_FAILURES: &str = "isolation_probe_failures_total";

/// Install the global tracing subscriber
pub fn init_tracing(settings: &ObservabilitySettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .map_err(|e| EngineError::ObservabilityError(format!("Invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if settings.log_format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
    };

    installed.map_err(|e| EngineError::ObservabilityError(format!("Tracing init failed: {}", e)))
}

/// Install the Prometheus exporter (if configured) and describe all metrics
pub fn init_metrics(settings: &ObservabilitySettings) -> Result<()> {
    if let Some(addr) = &settings.metrics_addr {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| EngineError::ObservabilityError(format!("Invalid metrics_addr {}: {}", addr, e)))?;

        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .map_err(|e| EngineError::ObservabilityError(format!("Prometheus exporter failed: {}", e)))?;

        info!("Prometheus metrics exporter listening on {}", addr);
    }

    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!(ENGINES_CREATED, "Execution engines created");
    describe_counter!(ENGINES_CLEANED, "Execution engines cleaned up");
    describe_counter!(ENGINES_REJECTED, "Engine creations rejected by limits or shutdown");
    describe_counter!(ENGINE_CLEANUP_FAILURES, "Engine resource releases that failed");
    describe_gauge!(ENGINES_ACTIVE, "Execution engines currently active");
    describe_histogram!(INSTANCE_CREATION_MS, Unit::Milliseconds, "Isolated instance creation time");

    describe_counter!(VIOLATIONS_TOTAL, "Isolation violations by type and severity");
    describe_gauge!(ISOLATION_SCORE, Unit::Percent, "System isolation score");
    describe_gauge!(CONCURRENT_USERS, "Users with at least one active request");
    describe_gauge!(ACTIVE_REQUESTS, "Requests currently tracked");

    describe_counter!(ALERTS_EMITTED, "Alerts delivered to the sink");
    describe_counter!(ALERTS_SUPPRESSED, "Alerts suppressed by cooldown");
    describe_counter!(ALERTS_DROPPED, "Alerts dropped because the queue was full");

    describe_histogram!(HEALTH_CHECK_DURATION_MS, Unit::Milliseconds, "Health check pass duration");
    describe_gauge!(HEALTH_OVERALL, "Overall health (0 healthy .. 3 critical)");
    describe_counter!(PROBE_FAILURES, "Health probes that raised an internal error");
}
