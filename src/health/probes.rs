// src/health/probes.rs
//! Built-in isolation health probes
//!
//! Probes read the collector (and optional collaborators) and never mutate
//! shared state, so they can run in any order or concurrently.

use crate::health::collaborators::{ConnectionStatsProvider, MemoryStatsProvider, PoolStatusProvider};
use crate::health::result::{HealthCheckResult, STATUS_OK};
use crate::monitoring::history::BoundedHistory;
use crate::monitoring::registry::{InstanceRegistry, ENGINE_INSTANCE};
use crate::monitoring::status::HealthSeverity;
use crate::monitoring::violation::ViolationType;
use crate::monitoring::IsolationMetricsCollector;
use crate::utils::config::HealthSettings;
use crate::utils::errors::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const REQUEST_ISOLATION: &str = "request_isolation";
pub const SINGLETON_VIOLATIONS: &str = "singleton_violations";
pub const WEBSOCKET_ISOLATION: &str = "websocket_isolation";
pub const DATABASE_SESSION_ISOLATION: &str = "database_session_isolation";
pub const RESOURCE_LEAKS: &str = "resource_leaks";
pub const FACTORY_PERFORMANCE: &str = "factory_performance";
pub const CONCURRENT_REQUEST_SAFETY: &str = "concurrent_request_safety";
pub const MEMORY_USAGE: &str = "memory_usage";

const LAST_HOUR: Duration = Duration::from_secs(3600);
const LAST_DAY: Duration = Duration::from_secs(24 * 3600);

/// Pool utilization treated as near exhaustion
const POOL_PRESSURE_PCT: f64 = 90.0;

/// One independent health check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self) -> Result<HealthCheckResult>;
}

/// Isolation score thresholds: 100 healthy, 99 warning, 95 error
pub struct RequestIsolationProbe {
    collector: Arc<IsolationMetricsCollector>,
}

impl RequestIsolationProbe {
    pub fn new(collector: Arc<IsolationMetricsCollector>) -> Self {
        Self { collector }
    }
}

#[async_trait]
impl HealthProbe for RequestIsolationProbe {
    fn name(&self) -> &'static str {
        REQUEST_ISOLATION
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let score = self.collector.get_isolation_score();
        let (severity, status) = if score >= 100.0 {
            (HealthSeverity::Healthy, STATUS_OK)
        } else if score >= 99.0 {
            (HealthSeverity::Warning, "degraded")
        } else if score >= 95.0 {
            (HealthSeverity::Error, "isolation_failures")
        } else {
            (HealthSeverity::Critical, "isolation_breach")
        };

        let mut result = HealthCheckResult::new(
            REQUEST_ISOLATION,
            severity,
            status,
            format!("request isolation score {:.2}%", score),
        )
        .with_metric("isolation_score", score)
        .with_metric("active_requests", self.collector.get_active_requests())
        .with_metric("concurrent_users", self.collector.get_concurrent_users());

        if severity != HealthSeverity::Healthy {
            result = result
                .with_remediation("Review recent violations for the affected requests")
                .with_remediation("Check for state shared between execution engines");
        }
        Ok(result)
    }
}

/// Duplicate singletons in the instance registry and shared-instance violations
pub struct SingletonProbe {
    collector: Arc<IsolationMetricsCollector>,
    registry: Option<Arc<InstanceRegistry>>,
}

impl SingletonProbe {
    pub fn new(collector: Arc<IsolationMetricsCollector>, registry: Option<Arc<InstanceRegistry>>) -> Self {
        Self { collector, registry }
    }
}

#[async_trait]
impl HealthProbe for SingletonProbe {
    fn name(&self) -> &'static str {
        SINGLETON_VIOLATIONS
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let violations = self.collector.count_violations(
            &[ViolationType::SingletonViolation, ViolationType::SharedAgentInstance],
            LAST_DAY,
        );
        let breaches = self
            .registry
            .as_ref()
            .map(|r| r.singleton_breaches())
            .unwrap_or_default();

        if breaches.is_empty() && violations == 0 {
            return Ok(
                HealthCheckResult::healthy(SINGLETON_VIOLATIONS, "no shared singleton instances")
                    .with_metric("instance_tracking", self.registry.is_some()),
            );
        }

        let described: Vec<String> = breaches
            .iter()
            .map(|b| format!("{} ({} live, {} allowed)", b.type_name, b.live, b.allowed))
            .collect();
        Ok(HealthCheckResult::new(
            SINGLETON_VIOLATIONS,
            HealthSeverity::Critical,
            "shared_instances",
            format!(
                "{} duplicate singleton type(s), {} shared-instance violation(s) in 24h",
                breaches.len(),
                violations
            ),
        )
        .with_metric("duplicate_singletons", described)
        .with_metric("violations_24h", violations)
        .with_remediation("Create per-request instances through the execution engine factory")
        .with_remediation("Pass shared services by reference instead of constructing new ones"))
    }
}

/// Cross-user event counts plus the live connection count
pub struct WebsocketIsolationProbe {
    collector: Arc<IsolationMetricsCollector>,
    connections: Option<Arc<dyn ConnectionStatsProvider>>,
}

impl WebsocketIsolationProbe {
    pub fn new(
        collector: Arc<IsolationMetricsCollector>,
        connections: Option<Arc<dyn ConnectionStatsProvider>>,
    ) -> Self {
        Self { collector, connections }
    }
}

#[async_trait]
impl HealthProbe for WebsocketIsolationProbe {
    fn name(&self) -> &'static str {
        WEBSOCKET_ISOLATION
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let contamination = self.collector.count_violations(
            &[ViolationType::WebsocketContamination, ViolationType::CrossUserEvent],
            LAST_DAY,
        );

        let connections = match &self.connections {
            Some(provider) => Some(provider.active_connections().await),
            None => None,
        };

        let mut result = if contamination > 0 {
            HealthCheckResult::new(
                WEBSOCKET_ISOLATION,
                HealthSeverity::Critical,
                "contamination_detected",
                format!("{} cross-user event(s) in 24h", contamination),
            )
            .with_remediation("Verify every emitted event is routed through its own user's channel")
        } else {
            HealthCheckResult::healthy(WEBSOCKET_ISOLATION, "events delivered to their own users only")
        };
        result = result.with_metric("contamination_24h", contamination);

        match connections {
            Some(Ok(active)) => result = result.with_metric("active_connections", active),
            Some(Err(e)) => {
                result = result.with_metric("connection_stats_error", e.to_string());
                if result.severity < HealthSeverity::Warning {
                    result.severity = HealthSeverity::Warning;
                    result.status_code = "stats_unavailable".into();
                    result.message = format!("connection stats unavailable: {}", e);
                }
            }
            None => {}
        }
        Ok(result)
    }
}

/// Session leak counts plus database pool pressure
pub struct DatabaseSessionProbe {
    collector: Arc<IsolationMetricsCollector>,
    pools: Option<Arc<dyn PoolStatusProvider>>,
}

impl DatabaseSessionProbe {
    pub fn new(collector: Arc<IsolationMetricsCollector>, pools: Option<Arc<dyn PoolStatusProvider>>) -> Self {
        Self { collector, pools }
    }
}

#[async_trait]
impl HealthProbe for DatabaseSessionProbe {
    fn name(&self) -> &'static str {
        DATABASE_SESSION_ISOLATION
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let leaks = self.collector.count_violations(
            &[ViolationType::DbSessionLeak, ViolationType::SharedDbSession],
            LAST_DAY,
        );

        let mut result = if leaks > 0 {
            HealthCheckResult::new(
                DATABASE_SESSION_ISOLATION,
                HealthSeverity::Critical,
                "session_leak",
                format!("{} shared or leaked database session(s) in 24h", leaks),
            )
            .with_remediation("Open one database session per request and close it on cleanup")
        } else {
            HealthCheckResult::healthy(DATABASE_SESSION_ISOLATION, "database sessions isolated")
        };
        result = result.with_metric("session_violations_24h", leaks);

        let Some(provider) = &self.pools else {
            return Ok(result);
        };

        match provider.pool_status().await {
            Ok(status) => {
                let pressure = status
                    .sync
                    .utilization_pct()
                    .max(status.asynchronous.utilization_pct());
                result = result
                    .with_metric("pool_status", serde_json::to_value(status).unwrap_or_default())
                    .with_metric("pool_utilization_pct", pressure);

                let overflowing = status.sync.overflow > 0 || status.asynchronous.overflow > 0;
                if (pressure >= POOL_PRESSURE_PCT || overflowing)
                    && result.severity < HealthSeverity::Warning
                {
                    result.severity = HealthSeverity::Warning;
                    result.status_code = "pool_pressure".into();
                    result.message = format!("database pool at {:.0}% utilization", pressure);
                    result = result.with_remediation("Check for sessions held past request completion");
                }
            }
            Err(e) => {
                result = result.with_metric("pool_status_error", e.to_string());
                if result.severity < HealthSeverity::Warning {
                    result.severity = HealthSeverity::Warning;
                    result.status_code = "stats_unavailable".into();
                    result.message = format!("pool status unavailable: {}", e);
                }
            }
        }
        Ok(result)
    }
}

/// Engine instances outliving their requests, plus leak violations
///
/// Each check samples `live engines - active requests`. A full window of
/// positive, non-shrinking excess is reported as a probable leak.
pub struct ResourceLeakProbe {
    collector: Arc<IsolationMetricsCollector>,
    registry: Option<Arc<InstanceRegistry>>,
    samples: Mutex<BoundedHistory<i64>>,
}

impl ResourceLeakProbe {
    pub fn new(
        collector: Arc<IsolationMetricsCollector>,
        registry: Option<Arc<InstanceRegistry>>,
        window: usize,
    ) -> Self {
        Self {
            collector,
            registry,
            samples: Mutex::new(BoundedHistory::new(window)),
        }
    }

    fn sample_excess(&self) -> Option<(i64, bool)> {
        let registry = self.registry.as_ref()?;
        let excess = registry.live_count(ENGINE_INSTANCE) as i64
            - self.collector.get_active_requests() as i64;

        let mut samples = self.samples.lock();
        samples.push(excess);
        let trending = samples.len() == samples.capacity()
            && samples.iter().all(|s| *s > 0)
            && samples.last().copied().unwrap_or(0) >= samples.iter().next().copied().unwrap_or(0);
        Some((excess, trending))
    }
}

#[async_trait]
impl HealthProbe for ResourceLeakProbe {
    fn name(&self) -> &'static str {
        RESOURCE_LEAKS
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let leak_violations = self.collector.count_violations(
            &[ViolationType::MemoryLeak, ViolationType::ResourceLeak],
            LAST_DAY,
        );
        let sample = self.sample_excess();

        let mut result = if leak_violations > 0 {
            HealthCheckResult::new(
                RESOURCE_LEAKS,
                HealthSeverity::Error,
                "leaks_reported",
                format!("{} leak violation(s) in 24h", leak_violations),
            )
            .with_remediation("Release engine resources in cleanup, including on error paths")
        } else {
            HealthCheckResult::healthy(RESOURCE_LEAKS, "no leaks detected")
        };
        result = result
            .with_metric("leak_violations_24h", leak_violations)
            .with_metric("instance_tracking", sample.is_some());

        if let Some((excess, trending)) = sample {
            result = result.with_metric("excess_engine_instances", excess);
            if trending && result.severity < HealthSeverity::Warning {
                result.severity = HealthSeverity::Warning;
                result.status_code = "instances_outliving_requests".into();
                result.message = format!(
                    "{} engine instance(s) alive without an active request",
                    excess
                );
                result = result.with_remediation("Drop engine handles once the factory cleaned them up");
            }
        }
        Ok(result)
    }
}

/// Average instance creation time thresholds
pub struct FactoryPerformanceProbe {
    collector: Arc<IsolationMetricsCollector>,
    warning_ms: f64,
    critical_ms: f64,
}

impl FactoryPerformanceProbe {
    pub fn new(collector: Arc<IsolationMetricsCollector>, warning_ms: f64, critical_ms: f64) -> Self {
        Self {
            collector,
            warning_ms,
            critical_ms,
        }
    }
}

#[async_trait]
impl HealthProbe for FactoryPerformanceProbe {
    fn name(&self) -> &'static str {
        FACTORY_PERFORMANCE
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let Some(avg_ms) = self.collector.get_average_instance_creation_ms() else {
            return Ok(HealthCheckResult::healthy(
                FACTORY_PERFORMANCE,
                "no instance creations recorded",
            ));
        };

        let (severity, status) = if avg_ms < self.warning_ms {
            (HealthSeverity::Healthy, STATUS_OK)
        } else if avg_ms < self.critical_ms {
            (HealthSeverity::Warning, "slow_creation")
        } else {
            (HealthSeverity::Critical, "creation_stalled")
        };

        let mut result = HealthCheckResult::new(
            FACTORY_PERFORMANCE,
            severity,
            status,
            format!("average instance creation {:.1}ms", avg_ms),
        )
        .with_metric("avg_instance_creation_ms", avg_ms)
        .with_metric("warning_threshold_ms", self.warning_ms)
        .with_metric("critical_threshold_ms", self.critical_ms);

        if severity != HealthSeverity::Healthy {
            result = result.with_remediation("Check notification channel setup latency");
        }
        Ok(result)
    }
}

/// Cross-request state and race violations in the last hour, plus load
pub struct ConcurrentRequestSafetyProbe {
    collector: Arc<IsolationMetricsCollector>,
    warning_load: usize,
    critical_load: usize,
}

impl ConcurrentRequestSafetyProbe {
    pub fn new(collector: Arc<IsolationMetricsCollector>, warning_load: usize, critical_load: usize) -> Self {
        Self {
            collector,
            warning_load,
            critical_load,
        }
    }
}

#[async_trait]
impl HealthProbe for ConcurrentRequestSafetyProbe {
    fn name(&self) -> &'static str {
        CONCURRENT_REQUEST_SAFETY
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let cross_state = self
            .collector
            .count_violations(&[ViolationType::CrossRequestState], LAST_HOUR);
        let races = self
            .collector
            .count_violations(&[ViolationType::RaceCondition], LAST_HOUR);
        let load = self.collector.get_active_requests();

        let mut result = if cross_state > 0 {
            HealthCheckResult::new(
                CONCURRENT_REQUEST_SAFETY,
                HealthSeverity::Critical,
                "cross_request_state",
                format!("{} cross-request state violation(s) in the last hour", cross_state),
            )
            .require_alert(true)
            .with_remediation("Keep request state inside the execution context, never in shared statics")
        } else if races > 0 {
            HealthCheckResult::new(
                CONCURRENT_REQUEST_SAFETY,
                HealthSeverity::Error,
                "race_conditions",
                format!("{} race condition(s) in the last hour", races),
            )
            .with_remediation("Audit shared mutable state touched by concurrent requests")
        } else if load >= self.critical_load {
            HealthCheckResult::new(
                CONCURRENT_REQUEST_SAFETY,
                HealthSeverity::Critical,
                "overloaded",
                format!("{} concurrent requests (critical at {})", load, self.critical_load),
            )
            .with_remediation("Shed load or lower per-user engine limits")
        } else if load >= self.warning_load {
            HealthCheckResult::new(
                CONCURRENT_REQUEST_SAFETY,
                HealthSeverity::Warning,
                "high_load",
                format!("{} concurrent requests (warning at {})", load, self.warning_load),
            )
        } else {
            HealthCheckResult::healthy(CONCURRENT_REQUEST_SAFETY, "no concurrency violations")
        };

        result = result
            .with_metric("cross_request_state_1h", cross_state)
            .with_metric("race_conditions_1h", races)
            .with_metric("active_requests", load);
        Ok(result)
    }
}

/// System memory usage thresholds
pub struct MemoryUsageProbe {
    provider: Arc<dyn MemoryStatsProvider>,
    warning_pct: f64,
    critical_pct: f64,
}

impl MemoryUsageProbe {
    pub fn new(provider: Arc<dyn MemoryStatsProvider>, warning_pct: f64, critical_pct: f64) -> Self {
        Self {
            provider,
            warning_pct,
            critical_pct,
        }
    }
}

#[async_trait]
impl HealthProbe for MemoryUsageProbe {
    fn name(&self) -> &'static str {
        MEMORY_USAGE
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        let sample = match self.provider.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                return Ok(HealthCheckResult::new(
                    MEMORY_USAGE,
                    HealthSeverity::Warning,
                    "stats_unavailable",
                    format!("memory stats unavailable: {}", e),
                ));
            }
        };

        let used = sample.used_pct();
        let (severity, status) = if used >= self.critical_pct {
            (HealthSeverity::Critical, "memory_critical")
        } else if used >= self.warning_pct {
            (HealthSeverity::Warning, "memory_high")
        } else {
            (HealthSeverity::Healthy, STATUS_OK)
        };

        let mut result = HealthCheckResult::new(
            MEMORY_USAGE,
            severity,
            status,
            format!("system memory {:.1}% used", used),
        )
        .with_metric("memory_used_pct", used)
        .with_metric("memory_total_bytes", sample.total_bytes);
        if let Some(rss) = sample.process_rss_bytes {
            result = result.with_metric("process_rss_bytes", rss);
        }
        if severity != HealthSeverity::Healthy {
            result = result.with_remediation("Check for engines or contexts retained after cleanup");
        }
        Ok(result)
    }
}

/// The eight built-in probes in their reporting order
pub(crate) fn default_probes(
    settings: &HealthSettings,
    collector: &Arc<IsolationMetricsCollector>,
    registry: Option<&Arc<InstanceRegistry>>,
    connections: Option<Arc<dyn ConnectionStatsProvider>>,
    pools: Option<Arc<dyn PoolStatusProvider>>,
    memory: Arc<dyn MemoryStatsProvider>,
) -> Vec<Arc<dyn HealthProbe>> {
    vec![
        Arc::new(RequestIsolationProbe::new(Arc::clone(collector))),
        Arc::new(SingletonProbe::new(Arc::clone(collector), registry.cloned())),
        Arc::new(WebsocketIsolationProbe::new(Arc::clone(collector), connections)),
        Arc::new(DatabaseSessionProbe::new(Arc::clone(collector), pools)),
        Arc::new(ResourceLeakProbe::new(
            Arc::clone(collector),
            registry.cloned(),
            settings.leak_window,
        )),
        Arc::new(FactoryPerformanceProbe::new(
            Arc::clone(collector),
            settings.creation_warning_ms,
            settings.creation_critical_ms,
        )),
        Arc::new(ConcurrentRequestSafetyProbe::new(
            Arc::clone(collector),
            settings.concurrency_warning,
            settings.concurrency_critical,
        )),
        Arc::new(MemoryUsageProbe::new(
            memory,
            settings.memory_warning_pct,
            settings.memory_critical_pct,
        )),
    ]
}
