// src/health/checker.rs
//! Isolation health checker
//!
//! Runs every probe once per pass, aggregates the results into an
//! [`IsolationHealthStatus`], keeps a bounded history and raises
//! cooldown-gated alerts through its own [`AlertDispatcher`].
//!
//! A probe that errors, panics or exceeds `probe_timeout_ms` is reported as
//! an ERROR result with status `probe_failed`; the other probes still run.

use crate::health::collaborators::{
    ConnectionStatsProvider, MemoryStatsProvider, PoolStatusProvider, ProcMemoryStats,
};
use crate::health::probes::{default_probes, HealthProbe};
use crate::health::result::{HealthCheckResult, IsolationHealthStatus};
use crate::monitoring::alert::{
    Alert, AlertDecision, AlertDispatcher, AlertSink, AlertSource, AlertStats, LogAlertSink,
};
use crate::monitoring::history::BoundedHistory;
use crate::monitoring::registry::{InstanceGuard, InstanceRegistry, HEALTH_CHECKER_INSTANCE};
use crate::monitoring::status::HealthSeverity;
use crate::monitoring::IsolationMetricsCollector;
use crate::observability as obs;
use crate::utils::config::HealthSettings;
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Grace period for background tasks on stop
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Alert queue size for the checker's dispatcher
const ALERT_QUEUE_CAPACITY: usize = 64;

/// Builder for [`IsolationHealthChecker`]
pub struct HealthCheckerBuilder {
    settings: HealthSettings,
    collector: Arc<IsolationMetricsCollector>,
    sink: Option<Arc<dyn AlertSink>>,
    registry: Option<Arc<InstanceRegistry>>,
    connections: Option<Arc<dyn ConnectionStatsProvider>>,
    pools: Option<Arc<dyn PoolStatusProvider>>,
    memory: Option<Arc<dyn MemoryStatsProvider>>,
    custom_probes: Vec<Arc<dyn HealthProbe>>,
}

impl HealthCheckerBuilder {
    pub fn new(settings: HealthSettings, collector: Arc<IsolationMetricsCollector>) -> Self {
        Self {
            settings,
            collector,
            sink: None,
            registry: None,
            connections: None,
            pools: None,
            memory: None,
            custom_probes: Vec::new(),
        }
    }

    /// Alert destination (default: [`LogAlertSink`])
    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Registry read by the singleton and leak probes; the checker registers itself
    pub fn registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn connection_stats(mut self, provider: Arc<dyn ConnectionStatsProvider>) -> Self {
        self.connections = Some(provider);
        self
    }

    pub fn pool_status(mut self, provider: Arc<dyn PoolStatusProvider>) -> Self {
        self.pools = Some(provider);
        self
    }

    /// Memory source (default: [`ProcMemoryStats`])
    pub fn memory_stats(mut self, provider: Arc<dyn MemoryStatsProvider>) -> Self {
        self.memory = Some(provider);
        self
    }

    /// Replace the built-in probe with the same name, or append a new one
    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.custom_probes.push(probe);
        self
    }

    pub fn build(self) -> IsolationHealthChecker {
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(ProcMemoryStats::new()));
        let mut probes = default_probes(
            &self.settings,
            &self.collector,
            self.registry.as_ref(),
            self.connections,
            self.pools,
            memory,
        );

        for custom in self.custom_probes {
            match probes.iter_mut().find(|p| p.name() == custom.name()) {
                Some(slot) => *slot = custom,
                None => probes.push(custom),
            }
        }

        let sink = self.sink.unwrap_or_else(|| Arc::new(LogAlertSink));
        let alerts = Arc::new(AlertDispatcher::new(
            AlertSource::HealthChecker,
            sink,
            Duration::from_secs(self.settings.alert_cooldown_secs),
            self.settings.cooldown_scope,
            ALERT_QUEUE_CAPACITY,
        ));

        let instance = self
            .registry
            .as_ref()
            .map(|registry| registry.register(HEALTH_CHECKER_INSTANCE, None));

        info!(
            probes = probes.len(),
            parallel = self.settings.parallel_probes,
            "Isolation health checker initialized"
        );

        IsolationHealthChecker {
            history: Mutex::new(BoundedHistory::new(self.settings.history_limit)),
            settings: self.settings,
            collector: self.collector,
            probes,
            alerts,
            stop: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            _instance: instance,
        }
    }
}

/// Periodic isolation health checker
pub struct IsolationHealthChecker {
    settings: HealthSettings,
    collector: Arc<IsolationMetricsCollector>,
    probes: Vec<Arc<dyn HealthProbe>>,
    history: Mutex<BoundedHistory<IsolationHealthStatus>>,
    alerts: Arc<AlertDispatcher>,
    /// Replaced on every start so the services can be restarted
    stop: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _instance: Option<InstanceGuard>,
}

impl IsolationHealthChecker {
    pub fn builder(
        settings: HealthSettings,
        collector: Arc<IsolationMetricsCollector>,
    ) -> HealthCheckerBuilder {
        HealthCheckerBuilder::new(settings, collector)
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Probe names in reporting order
    pub fn check_names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Run every probe once, store the aggregate and evaluate alerts
    pub async fn run_health_checks(&self) -> IsolationHealthStatus {
        let started = Instant::now();

        let results: Vec<HealthCheckResult> = if self.settings.parallel_probes {
            join_all(self.probes.iter().map(|p| self.run_probe(p.as_ref()))).await
        } else {
            let mut results = Vec::with_capacity(self.probes.len());
            for probe in &self.probes {
                results.push(self.run_probe(probe.as_ref()).await);
            }
            results
        };

        let status = IsolationHealthStatus {
            overall_health: HealthSeverity::worst(results.iter().map(|r| r.severity)),
            isolation_score: self.collector.get_isolation_score(),
            failure_containment_rate: self.collector.get_failure_containment_rate(),
            concurrent_users: self.collector.get_concurrent_users(),
            active_requests: self.collector.get_active_requests(),
            total_violations: self.collector.total_violations(),
            critical_violations_24h: self.collector.get_critical_violation_count(24),
            check_results: results,
            checked_at: Utc::now(),
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        self.history.lock().push(status.clone());

        metrics::gauge!(obs::HEALTH_OVERALL).set(status.overall_health.level());
        metrics::histogram!(obs::HEALTH_CHECK_DURATION_MS).record(status.duration_ms);

        self.evaluate_alerts(&status);

        debug!(
            overall = %status.overall_health,
            duration_ms = status.duration_ms,
            "Isolation health check pass complete"
        );
        status
    }

    /// Run one probe by name; unknown names yield an `unknown_check` result
    pub async fn run_specific_check(&self, check_name: &str) -> HealthCheckResult {
        match self.probes.iter().find(|p| p.name() == check_name) {
            Some(probe) => self.run_probe(probe.as_ref()).await,
            None => HealthCheckResult::unknown_check(check_name, &self.check_names()),
        }
    }

    /// Latest stored pass
    pub fn get_current_health(&self) -> Option<IsolationHealthStatus> {
        self.history.lock().last().cloned()
    }

    /// Up to `limit` most recent passes, oldest first
    pub fn get_health_history(&self, limit: usize) -> Vec<IsolationHealthStatus> {
        self.history.lock().latest(limit).cloned().collect()
    }

    pub fn alert_stats(&self) -> AlertStats {
        self.alerts.stats()
    }

    /// Deliver queued alerts now
    pub async fn flush_alerts(&self) -> usize {
        self.alerts.flush().await
    }

    async fn run_probe(&self, probe: &dyn HealthProbe) -> HealthCheckResult {
        let name = probe.name();
        let started = Instant::now();
        let deadline = Duration::from_millis(self.settings.probe_timeout_ms);

        let outcome = tokio::time::timeout(deadline, AssertUnwindSafe(probe.check()).catch_unwind()).await;
        let mut result = match outcome {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(e))) => {
                warn!(probe = name, error = %e, "Health probe returned an error");
                HealthCheckResult::probe_failed(name, e.to_string())
            }
            Ok(Err(panic)) => {
                let reason = panic_message(panic.as_ref());
                error!(probe = name, reason = %reason, "Health probe panicked");
                HealthCheckResult::probe_failed(name, reason)
            }
            Err(_) => {
                warn!(probe = name, timeout_ms = self.settings.probe_timeout_ms, "Health probe timed out");
                HealthCheckResult::probe_failed(
                    name,
                    format!("timed out after {}ms", self.settings.probe_timeout_ms),
                )
            }
        };

        if result.is_probe_failure() {
            metrics::counter!(obs::PROBE_FAILURES, "probe" => name).increment(1);
        }
        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        result
    }

    fn evaluate_alerts(&self, status: &IsolationHealthStatus) {
        let mut conditions: Vec<String> = status
            .alerts_required()
            .map(|r| format!("{}: {}", r.check_name, r.message))
            .collect();
        let mut severity = status.overall_health;

        if status.overall_health == HealthSeverity::Critical && conditions.is_empty() {
            conditions.push("overall isolation health is CRITICAL".to_string());
        }
        if status.critical_violations_24h > 0 {
            conditions.push(format!(
                "{} critical violation(s) in the last 24h",
                status.critical_violations_24h
            ));
            severity = HealthSeverity::Critical;
        }
        if conditions.is_empty() {
            return;
        }

        let alert = Alert::new(
            AlertSource::HealthChecker,
            severity,
            format!("isolation health {}", status.overall_health),
            conditions,
            serde_json::to_value(status).unwrap_or_default(),
        );
        if self.alerts.raise(alert) == AlertDecision::Queued {
            info!(severity = %severity, "Health alert queued");
        }
    }

    /// Launch the periodic check loop and alert delivery task
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Isolation health checker already started");
            return;
        }

        info!(
            interval_secs = self.settings.check_interval_secs,
            "Starting isolation health checks"
        );

        let stop = CancellationToken::new();
        *self.stop.lock() = stop.clone();
        tasks.push(self.alerts.spawn(stop.child_token()));

        let checker = Arc::clone(self);
        let period = Duration::from_secs(self.settings.check_interval_secs);
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let status = checker.run_health_checks().await;
                        if status.overall_health >= HealthSeverity::Error {
                            warn!(overall = %status.overall_health, "Isolation health degraded");
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
            debug!("Isolation health check loop stopped");
        }));
    }

    /// Signal the background tasks and wait a bounded time for them
    pub async fn stop(&self) {
        self.stop.lock().cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!("Health checker task did not stop in time, aborting");
                task.abort();
            }
        }
        info!("Isolation health checker stopped");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::collaborators::StaticMemoryStats;
    use crate::health::probes::{
        CONCURRENT_REQUEST_SAFETY, FACTORY_PERFORMANCE, MEMORY_USAGE, REQUEST_ISOLATION,
    };
    use crate::health::result::STATUS_UNKNOWN_CHECK;
    use crate::monitoring::{BufferedAlertSink, ViolationSeverity, ViolationType};
    use crate::utils::config::CollectorSettings;
    use crate::utils::errors::{EngineError, Result};
    use async_trait::async_trait;

    fn collector() -> Arc<IsolationMetricsCollector> {
        Arc::new(IsolationMetricsCollector::new(
            CollectorSettings::default(),
            Arc::new(BufferedAlertSink::new()),
        ))
    }

    fn checker(collector: Arc<IsolationMetricsCollector>, sink: Arc<BufferedAlertSink>) -> IsolationHealthChecker {
        IsolationHealthChecker::builder(HealthSettings::default(), collector)
            .alert_sink(sink)
            .memory_stats(Arc::new(StaticMemoryStats::used_pct(40.0)))
            .build()
    }

    struct ErrorProbe;

    #[async_trait]
    impl HealthProbe for ErrorProbe {
        fn name(&self) -> &'static str {
            MEMORY_USAGE
        }

        async fn check(&self) -> Result<HealthCheckResult> {
            Err(EngineError::ProbeFailed("sampler crashed".into()))
        }
    }

    struct PanicProbe;

    #[async_trait]
    impl HealthProbe for PanicProbe {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn check(&self) -> Result<HealthCheckResult> {
            panic!("probe bug");
        }
    }

    #[tokio::test]
    async fn test_healthy_pass() {
        let sink = Arc::new(BufferedAlertSink::new());
        let checker = checker(collector(), sink.clone());

        let status = checker.run_health_checks().await;
        assert_eq!(status.check_results.len(), 8);
        assert_eq!(status.overall_health, HealthSeverity::Healthy);
        assert!(status.is_healthy());

        checker.flush_alerts().await;
        assert!(sink.is_empty());
        assert!(checker.get_current_health().is_some());
    }

    #[tokio::test]
    async fn test_cross_request_state_is_critical() {
        let collector = collector();
        let sink = Arc::new(BufferedAlertSink::new());
        let checker = checker(collector.clone(), sink.clone());

        collector.record_isolation_violation(
            ViolationType::CrossRequestState,
            ViolationSeverity::Critical,
            None,
            None,
            "request state leaked into a shared cache",
        );

        let status = checker.run_health_checks().await;
        assert_eq!(status.overall_health, HealthSeverity::Critical);
        let probe = status.result(CONCURRENT_REQUEST_SAFETY).unwrap();
        assert!(probe.alert_required);

        checker.flush_alerts().await;
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.alerts()[0].severity, HealthSeverity::Critical);
    }

    #[tokio::test]
    async fn test_slow_creation_is_warning() {
        let collector = collector();
        let checker = checker(collector.clone(), Arc::new(BufferedAlertSink::new()));
        for _ in 0..5 {
            collector.record_instance_creation_time("req_1", 150.0);
        }

        let result = checker.run_specific_check(FACTORY_PERFORMANCE).await;
        assert_eq!(result.severity, HealthSeverity::Warning);
    }

    #[tokio::test]
    async fn test_alert_cooldown_between_passes() {
        let collector = collector();
        let sink = Arc::new(BufferedAlertSink::new());
        let checker = checker(collector.clone(), sink.clone());

        collector.record_isolation_violation(
            ViolationType::CrossRequestState,
            ViolationSeverity::Critical,
            None,
            None,
            "shared state",
        );
        checker.run_health_checks().await;
        checker.run_health_checks().await;
        checker.flush_alerts().await;

        assert_eq!(sink.len(), 1);
        assert_eq!(checker.alert_stats().suppressed, 1);
    }

    #[tokio::test]
    async fn test_failing_probe_is_contained() {
        let sink = Arc::new(BufferedAlertSink::new());
        let checker = IsolationHealthChecker::builder(HealthSettings::default(), collector())
            .alert_sink(sink)
            .probe(Arc::new(ErrorProbe))
            .probe(Arc::new(PanicProbe))
            .build();

        let names = checker.check_names();
        assert_eq!(names.len(), 9);
        assert_eq!(names[7], MEMORY_USAGE);

        let status = checker.run_health_checks().await;
        assert_eq!(status.check_results.len(), 9);
        assert_eq!(status.overall_health, HealthSeverity::Error);

        let failed: Vec<&str> = status
            .check_results
            .iter()
            .filter(|r| r.is_probe_failure())
            .map(|r| r.check_name.as_str())
            .collect();
        assert_eq!(failed, vec![MEMORY_USAGE, "panicking"]);
        assert!(status
            .check_results
            .iter()
            .filter(|r| !r.is_probe_failure())
            .all(|r| r.is_healthy()));
    }

    #[tokio::test]
    async fn test_parallel_probes() {
        let settings = HealthSettings {
            parallel_probes: true,
            ..Default::default()
        };
        let checker = IsolationHealthChecker::builder(settings, collector())
            .memory_stats(Arc::new(StaticMemoryStats::used_pct(10.0)))
            .build();

        let status = checker.run_health_checks().await;
        assert_eq!(status.check_results.len(), 8);
        assert_eq!(status.check_results[0].check_name, REQUEST_ISOLATION);
    }

    #[tokio::test]
    async fn test_unknown_check() {
        let checker = checker(collector(), Arc::new(BufferedAlertSink::new()));
        let result = checker.run_specific_check("disk_space").await;
        assert_eq!(result.status_code, STATUS_UNKNOWN_CHECK);
        assert_eq!(result.severity, HealthSeverity::Error);
    }

    #[tokio::test]
    async fn test_history_limit() {
        let settings = HealthSettings {
            history_limit: 2,
            ..Default::default()
        };
        let checker = IsolationHealthChecker::builder(settings, collector())
            .memory_stats(Arc::new(StaticMemoryStats::used_pct(10.0)))
            .build();

        for _ in 0..3 {
            checker.run_health_checks().await;
        }
        assert_eq!(checker.get_health_history(10).len(), 2);
        assert_eq!(checker.get_health_history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_registers_in_registry() {
        let registry = InstanceRegistry::new();
        let checker = IsolationHealthChecker::builder(HealthSettings::default(), collector())
            .registry(registry.clone())
            .build();
        assert_eq!(registry.live_count(HEALTH_CHECKER_INSTANCE), 1);
        drop(checker);
        assert_eq!(registry.live_count(HEALTH_CHECKER_INSTANCE), 0);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let settings = HealthSettings {
            check_interval_secs: 1,
            ..Default::default()
        };
        let checker = Arc::new(
            IsolationHealthChecker::builder(settings, collector())
                .memory_stats(Arc::new(StaticMemoryStats::used_pct(10.0)))
                .build(),
        );
        checker.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        checker.stop().await;
        assert!(checker.get_current_health().is_some());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let checker = Arc::new(
            IsolationHealthChecker::builder(HealthSettings::default(), collector())
                .memory_stats(Arc::new(StaticMemoryStats::used_pct(10.0)))
                .build(),
        );
        checker.start();
        checker.stop().await;
        let passes = checker.get_health_history(10).len();

        checker.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(checker.get_health_history(10).len() > passes);
        assert!(checker.tasks.lock().iter().all(|task| !task.is_finished()));
        checker.stop().await;
    }
}
