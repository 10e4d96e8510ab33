// tests/isolation_scenarios.rs
//! End-to-end isolation scenarios across the factory, collector and health checker

use agent_isolation_engine::context::UserExecutionContext;
use agent_isolation_engine::health::collaborators::StaticMemoryStats;
use agent_isolation_engine::health::probes::{
    CONCURRENT_REQUEST_SAFETY, FACTORY_PERFORMANCE, WEBSOCKET_ISOLATION,
};
use agent_isolation_engine::health::{HealthCheckResult, HealthProbe, IsolationHealthChecker};
use agent_isolation_engine::monitoring::{
    BufferedAlertSink, CooldownScope, HealthSeverity, IsolationMetricsCollector,
    ViolationSeverity, ViolationType,
};
use agent_isolation_engine::runtime::{
    ChannelFactory, ExecutionEngineFactory, FactoryConfig, InMemoryChannel, NotificationChannel,
    UserLimits,
};
use agent_isolation_engine::utils::config::{CollectorSettings, HealthSettings};
use agent_isolation_engine::{ContextError, EngineError, FactoryError, Result};
use async_trait::async_trait;
use std::sync::Arc;

fn ctx(user: &str, thread: &str, run: &str) -> UserExecutionContext {
    UserExecutionContext::new(user, thread, run).unwrap()
}

fn collector_with(sink: Arc<BufferedAlertSink>) -> Arc<IsolationMetricsCollector> {
    Arc::new(IsolationMetricsCollector::new(CollectorSettings::default(), sink))
}

fn checker_for(
    collector: Arc<IsolationMetricsCollector>,
    sink: Arc<BufferedAlertSink>,
) -> IsolationHealthChecker {
    IsolationHealthChecker::builder(HealthSettings::default(), collector)
        .alert_sink(sink)
        .memory_stats(Arc::new(StaticMemoryStats::used_pct(30.0)))
        .build()
}

#[tokio::test]
async fn concurrent_users_rise_and_fall() {
    let collector = collector_with(Arc::new(BufferedAlertSink::new()));

    for (i, user) in ["alice", "bob", "carol"].iter().enumerate() {
        collector.start_request(user, &format!("req_{i}"), None, None);
    }
    assert_eq!(collector.get_concurrent_users(), 3);

    for i in 0..3 {
        assert!(collector.complete_request(&format!("req_{i}"), true).is_some());
    }
    assert_eq!(collector.get_concurrent_users(), 0);
    assert_eq!(collector.get_active_requests(), 0);
    assert_eq!(collector.get_isolation_score(), 100.0);
}

#[tokio::test]
async fn cross_request_state_makes_health_critical() {
    let collector = collector_with(Arc::new(BufferedAlertSink::new()));
    let sink = Arc::new(BufferedAlertSink::new());
    let checker = checker_for(collector.clone(), sink.clone());

    collector.record_isolation_violation(
        ViolationType::CrossRequestState,
        ViolationSeverity::Critical,
        None,
        None,
        "conversation history shared between requests",
    );

    let status = checker.run_health_checks().await;
    assert_eq!(status.overall_health, HealthSeverity::Critical);
    assert!(status.result(CONCURRENT_REQUEST_SAFETY).unwrap().alert_required);

    checker.flush_alerts().await;
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn slow_instance_creation_warns() {
    let collector = collector_with(Arc::new(BufferedAlertSink::new()));
    let checker = checker_for(collector.clone(), Arc::new(BufferedAlertSink::new()));

    for i in 0..5 {
        collector.record_instance_creation_time(&format!("req_{i}"), 150.0);
    }

    let status = checker.run_health_checks().await;
    let probe = status.result(FACTORY_PERFORMANCE).unwrap();
    assert_eq!(probe.severity, HealthSeverity::Warning);
    let slow = collector.count_violations(
        &[ViolationType::SlowInstanceCreation],
        std::time::Duration::from_secs(60),
    );
    assert_eq!(slow, 5);
}

#[tokio::test]
async fn alerts_within_cooldown_are_emitted_once() {
    let sink = Arc::new(BufferedAlertSink::new());
    let collector = collector_with(sink.clone());

    collector.record_isolation_violation(
        ViolationType::SingletonViolation,
        ViolationSeverity::Critical,
        None,
        None,
        "agent registry shared across users",
    );
    collector.aggregate_once();
    collector.record_isolation_violation(
        ViolationType::SingletonViolation,
        ViolationSeverity::Critical,
        None,
        None,
        "agent registry shared across users again",
    );
    collector.aggregate_once();

    collector.flush_alerts().await;
    assert_eq!(sink.len(), 1);

    let stats = collector.alert_stats();
    assert_eq!(stats.raised, 2);
    assert_eq!(stats.suppressed, 1);
}

#[tokio::test]
async fn per_category_cooldown_lets_escalation_through() {
    let sink = Arc::new(BufferedAlertSink::new());
    let collector = Arc::new(IsolationMetricsCollector::new(
        CollectorSettings {
            cooldown_scope: CooldownScope::PerCategory,
            ..Default::default()
        },
        sink.clone(),
    ));

    // WARNING: slow creation only
    collector.record_instance_creation_time("req_slow", 500.0);
    collector.aggregate_once();

    // CRITICAL inside the same window is a different category
    collector.record_isolation_violation(
        ViolationType::WebsocketContamination,
        ViolationSeverity::Critical,
        None,
        Some("alice"),
        "event sent to bob's socket",
    );
    collector.aggregate_once();

    collector.flush_alerts().await;
    let severities: Vec<HealthSeverity> = sink.alerts().iter().map(|a| a.severity).collect();
    assert_eq!(severities, vec![HealthSeverity::Warning, HealthSeverity::Critical]);
}

struct BrokenProbe;

#[async_trait]
impl HealthProbe for BrokenProbe {
    fn name(&self) -> &'static str {
        "database_session_isolation"
    }

    async fn check(&self) -> Result<HealthCheckResult> {
        Err(EngineError::CollaboratorUnavailable("pool introspection failed".into()))
    }
}

#[tokio::test]
async fn failing_probe_does_not_stop_the_others() {
    let collector = collector_with(Arc::new(BufferedAlertSink::new()));
    let checker = IsolationHealthChecker::builder(HealthSettings::default(), collector)
        .memory_stats(Arc::new(StaticMemoryStats::used_pct(30.0)))
        .probe(Arc::new(BrokenProbe))
        .build();

    let status = checker.run_health_checks().await;
    assert_eq!(status.check_results.len(), 8);

    let failed: Vec<&HealthCheckResult> = status
        .check_results
        .iter()
        .filter(|r| r.is_probe_failure())
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].check_name, "database_session_isolation");
    assert_eq!(failed[0].severity, HealthSeverity::Error);

    assert_eq!(
        status.check_results.iter().filter(|r| r.is_healthy()).count(),
        7
    );
    assert_eq!(status.overall_health, HealthSeverity::Error);
}

#[tokio::test]
async fn user_limit_then_cleanup_frees_a_slot() {
    let config = FactoryConfig {
        limits: UserLimits {
            max_engines_per_user: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let factory = ExecutionEngineFactory::new(config).unwrap();

    let mut engines = Vec::new();
    for i in 0..3 {
        engines.push(
            factory
                .create_for_user(ctx("alice", "thread_1", &format!("run_{i}")))
                .await
                .unwrap(),
        );
    }

    let err = factory
        .create_for_user(ctx("alice", "thread_1", "run_3"))
        .await
        .unwrap_err();
    assert!(err.is_capacity());
    assert!(err.is_retryable());

    factory.cleanup_engine(&engines[0]).await;
    assert!(factory
        .create_for_user(ctx("alice", "thread_1", "run_4"))
        .await
        .is_ok());
}

#[tokio::test]
async fn cleanup_twice_does_not_double_count() {
    let factory = ExecutionEngineFactory::new(FactoryConfig::default()).unwrap();
    let engine = factory
        .create_for_user(ctx("alice", "thread_1", "run_1"))
        .await
        .unwrap();

    assert!(factory.cleanup_engine(&engine).await);
    assert!(!factory.cleanup_engine(&engine).await);

    let metrics = factory.get_factory_metrics();
    assert_eq!(metrics.engines_cleaned, 1);
    assert_eq!(metrics.engines_active, 0);
}

#[tokio::test]
async fn factory_counters_stay_consistent_under_concurrency() {
    let factory = ExecutionEngineFactory::new(FactoryConfig::default()).unwrap();
    let mut handles = Vec::new();

    for u in 0..8 {
        let factory = factory.clone();
        handles.push(tokio::spawn(async move {
            for r in 0..10 {
                let user = format!("user_{u}");
                let context = ctx(&user, &format!("thread_{u}"), &format!("run_{r}"));
                if let Ok(engine) = factory.create_for_user(context).await {
                    assert!(engine.is_active());
                    tokio::task::yield_now().await;
                    factory.cleanup_engine(&engine).await;
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let metrics = factory.get_factory_metrics();
    assert_eq!(metrics.engines_created - metrics.engines_cleaned, metrics.engines_active);
    assert_eq!(metrics.engines_created, 80);
    assert_eq!(metrics.engines_cleaned, 80);
    assert_eq!(metrics.engines_active, 0);
    assert_eq!(metrics.total_users, 0);
}

#[tokio::test]
async fn shutdown_is_terminal() {
    let factory = ExecutionEngineFactory::new(FactoryConfig::default()).unwrap();
    factory
        .create_for_user(ctx("alice", "thread_1", "run_1"))
        .await
        .unwrap();

    let report = factory.shutdown().await;
    assert_eq!(report.cleaned, 1);

    let err = factory
        .create_for_user(ctx("bob", "thread_2", "run_1"))
        .await
        .unwrap_err();
    assert_eq!(err, FactoryError::ShutDown);
    assert!(!err.is_retryable());
}

#[test]
fn contexts_of_different_users_must_not_share_a_thread() {
    let alice = ctx("alice", "thread_shared", "run_1");
    let bob = ctx("bob", "thread_shared", "run_2");
    assert!(matches!(
        alice.validate_isolation_integrity(&bob),
        Err(ContextError::Isolation(_))
    ));

    let carol = ctx("carol", "thread_carol", "run_3");
    assert!(alice.validate_isolation_integrity(&carol).is_ok());
}

/// Channel factory that hands every engine the same user's socket
struct MisroutingChannelFactory {
    victim: Arc<InMemoryChannel>,
}

#[async_trait]
impl ChannelFactory for MisroutingChannelFactory {
    async fn create_channel(
        &self,
        _context: &UserExecutionContext,
    ) -> Result<Arc<dyn NotificationChannel>> {
        Ok(self.victim.clone())
    }
}

#[tokio::test]
async fn misrouted_channel_is_blocked_and_reported() {
    let collector = collector_with(Arc::new(BufferedAlertSink::new()));
    let victim = Arc::new(InMemoryChannel::new("ws_bob", "bob"));
    let factory = ExecutionEngineFactory::builder(FactoryConfig::default())
        .collector(collector.clone())
        .channel_factory(Arc::new(MisroutingChannelFactory {
            victim: victim.clone(),
        }))
        .build()
        .unwrap();

    let engine = factory
        .create_for_user(ctx("alice", "thread_1", "run_1"))
        .await
        .unwrap();
    let err = engine
        .emit("agent_completed", serde_json::json!({"answer": "secret"}))
        .await
        .unwrap_err();
    assert!(err.is_isolation_breach());
    assert!(victim.events().is_empty());

    let checker = checker_for(collector.clone(), Arc::new(BufferedAlertSink::new()));
    let result = checker.run_specific_check(WEBSOCKET_ISOLATION).await;
    assert_eq!(result.severity, HealthSeverity::Critical);

    factory.cleanup_engine(&engine).await;
    let record = collector.get_request_metrics(engine.request_id()).unwrap();
    assert!(!record.websocket_isolated);
    assert!(record.isolation_score < 100.0);
}

#[tokio::test]
async fn late_violation_after_completion_is_kept_globally() {
    let collector = collector_with(Arc::new(BufferedAlertSink::new()));
    collector.start_request("alice", "req_1", None, None);
    collector.complete_request("req_1", true);

    collector.record_isolation_violation(
        ViolationType::RaceCondition,
        ViolationSeverity::Error,
        Some("req_1"),
        Some("alice"),
        "late write after completion",
    );

    assert_eq!(collector.total_violations(), 1);
    let record = collector.get_request_metrics("req_1").unwrap();
    assert!(record.violations.is_empty());
    assert_eq!(record.isolation_score, 100.0);
    assert_eq!(collector.get_isolation_score(), 100.0);
}
