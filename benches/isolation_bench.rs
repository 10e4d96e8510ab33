// benches/isolation_bench.rs
//! Benchmarks for the per-request hot paths

use agent_isolation_engine::monitoring::{BufferedAlertSink, IsolationMetricsCollector};
use agent_isolation_engine::runtime::{ExecutionEngineFactory, FactoryConfig};
use agent_isolation_engine::utils::config::CollectorSettings;
use agent_isolation_engine::{UserExecutionContext, ViolationSeverity, ViolationType};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

fn collector() -> Arc<IsolationMetricsCollector> {
    Arc::new(IsolationMetricsCollector::new(
        CollectorSettings::default(),
        Arc::new(BufferedAlertSink::new()),
    ))
}

fn bench_engine_lifecycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("failed to build runtime");
    let factory = ExecutionEngineFactory::builder(FactoryConfig::default())
        .collector(collector())
        .build()
        .expect("failed to build factory");

    c.bench_function("engine_create_and_cleanup", |b| {
        b.to_async(&rt).iter(|| async {
            let ctx = UserExecutionContext::new("bench_user", "bench_thread", "bench_run")
                .expect("valid context");
            let engine = factory.create_for_user(ctx).await.expect("engine");
            black_box(factory.cleanup_engine(&engine).await)
        })
    });

    c.bench_function("engine_lease", |b| {
        b.to_async(&rt).iter(|| async {
            let ctx = UserExecutionContext::new("lease_user", "lease_thread", "lease_run")
                .expect("valid context");
            let lease = factory.lease(ctx).await.expect("engine");
            black_box(lease.release().await)
        })
    });
}

fn bench_violation_recording(c: &mut Criterion) {
    let mut group = c.benchmark_group("violation_recording");

    for active in [0usize, 100, 1_000] {
        let collector = collector();
        for i in 0..active {
            collector.start_request(&format!("user_{}", i % 50), &format!("req_{i}"), None, None);
        }

        group.bench_with_input(BenchmarkId::from_parameter(active), &active, |b, _| {
            b.iter(|| {
                collector.record_isolation_violation(
                    ViolationType::RaceCondition,
                    ViolationSeverity::Warning,
                    Some("req_0"),
                    None,
                    "bench",
                )
            })
        });
    }
    group.finish();
}

fn bench_context_derivation(c: &mut Criterion) {
    let root = UserExecutionContext::new("bench_user", "bench_thread", "bench_run")
        .expect("valid context");

    c.bench_function("create_child", |b| {
        b.iter(|| black_box(root.create_child("tool_call")))
    });
}

criterion_group!(
    benches,
    bench_engine_lifecycle,
    bench_violation_recording,
    bench_context_derivation
);
criterion_main!(benches);
