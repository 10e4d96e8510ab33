// src/runtime/factory.rs
//! Execution engine factory
//!
//! Mints one [`ExecutionEngine`] per request, enforces per-user concurrency
//! limits and guarantees cleanup on every exit path.
//!
//! # Architecture
//!
//! ```text
//! ExecutionEngineFactory (Clone, Arc inside)
//! ├─ engines:  DashMap<engine_id, Arc<ExecutionEngine>>   (live engines)
//! ├─ counters: Mutex<per_user, created, cleaned, ...>     (single lock for
//! │                                                        check-and-reserve)
//! ├─ channel_factory ─► NotificationChannel per engine
//! └─ collector       ─► start_request / creation time / complete_request
//! ```
//!
//! Exit paths: explicit [`ExecutionEngineFactory::cleanup_engine`], the
//! [`EngineLease`] guard (drop, including cancellation), and
//! [`ExecutionEngineFactory::user_execution_scope`] (Ok, Err or panic).
//!
//! `engines_created - engines_cleaned == engines_active` holds at every
//! observable point.
//!
//! Both `create_for_user` and `cleanup_engine` may be cancelled at any await.
//! A dropped creation releases its slot through [`SlotReservation`]; a
//! dropped cleanup finalizes the engine through [`CleanupGuard`].

use crate::context::UserExecutionContext;
use crate::monitoring::registry::{InstanceRegistry, ENGINE_INSTANCE};
use crate::monitoring::IsolationMetricsCollector;
use crate::observability as obs;
use crate::runtime::channel::ChannelFactory;
use crate::runtime::engine::{EngineState, ExecutionEngine};
use crate::runtime::user_limits::UserLimits;
use crate::utils::config::FactorySettings;
use crate::utils::errors::{EngineError, FactoryError, Result};
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Configuration for the engine factory
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Per-user concurrency ceilings
    pub limits: UserLimits,

    /// Hard deadline for [`ExecutionEngineFactory::shutdown`] (default: 10s)
    pub shutdown_timeout: Duration,

    /// Deadline for releasing a single engine resource (default: 5s)
    pub cleanup_timeout: Duration,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            limits: UserLimits::default(),
            shutdown_timeout: Duration::from_secs(10),
            cleanup_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&FactorySettings> for FactoryConfig {
    fn from(settings: &FactorySettings) -> Self {
        Self {
            limits: UserLimits::from(settings),
            shutdown_timeout: settings.shutdown_timeout(),
            cleanup_timeout: settings.cleanup_timeout(),
        }
    }
}

/// Factory statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactoryMetrics {
    pub engines_created: u64,
    pub engines_active: u64,
    pub engines_cleaned: u64,
    /// Users holding at least one engine (or a reservation for one)
    pub total_users: usize,
    pub cleanup_failures: u64,
    pub rejections: u64,
}

/// Outcome of [`ExecutionEngineFactory::shutdown`]
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub cleaned: usize,
    pub abandoned: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct FactoryCounters {
    per_user: HashMap<String, usize>,
    created: u64,
    cleaned: u64,
    cleanup_failures: u64,
    rejections: u64,
}

impl FactoryCounters {
    fn release_slot(&mut self, user_id: &str) {
        if let Some(count) = self.per_user.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_user.remove(user_id);
            }
        }
    }

    fn active(&self) -> u64 {
        self.created.saturating_sub(self.cleaned)
    }
}

struct FactoryInner {
    config: FactoryConfig,
    engines: DashMap<String, Arc<ExecutionEngine>>,
    counters: Mutex<FactoryCounters>,
    shutting_down: AtomicBool,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    collector: Option<Arc<IsolationMetricsCollector>>,
    registry: Option<Arc<InstanceRegistry>>,
}

/// Builder wiring the factory's optional collaborators
pub struct FactoryBuilder {
    config: FactoryConfig,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    collector: Option<Arc<IsolationMetricsCollector>>,
    registry: Option<Arc<InstanceRegistry>>,
}

impl FactoryBuilder {
    pub fn channel_factory(mut self, channel_factory: Arc<dyn ChannelFactory>) -> Self {
        self.channel_factory = Some(channel_factory);
        self
    }

    pub fn collector(mut self, collector: Arc<IsolationMetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn registry(mut self, registry: Arc<InstanceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<ExecutionEngineFactory> {
        self.config
            .limits
            .validate()
            .map_err(EngineError::ConfigError)?;

        info!(
            max_engines_per_user = self.config.limits.max_engines_per_user,
            overrides = self.config.limits.overrides.len(),
            "Execution engine factory initialized"
        );

        Ok(ExecutionEngineFactory {
            inner: Arc::new(FactoryInner {
                config: self.config,
                engines: DashMap::new(),
                counters: Mutex::new(FactoryCounters::default()),
                shutting_down: AtomicBool::new(false),
                channel_factory: self.channel_factory,
                collector: self.collector,
                registry: self.registry,
            }),
        })
    }
}

/// Per-request execution engine factory
#[derive(Clone)]
pub struct ExecutionEngineFactory {
    inner: Arc<FactoryInner>,
}

impl ExecutionEngineFactory {
    pub fn builder(config: FactoryConfig) -> FactoryBuilder {
        FactoryBuilder {
            config,
            channel_factory: None,
            collector: None,
            registry: None,
        }
    }

    /// Factory without channel, collector or registry
    pub fn new(config: FactoryConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.inner.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Create an engine bound to `context`
    ///
    /// Fails with [`FactoryError::UserLimitExceeded`] when the user already
    /// holds their maximum number of engines. The check and the reservation
    /// happen under one lock, so concurrent calls for one user never exceed
    /// the limit.
    pub async fn create_for_user(
        &self,
        context: impl Into<Arc<UserExecutionContext>>,
    ) -> std::result::Result<Arc<ExecutionEngine>, FactoryError> {
        let context: Arc<UserExecutionContext> = context.into();
        let inner = &self.inner;
        let user_id = context.user_id();
        let request_id = context.request_id();

        if self.is_shutting_down() {
            return Err(self.reject(FactoryError::ShutDown));
        }
        let reservation = self.reserve_slot(user_id, request_id)?;

        let started = Instant::now();
        if let Some(collector) = &inner.collector {
            collector.start_request(
                user_id,
                request_id,
                Some(context.thread_id()),
                Some(context.run_id()),
            );
        }

        let channel = match &inner.channel_factory {
            None => None,
            Some(channel_factory) => match channel_factory.create_channel(&context).await {
                Ok(channel) => Some(channel),
                Err(e) => {
                    warn!(user_id, request_id, error = %e, "Notification channel unavailable");
                    drop(reservation);
                    return Err(self.reject(FactoryError::ChannelUnavailable(e.to_string())));
                }
            },
        };

        if self.is_shutting_down() {
            if let Some(channel) = &channel {
                if let Err(e) = channel.close().await {
                    debug!(request_id, error = %e, "Closing channel of aborted engine failed");
                }
            }
            drop(reservation);
            return Err(self.reject(FactoryError::ShutDown));
        }

        let instance = inner
            .registry
            .as_ref()
            .map(|registry| registry.register(ENGINE_INSTANCE, Some(user_id)));
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&context),
            channel,
            inner.collector.clone(),
            instance,
        ));
        engine.activate();

        let active = {
            let mut counters = inner.counters.lock();
            counters.created += 1;
            counters.active()
        };
        inner
            .engines
            .insert(engine.engine_id().to_string(), Arc::clone(&engine));
        // From here the engine owns the slot
        reservation.commit();

        // shutdown() may have taken its snapshot before the insert
        if self.is_shutting_down() {
            self.cleanup_engine(&engine).await;
            return Err(self.reject(FactoryError::ShutDown));
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match &inner.collector {
            Some(collector) => collector.record_instance_creation_time(request_id, elapsed_ms),
            None => metrics::histogram!(obs::INSTANCE_CREATION_MS).record(elapsed_ms),
        }
        metrics::counter!(obs::ENGINES_CREATED).increment(1);
        metrics::gauge!(obs::ENGINES_ACTIVE).set(active as f64);

        info!(
            engine_id = %engine.engine_id(),
            user_id,
            request_id,
            elapsed_ms,
            "Execution engine created"
        );
        Ok(engine)
    }

    /// Release everything the engine holds
    ///
    /// Returns true when this call performed the cleanup; later calls are
    /// no-ops. Resource release failures are logged and counted, and the
    /// bookkeeping runs regardless.
    pub async fn cleanup_engine(&self, engine: &ExecutionEngine) -> bool {
        if !engine.begin_cleanup() {
            debug!(engine_id = %engine.engine_id(), "Engine already cleaned up");
            return false;
        }

        let started = Instant::now();
        self.inner.engines.remove(engine.engine_id());

        let guard = CleanupGuard {
            factory: self,
            engine,
            armed: true,
        };
        let failures = self.release_resources(engine).await;
        guard.disarm();
        engine.finish_cleanup();
        self.finalize(engine, failures);

        debug!(
            engine_id = %engine.engine_id(),
            user_id = %engine.user_id(),
            failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Execution engine cleaned up"
        );
        true
    }

    /// Create an engine wrapped in a guard that cleans it up when dropped
    pub async fn lease(
        &self,
        context: impl Into<Arc<UserExecutionContext>>,
    ) -> std::result::Result<EngineLease, FactoryError> {
        let engine = self.create_for_user(context).await?;
        Ok(EngineLease {
            factory: self.clone(),
            engine,
            released: false,
        })
    }

    /// Run `scope` with a fresh engine and clean it up on every exit path
    ///
    /// An `Err` or a panic marks the request failed before cleanup. Panics
    /// are resumed after cleanup.
    pub async fn user_execution_scope<F, Fut, T>(
        &self,
        context: impl Into<Arc<UserExecutionContext>>,
        scope: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<ExecutionEngine>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lease = self.lease(context).await?;
        let engine = Arc::clone(lease.engine());

        let outcome = AssertUnwindSafe(async move { scope(engine).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => {
                if result.is_err() {
                    lease.mark_failed();
                }
                lease.release().await;
                result
            }
            Err(panic) => {
                error!(
                    engine_id = %lease.engine_id(),
                    user_id = %lease.user_id(),
                    "Execution scope panicked, cleaning up engine"
                );
                lease.mark_failed();
                lease.release().await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Get factory statistics
    pub fn get_factory_metrics(&self) -> FactoryMetrics {
        let counters = self.inner.counters.lock();
        FactoryMetrics {
            engines_created: counters.created,
            engines_active: counters.active(),
            engines_cleaned: counters.cleaned,
            total_users: counters.per_user.len(),
            cleanup_failures: counters.cleanup_failures,
            rejections: counters.rejections,
        }
    }

    pub fn get_engine(&self, engine_id: &str) -> Option<Arc<ExecutionEngine>> {
        self.inner
            .engines
            .get(engine_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Engines held by `user_id`, including ones still being created
    pub fn active_engines_for(&self, user_id: &str) -> usize {
        self.inner
            .counters
            .lock()
            .per_user
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Stop accepting engines and clean up every live one
    ///
    /// Engines whose cleanup misses `shutdown_timeout` are abandoned: their
    /// resources may leak but their bookkeeping is finalized.
    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Factory shutdown already requested");
        }

        let engines: Vec<Arc<ExecutionEngine>> = self
            .inner
            .engines
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        info!(engines = engines.len(), "Shutting down execution engine factory");

        let finished = AtomicUsize::new(0);
        let finished_ref = &finished;
        let cleanups = join_all(engines.iter().map(|engine| async move {
            self.cleanup_engine(engine).await;
            finished_ref.fetch_add(1, Ordering::Relaxed);
        }));
        // Cleanups still pending at the deadline are dropped and abandon their engine
        if timeout(self.inner.config.shutdown_timeout, cleanups)
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.inner.config.shutdown_timeout.as_secs(),
                "Factory shutdown deadline exceeded"
            );
        }

        let cleaned = finished.load(Ordering::Relaxed);
        let abandoned = engines.len().saturating_sub(cleaned);

        let report = ShutdownReport {
            cleaned,
            abandoned,
            elapsed: started.elapsed(),
        };
        info!(
            cleaned = report.cleaned,
            abandoned = report.abandoned,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Execution engine factory shut down"
        );
        report
    }

    fn reserve_slot<'a>(
        &'a self,
        user_id: &'a str,
        request_id: &'a str,
    ) -> std::result::Result<SlotReservation<'a>, FactoryError> {
        let limit = self.inner.config.limits.limit_for(user_id);
        let mut counters = self.inner.counters.lock();
        let active = counters.per_user.get(user_id).copied().unwrap_or(0);

        if active >= limit {
            drop(counters);
            warn!(user_id, active, limit, "Per-user engine limit reached");
            return Err(self.reject(FactoryError::UserLimitExceeded {
                user_id: user_id.to_string(),
                active,
                limit,
            }));
        }

        *counters.per_user.entry(user_id.to_string()).or_insert(0) += 1;
        Ok(SlotReservation {
            factory: self,
            user_id,
            request_id,
            committed: false,
        })
    }

    fn reject(&self, err: FactoryError) -> FactoryError {
        self.inner.counters.lock().rejections += 1;
        let reason = match &err {
            FactoryError::UserLimitExceeded { .. } => "user_limit",
            FactoryError::ChannelUnavailable(_) => "channel_unavailable",
            FactoryError::ShutDown => "shut_down",
        };
        metrics::counter!(obs::ENGINES_REJECTED, "reason" => reason).increment(1);
        err
    }

    /// Undo a reservation for an engine that was never created
    fn abort_creation(&self, user_id: &str, request_id: &str) {
        self.inner.counters.lock().release_slot(user_id);
        if let Some(collector) = &self.inner.collector {
            collector.complete_request(request_id, false);
        }
    }

    async fn release_resources(&self, engine: &ExecutionEngine) -> u64 {
        let mut failures = 0;
        if let Some(channel) = engine.channel() {
            if !self
                .release_step(engine, "notification_channel", channel.close())
                .await
            {
                failures += 1;
            }
        }
        for resource in engine.take_resources() {
            if !self
                .release_step(engine, resource.name(), resource.release())
                .await
            {
                failures += 1;
            }
        }
        failures
    }

    async fn release_step<F>(&self, engine: &ExecutionEngine, resource: &str, release: F) -> bool
    where
        F: Future<Output = Result<()>>,
    {
        let deadline = self.inner.config.cleanup_timeout;
        match timeout(deadline, AssertUnwindSafe(release).catch_unwind()).await {
            Ok(Ok(Ok(()))) => true,
            Ok(Ok(Err(e))) => {
                warn!(engine_id = %engine.engine_id(), resource, error = %e, "Resource release failed");
                false
            }
            Ok(Err(_)) => {
                error!(engine_id = %engine.engine_id(), resource, "Resource release panicked");
                false
            }
            Err(_) => {
                warn!(
                    engine_id = %engine.engine_id(),
                    resource,
                    timeout_ms = deadline.as_millis() as u64,
                    "Resource release timed out"
                );
                false
            }
        }
    }

    /// Factory bookkeeping for a cleaned engine; runs once per engine
    fn finalize(&self, engine: &ExecutionEngine, failures: u64) -> bool {
        if !engine.claim_accounting() {
            return false;
        }

        let active = {
            let mut counters = self.inner.counters.lock();
            counters.cleaned += 1;
            counters.cleanup_failures += failures;
            counters.release_slot(engine.user_id());
            counters.active()
        };

        if let Some(collector) = &self.inner.collector {
            collector.complete_request(engine.request_id(), !engine.has_failed());
        }

        metrics::counter!(obs::ENGINES_CLEANED).increment(1);
        metrics::gauge!(obs::ENGINES_ACTIVE).set(active as f64);
        if failures > 0 {
            metrics::counter!(obs::ENGINE_CLEANUP_FAILURES).increment(failures);
        }
        true
    }

    /// Finalize bookkeeping without waiting for resources
    fn abandon(&self, engine: &ExecutionEngine) -> bool {
        warn!(
            engine_id = %engine.engine_id(),
            user_id = %engine.user_id(),
            "Abandoning engine, resources may not be released"
        );
        engine.mark_failed();
        engine.finish_cleanup();
        self.inner.engines.remove(engine.engine_id());
        self.finalize(engine, 1)
    }
}

/// Per-user slot held while an engine is being created
///
/// Dropped without [`SlotReservation::commit`] (error return or cancelled
/// creation), it gives the slot back and closes the collector record.
struct SlotReservation<'a> {
    factory: &'a ExecutionEngineFactory,
    user_id: &'a str,
    request_id: &'a str,
    committed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(
                user_id = self.user_id,
                request_id = self.request_id,
                "Engine creation abandoned, releasing slot"
            );
            self.factory.abort_creation(self.user_id, self.request_id);
        }
    }
}

/// Finalizes an engine whose cleanup future is dropped before completing
struct CleanupGuard<'a> {
    factory: &'a ExecutionEngineFactory,
    engine: &'a ExecutionEngine,
    armed: bool,
}

impl CleanupGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.factory.abandon(self.engine);
        }
    }
}

/// Engine guard returned by [`ExecutionEngineFactory::lease`]
///
/// Dropping the lease without calling [`EngineLease::release`] spawns the
/// cleanup on the current Tokio runtime. Outside a runtime only the
/// bookkeeping is finalized.
pub struct EngineLease {
    factory: ExecutionEngineFactory,
    engine: Arc<ExecutionEngine>,
    released: bool,
}

impl EngineLease {
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Clean up now; returns whether this call performed the cleanup
    pub async fn release(mut self) -> bool {
        self.released = true;
        self.factory.cleanup_engine(&self.engine).await
    }
}

impl Deref for EngineLease {
    type Target = ExecutionEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if self.released || self.engine.state() == EngineState::Cleaned {
            return;
        }

        let factory = self.factory.clone();
        let engine = Arc::clone(&self.engine);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    factory.cleanup_engine(&engine).await;
                });
            }
            Err(_) => {
                warn!(
                    engine_id = %engine.engine_id(),
                    "Engine lease dropped outside a runtime, resources not released"
                );
                factory.abandon(&engine);
            }
        }
    }
}
