// src/service.rs
//! Composition root
//!
//! Builds one registry, collector, health checker and factory from an
//! [`EngineConfig`] and wires them together. Hosts that need process-wide
//! access install the services once with [`install_global`].

use crate::health::{
    ConnectionStatsProvider, IsolationHealthChecker, MemoryStatsProvider, PoolStatusProvider,
};
use crate::monitoring::{AlertSink, InstanceRegistry, IsolationMetricsCollector, LogAlertSink};
use crate::runtime::{ChannelFactory, ExecutionEngineFactory, FactoryConfig, ShutdownReport};
use crate::utils::config::EngineConfig;
use crate::utils::errors::Result;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::info;

static GLOBAL: OnceCell<Arc<IsolationServices>> = OnceCell::new();

/// Optional collaborators injected into the services
#[derive(Default)]
pub struct ServiceCollaborators {
    pub alert_sink: Option<Arc<dyn AlertSink>>,
    pub channel_factory: Option<Arc<dyn ChannelFactory>>,
    pub connection_stats: Option<Arc<dyn ConnectionStatsProvider>>,
    pub pool_status: Option<Arc<dyn PoolStatusProvider>>,
    pub memory_stats: Option<Arc<dyn MemoryStatsProvider>>,
}

/// The wired isolation services of one process
pub struct IsolationServices {
    config: EngineConfig,
    registry: Arc<InstanceRegistry>,
    collector: Arc<IsolationMetricsCollector>,
    health: Arc<IsolationHealthChecker>,
    factory: ExecutionEngineFactory,
}

impl IsolationServices {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        Self::with_collaborators(config, ServiceCollaborators::default())
    }

    pub fn with_collaborators(config: EngineConfig, collaborators: ServiceCollaborators) -> Result<Self> {
        config.validate()?;

        let registry = InstanceRegistry::new();
        let sink = collaborators
            .alert_sink
            .unwrap_or_else(|| Arc::new(LogAlertSink));

        let collector = Arc::new(
            IsolationMetricsCollector::new(config.collector.clone(), Arc::clone(&sink))
                .registered_in(&registry),
        );

        let mut health = IsolationHealthChecker::builder(config.health.clone(), Arc::clone(&collector))
            .alert_sink(sink)
            .registry(Arc::clone(&registry));
        if let Some(provider) = collaborators.connection_stats {
            health = health.connection_stats(provider);
        }
        if let Some(provider) = collaborators.pool_status {
            health = health.pool_status(provider);
        }
        if let Some(provider) = collaborators.memory_stats {
            health = health.memory_stats(provider);
        }
        let health = Arc::new(health.build());

        let mut factory = ExecutionEngineFactory::builder(FactoryConfig::from(&config.factory))
            .collector(Arc::clone(&collector))
            .registry(Arc::clone(&registry));
        if let Some(channel_factory) = collaborators.channel_factory {
            factory = factory.channel_factory(channel_factory);
        }
        let factory = factory.build()?;

        Ok(Self {
            config,
            registry,
            collector,
            health,
            factory,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn collector(&self) -> &Arc<IsolationMetricsCollector> {
        &self.collector
    }

    pub fn health(&self) -> &Arc<IsolationHealthChecker> {
        &self.health
    }

    pub fn factory(&self) -> &ExecutionEngineFactory {
        &self.factory
    }

    /// Launch the collector and health-check background loops
    pub fn start(&self) {
        self.collector.start();
        self.health.start();
        info!("Isolation services started");
    }

    /// Shut the factory down, then stop both loops; bounded by their timeouts
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.factory.shutdown().await;
        self.health.stop().await;
        self.collector.stop().await;
        info!(
            cleaned = report.cleaned,
            abandoned = report.abandoned,
            "Isolation services shut down"
        );
        report
    }
}

/// Install the process-wide services; returns them back if already set
pub fn install_global(
    services: Arc<IsolationServices>,
) -> std::result::Result<(), Arc<IsolationServices>> {
    GLOBAL.set(services)
}

/// Process-wide services, if installed
pub fn global() -> Option<&'static Arc<IsolationServices>> {
    GLOBAL.get()
}
