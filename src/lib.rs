// src/lib.rs
//! Agent Isolation Engine Library
//!
//! Per-request execution isolation for multi-tenant agent execution:
//! every request gets its own immutable identity context and its own
//! execution engine, and the isolation guarantees are continuously
//! measured and health-checked.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **context**: Immutable per-request identity with child derivation
//! - **runtime**: Execution engines, the factory and per-user limits
//! - **monitoring**: Isolation metrics, violations, alerts, instance registry
//! - **health**: Isolation health probes and the periodic checker
//! - **service**: Composition root wiring everything from configuration
//! - **observability**: Tracing and metrics initialization
//! - **utils**: Configuration, errors and identifiers

// Public module exports
pub mod context;
pub mod health;
pub mod monitoring;
pub mod observability;
pub mod runtime;
pub mod service;
pub mod utils;

// Re-export commonly used types
pub use context::UserExecutionContext;
pub use health::{HealthCheckResult, IsolationHealthChecker, IsolationHealthStatus};
pub use monitoring::{
    HealthSeverity, IsolationMetricsCollector, ViolationSeverity, ViolationType,
};
pub use runtime::{EngineLease, ExecutionEngine, ExecutionEngineFactory, FactoryConfig};
pub use service::IsolationServices;
pub use utils::config::EngineConfig;
pub use utils::errors::{ContextError, EngineError, FactoryError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
