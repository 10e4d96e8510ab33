// src/health/mod.rs
//! Isolation health checks
//!
//! Eight independent probes, aggregated to the most severe result:
//!
//! ```text
//! IsolationHealthChecker (every 30s)
//! ├─ request_isolation            collector isolation score
//! ├─ singleton_violations         InstanceRegistry + violation counts
//! ├─ websocket_isolation          contamination + ConnectionStatsProvider
//! ├─ database_session_isolation   session leaks + PoolStatusProvider
//! ├─ resource_leaks               live engines vs active requests
//! ├─ factory_performance          average instance creation time
//! ├─ concurrent_request_safety    cross-request state / races / load
//! └─ memory_usage                 MemoryStatsProvider
//!          │
//!          ▼
//! IsolationHealthStatus ─► history ─► AlertDispatcher (own cooldown)
//! ```

pub mod checker;
pub mod collaborators;
pub mod probes;
pub mod result;

pub use checker::{HealthCheckerBuilder, IsolationHealthChecker};
pub use collaborators::{
    ConnectionStatsProvider, MemorySample, MemoryStatsProvider, PoolStatus, PoolStatusProvider,
    PoolUsage, ProcMemoryStats,
};
pub use probes::HealthProbe;
pub use result::{HealthCheckResult, IsolationHealthStatus};
