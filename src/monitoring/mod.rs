// src/monitoring/mod.rs
//! Isolation monitoring
//!
//! - **Collector**: active/completed request tracking, isolation and
//!   failure-containment scores, periodic snapshots
//! - **Violations**: typed violation events stored in a bounded ring buffer
//! - **Alerts**: cooldown-gated, queue-backed alert delivery
//! - **Registry**: live instance counting for singleton and leak detection
//!
//! # Architecture
//!
//! ```text
//! Factory / request path
//!     │ start_request, record_*, complete_request   (O(1), one lock)
//!     ▼
//! IsolationMetricsCollector ──(every 5s)──► SystemIsolationHealth history
//!     │                                          │
//!     │                                   alert conditions
//!     ▼                                          ▼
//! violation ring buffer               AlertDispatcher ─► AlertQueue ─► AlertSink
//! ```

pub mod alert;
pub mod alert_queue;
pub mod collector;
pub mod history;
pub mod registry;
pub mod request_metrics;
pub mod snapshot;
pub mod status;
pub mod violation;

pub use alert::{
    Alert, AlertDecision, AlertDispatcher, AlertSink, AlertSource, AlertStats, BufferedAlertSink,
    CooldownScope, LogAlertSink,
};
pub use collector::IsolationMetricsCollector;
pub use history::BoundedHistory;
pub use registry::{InstanceGuard, InstanceRegistry};
pub use request_metrics::RequestIsolationMetrics;
pub use snapshot::{SystemIsolationHealth, UserIsolationSummary};
pub use status::HealthSeverity;
pub use violation::{IsolationViolation, ViolationSeverity, ViolationType};
