// src/runtime/mod.rs
//! Per-request execution runtime
//!
//! - **Execution Engine**: one engine per request, bound to its context
//! - **Factory**: engine creation, per-user limits, guaranteed cleanup
//! - **User Limits**: per-user concurrency ceilings with overrides
//! - **Channels**: notification channel collaborator (e.g. WebSocket)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 ExecutionEngineFactory                   │
//! │   user_a: [Engine req_1] [Engine req_2]   (limit 2)      │
//! │   user_b: [Engine req_3]                                 │
//! │        │              │                                  │
//! │   ChannelFactory   IsolationMetricsCollector             │
//! └──────────────────────────────────────────────────────────┘
//!          ▲                   ▲                 ▲
//!   create_for_user      lease() / Drop    user_execution_scope
//! ```
//!
//! Engines are never pooled or shared: each one holds an
//! `Arc<UserExecutionContext>` for a single request and is released
//! through the factory exactly once.

pub mod channel;
pub mod engine;
pub mod factory;
pub mod user_limits;

pub use channel::{
    ChannelEvent, ChannelFactory, InMemoryChannel, InMemoryChannelFactory, NotificationChannel,
};
pub use engine::{EngineResource, EngineState, ExecutionEngine};
pub use factory::{
    EngineLease, ExecutionEngineFactory, FactoryBuilder, FactoryConfig, FactoryMetrics,
    ShutdownReport,
};
pub use user_limits::UserLimits;
