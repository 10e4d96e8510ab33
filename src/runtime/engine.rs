// src/runtime/engine.rs
//! Per-request execution engine
//!
//! An engine is bound to exactly one [`UserExecutionContext`] for its whole
//! life and owns the resources attached to it (notification channel, tool
//! sessions...). State machine:
//!
//! ```text
//! Created ─► Active ─► Cleaning ─► Cleaned
//! ```
//!
//! A failed release does not send the engine back to `Active`; it still ends
//! in `Cleaned` so the factory's accounting never leaks.

use crate::context::UserExecutionContext;
use crate::monitoring::registry::InstanceGuard;
use crate::monitoring::violation::{ViolationSeverity, ViolationType};
use crate::monitoring::IsolationMetricsCollector;
use crate::runtime::channel::{ChannelEvent, NotificationChannel};
use crate::utils::errors::{ContextError, EngineError, Result};
use crate::utils::new_id;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lifecycle state of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Created,
    Active,
    Cleaning,
    Cleaned,
}

/// Something an engine must release when it is cleaned up
#[async_trait]
pub trait EngineResource: Send + Sync {
    fn name(&self) -> &str;

    async fn release(&self) -> Result<()>;
}

/// Execution engine bound to one request context
pub struct ExecutionEngine {
    engine_id: String,
    context: Arc<UserExecutionContext>,
    state: Mutex<EngineState>,
    channel: Option<Arc<dyn NotificationChannel>>,
    resources: Mutex<Vec<Arc<dyn EngineResource>>>,
    failed: AtomicBool,
    accounted: AtomicBool,
    created_at: Instant,
    collector: Option<Arc<IsolationMetricsCollector>>,
    _instance: Option<InstanceGuard>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("engine_id", &self.engine_id)
            .field("user_id", &self.context.user_id())
            .field("request_id", &self.context.request_id())
            .field("state", &self.state())
            .finish()
    }
}

impl ExecutionEngine {
    pub(crate) fn new(
        context: Arc<UserExecutionContext>,
        channel: Option<Arc<dyn NotificationChannel>>,
        collector: Option<Arc<IsolationMetricsCollector>>,
        instance: Option<InstanceGuard>,
    ) -> Self {
        Self {
            engine_id: new_id("eng"),
            context,
            state: Mutex::new(EngineState::Created),
            channel,
            resources: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            accounted: AtomicBool::new(false),
            created_at: Instant::now(),
            collector,
            _instance: instance,
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn context(&self) -> &Arc<UserExecutionContext> {
        &self.context
    }

    pub fn user_id(&self) -> &str {
        self.context.user_id()
    }

    pub fn request_id(&self) -> &str {
        self.context.request_id()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == EngineState::Active
    }

    pub fn channel(&self) -> Option<&Arc<dyn NotificationChannel>> {
        self.channel.as_ref()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Report the request as failed when the engine is cleaned up
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Attach a resource to release on cleanup; refused once cleanup started
    pub fn attach_resource(&self, resource: Arc<dyn EngineResource>) -> bool {
        let state = self.state.lock();
        if matches!(*state, EngineState::Cleaning | EngineState::Cleaned) {
            return false;
        }
        self.resources.lock().push(resource);
        true
    }

    /// Child context for a sub-operation of this engine's request
    pub fn derive_context(&self, operation_name: &str) -> UserExecutionContext {
        self.context.create_child(operation_name)
    }

    /// Send an event to the engine's user through its channel
    ///
    /// A channel owned by another user is never written to; the attempt is
    /// recorded as a critical contamination violation.
    pub async fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        if !self.is_active() {
            return Err(EngineError::ChannelFailed(format!(
                "engine {} is not active",
                self.engine_id
            )));
        }

        let Some(channel) = &self.channel else {
            debug!(engine_id = %self.engine_id, event_type, "No channel bound, event not sent");
            return Ok(());
        };

        if channel.user_id() != self.user_id() {
            let description = format!(
                "engine {} for user {} attempted to emit `{}` on channel {} owned by {}",
                self.engine_id,
                self.user_id(),
                event_type,
                channel.channel_id(),
                channel.user_id()
            );
            if let Some(collector) = &self.collector {
                collector.record_isolation_violation(
                    ViolationType::WebsocketContamination,
                    ViolationSeverity::Critical,
                    Some(self.request_id()),
                    Some(self.user_id()),
                    &description,
                );
            }
            return Err(ContextError::Isolation(description).into());
        }

        channel
            .send(ChannelEvent {
                event_type: event_type.to_string(),
                user_id: self.user_id().to_string(),
                request_id: self.request_id().to_string(),
                payload,
                sent_at: Utc::now(),
            })
            .await
    }

    pub(crate) fn activate(&self) {
        let mut state = self.state.lock();
        if *state == EngineState::Created {
            *state = EngineState::Active;
        }
    }

    /// Move to `Cleaning`; false when cleanup already started
    pub(crate) fn begin_cleanup(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            EngineState::Created | EngineState::Active => {
                *state = EngineState::Cleaning;
                true
            }
            EngineState::Cleaning | EngineState::Cleaned => false,
        }
    }

    pub(crate) fn finish_cleanup(&self) {
        *self.state.lock() = EngineState::Cleaned;
    }

    pub(crate) fn take_resources(&self) -> Vec<Arc<dyn EngineResource>> {
        std::mem::take(&mut *self.resources.lock())
    }

    /// True exactly once: the caller owns the factory bookkeeping for this engine
    pub(crate) fn claim_accounting(&self) -> bool {
        self.accounted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::BufferedAlertSink;
    use crate::runtime::channel::InMemoryChannel;
    use crate::utils::config::CollectorSettings;

    fn context(user: &str) -> Arc<UserExecutionContext> {
        Arc::new(UserExecutionContext::new(user, &format!("thread_{user}"), "run_1").unwrap())
    }

    #[test]
    fn test_state_transitions() {
        let engine = ExecutionEngine::new(context("user_a"), None, None, None);
        assert_eq!(engine.state(), EngineState::Created);
        engine.activate();
        assert!(engine.is_active());

        assert!(engine.begin_cleanup());
        assert!(!engine.begin_cleanup());
        assert_eq!(engine.state(), EngineState::Cleaning);
        engine.finish_cleanup();
        assert_eq!(engine.state(), EngineState::Cleaned);

        assert!(engine.claim_accounting());
        assert!(!engine.claim_accounting());
    }

    #[tokio::test]
    async fn test_emit_to_own_channel() {
        let channel = Arc::new(InMemoryChannel::new("ws_a", "user_a"));
        let engine = ExecutionEngine::new(context("user_a"), Some(channel.clone()), None, None);
        engine.activate();

        engine
            .emit("agent_thinking", serde_json::json!({"step": 1}))
            .await
            .unwrap();
        let events = channel.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].user_id, "user_a");
        assert_eq!(events[0].request_id, engine.request_id());
    }

    #[tokio::test]
    async fn test_emit_to_foreign_channel_is_blocked() {
        let collector = Arc::new(IsolationMetricsCollector::new(
            CollectorSettings::default(),
            Arc::new(BufferedAlertSink::new()),
        ));
        let ctx = context("user_a");
        collector.start_request("user_a", ctx.request_id(), None, None);

        let foreign = Arc::new(InMemoryChannel::new("ws_b", "user_b"));
        let engine =
            ExecutionEngine::new(ctx, Some(foreign.clone()), Some(collector.clone()), None);
        engine.activate();

        let err = engine.emit("agent_done", Value::Null).await.unwrap_err();
        assert!(err.is_isolation_breach());
        assert!(foreign.events().is_empty());

        let record = collector.get_request_metrics(engine.request_id()).unwrap();
        assert!(!record.websocket_isolated);
    }

    #[tokio::test]
    async fn test_inactive_engine_cannot_emit() {
        let engine = ExecutionEngine::new(context("user_a"), None, None, None);
        assert!(engine.emit("x", Value::Null).await.is_err());
    }

    #[test]
    fn test_resources_refused_after_cleanup() {
        struct Noop;

        #[async_trait]
        impl EngineResource for Noop {
            fn name(&self) -> &str {
                "noop"
            }

            async fn release(&self) -> Result<()> {
                Ok(())
            }
        }

        let engine = ExecutionEngine::new(context("user_a"), None, None, None);
        engine.activate();
        assert!(engine.attach_resource(Arc::new(Noop)));
        engine.begin_cleanup();
        assert!(!engine.attach_resource(Arc::new(Noop)));
        assert_eq!(engine.take_resources().len(), 1);
    }
}
