// src/runtime/channel.rs
//! Notification channel collaborator (e.g. a user's WebSocket)
//!
//! The transport lives outside this crate. The factory asks a
//! [`ChannelFactory`] for one channel per engine and closes it on cleanup.

use crate::context::UserExecutionContext;
use crate::utils::errors::{EngineError, Result};
use crate::utils::new_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

/// Event pushed to a user through their channel
#[derive(Debug, Clone, Serialize)]
pub struct ChannelEvent {
    pub event_type: String,
    pub user_id: String,
    pub request_id: String,
    pub payload: Value,
    pub sent_at: DateTime<Utc>,
}

/// A per-user notification channel
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn channel_id(&self) -> &str;

    /// The user this channel delivers to
    fn user_id(&self) -> &str;

    async fn send(&self, event: ChannelEvent) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates notification channels for new engines
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn create_channel(
        &self,
        context: &UserExecutionContext,
    ) -> Result<Arc<dyn NotificationChannel>>;
}

type ChannelMap = DashMap<String, Arc<InMemoryChannel>>;

/// Channel that buffers events in memory
#[derive(Debug)]
pub struct InMemoryChannel {
    channel_id: String,
    user_id: String,
    events: Mutex<Vec<ChannelEvent>>,
    closed: AtomicBool,
    /// Map of the factory that created this channel; left on close
    registry: Option<Weak<ChannelMap>>,
}

impl InMemoryChannel {
    pub fn new(channel_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            user_id: user_id.into(),
            events: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            registry: None,
        }
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl NotificationChannel for InMemoryChannel {
    fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn send(&self, event: ChannelEvent) -> Result<()> {
        if self.is_closed() {
            return Err(EngineError::ChannelFailed(format!(
                "channel {} is closed",
                self.channel_id
            )));
        }
        self.events.lock().push(event);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        if let Some(channels) = self.registry.as_ref().and_then(Weak::upgrade) {
            channels.remove_if(&self.channel_id, |_, c| std::ptr::eq(Arc::as_ptr(c), self));
        }
        Ok(())
    }
}

/// Factory handing out [`InMemoryChannel`]s; keeps open ones for inspection
#[derive(Debug, Default)]
pub struct InMemoryChannelFactory {
    channels: Arc<ChannelMap>,
    created: AtomicUsize,
}

impl InMemoryChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<InMemoryChannel>> {
        self.channels.get(channel_id).map(|c| Arc::clone(c.value()))
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelFactory for InMemoryChannelFactory {
    async fn create_channel(
        &self,
        context: &UserExecutionContext,
    ) -> Result<Arc<dyn NotificationChannel>> {
        let channel_id = context
            .websocket_channel_id()
            .map(str::to_string)
            .unwrap_or_else(|| new_id("ws"));

        let channel = Arc::new(InMemoryChannel {
            registry: Some(Arc::downgrade(&self.channels)),
            ..InMemoryChannel::new(channel_id.clone(), context.user_id())
        });
        self.channels.insert(channel_id, Arc::clone(&channel));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_channel_lifecycle() {
        let factory = InMemoryChannelFactory::new();
        let ctx = UserExecutionContext::builder("user_a", "thread_a", "run_a")
            .websocket_channel_id("ws_a")
            .build()
            .unwrap();

        let channel = factory.create_channel(&ctx).await.unwrap();
        assert_eq!(channel.channel_id(), "ws_a");
        assert_eq!(channel.user_id(), "user_a");
        assert_eq!(factory.open_channels(), 1);

        let event = ChannelEvent {
            event_type: "agent_started".into(),
            user_id: "user_a".into(),
            request_id: ctx.request_id().into(),
            payload: serde_json::json!({}),
            sent_at: Utc::now(),
        };
        channel.send(event.clone()).await.unwrap();
        assert_eq!(factory.channel("ws_a").unwrap().events().len(), 1);

        channel.close().await.unwrap();
        assert_eq!(factory.open_channels(), 0);
        assert!(factory.channel("ws_a").is_none());
        assert!(channel.send(event).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channels_leave_the_factory() {
        let factory = InMemoryChannelFactory::new();
        let mut channels = Vec::new();
        for i in 0..20 {
            let ctx = UserExecutionContext::new(&format!("user_{i}"), "thread_a", "run_a").unwrap();
            channels.push(factory.create_channel(&ctx).await.unwrap());
        }
        assert_eq!(factory.open_channels(), 20);

        for channel in &channels {
            channel.close().await.unwrap();
        }
        assert_eq!(factory.open_channels(), 0);
        assert_eq!(factory.created(), 20);
    }

    #[tokio::test]
    async fn test_reused_channel_id_keeps_newest() {
        let factory = InMemoryChannelFactory::new();
        let ctx = UserExecutionContext::builder("user_a", "thread_a", "run_a")
            .websocket_channel_id("ws_a")
            .build()
            .unwrap();

        let first = factory.create_channel(&ctx).await.unwrap();
        let second = factory.create_channel(&ctx).await.unwrap();
        first.close().await.unwrap();

        assert_eq!(factory.open_channels(), 1);
        second.close().await.unwrap();
        assert_eq!(factory.open_channels(), 0);
    }
}
