// src/monitoring/alert.rs
//! Alert sink contract, cooldown gating and asynchronous delivery
//!
//! ```text
//! raise() ──► cooldown ──► AlertQueue ──► delivery task ──► AlertSink::emit
//!               │ (suppressed)   │ (dropped when full)
//! ```

use crate::monitoring::alert_queue::{AlertQueue, AlertQueueStats};
use crate::monitoring::status::HealthSeverity;
use crate::utils::errors::Result;
use crate::utils::new_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Component that raised an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSource {
    Collector,
    HealthChecker,
}

impl AlertSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collector => "collector",
            Self::HealthChecker => "health_checker",
        }
    }
}

impl fmt::Display for AlertSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One alert, batching every condition that was true when it was raised
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub source: AlertSource,
    pub severity: HealthSeverity,
    pub message: String,
    pub conditions: Vec<String>,
    pub snapshot: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        source: AlertSource,
        severity: HealthSeverity,
        message: impl Into<String>,
        conditions: Vec<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: new_id("alert"),
            source,
            severity,
            message: message.into(),
            conditions,
            snapshot,
            raised_at: Utc::now(),
        }
    }

    /// Cooldown key when alerts are throttled per category
    pub fn category(&self) -> String {
        format!("{}:{}", self.source, self.severity)
    }
}

/// Destination for alerts (pager, webhook, log...)
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, alert: &Alert) -> Result<()>;
}

/// Writes alerts to the tracing log
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            HealthSeverity::Critical | HealthSeverity::Error => error!(
                alert_id = %alert.id,
                source = %alert.source,
                severity = %alert.severity,
                conditions = ?alert.conditions,
                "ISOLATION ALERT: {}",
                alert.message
            ),
            _ => warn!(
                alert_id = %alert.id,
                source = %alert.source,
                severity = %alert.severity,
                conditions = ?alert.conditions,
                "Isolation alert: {}",
                alert.message
            ),
        }
        Ok(())
    }
}

/// Keeps emitted alerts in memory for pull-style readers
#[derive(Debug, Default)]
pub struct BufferedAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl BufferedAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

#[async_trait]
impl AlertSink for BufferedAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

/// How alerts share a cooldown window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    /// One window per component
    Global,
    /// One window per `source:severity` category
    PerCategory,
}

/// Remaining cooldown for one key
#[derive(Debug, Clone, Serialize)]
pub struct CooldownEntry {
    pub key: String,
    pub remaining_ms: u64,
}

/// Minimum spacing between alerts with the same key
pub struct AlertCooldown {
    window: Duration,
    scope: CooldownScope,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl AlertCooldown {
    pub fn new(window: Duration, scope: CooldownScope) -> Self {
        Self {
            window,
            scope,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    pub fn key_for(&self, alert: &Alert) -> String {
        match self.scope {
            CooldownScope::Global => alert.source.as_str().to_string(),
            CooldownScope::PerCategory => alert.category(),
        }
    }

    /// Claim the window for `key`; false while a previous alert is cooling down
    pub fn try_acquire(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut last = self.last_emitted.lock();
        match last.get(key) {
            Some(at) if now.duration_since(*at) < self.window => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Give back a claim whose alert never made it into the queue
    ///
    /// A successful claim only replaces an expired entry, so removing the
    /// key leaves the window as it was before the claim.
    pub fn release(&self, key: &str) {
        self.last_emitted.lock().remove(key);
    }

    pub fn state(&self) -> Vec<CooldownEntry> {
        let now = Instant::now();
        let last = self.last_emitted.lock();
        let mut entries: Vec<CooldownEntry> = last
            .iter()
            .filter_map(|(key, at)| {
                let elapsed = now.duration_since(*at);
                (elapsed < self.window).then(|| CooldownEntry {
                    key: key.clone(),
                    remaining_ms: (self.window - elapsed).as_millis() as u64,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Outcome of [`AlertDispatcher::raise`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    Queued,
    Suppressed,
    Dropped,
}

/// Dispatcher counters
#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub raised: u64,
    pub suppressed: u64,
    pub emitted: u64,
    pub failed: u64,
    pub queue: AlertQueueStats,
    pub cooldowns: Vec<CooldownEntry>,
}

/// Cooldown-gated, non-blocking alert path for one component
pub struct AlertDispatcher {
    source: AlertSource,
    sink: Arc<dyn AlertSink>,
    cooldown: AlertCooldown,
    queue: AlertQueue,
    notify: Notify,
    raised: AtomicU64,
    suppressed: AtomicU64,
    emitted: AtomicU64,
    failed: AtomicU64,
}

impl AlertDispatcher {
    pub fn new(
        source: AlertSource,
        sink: Arc<dyn AlertSink>,
        cooldown: Duration,
        scope: CooldownScope,
        queue_capacity: usize,
    ) -> Self {
        Self {
            source,
            sink,
            cooldown: AlertCooldown::new(cooldown, scope),
            queue: AlertQueue::new(queue_capacity),
            notify: Notify::new(),
            raised: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Queue an alert for delivery unless its cooldown is active; never blocks
    pub fn raise(&self, alert: Alert) -> AlertDecision {
        self.raised.fetch_add(1, Ordering::Relaxed);
        let key = self.cooldown.key_for(&alert);

        if !self.cooldown.try_acquire(&key) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(crate::observability::ALERTS_SUPPRESSED, "source" => self.source.as_str())
                .increment(1);
            debug!(source = %self.source, key = %key, "Alert suppressed by cooldown");
            return AlertDecision::Suppressed;
        }

        match self.queue.push(alert) {
            Ok(()) => {
                self.notify.notify_one();
                AlertDecision::Queued
            }
            Err(alert) => {
                self.cooldown.release(&key);
                metrics::counter!(crate::observability::ALERTS_DROPPED, "source" => self.source.as_str())
                    .increment(1);
                warn!(
                    source = %self.source,
                    alert_id = %alert.id,
                    "Alert queue full, dropping alert: {}",
                    alert.message
                );
                AlertDecision::Dropped
            }
        }
    }

    /// Deliver every queued alert; returns how many reached the sink
    pub async fn flush(&self) -> usize {
        let mut delivered = 0;
        while let Some(alert) = self.queue.try_pop() {
            match self.sink.emit(&alert).await {
                Ok(()) => {
                    delivered += 1;
                    self.emitted.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(
                        crate::observability::ALERTS_EMITTED,
                        "source" => self.source.as_str(),
                        "severity" => alert.severity.as_str()
                    )
                    .increment(1);
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    error!(source = %self.source, alert_id = %alert.id, "Failed to emit alert: {}", e);
                }
            }
        }
        delivered
    }

    /// Start the delivery task; it drains once more when `stop` fires
    pub fn spawn(self: &Arc<Self>, stop: CancellationToken) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            info!(source = %dispatcher.source, "Alert delivery task started");
            loop {
                tokio::select! {
                    _ = dispatcher.notify.notified() => {
                        dispatcher.flush().await;
                    }
                    _ = stop.cancelled() => {
                        dispatcher.flush().await;
                        break;
                    }
                }
            }
            debug!(source = %dispatcher.source, "Alert delivery task stopped");
        })
    }

    pub fn stats(&self) -> AlertStats {
        AlertStats {
            raised: self.raised.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            cooldowns: self.cooldown.state(),
        }
    }
}
