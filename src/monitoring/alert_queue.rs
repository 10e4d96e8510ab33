// src/monitoring/alert_queue.rs
//! Lock-free bounded queue between alert producers and the delivery task
//!
//! Producers (the aggregation loop, the health-check loop) never wait on the
//! alert sink: they push here and move on. A full queue drops the alert and
//! counts the drop.

use crate::monitoring::alert::Alert;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded MPMC alert queue
pub struct AlertQueue {
    queue: ArrayQueue<Alert>,
    push_count: AtomicU64,
    pop_count: AtomicU64,
    drop_count: AtomicU64,
}

impl AlertQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push an alert (non-blocking); a full queue hands the alert back
    pub fn push(&self, alert: Alert) -> Result<(), Alert> {
        match self.queue.push(alert) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(alert) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(alert)
            }
        }
    }

    pub fn try_pop(&self) -> Option<Alert> {
        let alert = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(alert)
    }

    pub fn stats(&self) -> AlertQueueStats {
        AlertQueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Queue counters
#[derive(Debug, Clone, serde::Serialize)]
pub struct AlertQueueStats {
    pub push_count: u64,
    pub pop_count: u64,
    pub drop_count: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl AlertQueueStats {
    pub fn drop_rate(&self) -> f64 {
        let attempts = self.push_count + self.drop_count;
        if attempts == 0 {
            0.0
        } else {
            (self.drop_count as f64 / attempts as f64) * 100.0
        }
    }
}
