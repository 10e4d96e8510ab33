// src/monitoring/history.rs
//! Bounded ring buffer used for violations, completed requests and snapshots

use std::collections::VecDeque;

/// Fixed-capacity FIFO; pushing into a full buffer evicts the oldest entry
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            evicted: 0,
        }
    }

    /// Append an item, returning the evicted one if the buffer was full
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.evicted += 1;
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Drop leading items while `expired` holds; returns how many were removed
    pub fn expire_while<F: Fn(&T) -> bool>(&mut self, expired: F) -> usize {
        let mut removed = 0;
        while self.items.front().map_or(false, &expired) {
            self.items.pop_front();
            removed += 1;
        }
        removed
    }

    /// Oldest to newest
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    /// The most recent `n` items, oldest first
    pub fn latest(&self, n: usize) -> impl Iterator<Item = &T> {
        let skip = self.items.len().saturating_sub(n);
        self.items.iter().skip(skip)
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted because the buffer was full
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
