// src/monitoring/snapshot.rs
//! Periodic system-wide isolation snapshot

use crate::monitoring::status::HealthSeverity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate isolation health, produced on every collector tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemIsolationHealth {
    pub timestamp: DateTime<Utc>,
    pub total_requests: u64,
    pub isolated_requests: u64,
    pub isolation_score: f64,
    pub failure_containment_rate: f64,
    pub concurrent_users: usize,
    pub active_requests: usize,
    pub violations_by_category: BTreeMap<String, u64>,
    pub avg_instance_creation_ms: f64,
    pub critical_violations_24h: u64,
    pub status: HealthSeverity,
}

impl SystemIsolationHealth {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthSeverity::Healthy
    }

    pub fn violation_count(&self, category: &str) -> u64 {
        self.violations_by_category.get(category).copied().unwrap_or(0)
    }
}

/// Per-user view for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIsolationSummary {
    pub user_id: String,
    pub active_requests: usize,
    pub total_requests: u64,
    pub violations: usize,
    pub average_isolation_score: f64,
}
