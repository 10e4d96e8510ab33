// src/health/collaborators.rs
//! External statistics consumed by the health probes
//!
//! Each provider may fail on its own; a failing provider degrades only the
//! probe that reads it.

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Live notification connection count (e.g. open WebSockets)
#[async_trait]
pub trait ConnectionStatsProvider: Send + Sync {
    async fn active_connections(&self) -> Result<usize>;
}

/// Usage of one database connection pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    /// Connections currently checked out
    pub total: usize,
    /// Configured pool size
    pub size: usize,
    /// Connections opened beyond `size`
    pub overflow: usize,
}

impl PoolUsage {
    /// Checked-out connections as a percentage of the pool size
    pub fn utilization_pct(&self) -> f64 {
        if self.size == 0 {
            return 0.0;
        }
        self.total as f64 / self.size as f64 * 100.0
    }
}

/// Status of the synchronous and asynchronous database pools
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub sync: PoolUsage,
    #[serde(rename = "async")]
    pub asynchronous: PoolUsage,
}

#[async_trait]
pub trait PoolStatusProvider: Send + Sync {
    async fn pool_status(&self) -> Result<PoolStatus>;
}

/// Memory usage sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemorySample {
    pub total_bytes: u64,
    pub available_bytes: u64,
    /// Resident set size of this process, when known
    pub process_rss_bytes: Option<u64>,
}

impl MemorySample {
    /// System memory in use, as a percentage
    pub fn used_pct(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 / self.total_bytes as f64 * 100.0
    }
}

#[async_trait]
pub trait MemoryStatsProvider: Send + Sync {
    async fn sample(&self) -> Result<MemorySample>;
}

/// Reads `/proc/meminfo` and `/proc/self/status`
#[derive(Debug, Clone)]
pub struct ProcMemoryStats {
    meminfo: PathBuf,
    status: PathBuf,
}

impl Default for ProcMemoryStats {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
            status: PathBuf::from("/proc/self/status"),
        }
    }
}

impl ProcMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read from other files (tests, containers with a remapped /proc)
    pub fn with_paths(meminfo: impl Into<PathBuf>, status: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: meminfo.into(),
            status: status.into(),
        }
    }
}

/// Value of a `Key:   1234 kB` line, in bytes
fn kb_field(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

#[async_trait]
impl MemoryStatsProvider for ProcMemoryStats {
    async fn sample(&self) -> Result<MemorySample> {
        let meminfo = tokio::fs::read_to_string(&self.meminfo).await.map_err(|e| {
            EngineError::CollaboratorUnavailable(format!("{}: {}", self.meminfo.display(), e))
        })?;

        let total_bytes = kb_field(&meminfo, "MemTotal").ok_or_else(|| {
            EngineError::CollaboratorUnavailable("MemTotal missing from meminfo".into())
        })?;
        let available_bytes = kb_field(&meminfo, "MemAvailable")
            .or_else(|| kb_field(&meminfo, "MemFree"))
            .unwrap_or(0);

        let process_rss_bytes = tokio::fs::read_to_string(&self.status)
            .await
            .ok()
            .and_then(|status| kb_field(&status, "VmRSS"));

        Ok(MemorySample {
            total_bytes,
            available_bytes,
            process_rss_bytes,
        })
    }
}

/// Provider returning a fixed connection count
#[derive(Debug, Clone, Copy)]
pub struct StaticConnectionStats(pub usize);

#[async_trait]
impl ConnectionStatsProvider for StaticConnectionStats {
    async fn active_connections(&self) -> Result<usize> {
        Ok(self.0)
    }
}

/// Provider returning a fixed pool status
#[derive(Debug, Clone, Copy)]
pub struct StaticPoolStatus(pub PoolStatus);

#[async_trait]
impl PoolStatusProvider for StaticPoolStatus {
    async fn pool_status(&self) -> Result<PoolStatus> {
        Ok(self.0)
    }
}

/// Provider returning a fixed memory sample
#[derive(Debug, Clone, Copy)]
pub struct StaticMemoryStats(pub MemorySample);

impl StaticMemoryStats {
    /// Sample with `used_pct` percent of 1 GiB in use
    pub fn used_pct(used_pct: f64) -> Self {
        let total_bytes = 1u64 << 30;
        let used = (total_bytes as f64 * used_pct / 100.0) as u64;
        Self(MemorySample {
            total_bytes,
            available_bytes: total_bytes - used.min(total_bytes),
            process_rss_bytes: None,
        })
    }
}

#[async_trait]
impl MemoryStatsProvider for StaticMemoryStats {
    async fn sample(&self) -> Result<MemorySample> {
        Ok(self.0)
    }
}
