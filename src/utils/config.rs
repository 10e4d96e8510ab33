// src/utils/config.rs
//! Engine configuration
//!
//! Loaded with the `config` crate from an optional TOML file followed by
//! `ISOLATION_*` environment overrides (`__` separates nested keys, e.g.
//! `ISOLATION_FACTORY__MAX_ENGINES_PER_USER=4`).

use crate::monitoring::alert::CooldownScope;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "ISOLATION_CONFIG";

/// Config file used when `ISOLATION_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "isolation.toml";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub factory: FactorySettings,
    pub collector: CollectorSettings,
    pub health: HealthSettings,
    pub observability: ObservabilitySettings,
}

/// Execution engine factory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactorySettings {
    /// Concurrent engines a single user may hold (default: 2)
    pub max_engines_per_user: usize,

    /// Hard deadline for factory shutdown
    pub shutdown_timeout_secs: u64,

    /// Deadline for releasing one engine resource
    pub cleanup_timeout_ms: u64,

    /// Per-user ceilings replacing `max_engines_per_user`
    pub user_overrides: HashMap<String, usize>,
}

impl Default for FactorySettings {
    fn default() -> Self {
        Self {
            max_engines_per_user: 2,
            shutdown_timeout_secs: 10,
            cleanup_timeout_ms: 5_000,
            user_overrides: HashMap::new(),
        }
    }
}

impl FactorySettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }
}

/// Isolation metrics collector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    pub aggregation_interval_secs: u64,
    pub alert_cooldown_secs: u64,
    pub cooldown_scope: CooldownScope,
    pub max_completed_requests: usize,
    pub max_violations: usize,
    pub max_creation_samples: usize,
    pub health_retention_hours: u64,
    pub violation_retention_hours: u64,
    pub slow_creation_threshold_ms: f64,
    pub alert_queue_capacity: usize,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            aggregation_interval_secs: 5,
            alert_cooldown_secs: 30,
            cooldown_scope: CooldownScope::PerCategory,
            max_completed_requests: 1_000,
            max_violations: 10_000,
            max_creation_samples: 1_000,
            health_retention_hours: 24,
            violation_retention_hours: 24,
            slow_creation_threshold_ms: 100.0,
            alert_queue_capacity: 256,
        }
    }
}

/// Isolation health checker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub check_interval_secs: u64,
    pub alert_cooldown_secs: u64,
    pub cooldown_scope: CooldownScope,
    pub history_limit: usize,
    pub parallel_probes: bool,
    pub probe_timeout_ms: u64,

    pub memory_warning_pct: f64,
    pub memory_critical_pct: f64,

    pub creation_warning_ms: f64,
    pub creation_critical_ms: f64,

    pub concurrency_warning: usize,
    pub concurrency_critical: usize,

    /// Samples kept by the leak-trend heuristic
    pub leak_window: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            alert_cooldown_secs: 30,
            cooldown_scope: CooldownScope::PerCategory,
            history_limit: 100,
            parallel_probes: false,
            probe_timeout_ms: 5_000,
            memory_warning_pct: 75.0,
            memory_critical_pct: 90.0,
            creation_warning_ms: 100.0,
            creation_critical_ms: 1_000.0,
            concurrency_warning: 100,
            concurrency_critical: 500,
            leak_window: 12,
        }
    }
}

/// Logging and metrics export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,

    /// "pretty" or "json"
    pub log_format: String,

    /// Prometheus listener, e.g. "0.0.0.0:9464"; disabled when unset
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default locations
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(Path::new(&path))
    }

    /// Load configuration from `path` (if it exists) plus environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let config: EngineConfig = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("ISOLATION")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(EngineError::ConfigError(msg.to_string()));

        if self.factory.max_engines_per_user == 0 {
            return fail("factory.max_engines_per_user must be at least 1");
        }
        if self.factory.user_overrides.values().any(|limit| *limit == 0) {
            return fail("factory.user_overrides entries must be at least 1");
        }
        if self.factory.shutdown_timeout_secs == 0 {
            return fail("factory.shutdown_timeout_secs must be positive");
        }
        if self.collector.aggregation_interval_secs == 0 {
            return fail("collector.aggregation_interval_secs must be positive");
        }
        if self.collector.alert_cooldown_secs == 0 || self.health.alert_cooldown_secs == 0 {
            return fail("alert cooldowns must be positive");
        }
        if self.collector.max_violations == 0 || self.collector.max_completed_requests == 0 {
            return fail("collector history sizes must be positive");
        }
        if self.collector.alert_queue_capacity == 0 {
            return fail("collector.alert_queue_capacity must be positive");
        }
        if self.health.check_interval_secs == 0 {
            return fail("health.check_interval_secs must be positive");
        }
        if self.health.memory_warning_pct >= self.health.memory_critical_pct {
            return fail("health.memory_warning_pct must be below memory_critical_pct");
        }
        if self.health.creation_warning_ms >= self.health.creation_critical_ms {
            return fail("health.creation_warning_ms must be below creation_critical_ms");
        }
        if self.health.concurrency_warning >= self.health.concurrency_critical {
            return fail("health.concurrency_warning must be below concurrency_critical");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.factory.max_engines_per_user, 2);
        assert_eq!(config.collector.aggregation_interval_secs, 5);
        assert_eq!(config.collector.alert_cooldown_secs, 30);
        assert_eq!(config.collector.slow_creation_threshold_ms, 100.0);
        assert_eq!(config.health.memory_warning_pct, 75.0);
        assert_eq!(config.health.memory_critical_pct, 90.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[factory]
max_engines_per_user = 4

[health]
check_interval_secs = 10
parallel_probes = true
"#
        )
        .unwrap();

        let config = EngineConfig::load_from(file.path()).unwrap();
        assert_eq!(config.factory.max_engines_per_user, 4);
        assert_eq!(config.health.check_interval_secs, 10);
        assert!(config.health.parallel_probes);
        // Untouched sections keep their defaults
        assert_eq!(config.collector.max_violations, 10_000);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.factory.max_engines_per_user, 2);
    }

    #[test]
    fn test_validation() {
        let mut config = EngineConfig::default();
        config.factory.max_engines_per_user = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.health.memory_warning_pct = 95.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.collector.alert_cooldown_secs = 0;
        assert!(config.validate().is_err());
    }
}
