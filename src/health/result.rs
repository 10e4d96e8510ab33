// src/health/result.rs
//! Health check results

use crate::monitoring::status::HealthSeverity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

pub const STATUS_OK: &str = "ok";
pub const STATUS_PROBE_FAILED: &str = "probe_failed";
pub const STATUS_UNKNOWN_CHECK: &str = "unknown_check";

/// Output of one probe
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub check_name: String,
    pub severity: HealthSeverity,
    /// Short machine-readable status, e.g. `ok`, `contamination_detected`
    pub status_code: String,
    pub message: String,
    pub metrics: Map<String, Value>,
    pub remediation: Vec<String>,
    pub alert_required: bool,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: f64,
}

impl HealthCheckResult {
    /// Result whose `alert_required` defaults to `severity == Critical`
    pub fn new(
        check_name: impl Into<String>,
        severity: HealthSeverity,
        status_code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            check_name: check_name.into(),
            severity,
            status_code: status_code.into(),
            message: message.into(),
            metrics: Map::new(),
            remediation: Vec::new(),
            alert_required: severity == HealthSeverity::Critical,
            checked_at: Utc::now(),
            duration_ms: 0.0,
        }
    }

    pub fn healthy(check_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(check_name, HealthSeverity::Healthy, STATUS_OK, message)
    }

    /// ERROR result standing in for a probe that failed internally
    pub fn probe_failed(check_name: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            check_name,
            HealthSeverity::Error,
            STATUS_PROBE_FAILED,
            format!("health probe failed: {}", reason),
        )
        .with_remediation("Inspect the probe's logs; other probes were not affected")
    }

    pub fn unknown_check(check_name: impl Into<String>, available: &[&str]) -> Self {
        let check_name = check_name.into();
        let message = format!("unknown health check `{}`", check_name);
        Self::new(check_name, HealthSeverity::Error, STATUS_UNKNOWN_CHECK, message)
            .with_metric("available_checks", available.to_vec())
            .require_alert(false)
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }

    pub fn with_remediation(mut self, step: impl Into<String>) -> Self {
        self.remediation.push(step.into());
        self
    }

    pub fn require_alert(mut self, required: bool) -> Self {
        self.alert_required = required;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.severity == HealthSeverity::Healthy
    }

    pub fn is_probe_failure(&self) -> bool {
        self.status_code == STATUS_PROBE_FAILED
    }
}

/// Aggregate of one health-check pass
#[derive(Debug, Clone, Serialize)]
pub struct IsolationHealthStatus {
    /// Most severe probe result
    pub overall_health: HealthSeverity,
    pub isolation_score: f64,
    pub failure_containment_rate: f64,
    pub concurrent_users: usize,
    pub active_requests: usize,
    pub total_violations: u64,
    pub critical_violations_24h: u64,
    pub check_results: Vec<HealthCheckResult>,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: f64,
}

impl IsolationHealthStatus {
    pub fn result(&self, check_name: &str) -> Option<&HealthCheckResult> {
        self.check_results
            .iter()
            .find(|r| r.check_name == check_name)
    }

    pub fn alerts_required(&self) -> impl Iterator<Item = &HealthCheckResult> {
        self.check_results.iter().filter(|r| r.alert_required)
    }

    pub fn is_healthy(&self) -> bool {
        self.overall_health == HealthSeverity::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_required_defaults_to_critical() {
        let warning = HealthCheckResult::new("x", HealthSeverity::Warning, "slow", "slow");
        assert!(!warning.alert_required);

        let critical = HealthCheckResult::new("x", HealthSeverity::Critical, "bad", "bad");
        assert!(critical.alert_required);
    }

    #[test]
    fn test_probe_failed_shape() {
        let result = HealthCheckResult::probe_failed("memory_usage", "boom");
        assert_eq!(result.severity, HealthSeverity::Error);
        assert!(result.is_probe_failure());
        assert!(result.message.contains("boom"));
        assert!(!result.remediation.is_empty());
    }

    #[test]
    fn test_unknown_check() {
        let result = HealthCheckResult::unknown_check("nope", &["memory_usage"]);
        assert_eq!(result.status_code, STATUS_UNKNOWN_CHECK);
        assert!(!result.alert_required);
        assert_eq!(
            result.metrics["available_checks"],
            serde_json::json!(["memory_usage"])
        );
    }
}
