// src/monitoring/request_metrics.rs
//! Per-request isolation record and scoring

use crate::monitoring::violation::{IsolationFlag, IsolationViolation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Points removed per isolation flag that is no longer set
const FLAG_PENALTY: f64 = 25.0;

/// Isolation bookkeeping for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestIsolationMetrics {
    pub request_id: String,
    pub user_id: String,
    pub thread_id: Option<String>,
    pub run_id: Option<String>,

    pub websocket_isolated: bool,
    pub db_session_isolated: bool,
    pub agent_instance_isolated: bool,
    pub state_isolated: bool,

    pub instance_creation_time_ms: Option<f64>,
    pub isolation_score: f64,
    pub failure_contained: bool,
    pub success: Option<bool>,

    pub violations: Vec<IsolationViolation>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RequestIsolationMetrics {
    pub fn new(
        request_id: &str,
        user_id: &str,
        thread_id: Option<&str>,
        run_id: Option<&str>,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            thread_id: thread_id.map(str::to_string),
            run_id: run_id.map(str::to_string),
            websocket_isolated: true,
            db_session_isolated: true,
            agent_instance_isolated: true,
            state_isolated: true,
            instance_creation_time_ms: None,
            isolation_score: 100.0,
            failure_contained: true,
            success: None,
            violations: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Clear the flag a violation breaks and keep the event
    pub fn apply_violation(&mut self, violation: IsolationViolation) {
        match violation.violation_type.isolation_flag() {
            Some(IsolationFlag::Websocket) => self.websocket_isolated = false,
            Some(IsolationFlag::DbSession) => self.db_session_isolated = false,
            Some(IsolationFlag::AgentInstance) => self.agent_instance_isolated = false,
            Some(IsolationFlag::State) => self.state_isolated = false,
            None => {}
        }
        self.violations.push(violation);
        self.isolation_score = self.compute_score();
    }

    pub fn fully_isolated(&self) -> bool {
        self.websocket_isolated
            && self.db_session_isolated
            && self.agent_instance_isolated
            && self.state_isolated
    }

    /// Score in [0, 100]: flag penalties plus per-violation severity penalties
    pub fn compute_score(&self) -> f64 {
        let failed_flags = [
            self.websocket_isolated,
            self.db_session_isolated,
            self.agent_instance_isolated,
            self.state_isolated,
        ]
        .iter()
        .filter(|ok| !**ok)
        .count() as f64;

        let violation_penalty: f64 = self
            .violations
            .iter()
            .map(|v| v.severity.score_penalty())
            .sum();

        (100.0 - failed_flags * FLAG_PENALTY - violation_penalty).max(0.0)
    }

    /// Close the record; a failed request counts as contained if its isolation held
    pub fn finalize(&mut self, success: bool) {
        self.completed_at = Some(Utc::now());
        self.success = Some(success);
        self.isolation_score = self.compute_score();
        self.failure_contained = success || self.fully_isolated();
    }

    pub fn is_isolated(&self) -> bool {
        self.compute_score() >= 100.0
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::violation::{ViolationSeverity, ViolationType};

    fn violation(kind: ViolationType, severity: ViolationSeverity) -> IsolationViolation {
        IsolationViolation::new(kind, severity, Some("user_a"), Some("req_1"), "test")
    }

    #[test]
    fn test_clean_request_scores_100() {
        let mut metrics = RequestIsolationMetrics::new("req_1", "user_a", None, None);
        metrics.finalize(true);
        assert_eq!(metrics.isolation_score, 100.0);
        assert!(metrics.failure_contained);
        assert!(metrics.is_isolated());
        assert!(metrics.duration_ms().is_some());
    }

    #[test]
    fn test_score_deductions() {
        let mut metrics = RequestIsolationMetrics::new("req_1", "user_a", None, None);

        metrics.apply_violation(violation(
            ViolationType::SlowInstanceCreation,
            ViolationSeverity::Warning,
        ));
        assert_eq!(metrics.isolation_score, 90.0);

        // Flag (-25) plus error (-25)
        metrics.apply_violation(violation(ViolationType::SharedDbSession, ViolationSeverity::Error));
        assert!(!metrics.db_session_isolated);
        assert_eq!(metrics.isolation_score, 40.0);

        metrics.apply_violation(violation(
            ViolationType::CrossRequestState,
            ViolationSeverity::Critical,
        ));
        assert_eq!(metrics.isolation_score, 0.0);
    }

    #[test]
    fn test_failure_containment() {
        let mut contained = RequestIsolationMetrics::new("req_1", "user_a", None, None);
        contained.finalize(false);
        assert!(contained.failure_contained);

        let mut leaked = RequestIsolationMetrics::new("req_2", "user_a", None, None);
        leaked.apply_violation(violation(
            ViolationType::CrossRequestState,
            ViolationSeverity::Critical,
        ));
        leaked.finalize(false);
        assert!(!leaked.failure_contained);
    }
}
