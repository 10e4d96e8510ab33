// src/monitoring/violation.rs
//! Isolation violation events and severities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a recorded violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl ViolationSeverity {
    /// Points removed from a request's isolation score per violation
    pub fn score_penalty(self) -> f64 {
        match self {
            Self::Info => 0.0,
            Self::Warning => 10.0,
            Self::Error => 25.0,
            Self::Critical => 50.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which per-request isolation flag a violation breaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationFlag {
    Websocket,
    DbSession,
    AgentInstance,
    State,
}

/// Kind of isolation violation (open set)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ViolationType {
    CrossRequestState,
    RaceCondition,
    WebsocketContamination,
    CrossUserEvent,
    DbSessionLeak,
    SharedDbSession,
    SingletonViolation,
    SharedAgentInstance,
    MemoryLeak,
    ResourceLeak,
    SlowInstanceCreation,
    ContextIsolation,
    Other(String),
}

impl ViolationType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::CrossRequestState => "cross_request_state",
            Self::RaceCondition => "race_condition",
            Self::WebsocketContamination => "websocket_contamination",
            Self::CrossUserEvent => "cross_user_event",
            Self::DbSessionLeak => "db_session_leak",
            Self::SharedDbSession => "shared_db_session",
            Self::SingletonViolation => "singleton_violation",
            Self::SharedAgentInstance => "shared_agent_instance",
            Self::MemoryLeak => "memory_leak",
            Self::ResourceLeak => "resource_leak",
            Self::SlowInstanceCreation => "slow_instance_creation",
            Self::ContextIsolation => "context_isolation",
            Self::Other(name) => name,
        }
    }

    /// The isolation flag this kind of violation clears on the active request
    pub fn isolation_flag(&self) -> Option<IsolationFlag> {
        match self {
            Self::WebsocketContamination | Self::CrossUserEvent => Some(IsolationFlag::Websocket),
            Self::DbSessionLeak | Self::SharedDbSession => Some(IsolationFlag::DbSession),
            Self::SingletonViolation | Self::SharedAgentInstance => {
                Some(IsolationFlag::AgentInstance)
            }
            Self::CrossRequestState | Self::RaceCondition | Self::ContextIsolation => {
                Some(IsolationFlag::State)
            }
            Self::MemoryLeak | Self::ResourceLeak | Self::SlowInstanceCreation | Self::Other(_) => {
                None
            }
        }
    }
}

impl From<&str> for ViolationType {
    fn from(s: &str) -> Self {
        match s {
            "cross_request_state" => Self::CrossRequestState,
            "race_condition" => Self::RaceCondition,
            "websocket_contamination" => Self::WebsocketContamination,
            "cross_user_event" => Self::CrossUserEvent,
            "db_session_leak" => Self::DbSessionLeak,
            "shared_db_session" => Self::SharedDbSession,
            "singleton_violation" => Self::SingletonViolation,
            "shared_agent_instance" => Self::SharedAgentInstance,
            "memory_leak" => Self::MemoryLeak,
            "resource_leak" => Self::ResourceLeak,
            "slow_instance_creation" => Self::SlowInstanceCreation,
            "context_isolation" => Self::ContextIsolation,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ViolationType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<ViolationType> for String {
    fn from(t: ViolationType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for ViolationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded isolation violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationViolation {
    pub timestamp: DateTime<Utc>,
    pub violation_type: ViolationType,
    pub severity: ViolationSeverity,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
    pub description: String,

    /// Captured for CRITICAL violations only
    pub stack_trace: Option<String>,
}

impl IsolationViolation {
    pub fn new(
        violation_type: ViolationType,
        severity: ViolationSeverity,
        user_id: Option<&str>,
        request_id: Option<&str>,
        description: impl Into<String>,
    ) -> Self {
        let stack_trace = (severity == ViolationSeverity::Critical)
            .then(|| std::backtrace::Backtrace::force_capture().to_string());

        Self {
            timestamp: Utc::now(),
            violation_type,
            severity,
            user_id: user_id.map(str::to_string),
            request_id: request_id.map(str::to_string),
            description: description.into(),
            stack_trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_and_penalty() {
        assert!(ViolationSeverity::Critical > ViolationSeverity::Error);
        assert!(ViolationSeverity::Error > ViolationSeverity::Warning);
        assert!(ViolationSeverity::Warning > ViolationSeverity::Info);
        assert_eq!(ViolationSeverity::Critical.score_penalty(), 50.0);
        assert_eq!(ViolationSeverity::Info.score_penalty(), 0.0);
    }

    #[test]
    fn test_type_string_mapping() {
        assert_eq!(
            ViolationType::from("cross_request_state"),
            ViolationType::CrossRequestState
        );
        assert_eq!(
            ViolationType::from("custom_probe"),
            ViolationType::Other("custom_probe".into())
        );
        assert_eq!(ViolationType::DbSessionLeak.to_string(), "db_session_leak");

        let json = serde_json::to_string(&ViolationType::RaceCondition).unwrap();
        assert_eq!(json, "\"race_condition\"");
    }

    #[test]
    fn test_isolation_flags() {
        assert_eq!(
            ViolationType::CrossUserEvent.isolation_flag(),
            Some(IsolationFlag::Websocket)
        );
        assert_eq!(
            ViolationType::SharedDbSession.isolation_flag(),
            Some(IsolationFlag::DbSession)
        );
        assert_eq!(ViolationType::MemoryLeak.isolation_flag(), None);
    }

    #[test]
    fn test_stack_trace_only_for_critical() {
        let critical = IsolationViolation::new(
            ViolationType::CrossRequestState,
            ViolationSeverity::Critical,
            Some("user_a"),
            None,
            "state leaked",
        );
        assert!(critical.stack_trace.is_some());

        let warning = IsolationViolation::new(
            ViolationType::SlowInstanceCreation,
            ViolationSeverity::Warning,
            None,
            None,
            "slow",
        );
        assert!(warning.stack_trace.is_none());
    }
}
