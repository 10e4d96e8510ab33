// src/monitoring/status.rs
//! Health severity shared by the collector and the health checker

use crate::monitoring::violation::ViolationSeverity;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Health of one probe, one pass, or the whole system
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthSeverity {
    #[default]
    Healthy,
    Warning,
    Error,
    Critical,
}

impl HealthSeverity {
    /// Most severe of a set; `Healthy` when empty
    pub fn worst<I: IntoIterator<Item = HealthSeverity>>(items: I) -> Self {
        items.into_iter().max().unwrap_or_default()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Numeric form for gauges (0 = healthy .. 3 = critical)
    pub fn level(self) -> f64 {
        match self {
            Self::Healthy => 0.0,
            Self::Warning => 1.0,
            Self::Error => 2.0,
            Self::Critical => 3.0,
        }
    }
}

impl From<ViolationSeverity> for HealthSeverity {
    fn from(s: ViolationSeverity) -> Self {
        match s {
            ViolationSeverity::Info => Self::Healthy,
            ViolationSeverity::Warning => Self::Warning,
            ViolationSeverity::Error => Self::Error,
            ViolationSeverity::Critical => Self::Critical,
        }
    }
}

impl fmt::Display for HealthSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
