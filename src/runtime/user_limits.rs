// src/runtime/user_limits.rs
//! Per-user concurrency limits for execution engines
//!
//! Every user gets the default ceiling unless an override names them.
//! Overrides can raise or lower the ceiling but never remove it.

use crate::utils::config::FactorySettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound accepted for any per-user limit
pub const MAX_ENGINES_CEILING: usize = 1024;

/// Concurrent engine limits per user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserLimits {
    /// Ceiling applied to users without an override
    pub max_engines_per_user: usize,

    /// Per-user ceilings
    #[serde(default)]
    pub overrides: HashMap<String, usize>,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            max_engines_per_user: 2,
            overrides: HashMap::new(),
        }
    }
}

impl From<&FactorySettings> for UserLimits {
    fn from(settings: &FactorySettings) -> Self {
        Self {
            max_engines_per_user: settings.max_engines_per_user,
            overrides: settings.user_overrides.clone(),
        }
    }
}

impl UserLimits {
    /// One engine per user
    pub fn strict() -> Self {
        Self {
            max_engines_per_user: 1,
            overrides: HashMap::new(),
        }
    }

    /// Generous limits for development
    pub fn relaxed() -> Self {
        Self {
            max_engines_per_user: 8,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, user_id: impl Into<String>, max_engines: usize) -> Self {
        self.overrides.insert(user_id.into(), max_engines);
        self
    }

    /// Ceiling for `user_id`
    pub fn limit_for(&self, user_id: &str) -> usize {
        self.overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.max_engines_per_user)
    }

    /// Validate limits
    pub fn validate(&self) -> Result<(), String> {
        check_limit("max_engines_per_user", self.max_engines_per_user)?;
        for (user, limit) in &self.overrides {
            check_limit(&format!("override for {}", user), *limit)?;
        }
        Ok(())
    }
}

fn check_limit(what: &str, limit: usize) -> Result<(), String> {
    if limit == 0 {
        return Err(format!("{} cannot be 0", what));
    }
    if limit > MAX_ENGINES_CEILING {
        return Err(format!("{} cannot exceed {}", what, MAX_ENGINES_CEILING));
    }
    Ok(())
}
