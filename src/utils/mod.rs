// src/utils/mod.rs
//! Common utilities: configuration, errors and identifiers

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{ContextError, EngineError, FactoryError, Result};

/// Generate a prefixed, time-sortable identifier (e.g. `eng_01H...`)
pub fn new_id(prefix: &str) -> String {
    format!("{}_{}", prefix, ulid::Ulid::new())
}
