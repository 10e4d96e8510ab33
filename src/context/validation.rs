// src/context/validation.rs
//! Identity field validation for execution contexts

use crate::utils::errors::ContextError;
use once_cell::sync::Lazy;
use regex::Regex;

/// Maximum length of any identity field
pub const MAX_ID_LEN: usize = 255;

/// Substrings that mark an identifier as a placeholder rather than a real id
pub const RESERVED_TOKENS: &[&str] = &[
    "placeholder",
    "default",
    "temp",
    "none",
    "null",
    "example",
    "undefined",
];

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:@-]*$").expect("identity pattern is valid")
});

/// Validate one identity field, returning the trimmed value
pub fn validate_identifier(field: &'static str, value: &str) -> Result<String, ContextError> {
    let trimmed = value.trim();

    if trimmed.is_empty() {
        return Err(ContextError::invalid(field, "must not be empty"));
    }
    if trimmed.len() > MAX_ID_LEN {
        return Err(ContextError::invalid(
            field,
            format!("exceeds {} characters", MAX_ID_LEN),
        ));
    }
    if !ID_PATTERN.is_match(trimmed) {
        return Err(ContextError::invalid(
            field,
            format!("`{}` contains disallowed characters", trimmed),
        ));
    }

    let lowered = trimmed.to_ascii_lowercase();
    if let Some(token) = RESERVED_TOKENS.iter().find(|t| lowered.contains(*t)) {
        return Err(ContextError::invalid(
            field,
            format!("`{}` looks like a placeholder (contains `{}`)", trimmed, token),
        ));
    }

    Ok(trimmed.to_string())
}

/// Reduce an operation name to characters safe for embedding in a request id
pub fn sanitize_operation_name(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(48)
        .collect();

    if cleaned.trim_matches('_').is_empty() {
        "op".to_string()
    } else {
        cleaned
    }
}
