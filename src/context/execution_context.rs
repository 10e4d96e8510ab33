// src/context/execution_context.rs
//! Immutable per-request execution context
//!
//! A context carries the identity of one unit of work (user, thread, run,
//! request) plus two owned JSON maps. Fields are private and there are no
//! setters, so a context cannot change after construction. Child contexts
//! receive their own copies of both maps; nothing mutable is shared between
//! a parent and its children.

use crate::context::validation::{sanitize_operation_name, validate_identifier};
use crate::utils::errors::ContextError;
use crate::utils::new_id;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

/// JSON object type used for agent and audit data
pub type ContextMap = Map<String, Value>;

const REDACTED: &str = "[REDACTED]";
const SENSITIVE_KEY_MARKERS: &[&str] = &["token", "secret", "password", "key", "credential"];

/// Builder for root execution contexts
#[derive(Debug, Default)]
pub struct ContextBuilder {
    user_id: String,
    thread_id: String,
    run_id: String,
    websocket_channel_id: Option<String>,
    db_session_id: Option<String>,
    agent_context: Option<Value>,
    audit_metadata: Option<Value>,
}

impl ContextBuilder {
    pub fn websocket_channel_id(mut self, id: impl Into<String>) -> Self {
        self.websocket_channel_id = Some(id.into());
        self
    }

    pub fn db_session_id(mut self, id: impl Into<String>) -> Self {
        self.db_session_id = Some(id.into());
        self
    }

    /// Business/session data; must be a JSON object
    pub fn agent_context(mut self, value: Value) -> Self {
        self.agent_context = Some(value);
        self
    }

    /// Compliance/audit data; must be a JSON object
    pub fn audit_metadata(mut self, value: Value) -> Self {
        self.audit_metadata = Some(value);
        self
    }

    /// Validate every field and build the context
    pub fn build(self) -> Result<UserExecutionContext, ContextError> {
        let user_id = validate_identifier("user_id", &self.user_id)?;
        let thread_id = validate_identifier("thread_id", &self.thread_id)?;
        let run_id = validate_identifier("run_id", &self.run_id)?;

        let websocket_channel_id = self
            .websocket_channel_id
            .map(|id| validate_identifier("websocket_channel_id", &id))
            .transpose()?;
        let db_session_id = self
            .db_session_id
            .map(|id| validate_identifier("db_session_id", &id))
            .transpose()?;

        let agent_context = into_map("agent_context", self.agent_context)?;
        let audit_metadata = into_map("audit_metadata", self.audit_metadata)?;

        Ok(UserExecutionContext {
            request_id: fresh_request_id("req", &run_id),
            user_id,
            thread_id,
            run_id,
            websocket_channel_id,
            db_session_id,
            agent_context,
            audit_metadata,
            operation_depth: 0,
            parent_request_id: None,
            operation_name: None,
            created_at: Utc::now(),
        })
    }
}

fn into_map(field: &'static str, value: Option<Value>) -> Result<ContextMap, ContextError> {
    match value {
        None | Some(Value::Null) => Ok(ContextMap::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(other) => Err(ContextError::invalid(
            field,
            format!("expected a JSON object, got {}", json_kind(&other)),
        )),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn fresh_request_id(prefix: &str, run_id: &str) -> String {
    loop {
        let id = new_id(prefix);
        if id != run_id {
            return id;
        }
    }
}

/// Immutable identity and state for one request
#[derive(Debug, Clone, Serialize)]
pub struct UserExecutionContext {
    user_id: String,
    thread_id: String,
    run_id: String,
    request_id: String,
    websocket_channel_id: Option<String>,
    db_session_id: Option<String>,
    agent_context: ContextMap,
    audit_metadata: ContextMap,
    operation_depth: u32,
    parent_request_id: Option<String>,
    operation_name: Option<String>,
    created_at: DateTime<Utc>,
}

impl UserExecutionContext {
    /// Start building a root context
    pub fn builder(
        user_id: impl Into<String>,
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> ContextBuilder {
        ContextBuilder {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    /// Root context with no channel, session or data
    pub fn new(user_id: &str, thread_id: &str, run_id: &str) -> Result<Self, ContextError> {
        Self::builder(user_id, thread_id, run_id).build()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn websocket_channel_id(&self) -> Option<&str> {
        self.websocket_channel_id.as_deref()
    }

    pub fn db_session_id(&self) -> Option<&str> {
        self.db_session_id.as_deref()
    }

    pub fn agent_context(&self) -> &ContextMap {
        &self.agent_context
    }

    pub fn audit_metadata(&self) -> &ContextMap {
        &self.audit_metadata
    }

    pub fn operation_depth(&self) -> u32 {
        self.operation_depth
    }

    pub fn parent_request_id(&self) -> Option<&str> {
        self.parent_request_id.as_deref()
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation_name.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_root(&self) -> bool {
        self.operation_depth == 0
    }

    /// Derive a child context for a sub-operation
    pub fn create_child(&self, operation_name: &str) -> Self {
        self.create_child_with(operation_name, ContextMap::new(), ContextMap::new())
    }

    /// Derive a child context, merging extra data over copies of this context's maps
    pub fn create_child_with(
        &self,
        operation_name: &str,
        extra_agent_context: ContextMap,
        extra_audit_metadata: ContextMap,
    ) -> Self {
        let op = sanitize_operation_name(operation_name);
        let depth = self.operation_depth + 1;

        let mut agent_context = self.agent_context.clone();
        agent_context.extend(extra_agent_context);

        let mut audit_metadata = self.audit_metadata.clone();
        audit_metadata.extend(extra_audit_metadata);
        audit_metadata.insert("parent_request_id".into(), json!(self.request_id));
        audit_metadata.insert("operation_name".into(), json!(operation_name));
        audit_metadata.insert("operation_depth".into(), json!(depth));

        Self {
            user_id: self.user_id.clone(),
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            request_id: fresh_request_id(&format!("req_{}", op), &self.run_id),
            websocket_channel_id: self.websocket_channel_id.clone(),
            db_session_id: self.db_session_id.clone(),
            agent_context,
            audit_metadata,
            operation_depth: depth,
            parent_request_id: Some(self.request_id.clone()),
            operation_name: Some(operation_name.to_string()),
            created_at: Utc::now(),
        }
    }

    /// Short deterministic id for correlating logs across hops
    pub fn get_correlation_id(&self) -> String {
        let user: String = self.user_id.chars().take(8).collect();
        let thread: String = self.thread_id.chars().take(8).collect();
        format!("{}:{}", user, thread)
    }

    /// Structured record for compliance export; sensitive agent data is redacted
    pub fn get_audit_trail(&self) -> Value {
        let redacted: ContextMap = self
            .agent_context
            .iter()
            .map(|(k, v)| {
                let lowered = k.to_ascii_lowercase();
                if SENSITIVE_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                    (k.clone(), json!(REDACTED))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect();

        json!({
            "context_id": self.request_id,
            "correlation_id": self.get_correlation_id(),
            "user_id": self.user_id,
            "thread_id": self.thread_id,
            "run_id": self.run_id,
            "created_at": self.created_at.to_rfc3339(),
            "operation_depth": self.operation_depth,
            "operation_name": self.operation_name,
            "parent_request_id": self.parent_request_id,
            "has_db_session": self.db_session_id.is_some(),
            "websocket_channel_id": self.websocket_channel_id,
            "agent_context": redacted,
            "audit_metadata": self.audit_metadata,
        })
    }

    /// Check internal consistency of this context
    pub fn verify_isolation(&self) -> Result<(), ContextError> {
        if self.request_id == self.run_id {
            return Err(ContextError::Isolation(format!(
                "request_id equals run_id ({})",
                self.run_id
            )));
        }
        if self.is_root() != self.parent_request_id.is_none() {
            return Err(ContextError::Isolation(format!(
                "depth {} inconsistent with parent {:?}",
                self.operation_depth, self.parent_request_id
            )));
        }
        Ok(())
    }

    /// Fail when `other` belongs to another user but shares this context's thread or state
    pub fn validate_isolation_integrity(&self, other: &Self) -> Result<(), ContextError> {
        if self.user_id == other.user_id {
            return Ok(());
        }

        if self.thread_id == other.thread_id {
            return Err(ContextError::Isolation(format!(
                "users {} and {} share thread {}",
                self.user_id, other.user_id, self.thread_id
            )));
        }
        if self.request_id == other.request_id {
            return Err(ContextError::Isolation(format!(
                "users {} and {} share request {}",
                self.user_id, other.user_id, self.request_id
            )));
        }
        if let (Some(a), Some(b)) = (&self.db_session_id, &other.db_session_id) {
            if a == b {
                return Err(ContextError::Isolation(format!(
                    "users {} and {} share db session {}",
                    self.user_id, other.user_id, a
                )));
            }
        }
        if let (Some(a), Some(b)) = (&self.websocket_channel_id, &other.websocket_channel_id) {
            if a == b {
                return Err(ContextError::Isolation(format!(
                    "users {} and {} share websocket channel {}",
                    self.user_id, other.user_id, a
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> UserExecutionContext {
        UserExecutionContext::builder("user_alice", "thread_1", "run_1")
            .agent_context(json!({"session": {"turn": 1}, "api_token": "abc"}))
            .audit_metadata(json!({"source": "web"}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_root_context() {
        let ctx = root();
        assert_eq!(ctx.user_id(), "user_alice");
        assert_eq!(ctx.operation_depth(), 0);
        assert!(ctx.parent_request_id().is_none());
        assert!(ctx.request_id().starts_with("req_"));
        assert_ne!(ctx.request_id(), ctx.run_id());
        assert!(ctx.verify_isolation().is_ok());
    }

    #[test]
    fn test_map_fields_must_be_objects() {
        let err = UserExecutionContext::builder("user_a", "thread_a", "run_a")
            .agent_context(json!(["not", "a", "map"]))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::invalid("agent_context", "expected a JSON object, got array")
        );

        let err = UserExecutionContext::builder("user_a", "thread_a", "run_a")
            .audit_metadata(json!("text"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ContextError::Invalid { field: "audit_metadata", .. }));
    }

    #[test]
    fn test_child_derivation() {
        let parent = root();
        let child = parent.create_child("search tool");

        assert_eq!(child.operation_depth(), 1);
        assert_eq!(child.parent_request_id(), Some(parent.request_id()));
        assert!(child.request_id().starts_with("req_search_tool_"));
        assert_eq!(child.user_id(), parent.user_id());
        assert_eq!(child.operation_name(), Some("search tool"));
        assert_eq!(
            child.audit_metadata()["parent_request_id"],
            json!(parent.request_id())
        );

        let grandchild = child.create_child("nested");
        assert_eq!(grandchild.operation_depth(), 2);
        assert!(grandchild.verify_isolation().is_ok());
    }

    #[test]
    fn test_child_maps_are_independent_copies() {
        let parent = root();
        let mut extra = ContextMap::new();
        extra.insert("session".into(), json!({"turn": 99}));
        let child = parent.create_child_with("op", extra, ContextMap::new());

        assert_eq!(child.agent_context()["session"]["turn"], json!(99));
        assert_eq!(parent.agent_context()["session"]["turn"], json!(1));
        assert!(!parent.audit_metadata().contains_key("operation_name"));
    }

    #[test]
    fn test_correlation_id_is_deterministic() {
        let a = UserExecutionContext::new("user_abcdefghij", "thread_xyz123", "run_1").unwrap();
        let b = UserExecutionContext::new("user_abcdefghij", "thread_xyz123", "run_2").unwrap();
        assert_eq!(a.get_correlation_id(), "user_abc:thread_x");
        assert_eq!(a.get_correlation_id(), b.get_correlation_id());
    }

    #[test]
    fn test_audit_trail_redacts_sensitive_values() {
        let trail = root().get_audit_trail();
        assert_eq!(trail["agent_context"]["api_token"], json!("[REDACTED]"));
        assert_eq!(trail["agent_context"]["session"]["turn"], json!(1));
        assert_eq!(trail["operation_depth"], json!(0));
        assert_eq!(trail["has_db_session"], json!(false));
    }

    #[test]
    fn test_cross_user_integrity() {
        let alice = UserExecutionContext::new("user_alice", "thread_shared", "run_a").unwrap();
        let bob = UserExecutionContext::new("user_bob", "thread_shared", "run_b").unwrap();
        assert!(matches!(
            alice.validate_isolation_integrity(&bob),
            Err(ContextError::Isolation(_))
        ));

        let carol = UserExecutionContext::builder("user_carol", "thread_c", "run_c")
            .db_session_id("sess_1")
            .build()
            .unwrap();
        let dave = UserExecutionContext::builder("user_dave", "thread_d", "run_d")
            .db_session_id("sess_1")
            .build()
            .unwrap();
        assert!(carol.validate_isolation_integrity(&dave).is_err());

        let erin = UserExecutionContext::new("user_erin", "thread_e", "run_e").unwrap();
        assert!(alice.validate_isolation_integrity(&erin).is_ok());

        // Same user may reuse a thread
        let alice_again = UserExecutionContext::new("user_alice", "thread_shared", "run_z").unwrap();
        assert!(alice.validate_isolation_integrity(&alice_again).is_ok());
    }
}
