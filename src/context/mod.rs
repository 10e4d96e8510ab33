// src/context/mod.rs
//! Per-request execution identity
//!
//! - **Execution Context**: immutable user/thread/run/request identity with
//!   hierarchical child derivation
//! - **Validation**: identity field rules (pattern, length, placeholder tokens)
//!
//! ```text
//! root (depth 0, req_01H..)
//!  ├─ child "search"  (depth 1, parent = root.request_id)
//!  │   └─ child "fetch" (depth 2)
//!  └─ child "summarize" (depth 1)
//! ```

pub mod execution_context;
pub mod validation;

pub use execution_context::{ContextBuilder, ContextMap, UserExecutionContext};
pub use validation::{validate_identifier, RESERVED_TOKENS};
