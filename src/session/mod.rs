//! Downstream session management.
//!
//! A [`Session`] owns one child process speaking newline-delimited JSON-RPC
//! on its standard streams. The [`SessionManager`] owns the name → session
//! registry, fans out parallel startup, and diffs configuration on refresh.
//!
//! # Ownership
//!
//! The manager owns sessions; sessions never hold a reference back. Anything
//! a session needs to tell the world (unsolicited notifications) flows
//! through a message channel installed by the manager — no shared mutable
//! graph.

mod manager;
#[allow(clippy::module_inception)]
mod session;

pub use manager::{RefreshReport, ServerHealth, SessionManager, StartReport};
pub use session::{
    HeartbeatFn, PromptDescriptor, RequestSlot, ResourceDescriptor, ServerHandshake, Session,
    SessionState, ToolDescriptor, CALL_TIMEOUT, HEARTBEAT_CANCEL_GUARD, MAX_PENDING_PER_SESSION,
};
