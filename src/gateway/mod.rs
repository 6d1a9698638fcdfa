//! The upstream-facing gateway: meta-tool dispatch and the MCP server loop.
//!
//! # Lifecycle Flow
//!
//! ```text
//! Client                     Gateway
//!   │                          │
//!   ├─── initialize ──────────▶│
//!   │◀── initialize result ────┤
//!   ├─── initialized ─────────▶│  (notification)
//!   │                          │
//!   ├─── tools/list ──────────▶│  nine meta-tools, nothing else
//!   ├─── tools/call ──────────▶│──► dispatcher ──► sessions
//!   │◀── call result ──────────┤      (policy shaped)
//!   │                          │
//!   ├─── (close stdin) ───────▶│  exit
//! ```

pub mod dispatch;
pub mod server;
mod validate;

pub use dispatch::{ConfigSources, Dispatcher, Envelope, EnvelopeError};
pub use server::{GatewayServer, ServerState};
pub use validate::validate_arguments;
