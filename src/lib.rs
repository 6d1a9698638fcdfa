//! mcp-gateway: progressive-disclosure gateway for MCP tool servers
//!
//! The gateway sits between an LLM coding assistant (the upstream MCP
//! client) and any number of downstream MCP servers, each a child process
//! speaking newline-delimited JSON-RPC over its standard streams. Instead
//! of listing every downstream tool schema into the assistant's context,
//! it exposes nine fixed meta-tools — search, describe, invoke, and
//! friends — so full schemas are fetched only on demand.
//!
//! # Architecture
//!
//! ```text
//! upstream client ──► gateway server ──► meta-tool dispatcher
//!                                             │
//!                     ┌───────────────────────┼──────────────────┐
//!                     ▼                       ▼                  ▼
//!               catalog registry        session manager      provisioner
//!                     │                       │                  │
//!                     └──── policy engine ────┤            manifest store
//!                        (applied last on     ▼
//!                         every payload)  downstream children
//! ```
//!
//! # Modules
//!
//! - [`catalog`] — Aggregated, policy-filtered tool/resource/prompt index
//! - [`cli`] — Command-line front-end
//! - [`config`] — MCP config discovery and launch specs
//! - [`error`] — Error types
//! - [`gateway`] — Meta-tool dispatcher and upstream server loop
//! - [`manifest`] — Static catalog of provisionable servers
//! - [`matcher`] — Capability matching for `request_capability`
//! - [`policy`] — Allow/deny rules, output caps, redaction
//! - [`provision`] — Asynchronous install jobs
//! - [`rpc`] — JSON-RPC 2.0 wire types and stdio framing
//! - [`session`] — Downstream child processes and their supervisor

pub mod catalog;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod manifest;
pub mod matcher;
pub mod policy;
pub mod provision;
pub mod rpc;
pub mod session;
