//! JSON-RPC 2.0 wire types and stdio framing.
//!
//! The gateway speaks the same wire format on both edges: newline-delimited
//! JSON-RPC 2.0 over standard streams. Upstream it acts as an MCP server;
//! downstream it acts as an MCP client, one child process per server. This
//! module holds the message types shared by both directions and the
//! transport for the upstream edge.
//!
//! # Protocol Version
//!
//! This implementation targets MCP protocol version 2024-11-05.

pub mod protocol;
pub mod transport;

pub use protocol::{
    parse_message, ErrorCode, IncomingMessage, InboundResponse, JsonRpcError, JsonRpcErrorData,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId, JSONRPC_VERSION,
    MCP_PROTOCOL_VERSION,
};
pub use transport::{encode_line, StdioTransport, TransportWriter};
