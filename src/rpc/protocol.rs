//! JSON-RPC 2.0 message types and parsing.
//!
//! One line of input is one message. Incoming lines are classified into
//! requests (have `method` and `id`), notifications (have `method`, no
//! `id`), and responses (have `id` and one of `result`/`error`) — the last
//! category only appears on the downstream edge, where the gateway is the
//! client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The JSON-RPC version string required on every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// The MCP protocol version this gateway targets.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Name advertised in the upstream `initialize` response.
pub const SERVER_NAME: &str = "mcp-gateway";

/// A JSON-RPC request id.
///
/// JSON-RPC allows numbers and strings; both are preserved exactly so
/// responses echo the caller's id unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id.
    Number(i64),
    /// String id.
    String(String),
}

impl RequestId {
    /// Returns the numeric value, if this id is a number.
    #[must_use]
    pub const fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) if *n >= 0 => Some(n.unsigned_abs()),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// An outgoing or incoming JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Request id; echoed on the response.
    pub id: RequestId,
    /// Method name, e.g. `tools/call`.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Creates a request with the given id, method, and parameters.
    #[must_use]
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Method name, e.g. `notifications/initialized`.
    pub method: String,
    /// Notification parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a notification with the given method and parameters.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A successful JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request this answers.
    pub id: RequestId,
    /// Result payload.
    pub result: Value,
}

impl JsonRpcResponse {
    /// Creates a success response.
    #[must_use]
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// Standard JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Invalid JSON was received (-32700).
    ParseError,
    /// The JSON is not a valid request object (-32600).
    InvalidRequest,
    /// The method does not exist (-32601).
    MethodNotFound,
    /// Invalid method parameters (-32602).
    InvalidParams,
    /// Internal JSON-RPC error (-32603).
    InternalError,
}

impl ErrorCode {
    /// The wire value for this code.
    #[must_use]
    pub const fn value(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
        }
    }
}

/// The `error` member of an error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorData {
    /// Numeric error code.
    pub code: i64,
    /// Short error description.
    pub message: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorData {
    /// Creates error data with the given code and message.
    #[must_use]
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.value(),
            message: message.into(),
            data: None,
        }
    }
}

/// A complete JSON-RPC error response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Always `"2.0"`.
    pub jsonrpc: String,
    /// Id of the request this answers; `None` when the request id could not
    /// be recovered (e.g. parse errors).
    pub id: Option<RequestId>,
    /// The error payload.
    pub error: JsonRpcErrorData,
}

impl JsonRpcError {
    /// Creates an error response.
    #[must_use]
    pub fn new(id: Option<RequestId>, error: JsonRpcErrorData) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error,
        }
    }

    /// A -32700 parse error (no request id available).
    #[must_use]
    pub fn parse_error(detail: impl std::fmt::Display) -> Self {
        Self::new(
            None,
            JsonRpcErrorData::with_message(ErrorCode::ParseError, format!("Parse error: {detail}")),
        )
    }

    /// A -32600 invalid-request error.
    #[must_use]
    pub fn invalid_request(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::new(
            id,
            JsonRpcErrorData::with_message(ErrorCode::InvalidRequest, message),
        )
    }

    /// A -32601 method-not-found error.
    #[must_use]
    pub fn method_not_found(id: RequestId, method: &str) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::with_message(
                ErrorCode::MethodNotFound,
                format!("Method not found: {method}"),
            ),
        )
    }

    /// A -32602 invalid-params error.
    #[must_use]
    pub fn invalid_params(id: RequestId, message: impl Into<String>) -> Self {
        Self::new(
            Some(id),
            JsonRpcErrorData::with_message(ErrorCode::InvalidParams, message),
        )
    }
}

/// A response received from a downstream server.
///
/// Exactly one of `result`/`error` is populated on a conforming wire; both
/// are kept so the session can report a malformed peer instead of panicking.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundResponse {
    /// Id of the request this answers.
    pub id: RequestId,
    /// Success payload.
    pub result: Option<Value>,
    /// Error payload.
    pub error: Option<JsonRpcErrorData>,
}

/// A parsed incoming message.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// A request expecting a response.
    Request(JsonRpcRequest),
    /// A fire-and-forget notification.
    Notification(JsonRpcNotification),
    /// A response to one of our own requests (downstream edge only).
    Response(InboundResponse),
}

/// Parses one line of input into a classified message.
///
/// # Errors
///
/// Returns a ready-to-send [`JsonRpcError`] when the line is not valid
/// JSON, not a JSON object, misses the `"2.0"` version marker, or fits no
/// message shape.
pub fn parse_message(line: &str) -> Result<IncomingMessage, JsonRpcError> {
    let value: Value = serde_json::from_str(line).map_err(|e| JsonRpcError::parse_error(e))?;

    let Some(obj) = value.as_object() else {
        return Err(JsonRpcError::invalid_request(
            None,
            "Message must be a JSON object",
        ));
    };

    let id = obj
        .get("id")
        .cloned()
        .and_then(|v| serde_json::from_value::<RequestId>(v).ok());

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(JsonRpcError::invalid_request(
            id,
            "Missing or invalid jsonrpc version",
        ));
    }

    if obj.contains_key("method") {
        if id.is_some() {
            let req: JsonRpcRequest = serde_json::from_value(value)
                .map_err(|e| JsonRpcError::invalid_request(None, format!("Invalid request: {e}")))?;
            return Ok(IncomingMessage::Request(req));
        }
        let notif: JsonRpcNotification = serde_json::from_value(value)
            .map_err(|e| JsonRpcError::invalid_request(None, format!("Invalid notification: {e}")))?;
        return Ok(IncomingMessage::Notification(notif));
    }

    if id.is_some() && (obj.contains_key("result") || obj.contains_key("error")) {
        let resp: InboundResponse = serde_json::from_value(value)
            .map_err(|e| JsonRpcError::invalid_request(None, format!("Invalid response: {e}")))?;
        return Ok(IncomingMessage::Response(resp));
    }

    Err(JsonRpcError::invalid_request(
        id,
        "Message is neither request, notification, nor response",
    ))
}
