//! Upstream MCP server loop.
//!
//! Presents the gateway as a single MCP server over stdio. Only the nine
//! meta-tools are listed; resources and prompts are proxied through the
//! catalog to their owning sessions. Suspending operations (`tools/call`,
//! `resources/read`, `prompts/get`) run in spawned tasks so the loop keeps
//! reading — which is what lets an upstream `notifications/cancelled`
//! reach an in-flight `invoke`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::catalog::split_tool_id;
use crate::config::cache_dir;
use crate::gateway::dispatch::Dispatcher;
use crate::rpc::{
    parse_message, IncomingMessage, JsonRpcError, JsonRpcErrorData, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId, StdioTransport, TransportWriter,
    MCP_PROTOCOL_VERSION,
};
use crate::session::RequestSlot;

/// How often the loop checks for a CLI refresh marker.
const MARKER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// File the `refresh` subcommand drops into the cache directory.
pub const REFRESH_MARKER_FILE: &str = "refresh.request";

/// File the serving process keeps its status snapshot in.
pub const STATUS_FILE: &str = "status.json";

/// Server state in the MCP lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Waiting for initialize request.
    AwaitingInit,
    /// Initialize received, waiting for initialized notification.
    Initialising,
    /// Ready for normal operation.
    Running,
    /// Shutdown in progress.
    ShuttingDown,
}

/// A tool definition for the tools/list response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    pub input_schema: Value,
}

/// Content item in a tool call response.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ToolContent {
    Text { text: String },
}

/// Result of a tool call.
///
/// Per MCP, tool-level failures are reported in the result, not as
/// protocol errors — which is exactly the envelope contract.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallResult {
    content: Vec<ToolContent>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_error: bool,
}

impl ToolCallResult {
    fn from_envelope(envelope: &crate::gateway::Envelope) -> Self {
        let text = serde_json::to_string(envelope)
            .unwrap_or_else(|_| r#"{"ok":false,"error":{"code":"Internal"}}"#.to_string());
        Self {
            content: vec![ToolContent::Text { text }],
            is_error: !envelope.ok,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// The upstream MCP server.
pub struct GatewayServer {
    dispatcher: Arc<Dispatcher>,
    state: ServerState,
    /// Upstream request id → downstream request slot, for `invoke` calls
    /// that upstream may still cancel.
    inflight: Arc<Mutex<HashMap<String, RequestSlot>>>,
    cache_dir: Option<PathBuf>,
}

impl GatewayServer {
    /// Creates a server around a wired dispatcher.
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            state: ServerState::AwaitingInit,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            cache_dir: cache_dir(),
        }
    }

    /// Returns the current server state.
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Persists the status snapshot for the `status` subcommand.
    pub async fn write_status_file(&self) {
        let Some(dir) = &self.cache_dir else { return };
        let mut document = self.dispatcher.status_document().await;
        if let Some(obj) = document.as_object_mut() {
            obj.insert("pid".to_string(), json!(std::process::id()));
            let updated = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();
            obj.insert("updated_at".to_string(), json!(updated));
        }
        if std::fs::create_dir_all(dir).is_ok() {
            let path = dir.join(STATUS_FILE);
            if let Err(e) = std::fs::write(&path, document.to_string()) {
                debug!(error = %e, "could not write status snapshot");
            }
        }
    }

    /// Runs the MCP server main loop until the client closes stdin.
    ///
    /// # Errors
    ///
    /// Returns an error if transport I/O fails.
    pub async fn run(&mut self) -> std::io::Result<()> {
        let mut transport = StdioTransport::new();
        let writer = transport.writer();
        let mut poll = tokio::time::interval(MARKER_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // Drain unsolicited downstream notifications; the upstream surface
        // is fixed, so they are observability, not traffic
        if let Some(mut notifications) = self.dispatcher.manager().take_notification_stream() {
            tokio::spawn(async move {
                while let Some((server, notification)) = notifications.recv().await {
                    debug!(server = %server, method = %notification.method, "downstream notification");
                }
            });
        }

        // Reading happens in its own task: a line-in-progress must survive
        // the select below, and channel recv is cancellation safe where
        // read_line is not.
        let (line_tx, mut line_rx) = tokio::sync::mpsc::channel::<std::io::Result<String>>(16);
        tokio::spawn(async move {
            loop {
                match transport.read_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(Ok(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        let _ = line_tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        loop {
            tokio::select! {
                line = line_rx.recv() => {
                    let Some(line) = line else {
                        // EOF - client closed the connection
                        self.state = ServerState::ShuttingDown;
                        break;
                    };
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.handle_line(&line, &writer).await?;
                    if self.state == ServerState::ShuttingDown {
                        break;
                    }
                }
                _ = poll.tick() => {
                    self.poll_refresh_marker().await;
                }
            }
        }

        info!("upstream closed, shutting down sessions");
        self.dispatcher.manager().shutdown().await;
        Ok(())
    }

    async fn handle_line(&mut self, line: &str, writer: &TransportWriter) -> std::io::Result<()> {
        match parse_message(line) {
            Ok(IncomingMessage::Request(req)) => self.handle_request(req, writer).await,
            Ok(IncomingMessage::Notification(notif)) => {
                self.handle_notification(&notif);
                Ok(())
            }
            Ok(IncomingMessage::Response(_)) => {
                // The gateway never issues upstream requests
                debug!("ignoring unexpected response message from upstream");
                Ok(())
            }
            Err(error) => writer.write_error(&error).await,
        }
    }

    async fn handle_request(
        &mut self,
        req: JsonRpcRequest,
        writer: &TransportWriter,
    ) -> std::io::Result<()> {
        match req.method.as_str() {
            "initialize" => {
                let response = self.handle_initialize(&req);
                self.write_outcome(writer, response).await
            }
            "ping" => {
                writer
                    .write_response(&JsonRpcResponse::success(req.id.clone(), json!({})))
                    .await
            }
            "tools/list" => {
                let response = self.require_running(&req.id).map(|()| {
                    JsonRpcResponse::success(req.id.clone(), json!({"tools": meta_tool_definitions()}))
                });
                self.write_outcome(writer, response).await
            }
            "tools/call" => {
                if let Err(error) = self.require_running(&req.id) {
                    return writer.write_error(&error).await;
                }
                self.spawn_tool_call(req, writer);
                Ok(())
            }
            "resources/list" => {
                let response = self.require_running(&req.id).map(|()| {
                    let snapshot = self.dispatcher.catalog().snapshot();
                    let resources: Vec<Value> = snapshot
                        .resources
                        .iter()
                        .map(|entry| {
                            json!({
                                "uri": entry.uri,
                                "name": entry.name,
                                "description": entry.description,
                                "mimeType": entry.mime_type,
                                "server": entry.server,
                            })
                        })
                        .collect();
                    JsonRpcResponse::success(req.id.clone(), json!({"resources": resources}))
                });
                self.write_outcome(writer, response).await
            }
            "resources/read" => {
                if let Err(error) = self.require_running(&req.id) {
                    return writer.write_error(&error).await;
                }
                self.spawn_proxy_read(req, writer);
                Ok(())
            }
            "prompts/list" => {
                let response = self.require_running(&req.id).map(|()| {
                    let snapshot = self.dispatcher.catalog().snapshot();
                    let prompts: Vec<Value> = snapshot
                        .prompts
                        .iter()
                        .map(|entry| {
                            json!({
                                "name": entry.prompt_id,
                                "description": entry.description,
                                "arguments": entry.arguments,
                            })
                        })
                        .collect();
                    JsonRpcResponse::success(req.id.clone(), json!({"prompts": prompts}))
                });
                self.write_outcome(writer, response).await
            }
            "prompts/get" => {
                if let Err(error) = self.require_running(&req.id) {
                    return writer.write_error(&error).await;
                }
                self.spawn_prompt_get(req, writer);
                Ok(())
            }
            _ => {
                writer
                    .write_error(&JsonRpcError::method_not_found(req.id.clone(), &req.method))
                    .await
            }
        }
    }

    async fn write_outcome(
        &self,
        writer: &TransportWriter,
        outcome: Result<JsonRpcResponse, JsonRpcError>,
    ) -> std::io::Result<()> {
        match outcome {
            Ok(response) => writer.write_response(&response).await,
            Err(error) => writer.write_error(&error).await,
        }
    }

    fn handle_notification(&mut self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => {
                if self.state == ServerState::Initialising {
                    self.state = ServerState::Running;
                    info!("upstream client initialised");
                }
            }
            "notifications/cancelled" => self.propagate_cancellation(notif.params.as_ref()),
            // All other notifications are ignored per JSON-RPC
            _ => {}
        }
    }

    /// Upstream cancelled a request: forward a protocol cancel to the
    /// owning session and fail the pending entry locally.
    fn propagate_cancellation(&self, params: Option<&Value>) {
        let Some(upstream_id) = params
            .and_then(|p| p.get("requestId"))
            .map(ToString::to_string)
        else {
            return;
        };
        let upstream_id = upstream_id.trim_matches('"').to_string();

        let slot = self
            .inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&upstream_id);
        let Some(slot) = slot else {
            debug!(upstream_id = %upstream_id, "cancellation for unknown request");
            return;
        };
        let Some(request_id) = slot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
        else {
            return;
        };

        let manager = Arc::clone(self.dispatcher.manager());
        tokio::spawn(async move {
            let Some((server, _)) = split_tool_id(&request_id) else {
                return;
            };
            if let Some(session) = manager.get(server).await {
                info!(request_id = %request_id, "propagating upstream cancellation");
                if let Err(e) = session.cancel(&request_id, true).await {
                    warn!(request_id = %request_id, error = %e, "cancellation failed");
                }
            }
        });
    }

    fn handle_initialize(
        &mut self,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, JsonRpcError> {
        if self.state != ServerState::AwaitingInit {
            return Err(JsonRpcError::new(
                Some(req.id.clone()),
                JsonRpcErrorData::with_message(
                    crate::rpc::ErrorCode::InvalidRequest,
                    "Server already initialised",
                ),
            ));
        }
        if req.params.is_none() {
            return Err(JsonRpcError::invalid_params(
                req.id.clone(),
                "Missing initialize params",
            ));
        }

        self.state = ServerState::Initialising;
        let result = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": {"listChanged": false},
                "resources": {},
                "prompts": {},
            },
            "serverInfo": {
                "name": crate::rpc::protocol::SERVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        Ok(JsonRpcResponse::success(req.id.clone(), result))
    }

    fn require_running(&self, id: &RequestId) -> Result<(), JsonRpcError> {
        if self.state == ServerState::Running {
            Ok(())
        } else {
            Err(JsonRpcError::new(
                Some(id.clone()),
                JsonRpcErrorData::with_message(
                    crate::rpc::ErrorCode::InvalidRequest,
                    "Server not initialised",
                ),
            ))
        }
    }

    /// Runs one meta-tool call in its own task so the loop keeps reading.
    fn spawn_tool_call(&self, req: JsonRpcRequest, writer: &TransportWriter) {
        let writer = writer.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let inflight = Arc::clone(&self.inflight);
        let upstream_id = req.id.to_string();
        let id = req.id.clone();

        tokio::spawn(async move {
            let params: Result<ToolCallParams, _> = req
                .params
                .map_or_else(|| Err("missing tool call params".to_string()), |p| {
                    serde_json::from_value(p).map_err(|e| e.to_string())
                });
            let response = match params {
                Err(message) => {
                    let _ = writer
                        .write_error(&JsonRpcError::invalid_params(id, message))
                        .await;
                    return;
                }
                Ok(params) => {
                    // Only invoke can be cancelled mid-flight; register its
                    // downstream request id before dispatching
                    let slot: Option<RequestSlot> = if params.name == "invoke" {
                        let slot: RequestSlot = Arc::new(Mutex::new(None));
                        inflight
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner)
                            .insert(upstream_id.clone(), Arc::clone(&slot));
                        Some(slot)
                    } else {
                        None
                    };

                    let envelope = dispatcher
                        .dispatch(&params.name, params.arguments, slot)
                        .await;
                    inflight
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&upstream_id);

                    let result = ToolCallResult::from_envelope(&envelope);
                    JsonRpcResponse::success(
                        id,
                        serde_json::to_value(result).unwrap_or(Value::Null),
                    )
                }
            };
            let _ = writer.write_response(&response).await;
        });
    }

    /// Proxies `resources/read` to the owning session.
    fn spawn_proxy_read(&self, req: JsonRpcRequest, writer: &TransportWriter) {
        let writer = writer.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let id = req.id.clone();
            let uri = req
                .params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
                .map(String::from);
            let Some(uri) = uri else {
                let _ = writer
                    .write_error(&JsonRpcError::invalid_params(id, "Missing resource uri"))
                    .await;
                return;
            };

            let outcome = proxy_resource_read(&dispatcher, &uri).await;
            match outcome {
                Ok(result) => {
                    let _ = writer
                        .write_response(&JsonRpcResponse::success(id, result))
                        .await;
                }
                Err(e) => {
                    let _ = writer
                        .write_error(&JsonRpcError::new(
                            Some(id),
                            JsonRpcErrorData::with_message(
                                crate::rpc::ErrorCode::InternalError,
                                e.to_string(),
                            ),
                        ))
                        .await;
                }
            }
        });
    }

    /// Proxies `prompts/get` to the owning session.
    fn spawn_prompt_get(&self, req: JsonRpcRequest, writer: &TransportWriter) {
        let writer = writer.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let id = req.id.clone();
            let name = req
                .params
                .as_ref()
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .map(String::from);
            let Some(name) = name else {
                let _ = writer
                    .write_error(&JsonRpcError::invalid_params(id, "Missing prompt name"))
                    .await;
                return;
            };
            let arguments = req
                .params
                .as_ref()
                .and_then(|p| p.get("arguments"))
                .cloned();

            let outcome = proxy_prompt_get(&dispatcher, &name, arguments).await;
            match outcome {
                Ok(result) => {
                    let _ = writer
                        .write_response(&JsonRpcResponse::success(id, result))
                        .await;
                }
                Err(e) => {
                    let _ = writer
                        .write_error(&JsonRpcError::new(
                            Some(id),
                            JsonRpcErrorData::with_message(
                                crate::rpc::ErrorCode::InternalError,
                                e.to_string(),
                            ),
                        ))
                        .await;
                }
            }
        });
    }

    /// Applies a refresh requested by the CLI through the cache directory.
    async fn poll_refresh_marker(&self) {
        let Some(dir) = &self.cache_dir else { return };
        let marker = dir.join(REFRESH_MARKER_FILE);
        if !marker.exists() {
            return;
        }

        #[derive(Debug, Default, Deserialize)]
        struct MarkerRequest {
            #[serde(default)]
            server: Option<String>,
            #[serde(default)]
            force: bool,
        }
        let request: MarkerRequest = std::fs::read_to_string(&marker)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        let _ = std::fs::remove_file(&marker);

        info!(server = ?request.server, force = request.force, "refresh requested via CLI");
        if let Err(e) = self
            .dispatcher
            .run_refresh(request.server.as_deref(), request.force)
            .await
        {
            warn!(error = %e, "CLI-requested refresh failed");
        }
        self.write_status_file().await;
    }
}

/// The nine upstream-visible tools.
#[must_use]
pub fn meta_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "catalog_search".to_string(),
            description: "Search the aggregated tool catalog. Returns compact tool cards; \
                          fetch a full schema with describe before invoking."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string", "description": "Free-text search; empty lists the catalog head"},
                    "limit": {"type": "integer", "description": "Maximum cards to return (1-50)"}
                }
            }),
        },
        ToolDefinition {
            name: "describe".to_string(),
            description: "Fetch the full input schema and safety notes for one tool id."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_id": {"type": "string", "description": "Namespaced id, e.g. github::create_issue"}
                },
                "required": ["tool_id"]
            }),
        },
        ToolDefinition {
            name: "invoke".to_string(),
            description: "Invoke a downstream tool by id. Arguments are validated against \
                          the tool's schema; results are policy-shaped."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tool_id": {"type": "string"},
                    "arguments": {"type": "object"}
                },
                "required": ["tool_id"]
            }),
        },
        ToolDefinition {
            name: "refresh".to_string(),
            description: "Reload configuration and policy, reconcile sessions, and rebuild \
                          the catalog."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string", "description": "Limit the refresh to one server"},
                    "force": {"type": "boolean", "description": "Restart unchanged sessions too"}
                }
            }),
        },
        ToolDefinition {
            name: "health".to_string(),
            description: "Per-server connection state, pending counts, tool counts, and last \
                          refresh time."
                .to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "request_capability".to_string(),
            description: "Describe a capability in natural language; returns ranked running \
                          servers, installable servers, and tools with a recommendation."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "prefer_cli": {"type": "boolean", "description": "Prefer host CLI tools when available"}
                },
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: "sync_environment".to_string(),
            description: "Report the host platform and which CLI tools from the manifest \
                          probe list are installed."
                .to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "provision".to_string(),
            description: "Install and start a downstream server from the manifest. Returns a \
                          job id to poll with provision_status."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server_name": {"type": "string"},
                    "env": {"type": "object", "description": "Extra environment for install and launch"}
                },
                "required": ["server_name"]
            }),
        },
        ToolDefinition {
            name: "provision_status".to_string(),
            description: "Progress and state of a provisioning job.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "job_id": {"type": "string"}
                },
                "required": ["job_id"]
            }),
        },
    ]
}

async fn proxy_resource_read(
    dispatcher: &Dispatcher,
    uri: &str,
) -> Result<Value, crate::error::GatewayError> {
    let snapshot = dispatcher.catalog().snapshot();
    let entry = snapshot
        .resource_owner(uri)
        .ok_or_else(|| crate::error::GatewayError::InvalidArgument {
            message: format!("unknown resource uri '{uri}'"),
        })?;
    let session = dispatcher
        .manager()
        .get(&entry.server)
        .await
        .ok_or_else(|| crate::error::GatewayError::SessionClosed {
            server: entry.server.clone(),
        })?;
    let result = session
        .call("resources/read", Some(json!({"uri": uri})), None)
        .await?;
    Ok(dispatcher.policy().shape_output(&result).value)
}

async fn proxy_prompt_get(
    dispatcher: &Dispatcher,
    name: &str,
    arguments: Option<Value>,
) -> Result<Value, crate::error::GatewayError> {
    let snapshot = dispatcher.catalog().snapshot();
    let entry = snapshot
        .prompt(name)
        .ok_or_else(|| crate::error::GatewayError::InvalidArgument {
            message: format!("unknown prompt '{name}'"),
        })?;
    let session = dispatcher
        .manager()
        .get(&entry.server)
        .await
        .ok_or_else(|| crate::error::GatewayError::SessionClosed {
            server: entry.server.clone(),
        })?;
    let mut params = json!({"name": entry.name});
    if let Some(arguments) = arguments {
        params["arguments"] = arguments;
    }
    let result = session.call("prompts/get", Some(params), None).await?;
    Ok(dispatcher.policy().shape_output(&result).value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_nine_meta_tools() {
        let tools = meta_tool_definitions();
        assert_eq!(tools.len(), 9);

        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        for expected in [
            "catalog_search",
            "describe",
            "invoke",
            "refresh",
            "health",
            "request_capability",
            "sync_environment",
            "provision",
            "provision_status",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn tool_definitions_have_object_schemas() {
        for tool in meta_tool_definitions() {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(!tool.description.is_empty());
        }
    }

    #[test]
    fn tool_definitions_serialise_camel_case() {
        let tools = meta_tool_definitions();
        let value = serde_json::to_value(&tools[0]).unwrap();
        assert!(value.get("inputSchema").is_some());
        assert!(value.get("input_schema").is_none());
    }

    #[test]
    fn tool_call_result_wraps_envelope() {
        let envelope = crate::gateway::Envelope::failure(&crate::error::GatewayError::ToolDenied {
            tool_id: "x::y".to_string(),
        });
        let result = ToolCallResult::from_envelope(&envelope);
        assert!(result.is_error);
        let ToolContent::Text { text } = &result.content[0];
        assert!(text.contains("ToolDenied"));
    }
}
