//! One live connection to a downstream MCP server.
//!
//! # Lifecycle Flow
//!
//! ```text
//! pending ──start──► connecting ──handshake ok──► ready
//!                        │                         │
//!                        │                         ├─ inventory / I/O error ─► degraded
//!                        │                         │
//!                        └───handshake fail────────┴───► failed ──retry──► connecting
//!
//! ready|degraded|failed ──close()──► closed (terminal)
//! ```
//!
//! # Framing
//!
//! Outbound writes are serialised by a lock on the child's stdin. A single
//! reader task demultiplexes inbound messages by id into the pending table,
//! hands unsolicited notifications to the notification sink, and classifies
//! progress notifications as heartbeats.
//!
//! # Security
//!
//! The launch environment may carry credentials. Environment values are
//! never logged — only variable names appear in diagnostics.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ServerSpec, NAME_SEPARATOR};
use crate::error::GatewayError;
use crate::rpc::{
    encode_line, parse_message, IncomingMessage, InboundResponse, JsonRpcNotification,
    JsonRpcRequest, RequestId, MCP_PROTOCOL_VERSION,
};

/// Default timeout for a downstream call, reset by each heartbeat.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Non-force cancellation is refused while the last heartbeat is younger
/// than this.
pub const HEARTBEAT_CANCEL_GUARD: Duration = Duration::from_secs(30);

/// Pending-table cap; further calls fail fast with `ServerBusy`.
pub const MAX_PENDING_PER_SESSION: usize = 256;

/// Timeout for the `initialize` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between closing stdin and killing the child.
const CLOSE_GRACE: Duration = Duration::from_secs(3);

/// Callback invoked whenever a pending call receives a heartbeat.
pub type HeartbeatFn = Arc<dyn Fn() + Send + Sync>;

/// Out-parameter a caller can hand to [`Session::call_traced`] to learn the
/// `"<server>::<N>"` id of the request it issued (for later cancellation).
pub type RequestSlot = Arc<Mutex<Option<String>>>;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, not yet started.
    Pending,
    /// Child spawned, handshake in progress.
    Connecting,
    /// Handshake done; inventory current.
    Ready,
    /// Connection alive but the last inventory fetch errored; calls are
    /// still allowed.
    Degraded,
    /// Handshake or stream failure; waiting for retry or refresh.
    Failed,
    /// Terminal.
    Closed,
}

/// What the downstream advertised during the handshake.
#[derive(Debug, Clone)]
pub struct ServerHandshake {
    /// Negotiated protocol version.
    pub protocol_version: String,
    /// Server name from `serverInfo`.
    pub server_name: Option<String>,
    /// Server version from `serverInfo`.
    pub server_version: Option<String>,
    /// Raw advertised capabilities.
    pub capabilities: Value,
}

impl ServerHandshake {
    /// Whether the downstream advertised a capability section.
    #[must_use]
    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.get(name).is_some()
    }
}

/// A tool as listed by a downstream server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name, unqualified.
    pub name: String,
    /// Server-provided description.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    #[serde(default)]
    pub input_schema: Value,
    /// Optional annotations (risk hints and the like).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

/// A resource as listed by a downstream server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Server-provided description.
    #[serde(default)]
    pub description: Option<String>,
    /// MIME type, when known.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// A prompt as listed by a downstream server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptDescriptor {
    /// Prompt name, unqualified.
    pub name: String,
    /// Server-provided description.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared prompt arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolListResult {
    #[serde(default)]
    tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ResourceListResult {
    #[serde(default)]
    resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Deserialize)]
struct PromptListResult {
    #[serde(default)]
    prompts: Vec<PromptDescriptor>,
}

/// One in-flight downstream request.
struct PendingEntry {
    method: String,
    started_at: Instant,
    last_heartbeat: Instant,
    cancelled: bool,
    responder: oneshot::Sender<Result<Value, GatewayError>>,
    heartbeat: Option<HeartbeatFn>,
}

struct SessionInner {
    name: String,
    spec: ServerSpec,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<String>>,
    /// Next request id; ids are unique for the session's lifetime and
    /// never reused.
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingEntry>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: tokio::sync::Mutex<Option<Child>>,
    handshake: Mutex<Option<ServerHandshake>>,
    last_activity: Mutex<Instant>,
    notify_tx: Mutex<Option<mpsc::UnboundedSender<(String, JsonRpcNotification)>>>,
}

impl SessionInner {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = state;
    }

    fn get_state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn record_error(&self, message: impl Into<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(message.into());
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Instant::now();
    }

    fn request_id(&self, id: u64) -> String {
        format!("{}{NAME_SEPARATOR}{id}", self.name)
    }

    /// Delivers a downstream response to its pending entry.
    fn complete(&self, response: InboundResponse) {
        let Some(id) = response.id.as_u64() else {
            warn!(server = %self.name, "response with non-numeric id ignored");
            return;
        };

        let entry = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.remove(&id)
        };
        let Some(entry) = entry else {
            debug!(server = %self.name, id, "response for unknown request (late or cancelled)");
            return;
        };

        let outcome = if let Some(error) = response.error {
            if entry.cancelled {
                Err(GatewayError::UpstreamCancelled {
                    request_id: self.request_id(id),
                })
            } else {
                Err(GatewayError::internal(format!(
                    "downstream error {}: {}",
                    error.code, error.message
                )))
            }
        } else {
            Ok(response.result.unwrap_or(Value::Null))
        };

        debug!(
            server = %self.name,
            id,
            method = %entry.method,
            elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
            "request completed"
        );
        let _ = entry.responder.send(outcome);
    }

    /// Routes an unsolicited notification; progress notifications become
    /// heartbeats for their pending entry.
    fn handle_notification(&self, notification: JsonRpcNotification) {
        if let Some(id) = notification
            .params
            .as_ref()
            .and_then(extract_request_token)
        {
            let heartbeat = {
                let mut pending = self
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.get_mut(&id).map(|entry| {
                    entry.last_heartbeat = Instant::now();
                    entry.heartbeat.clone()
                })
            };
            if let Some(heartbeat) = heartbeat {
                debug!(server = %self.name, id, "heartbeat");
                if let Some(cb) = heartbeat {
                    cb();
                }
                return;
            }
        }

        let sink = self
            .notify_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(sink) = sink {
            let _ = sink.send((self.name.clone(), notification));
        } else {
            debug!(server = %self.name, method = %notification.method, "notification dropped (no sink)");
        }
    }

    /// Fails every pending request synchronously.
    fn fail_all_pending(&self) {
        let entries: Vec<PendingEntry> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.responder.send(Err(GatewayError::SessionClosed {
                server: self.name.clone(),
            }));
        }
    }

    /// Reader-task exit: the downstream went away underneath us.
    fn on_stream_closed(&self) {
        let state = self.get_state();
        if state != SessionState::Closed {
            self.record_error("downstream stream closed");
            self.set_state(SessionState::Failed);
            info!(server = %self.name, "downstream stream closed");
        }
        self.fail_all_pending();
    }
}

/// Extracts the request id a notification refers to, if any.
///
/// Progress notifications carry `progressToken`; cancellation-related
/// notifications carry `requestId`.
fn extract_request_token(params: &Value) -> Option<u64> {
    for key in ["progressToken", "requestId"] {
        if let Some(token) = params.get(key) {
            if let Some(n) = token.as_u64() {
                return Some(n);
            }
            if let Some(s) = token.as_str() {
                if let Ok(n) = s.parse() {
                    return Some(n);
                }
            }
        }
    }
    None
}

/// A live connection to one downstream MCP server.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates a session in state `pending`. Call [`Session::start`] to
    /// launch the child.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: ServerSpec) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                name: name.into(),
                spec,
                state: Mutex::new(SessionState::Pending),
                last_error: Mutex::new(None),
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
                stdin: tokio::sync::Mutex::new(None),
                child: tokio::sync::Mutex::new(None),
                handshake: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                notify_tx: Mutex::new(None),
            }),
        }
    }

    /// Server name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Launch spec this session was created from.
    #[must_use]
    pub fn spec(&self) -> &ServerSpec {
        &self.inner.spec
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.get_state()
    }

    /// Most recent error, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Seconds since the downstream was last heard from.
    #[must_use]
    pub fn idle_secs(&self) -> u64 {
        self.inner
            .last_activity
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .elapsed()
            .as_secs()
    }

    /// What the downstream advertised at handshake, once `ready`.
    #[must_use]
    pub fn handshake(&self) -> Option<ServerHandshake> {
        self.inner
            .handshake
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Installs the sink unsolicited notifications are forwarded to.
    pub fn set_notification_sink(
        &self,
        sink: mpsc::UnboundedSender<(String, JsonRpcNotification)>,
    ) {
        *self
            .inner
            .notify_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    /// Marks the session `degraded` after an inventory failure. Calls are
    /// still allowed.
    pub fn mark_degraded(&self, reason: impl Into<String>) {
        if self.state() == SessionState::Ready {
            self.inner.record_error(reason);
            self.inner.set_state(SessionState::Degraded);
        }
    }

    /// Marks a `degraded` session `ready` again after a successful
    /// inventory fetch.
    pub fn mark_recovered(&self) {
        if self.state() == SessionState::Degraded {
            self.inner.set_state(SessionState::Ready);
        }
    }

    /// Launches the child process and performs the MCP handshake.
    ///
    /// The child inherits the parent environment with the spec's `env`
    /// layered on top; values are never logged.
    ///
    /// # Errors
    ///
    /// Returns an error when spawning fails or the handshake does not
    /// complete; the session is left in state `failed`.
    pub async fn start(&self) -> Result<(), GatewayError> {
        self.inner.set_state(SessionState::Connecting);
        info!(server = %self.inner.name, command = %self.inner.spec.command, "starting session");
        debug!(
            server = %self.inner.name,
            env = ?crate::config::RedactedEnv(&self.inner.spec.env),
            "resolved launch environment"
        );

        let mut cmd = Command::new(&self.inner.spec.command);
        cmd.args(&self.inner.spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.inner.spec.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &self.inner.spec.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to launch '{}': {e}", self.inner.spec.command);
                self.inner.record_error(&message);
                self.inner.set_state(SessionState::Failed);
                return Err(GatewayError::Internal { message });
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
            let message = "child spawned without piped stdio".to_string();
            self.inner.record_error(&message);
            self.inner.set_state(SessionState::Failed);
            let _ = child.start_kill();
            return Err(GatewayError::Internal { message });
        };

        *self.inner.stdin.lock().await = Some(stdin);
        *self.inner.child.lock().await = Some(child);

        // Drain stderr so a chatty downstream cannot fill the pipe
        if let Some(stderr) = stderr {
            let name = self.inner.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {line}");
                }
            });
        }

        let reader_inner = Arc::clone(&self.inner);
        tokio::spawn(read_loop(reader_inner, stdout));

        match self.perform_handshake().await {
            Ok(handshake) => {
                info!(
                    server = %self.inner.name,
                    protocol = %handshake.protocol_version,
                    version = handshake.server_version.as_deref().unwrap_or("unknown"),
                    "session ready"
                );
                *self
                    .inner
                    .handshake
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handshake);
                self.inner.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                self.inner.record_error(e.to_string());
                self.inner.set_state(SessionState::Failed);
                self.terminate_child().await;
                Err(e)
            }
        }
    }

    async fn perform_handshake(&self) -> Result<ServerHandshake, GatewayError> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-gateway",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .call_with_timeout("initialize", Some(params), None, None, HANDSHAKE_TIMEOUT)
            .await?;

        let protocol_version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::internal("initialize response missing protocolVersion"))?
            .to_string();
        let capabilities = result.get("capabilities").cloned().unwrap_or(Value::Null);
        let server_name = result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .map(String::from);
        let server_version = result
            .pointer("/serverInfo/version")
            .and_then(Value::as_str)
            .map(String::from);

        self.send_notification("notifications/initialized", Some(json!({})))
            .await?;

        Ok(ServerHandshake {
            protocol_version,
            server_name,
            server_version,
            capabilities,
        })
    }

    /// Lists the downstream's tools; empty when the capability is absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails or the result is malformed.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, GatewayError> {
        if !self.advertises("tools") {
            return Ok(Vec::new());
        }
        let result = self.call("tools/list", Some(json!({})), None).await?;
        let parsed: ToolListResult =
            serde_json::from_value(result).map_err(GatewayError::internal)?;
        Ok(parsed.tools)
    }

    /// Lists the downstream's resources; empty when the capability is
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails or the result is malformed.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, GatewayError> {
        if !self.advertises("resources") {
            return Ok(Vec::new());
        }
        let result = self.call("resources/list", Some(json!({})), None).await?;
        let parsed: ResourceListResult =
            serde_json::from_value(result).map_err(GatewayError::internal)?;
        Ok(parsed.resources)
    }

    /// Lists the downstream's prompts; empty when the capability is absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the call fails or the result is malformed.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>, GatewayError> {
        if !self.advertises("prompts") {
            return Ok(Vec::new());
        }
        let result = self.call("prompts/list", Some(json!({})), None).await?;
        let parsed: PromptListResult =
            serde_json::from_value(result).map_err(GatewayError::internal)?;
        Ok(parsed.prompts)
    }

    fn advertises(&self, capability: &str) -> bool {
        self.handshake()
            .is_some_and(|h| h.has_capability(capability))
    }

    /// Sends a request and waits for the matching response.
    ///
    /// The default 120 s deadline restarts on every heartbeat the downstream
    /// emits for this request; `heartbeat` is invoked on each one.
    ///
    /// # Errors
    ///
    /// Fails with `SessionClosed`, `SessionTimeout`, `ServerBusy`, or
    /// `UpstreamCancelled`.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        heartbeat: Option<HeartbeatFn>,
    ) -> Result<Value, GatewayError> {
        self.call_traced(method, params, heartbeat, None).await
    }

    /// Like [`Session::call`], but records the issued request id into
    /// `slot` before awaiting, so the caller can cancel it from another
    /// task.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Session::call`].
    pub async fn call_traced(
        &self,
        method: &str,
        params: Option<Value>,
        heartbeat: Option<HeartbeatFn>,
        slot: Option<RequestSlot>,
    ) -> Result<Value, GatewayError> {
        self.call_with_timeout(method, params, heartbeat, slot, CALL_TIMEOUT)
            .await
    }

    async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        heartbeat: Option<HeartbeatFn>,
        slot: Option<RequestSlot>,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        match self.state() {
            SessionState::Connecting | SessionState::Ready | SessionState::Degraded => {}
            SessionState::Pending | SessionState::Failed | SessionState::Closed => {
                return Err(GatewayError::SessionClosed {
                    server: self.inner.name.clone(),
                });
            }
        }

        let (tx, mut rx) = oneshot::channel();
        let id = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if pending.len() >= MAX_PENDING_PER_SESSION {
                return Err(GatewayError::ServerBusy {
                    server: self.inner.name.clone(),
                    pending: pending.len(),
                });
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            pending.insert(
                id,
                PendingEntry {
                    method: method.to_string(),
                    started_at: now,
                    last_heartbeat: now,
                    cancelled: false,
                    responder: tx,
                    heartbeat,
                },
            );
            id
        };
        if let Some(slot) = &slot {
            *slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                Some(self.inner.request_id(id));
        }

        #[allow(clippy::cast_possible_wrap)] // ids never approach i64::MAX
        let request = JsonRpcRequest::new(RequestId::Number(id as i64), method, params);
        if let Err(e) = self.write_message(&request).await {
            self.inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&id);
            return Err(e);
        }

        loop {
            let deadline = {
                let pending = self
                    .inner
                    .pending
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                pending.get(&id).map(|entry| entry.last_heartbeat + timeout)
            };
            let Some(deadline) = deadline else {
                // Entry gone: the responder fires imminently
                return match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::SessionClosed {
                        server: self.inner.name.clone(),
                    }),
                };
            };

            tokio::select! {
                outcome = &mut rx => {
                    return match outcome {
                        Ok(outcome) => outcome,
                        Err(_) => Err(GatewayError::SessionClosed {
                            server: self.inner.name.clone(),
                        }),
                    };
                }
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    let expired = {
                        let mut pending = self
                            .inner
                            .pending
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner);
                        let stale = pending
                            .get(&id)
                            .is_some_and(|entry| entry.last_heartbeat.elapsed() >= timeout);
                        if stale {
                            pending
                                .remove(&id)
                                .map(|entry| entry.last_heartbeat.elapsed().as_secs())
                        } else {
                            None
                        }
                    };
                    if let Some(elapsed_secs) = expired {
                        // Best effort: tell the downstream we gave up
                        let _ = self
                            .send_notification(
                                "notifications/cancelled",
                                Some(json!({"requestId": id, "reason": "timeout"})),
                            )
                            .await;
                        return Err(GatewayError::SessionTimeout {
                            request_id: self.inner.request_id(id),
                            elapsed_secs,
                        });
                    }
                    // A heartbeat arrived while we slept; recompute the deadline
                }
            }
        }
    }

    /// Cancels an in-flight request.
    ///
    /// Sends the protocol cancellation notice. Without `force` the request
    /// stays pending (the downstream decides when to stop) and cancellation
    /// is refused outright while the last heartbeat is fresh. With `force`
    /// the pending entry is failed locally regardless of downstream
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns `CancelRefused` for fresh-heartbeat non-force cancels and
    /// `InvalidArgument` for unknown request ids.
    pub async fn cancel(&self, request_id: &str, force: bool) -> Result<(), GatewayError> {
        let id = self.parse_request_id(request_id)?;

        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(entry) = pending.get_mut(&id) else {
                return Err(GatewayError::InvalidArgument {
                    message: format!("no pending request {request_id}"),
                });
            };

            if !force {
                let age = entry.last_heartbeat.elapsed();
                if age < HEARTBEAT_CANCEL_GUARD {
                    return Err(GatewayError::CancelRefused {
                        request_id: request_id.to_string(),
                        age_secs: age.as_secs(),
                    });
                }
            }
            entry.cancelled = true;
        }

        let _ = self
            .send_notification(
                "notifications/cancelled",
                Some(json!({"requestId": id, "reason": "cancelled by client"})),
            )
            .await;

        if force {
            let entry = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&id);
            if let Some(entry) = entry {
                let _ = entry.responder.send(Err(GatewayError::UpstreamCancelled {
                    request_id: request_id.to_string(),
                }));
            }
        }
        Ok(())
    }

    /// Closes the session: stdin first, a bounded grace period, then the
    /// child is terminated. All pending requests fail with `SessionClosed`.
    pub async fn close(&self) {
        info!(server = %self.inner.name, "closing session");
        self.inner.set_state(SessionState::Closed);
        self.inner.fail_all_pending();
        self.terminate_child().await;
    }

    async fn terminate_child(&self) {
        // Dropping stdin closes the pipe; a conforming server exits on EOF
        self.inner.stdin.lock().await.take();

        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(server = %self.inner.name, "grace period expired, killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
    }

    async fn write_message(&self, message: &impl Serialize) -> Result<(), GatewayError> {
        let line = encode_line(message).map_err(GatewayError::internal)?;
        let mut guard = self.inner.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(GatewayError::SessionClosed {
                server: self.inner.name.clone(),
            });
        };
        stdin
            .write_all(&line)
            .await
            .map_err(|_| GatewayError::SessionClosed {
                server: self.inner.name.clone(),
            })?;
        stdin
            .flush()
            .await
            .map_err(|_| GatewayError::SessionClosed {
                server: self.inner.name.clone(),
            })
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), GatewayError> {
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    fn parse_request_id(&self, request_id: &str) -> Result<u64, GatewayError> {
        let prefix = format!("{}{NAME_SEPARATOR}", self.inner.name);
        request_id
            .strip_prefix(&prefix)
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| GatewayError::InvalidArgument {
                message: format!(
                    "request id '{request_id}' does not belong to server '{}'",
                    self.inner.name
                ),
            })
    }
}

/// Reader task: demultiplexes every inbound line for one session.
async fn read_loop(inner: Arc<SessionInner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                inner.touch();
                match parse_message(&line) {
                    Ok(IncomingMessage::Response(response)) => inner.complete(response),
                    Ok(IncomingMessage::Notification(notification)) => {
                        inner.handle_notification(notification);
                    }
                    Ok(IncomingMessage::Request(request)) => {
                        // Server-initiated requests (sampling etc.) are not
                        // supported through the gateway
                        warn!(
                            server = %inner.name,
                            method = %request.method,
                            "ignoring server-initiated request"
                        );
                    }
                    Err(_) => {
                        warn!(server = %inner.name, "discarding malformed downstream line");
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    inner.on_stream_closed();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new("alpha", ServerSpec::new("true", Vec::new()))
    }

    fn insert_pending(
        session: &Session,
        id: u64,
        heartbeat_age: Duration,
    ) -> oneshot::Receiver<Result<Value, GatewayError>> {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        session.inner.pending.lock().unwrap().insert(
            id,
            PendingEntry {
                method: "tools/call".to_string(),
                started_at: now,
                last_heartbeat: now.checked_sub(heartbeat_age).unwrap_or(now),
                cancelled: false,
                responder: tx,
                heartbeat: None,
            },
        );
        rx
    }

    #[test]
    fn new_session_is_pending() {
        let session = test_session();
        assert_eq!(session.state(), SessionState::Pending);
        assert_eq!(session.pending_count(), 0);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn request_ids_are_namespaced() {
        let session = test_session();
        assert_eq!(session.inner.request_id(7), "alpha::7");
    }

    #[test]
    fn parse_request_id_round_trips() {
        let session = test_session();
        assert_eq!(session.parse_request_id("alpha::42").unwrap(), 42);
        assert!(session.parse_request_id("beta::42").is_err());
        assert!(session.parse_request_id("alpha::x").is_err());
        assert!(session.parse_request_id("42").is_err());
    }

    #[test]
    fn degraded_only_from_ready() {
        let session = test_session();
        session.mark_degraded("inventory failed");
        // Pending sessions cannot degrade
        assert_eq!(session.state(), SessionState::Pending);

        session.inner.set_state(SessionState::Ready);
        session.mark_degraded("inventory failed");
        assert_eq!(session.state(), SessionState::Degraded);

        session.mark_recovered();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn call_on_closed_session_fails_fast() {
        let session = test_session();
        session.inner.set_state(SessionState::Closed);
        let err = session.call("tools/list", None, None).await.unwrap_err();
        assert_eq!(err.code(), "SessionClosed");
    }

    #[tokio::test]
    async fn cancel_refused_on_fresh_heartbeat() {
        let session = test_session();
        session.inner.set_state(SessionState::Ready);
        let _rx = insert_pending(&session, 1, Duration::from_secs(5));

        let err = session.cancel("alpha::1", false).await.unwrap_err();
        assert_eq!(err.code(), "CancelRefused");
        // Entry stays pending
        assert_eq!(session.pending_count(), 1);
    }

    #[tokio::test]
    async fn force_cancel_clears_pending_entry() {
        let session = test_session();
        session.inner.set_state(SessionState::Ready);
        let rx = insert_pending(&session, 1, Duration::from_secs(5));

        session.cancel("alpha::1", true).await.unwrap();
        assert_eq!(session.pending_count(), 0);

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap_err().code(), "UpstreamCancelled");
    }

    #[tokio::test]
    async fn non_force_cancel_allowed_when_heartbeat_stale() {
        let session = test_session();
        session.inner.set_state(SessionState::Ready);
        let _rx = insert_pending(&session, 1, Duration::from_secs(45));

        session.cancel("alpha::1", false).await.unwrap();
        // Non-force leaves the entry for the downstream to acknowledge
        assert_eq!(session.pending_count(), 1);
        assert!(session.inner.pending.lock().unwrap()[&1].cancelled);
    }

    #[tokio::test]
    async fn cancel_unknown_request_is_invalid_argument() {
        let session = test_session();
        let err = session.cancel("alpha::99", true).await.unwrap_err();
        assert_eq!(err.code(), "InvalidArgument");
    }

    #[tokio::test]
    async fn fail_all_pending_delivers_session_closed() {
        let session = test_session();
        let rx1 = insert_pending(&session, 1, Duration::ZERO);
        let rx2 = insert_pending(&session, 2, Duration::ZERO);

        session.inner.fail_all_pending();
        assert_eq!(session.pending_count(), 0);
        assert_eq!(rx1.await.unwrap().unwrap_err().code(), "SessionClosed");
        assert_eq!(rx2.await.unwrap().unwrap_err().code(), "SessionClosed");
    }

    #[test]
    fn complete_delivers_result_by_id() {
        let session = test_session();
        let rx = insert_pending(&session, 3, Duration::ZERO);

        session.inner.complete(InboundResponse {
            id: RequestId::Number(3),
            result: Some(json!({"ok": true})),
            error: None,
        });

        let outcome = rx.blocking_recv().unwrap().unwrap();
        assert_eq!(outcome, json!({"ok": true}));
        assert_eq!(session.pending_count(), 0);
    }

    #[test]
    fn complete_maps_downstream_error() {
        let session = test_session();
        let rx = insert_pending(&session, 4, Duration::ZERO);

        session.inner.complete(InboundResponse {
            id: RequestId::Number(4),
            result: None,
            error: Some(crate::rpc::JsonRpcErrorData {
                code: -32601,
                message: "no such method".to_string(),
                data: None,
            }),
        });

        let err = rx.blocking_recv().unwrap().unwrap_err();
        assert_eq!(err.code(), "Internal");
        assert!(err.to_string().contains("-32601"));
    }

    #[test]
    fn heartbeat_updates_pending_entry() {
        let session = test_session();
        let _rx = insert_pending(&session, 5, Duration::from_secs(60));

        session.inner.handle_notification(JsonRpcNotification::new(
            "notifications/progress",
            Some(json!({"progressToken": 5, "progress": 0.5})),
        ));

        let pending = session.inner.pending.lock().unwrap();
        assert!(pending[&5].last_heartbeat.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn heartbeat_invokes_callback() {
        let session = test_session();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_clone = Arc::clone(&fired);
        let (tx, _rx) = oneshot::channel();
        let now = Instant::now();
        session.inner.pending.lock().unwrap().insert(
            6,
            PendingEntry {
                method: "tools/call".to_string(),
                started_at: now,
                last_heartbeat: now,
                cancelled: false,
                responder: tx,
                heartbeat: Some(Arc::new(move || {
                    fired_clone.fetch_add(1, Ordering::Relaxed);
                })),
            },
        );

        session.inner.handle_notification(JsonRpcNotification::new(
            "notifications/progress",
            Some(json!({"requestId": "6"})),
        ));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn extract_request_token_handles_both_keys() {
        assert_eq!(
            extract_request_token(&json!({"progressToken": 9})),
            Some(9)
        );
        assert_eq!(extract_request_token(&json!({"requestId": "12"})), Some(12));
        assert_eq!(extract_request_token(&json!({"other": 1})), None);
    }

    #[tokio::test]
    async fn backpressure_rejects_at_cap() {
        let session = test_session();
        session.inner.set_state(SessionState::Ready);
        let mut receivers = Vec::new();
        for id in 0..MAX_PENDING_PER_SESSION as u64 {
            receivers.push(insert_pending(&session, id, Duration::ZERO));
        }

        let err = session.call("tools/call", None, None).await.unwrap_err();
        assert_eq!(err.code(), "ServerBusy");
    }

    #[test]
    fn stream_closed_fails_pending_and_marks_failed() {
        let session = test_session();
        session.inner.set_state(SessionState::Ready);
        let rx = insert_pending(&session, 1, Duration::ZERO);

        session.inner.on_stream_closed();
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(rx.blocking_recv().unwrap().unwrap_err().code(), "SessionClosed");
    }

    #[test]
    fn stream_closed_after_close_stays_closed() {
        let session = test_session();
        session.inner.set_state(SessionState::Closed);
        session.inner.on_stream_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
