//! Registry and supervisor for downstream sessions.
//!
//! Startup fans out all session starts in parallel and waits for every one
//! to resolve — success or failure — before the gateway declares itself
//! ready; a single server's failure never blocks the others. Refresh diffs
//! the new configuration against the running registry: added servers start,
//! removed servers close, changed servers restart, unchanged servers are
//! left alone (in-flight calls untouched) unless `force` is set. Failed
//! sessions are restarted on refresh regardless.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{info, warn};

use crate::config::{McpConfig, ServerSpec};
use crate::error::GatewayError;
use crate::rpc::JsonRpcNotification;
use crate::session::session::{Session, SessionState};

/// Backoff schedule between start retries.
const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

/// Outcome of the initial parallel startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    /// Servers that reached `ready`.
    pub ready: Vec<String>,
    /// Servers that exhausted their retries.
    pub failed: Vec<String>,
}

/// Outcome of a refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    /// Newly started servers.
    pub started: Vec<String>,
    /// Servers restarted because their spec changed, they had failed, or
    /// `force` was set.
    pub restarted: Vec<String>,
    /// Servers closed because the config no longer names them.
    pub closed: Vec<String>,
    /// Servers left untouched.
    pub unchanged: Vec<String>,
    /// Servers that failed to (re)start.
    pub failed: Vec<String>,
}

/// Per-server status snapshot for `health`.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    /// Server name.
    pub name: String,
    /// Connection state.
    pub state: SessionState,
    /// Most recent error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// In-flight request count.
    pub pending: usize,
    /// Seconds since the downstream was last heard from.
    pub idle_secs: u64,
    /// Version the downstream advertised, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

/// Owns the name → session registry.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Servers added at runtime by the provisioner; refresh leaves these
    /// alone since no config file names them.
    dynamic: std::sync::Mutex<HashSet<String>>,
    /// Refresh serialises against itself, never against readers.
    refresh_lock: Mutex<()>,
    retry_delays: Vec<Duration>,
    notify_tx: mpsc::UnboundedSender<(String, JsonRpcNotification)>,
    notify_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<(String, JsonRpcNotification)>>>,
}

impl SessionManager {
    /// Creates an empty manager with the standard retry schedule.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retry_delays(RETRY_DELAYS.to_vec())
    }

    /// Creates a manager with a custom retry schedule (empty disables
    /// retries).
    #[must_use]
    pub fn with_retry_delays(retry_delays: Vec<Duration>) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            sessions: RwLock::new(HashMap::new()),
            dynamic: std::sync::Mutex::new(HashSet::new()),
            refresh_lock: Mutex::new(()),
            retry_delays,
            notify_tx,
            notify_rx: std::sync::Mutex::new(Some(notify_rx)),
        }
    }

    /// Takes the stream of unsolicited downstream notifications. Callable
    /// once.
    #[must_use]
    pub fn take_notification_stream(
        &self,
    ) -> Option<mpsc::UnboundedReceiver<(String, JsonRpcNotification)>> {
        self.notify_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    /// Looks up a session by server name.
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Snapshot of all sessions in stable name order.
    pub async fn all(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<_> = sessions.values().cloned().collect();
        entries.sort_by(|a, b| a.name().cmp(b.name()));
        entries
    }

    /// Starts every configured server in parallel and waits for all of them
    /// to resolve.
    pub async fn start_all(&self, config: &McpConfig) -> StartReport {
        let mut handles = Vec::new();
        for (name, spec) in &config.mcp_servers {
            let session = self.register(name.clone(), spec.clone()).await;
            let delays = self.retry_delays.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                let outcome = start_with_retry(&session, &delays).await;
                (name, outcome)
            }));
        }

        let mut report = StartReport::default();
        for handle in handles {
            match handle.await {
                Ok((name, Ok(()))) => report.ready.push(name),
                Ok((name, Err(e))) => {
                    warn!(server = %name, error = %e, "session failed to start");
                    report.failed.push(name);
                }
                Err(e) => warn!(error = %e, "session start task panicked"),
            }
        }
        report.ready.sort();
        report.failed.sort();
        info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            "startup complete"
        );
        report
    }

    /// Diffs the given config against the registry and applies the changes.
    ///
    /// With `scope` set only that server is touched. Unchanged healthy
    /// sessions keep their in-flight calls unless `force` is set.
    pub async fn refresh(
        &self,
        config: &McpConfig,
        scope: Option<&str>,
        force: bool,
    ) -> RefreshReport {
        let _guard = self.refresh_lock.lock().await;
        let current: HashMap<String, Arc<Session>> = self.sessions.read().await.clone();
        let dynamic: HashSet<String> = self
            .dynamic
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let in_scope = |name: &str| scope.map_or(true, |s| s == name);

        let mut report = RefreshReport::default();
        let mut to_close: Vec<Arc<Session>> = Vec::new();
        let mut to_start: Vec<(String, ServerSpec, bool)> = Vec::new();

        for (name, session) in &current {
            if !in_scope(name) {
                report.unchanged.push(name.clone());
                continue;
            }
            if dynamic.contains(name) && !config.mcp_servers.contains_key(name) {
                report.unchanged.push(name.clone());
                continue;
            }
            match config.mcp_servers.get(name) {
                None => {
                    to_close.push(Arc::clone(session));
                    report.closed.push(name.clone());
                }
                Some(spec) => {
                    let spec_changed = spec != session.spec();
                    let needs_restart = matches!(
                        session.state(),
                        SessionState::Failed | SessionState::Closed
                    );
                    if spec_changed || needs_restart || force {
                        to_close.push(Arc::clone(session));
                        to_start.push((name.clone(), spec.clone(), true));
                    } else {
                        report.unchanged.push(name.clone());
                    }
                }
            }
        }

        for (name, spec) in &config.mcp_servers {
            if in_scope(name) && !current.contains_key(name) {
                to_start.push((name.clone(), spec.clone(), false));
            }
        }

        for session in to_close {
            session.close().await;
        }
        {
            let mut sessions = self.sessions.write().await;
            for name in &report.closed {
                sessions.remove(name);
            }
        }

        let mut handles = Vec::new();
        for (name, spec, restart) in to_start {
            let session = self.register(name.clone(), spec).await;
            let delays = self.retry_delays.clone();
            handles.push(tokio::spawn(async move {
                let outcome = start_with_retry(&session, &delays).await;
                (name, restart, outcome)
            }));
        }
        for handle in handles {
            match handle.await {
                Ok((name, restart, Ok(()))) => {
                    if restart {
                        report.restarted.push(name);
                    } else {
                        report.started.push(name);
                    }
                }
                Ok((name, _, Err(e))) => {
                    warn!(server = %name, error = %e, "session failed to start on refresh");
                    report.failed.push(name);
                }
                Err(e) => warn!(error = %e, "refresh start task panicked"),
            }
        }

        report.started.sort();
        report.restarted.sort();
        report.closed.sort();
        report.unchanged.sort();
        report.failed.sort();
        report
    }

    /// Starts a provisioned server and registers it outside config control.
    ///
    /// # Errors
    ///
    /// Returns the start error after retries are exhausted; the failed
    /// session stays registered so `health` reports it.
    pub async fn add_dynamic(
        &self,
        name: &str,
        spec: ServerSpec,
    ) -> Result<Arc<Session>, GatewayError> {
        if let Some(existing) = self.get(name).await {
            existing.close().await;
        }
        let session = self.register(name.to_string(), spec).await;
        self.dynamic
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string());
        start_with_retry(&session, &self.retry_delays).await?;
        Ok(session)
    }

    /// Per-server health snapshot in stable name order.
    pub async fn health(&self) -> Vec<ServerHealth> {
        self.all()
            .await
            .into_iter()
            .map(|session| ServerHealth {
                name: session.name().to_string(),
                state: session.state(),
                last_error: session.last_error(),
                pending: session.pending_count(),
                idle_secs: session.idle_secs(),
                server_version: session.handshake().and_then(|h| h.server_version),
            })
            .collect()
    }

    /// Closes every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }
    }

    async fn register(&self, name: String, spec: ServerSpec) -> Arc<Session> {
        let session = Arc::new(Session::new(name.clone(), spec));
        session.set_notification_sink(self.notify_tx.clone());
        self.sessions.write().await.insert(name, Arc::clone(&session));
        session
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts a session, retrying on failure with exponential backoff.
async fn start_with_retry(session: &Session, delays: &[Duration]) -> Result<(), GatewayError> {
    let mut last_err = None;
    for (attempt, delay) in std::iter::once(None)
        .chain(delays.iter().map(Some))
        .enumerate()
    {
        if let Some(delay) = delay {
            info!(
                server = %session.name(),
                attempt,
                delay_secs = delay.as_secs(),
                "retrying session start"
            );
            tokio::time::sleep(*delay).await;
        }
        match session.start().await {
            Ok(()) => return Ok(()),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| GatewayError::internal("session start failed")))
}
