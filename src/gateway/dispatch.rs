//! The nine upstream-visible meta-tools.
//!
//! Every handler returns a plain JSON value or a [`GatewayError`]; the
//! dispatcher shapes successes through policy (redaction, then the size
//! cap) and converts failures into error envelopes. Nothing thrown in here
//! ever becomes a transport-level failure — the envelope is the contract.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::catalog::{split_tool_id, CatalogRegistry};
use crate::config::{load_config, McpConfig};
use crate::error::GatewayError;
use crate::manifest::Manifest;
use crate::matcher::{Candidate, CandidateType, CapabilityMatcher};
use crate::policy::{load_policy, Policy};
use crate::provision::Provisioner;
use crate::session::{RequestSlot, SessionManager, SessionState};

/// Default `catalog_search` result count.
const DEFAULT_SEARCH_LIMIT: usize = 20;

/// Hard ceiling on `catalog_search` results.
const MAX_SEARCH_LIMIT: usize = 50;

/// Candidates returned by `request_capability`.
const CAPABILITY_CANDIDATES: usize = 10;

/// Where refresh reloads configuration and policy from.
#[derive(Debug, Clone)]
pub struct ConfigSources {
    /// Explicit config path (`--config` / `MCP_GATEWAY_CONFIG`), if any.
    pub config_path: Option<PathBuf>,
    /// Explicit policy path (`--policy` / `MCP_GATEWAY_POLICY`), if any.
    pub policy_path: Option<PathBuf>,
    /// Project directory for `.mcp.json` discovery.
    pub project_dir: PathBuf,
}

/// The JSON envelope every meta-tool returns.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Envelope {
    /// Whether the call succeeded.
    pub ok: bool,
    /// Success payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EnvelopeError>,
    /// Set when the size cap cut the result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    /// Serialised size of the unshaped result in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_size_estimate: Option<usize>,
}

/// Error half of the envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvelopeError {
    /// Stable error code, e.g. `ToolDenied`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl Envelope {
    /// Builds a failure envelope. `Internal` errors surface generically;
    /// the detail goes to the log only.
    #[must_use]
    pub fn failure(err: &GatewayError) -> Self {
        let message = if matches!(err, GatewayError::Internal { .. }) {
            error!(error = %err, "internal error surfaced to upstream");
            "internal gateway error".to_string()
        } else {
            err.to_string()
        };
        Self {
            ok: false,
            result: None,
            error: Some(EnvelopeError {
                code: err.code().to_string(),
                message,
            }),
            truncated: None,
            raw_size_estimate: None,
        }
    }
}

/// Routes upstream `tools/call` requests into the gateway runtime.
pub struct Dispatcher {
    manager: Arc<SessionManager>,
    catalog: Arc<CatalogRegistry>,
    policy: RwLock<Arc<Policy>>,
    matcher: CapabilityMatcher,
    provisioner: Arc<Provisioner>,
    manifest: Arc<Manifest>,
    sources: ConfigSources,
    last_refresh: Mutex<Option<Instant>>,
}

impl Dispatcher {
    /// Wires the dispatcher to the gateway's shared components.
    #[must_use]
    pub fn new(
        manager: Arc<SessionManager>,
        catalog: Arc<CatalogRegistry>,
        policy: Policy,
        manifest: Arc<Manifest>,
        provisioner: Arc<Provisioner>,
        sources: ConfigSources,
    ) -> Self {
        Self {
            manager,
            catalog,
            policy: RwLock::new(Arc::new(policy)),
            matcher: CapabilityMatcher::new(),
            provisioner,
            manifest,
            sources,
            last_refresh: Mutex::new(None),
        }
    }

    /// Current policy snapshot.
    #[must_use]
    pub fn policy(&self) -> Arc<Policy> {
        Arc::clone(
            &self
                .policy
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// The session manager this dispatcher routes through.
    #[must_use]
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// The catalog registry backing search and describe.
    #[must_use]
    pub fn catalog(&self) -> &Arc<CatalogRegistry> {
        &self.catalog
    }

    /// Starts all configured sessions and builds the first catalog.
    pub async fn startup(&self, config: &McpConfig) -> crate::session::StartReport {
        let report = self.manager.start_all(config).await;
        let sessions = self.manager.all().await;
        let policy = self.policy();
        self.catalog.rebuild(&sessions, &policy).await;
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());
        report
    }

    /// Dispatches one meta-tool call into an envelope.
    ///
    /// `slot` receives the downstream request id for `invoke` so the server
    /// loop can propagate upstream cancellation.
    pub async fn dispatch(&self, tool: &str, args: Value, slot: Option<RequestSlot>) -> Envelope {
        match self.route(tool, args, slot).await {
            Ok(value) => {
                let shaped = self.policy().shape_output(&value);
                Envelope {
                    ok: true,
                    result: Some(shaped.value),
                    error: None,
                    truncated: shaped.truncated.then_some(true),
                    raw_size_estimate: Some(shaped.raw_size),
                }
            }
            Err(e) => Envelope::failure(&e),
        }
    }

    async fn route(
        &self,
        tool: &str,
        args: Value,
        slot: Option<RequestSlot>,
    ) -> Result<Value, GatewayError> {
        match tool {
            "catalog_search" => self.catalog_search(args),
            "describe" => self.describe(args),
            "invoke" => self.invoke(args, slot).await,
            "refresh" => self.refresh(args).await,
            "health" => Ok(self.status_document().await),
            "request_capability" => self.request_capability(args).await,
            "sync_environment" => Ok(self.sync_environment()),
            "provision" => self.provision(args),
            "provision_status" => self.provision_status(args),
            other => Err(GatewayError::InvalidArgument {
                message: format!("unknown meta-tool '{other}'"),
            }),
        }
    }

    fn catalog_search(&self, args: Value) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            query: String,
            #[serde(default)]
            limit: Option<usize>,
        }
        let params: Params = parse_params(args)?;
        let limit = params
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);

        let results = self.catalog.snapshot().search(&params.query, limit);
        Ok(json!({
            "tools": results.cards,
            "total_available": results.total_available,
            "truncated": results.truncated,
        }))
    }

    fn describe(&self, args: Value) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            tool_id: String,
        }
        let params: Params = parse_params(args)?;
        let policy = self.policy();
        let snapshot = self.catalog.snapshot();
        let schema = snapshot.describe(&params.tool_id, &policy)?;
        serde_json::to_value(schema).map_err(GatewayError::internal)
    }

    async fn invoke(&self, args: Value, slot: Option<RequestSlot>) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            tool_id: String,
            #[serde(default)]
            arguments: Value,
        }
        let params: Params = parse_params(args)?;
        let policy = self.policy();
        let snapshot = self.catalog.snapshot();
        let schema = snapshot.describe(&params.tool_id, &policy)?;

        let mut arguments = if params.arguments.is_null() {
            json!({})
        } else {
            params.arguments
        };
        crate::gateway::validate::validate_arguments(&schema.input_schema, &mut arguments)?;

        let (server, tool_name) =
            split_tool_id(&params.tool_id).ok_or_else(|| GatewayError::ToolNotFound {
                tool_id: params.tool_id.clone(),
            })?;
        let session = self
            .manager
            .get(server)
            .await
            .ok_or_else(|| GatewayError::SessionClosed {
                server: server.to_string(),
            })?;

        info!(tool_id = %params.tool_id, "invoking downstream tool");
        session
            .call_traced(
                "tools/call",
                Some(json!({"name": tool_name, "arguments": arguments})),
                None,
                slot,
            )
            .await
    }

    async fn refresh(&self, args: Value) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            #[serde(default)]
            server: Option<String>,
            #[serde(default)]
            force: bool,
        }
        let params: Params = parse_params(args)?;
        self.run_refresh(params.server.as_deref(), params.force)
            .await
    }

    /// Reloads config and policy, applies the session diff, and rebuilds
    /// the catalog. Config errors are local: the current sessions keep
    /// running.
    pub async fn run_refresh(
        &self,
        server: Option<&str>,
        force: bool,
    ) -> Result<Value, GatewayError> {
        let config = load_config(self.sources.config_path.as_deref(), &self.sources.project_dir)?;
        let policy = load_policy(self.sources.policy_path.as_deref())?;

        let report = self.manager.refresh(&config, server, force).await;
        let sessions = self.manager.all().await;
        self.catalog.rebuild(&sessions, &policy).await;
        *self
            .policy
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(policy);
        *self
            .last_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Instant::now());

        info!(
            started = report.started.len(),
            restarted = report.restarted.len(),
            closed = report.closed.len(),
            "refresh complete"
        );
        Ok(json!({
            "refresh": report,
            "tool_count": self.catalog.snapshot().tool_count(),
        }))
    }

    /// The health payload; also persisted as the CLI's status snapshot.
    pub async fn status_document(&self) -> Value {
        let health = self.manager.health().await;
        let snapshot = self.catalog.snapshot();
        let last_refresh_secs = self
            .last_refresh
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .map(|at| at.elapsed().as_secs());

        let servers: Vec<Value> = health
            .into_iter()
            .map(|h| {
                let tools = snapshot.tool_counts.get(&h.name).copied().unwrap_or(0);
                let mut value = serde_json::to_value(&h).unwrap_or_else(|_| json!({}));
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("tools".to_string(), json!(tools));
                }
                value
            })
            .collect();

        json!({
            "servers": servers,
            "total_tools": snapshot.tool_count(),
            "total_resources": snapshot.resources.len(),
            "total_prompts": snapshot.prompts.len(),
            "last_refresh_secs_ago": last_refresh_secs,
        })
    }

    async fn request_capability(&self, args: Value) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            query: String,
            #[serde(default)]
            prefer_cli: bool,
        }
        let params: Params = parse_params(args)?;

        let running: Vec<String> = self
            .manager
            .all()
            .await
            .iter()
            .filter(|s| {
                matches!(s.state(), SessionState::Ready | SessionState::Degraded)
            })
            .map(|s| s.name().to_string())
            .collect();
        let snapshot = self.catalog.snapshot();
        let candidates = self.matcher.rank(
            &params.query,
            &self.manifest,
            &running,
            &snapshot,
            &|var| std::env::var(var).is_ok(),
        );
        let top: Vec<Candidate> = candidates.into_iter().take(CAPABILITY_CANDIDATES).collect();
        let recommendation =
            build_recommendation(&top, params.prefer_cli, &self.manifest, &params.query);

        Ok(json!({
            "candidates": top,
            "recommendation": recommendation,
        }))
    }

    fn sync_environment(&self) -> Value {
        let clis: Vec<Value> = self
            .manifest
            .cli_probes
            .iter()
            .map(|name| match which::which(name) {
                Ok(path) => json!({
                    "name": name,
                    "available": true,
                    "path": path.to_string_lossy(),
                }),
                Err(_) => json!({"name": name, "available": false}),
            })
            .collect();

        json!({
            "platform": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "clis": clis,
        })
    }

    fn provision(&self, args: Value) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            server_name: String,
            #[serde(default)]
            env: BTreeMap<String, String>,
        }
        let params: Params = parse_params(args)?;
        let job_id = self.provisioner.provision(&params.server_name, params.env)?;
        Ok(json!({"job_id": job_id, "server_name": params.server_name}))
    }

    fn provision_status(&self, args: Value) -> Result<Value, GatewayError> {
        #[derive(Deserialize)]
        struct Params {
            job_id: String,
        }
        let params: Params = parse_params(args)?;
        let status = self.provisioner.status(&params.job_id)?;
        serde_json::to_value(status).map_err(GatewayError::internal)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, GatewayError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| GatewayError::InvalidArgument {
        message: e.to_string(),
    })
}

fn build_recommendation(
    candidates: &[Candidate],
    prefer_cli: bool,
    manifest: &Manifest,
    query: &str,
) -> String {
    if prefer_cli {
        let query_lower = query.to_lowercase();
        for probe in &manifest.cli_probes {
            if query_lower.contains(probe.as_str()) && which::which(probe).is_ok() {
                return format!(
                    "The '{probe}' CLI is installed on this host; prefer running it directly."
                );
            }
        }
    }

    let Some(best) = candidates.first() else {
        return "No matching capability found. Broaden the query or check the manifest with \
                sync_environment."
            .to_string();
    };
    match best.candidate_type {
        CandidateType::Tool if best.is_running => format!(
            "Tool '{}' is available now; fetch its schema with describe and call it with invoke.",
            best.name
        ),
        CandidateType::Tool => format!(
            "Tool '{}' is known but its server is offline; run refresh to reconnect.",
            best.name
        ),
        CandidateType::ServerRunning => format!(
            "Server '{}' is already connected; list its tools with catalog_search.",
            best.name
        ),
        CandidateType::ServerManifest => {
            if best.missing_env.is_empty() {
                format!(
                    "Server '{}' can be installed; start it with provision.",
                    best.name
                )
            } else {
                format!(
                    "Server '{}' can be installed after setting {}.",
                    best.name,
                    best.missing_env.join(", ")
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::policy::parse_policy;
    use crate::session::ToolDescriptor;

    fn dispatcher_with_policy(policy: Policy) -> Dispatcher {
        let manager = Arc::new(SessionManager::with_retry_delays(Vec::new()));
        let catalog = Arc::new(CatalogRegistry::new());
        catalog.install_inventory(
            "alpha",
            vec![ToolDescriptor {
                name: "hello".to_string(),
                description: Some("Says hello to someone.".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"]
                }),
                annotations: None,
            }],
            Vec::new(),
            Vec::new(),
            true,
        );
        catalog.publish(&policy);

        let manifest = Arc::new(Manifest::builtin().unwrap());
        let provisioner = Arc::new(Provisioner::new(Arc::clone(&manifest), Arc::clone(&manager)));
        Dispatcher::new(
            manager,
            catalog,
            policy,
            manifest,
            provisioner,
            ConfigSources {
                config_path: None,
                policy_path: None,
                project_dir: PathBuf::from("."),
            },
        )
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with_policy(Policy::permissive())
    }

    #[tokio::test]
    async fn catalog_search_returns_cards() {
        let d = dispatcher();
        let envelope = d.dispatch("catalog_search", json!({}), None).await;
        assert!(envelope.ok);
        let result = envelope.result.unwrap();
        assert_eq!(result["total_available"], 1);
        assert_eq!(result["tools"][0]["tool_id"], "alpha::hello");
    }

    #[tokio::test]
    async fn catalog_search_query_filters() {
        let d = dispatcher();
        let envelope = d
            .dispatch("catalog_search", json!({"query": "nonexistent-capability"}), None)
            .await;
        assert!(envelope.ok);
        assert_eq!(envelope.result.unwrap()["total_available"], 0);
    }

    #[tokio::test]
    async fn describe_returns_schema() {
        let d = dispatcher();
        let envelope = d
            .dispatch("describe", json!({"tool_id": "alpha::hello"}), None)
            .await;
        assert!(envelope.ok);
        let result = envelope.result.unwrap();
        assert_eq!(result["tool_id"], "alpha::hello");
        assert!(result["input_schema"]["properties"]["name"].is_object());
    }

    #[tokio::test]
    async fn describe_unknown_tool_is_not_found() {
        let d = dispatcher();
        let envelope = d
            .dispatch("describe", json!({"tool_id": "alpha::ghost"}), None)
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().code, "ToolNotFound");
    }

    #[tokio::test]
    async fn describe_denied_tool_is_denied() {
        let d = dispatcher_with_policy(
            parse_policy("tools:\n  denylist: ['*::hello']\n").unwrap(),
        );
        let envelope = d
            .dispatch("describe", json!({"tool_id": "alpha::hello"}), None)
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().code, "ToolDenied");
    }

    #[tokio::test]
    async fn denied_tools_absent_from_search() {
        let d = dispatcher_with_policy(
            parse_policy("tools:\n  denylist: ['*::hello']\n").unwrap(),
        );
        let envelope = d
            .dispatch("catalog_search", json!({"query": "hello"}), None)
            .await;
        assert!(envelope.ok);
        assert_eq!(envelope.result.unwrap()["total_available"], 0);
    }

    #[tokio::test]
    async fn invoke_missing_required_field_is_invalid_argument() {
        let d = dispatcher();
        let envelope = d
            .dispatch(
                "invoke",
                json!({"tool_id": "alpha::hello", "arguments": {}}),
                None,
            )
            .await;
        assert!(!envelope.ok);
        let err = envelope.error.unwrap();
        assert_eq!(err.code, "InvalidArgument");
        assert!(err.message.contains("name"));
    }

    #[tokio::test]
    async fn invoke_without_session_is_session_closed() {
        let d = dispatcher();
        // Schema passes, but no session named "alpha" is registered
        let envelope = d
            .dispatch(
                "invoke",
                json!({"tool_id": "alpha::hello", "arguments": {"name": "world"}}),
                None,
            )
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().code, "SessionClosed");
    }

    #[tokio::test]
    async fn unknown_meta_tool_is_invalid_argument() {
        let d = dispatcher();
        let envelope = d.dispatch("no_such_tool", json!({}), None).await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().code, "InvalidArgument");
    }

    #[tokio::test]
    async fn provision_missing_env_is_error_envelope() {
        let d = dispatcher();
        // The builtin github entry requires GITHUB_PERSONAL_ACCESS_TOKEN;
        // guard against it being present in the test environment
        if std::env::var("GITHUB_PERSONAL_ACCESS_TOKEN").is_ok() {
            return;
        }
        let envelope = d
            .dispatch("provision", json!({"server_name": "github"}), None)
            .await;
        assert!(!envelope.ok);
        let err = envelope.error.unwrap();
        assert_eq!(err.code, "ProvisionFailed");
        assert!(err.message.contains("GITHUB_PERSONAL_ACCESS_TOKEN"));
    }

    #[tokio::test]
    async fn provision_status_unknown_job() {
        let d = dispatcher();
        let envelope = d
            .dispatch("provision_status", json!({"job_id": "job-404"}), None)
            .await;
        assert!(!envelope.ok);
        assert_eq!(envelope.error.unwrap().code, "InvalidArgument");
    }

    #[tokio::test]
    async fn health_reports_catalog_totals() {
        let d = dispatcher();
        let envelope = d.dispatch("health", json!({}), None).await;
        assert!(envelope.ok);
        let result = envelope.result.unwrap();
        assert_eq!(result["total_tools"], 1);
        assert!(result["servers"].is_array());
    }

    #[tokio::test]
    async fn sync_environment_lists_probes() {
        let d = dispatcher();
        let envelope = d.dispatch("sync_environment", json!({}), None).await;
        assert!(envelope.ok);
        let result = envelope.result.unwrap();
        assert_eq!(result["platform"], std::env::consts::OS);
        assert!(!result["clis"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_capability_recommends() {
        let d = dispatcher();
        let envelope = d
            .dispatch("request_capability", json!({"query": "search the web"}), None)
            .await;
        assert!(envelope.ok);
        let result = envelope.result.unwrap();
        assert!(!result["candidates"].as_array().unwrap().is_empty());
        assert!(result["recommendation"].as_str().unwrap().len() > 10);
    }

    #[tokio::test]
    async fn results_pass_through_redaction() {
        let d = dispatcher_with_policy(
            parse_policy("redaction:\n  patterns: ['api_key=\\w+']\n").unwrap(),
        );
        // The hello description is clean, but health output of a crafted
        // server name would not be; exercise shape via catalog_search
        let envelope = d.dispatch("catalog_search", json!({}), None).await;
        assert!(envelope.ok);
        assert!(envelope.raw_size_estimate.is_some());
    }

    #[tokio::test]
    async fn truncation_sets_envelope_flags() {
        let d = dispatcher_with_policy(
            parse_policy("limits:\n  max_output_bytes: 60\n").unwrap(),
        );
        let envelope = d.dispatch("catalog_search", json!({}), None).await;
        assert!(envelope.ok);
        assert_eq!(envelope.truncated, Some(true));
        let raw = envelope.raw_size_estimate.unwrap();
        assert!(raw > 60);
        assert!(envelope.result.unwrap().to_string().len() <= 60);
    }
}
