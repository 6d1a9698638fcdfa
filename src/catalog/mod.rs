//! Aggregated tool/resource/prompt catalog.
//!
//! The registry pulls inventories from every live session, namespaces each
//! entry under `"<server>::<name>"`, applies policy, and publishes an
//! immutable snapshot. Reads clone an `Arc` of the current snapshot — a
//! search never observes a half-built catalog — and rebuilds swap the
//! snapshot atomically.
//!
//! Entries from a server that left `ready` are retained with
//! `availability = "offline"` until the next successful inventory fetch
//! replaces them.

mod search;

pub use search::{score_card, SearchResults};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::NAME_SEPARATOR;
use crate::error::GatewayError;
use crate::policy::Policy;
use crate::session::{PromptDescriptor, ResourceDescriptor, Session, SessionState, ToolDescriptor};

/// Hard cap on short descriptions, in characters.
const SHORT_DESCRIPTION_CHARS: usize = 140;

/// Whether an entry's owning server is currently reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    /// Owning session is `ready` or `degraded`.
    Online,
    /// Owning session left `ready`; entry retained from its last inventory.
    Offline,
}

/// Compact tool descriptor served by `catalog_search`.
///
/// Excludes the input schema — that is fetched on demand via `describe`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCard {
    /// Namespaced id, exactly `"<server>::<name>"`.
    pub tool_id: String,
    /// Owning server.
    pub server: String,
    /// Unqualified tool name.
    pub tool_name: String,
    /// First sentence of the server's description, capped at 140 chars.
    pub short_description: String,
    /// Capability tags (derived from annotations when present).
    pub tags: Vec<String>,
    /// Whether the owning server is reachable.
    pub availability: Availability,
    /// Coarse risk classification from the tool's annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_hint: Option<String>,
}

/// Full tool definition served by `describe`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    /// Namespaced id.
    pub tool_id: String,
    /// Full server-provided description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    pub input_schema: Value,
    /// Safety notes derived from the tool's annotations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_notes: Option<String>,
}

/// A proxied resource entry.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceEntry {
    /// Owning server.
    pub server: String,
    /// Resource URI as the downstream exposes it.
    pub uri: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Server-provided description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Whether the owning server is reachable.
    pub availability: Availability,
}

/// A proxied prompt entry.
#[derive(Debug, Clone, Serialize)]
pub struct PromptEntry {
    /// Namespaced id, `"<server>::<name>"`.
    pub prompt_id: String,
    /// Owning server.
    pub server: String,
    /// Unqualified prompt name.
    pub name: String,
    /// Server-provided description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    /// Whether the owning server is reachable.
    pub availability: Availability,
}

/// Splits a namespaced id into `(server, name)`.
#[must_use]
pub fn split_tool_id(tool_id: &str) -> Option<(&str, &str)> {
    tool_id.split_once(NAME_SEPARATOR)
}

/// Builds a namespaced id from components.
#[must_use]
pub fn make_tool_id(server: &str, name: &str) -> String {
    format!("{server}{NAME_SEPARATOR}{name}")
}

/// One server's most recent inventory, retained across rebuilds.
#[derive(Debug, Clone, Default)]
struct ServerInventory {
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
    prompts: Vec<PromptDescriptor>,
    online: bool,
}

/// The immutable catalog published to readers.
#[derive(Debug, Default)]
pub struct CatalogSnapshot {
    /// Policy-filtered tool cards in stable server-then-name order.
    pub tools: Vec<ToolCard>,
    /// Full schemas for every tool of a live inventory (not policy
    /// filtered; `describe` applies policy so denial is distinguishable
    /// from absence).
    schemas: HashMap<String, ToolSchema>,
    /// Policy-filtered resources.
    pub resources: Vec<ResourceEntry>,
    /// Policy-filtered prompts.
    pub prompts: Vec<PromptEntry>,
    /// Visible tool count per server.
    pub tool_counts: BTreeMap<String, usize>,
}

/// The aggregated, policy-filtered catalog.
pub struct CatalogRegistry {
    inventories: Mutex<BTreeMap<String, ServerInventory>>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl CatalogRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inventories: Mutex::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
        }
    }

    /// Returns the current snapshot. Cheap; never blocks a rebuild.
    #[must_use]
    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(
            &self
                .snapshot
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// Pulls inventories from the given sessions and publishes a new
    /// snapshot.
    ///
    /// Sessions in `ready`/`degraded` are fetched; a fetch failure degrades
    /// the session and keeps its previous entries offline. Sessions in any
    /// other state only flip their retained entries offline. Inventories of
    /// servers no longer present are dropped.
    pub async fn rebuild(&self, sessions: &[Arc<Session>], policy: &Policy) {
        for session in sessions {
            let name = session.name().to_string();
            match session.state() {
                SessionState::Ready | SessionState::Degraded => {
                    match fetch_inventory(session).await {
                        Ok((tools, resources, prompts)) => {
                            session.mark_recovered();
                            self.install_inventory(&name, tools, resources, prompts, true);
                        }
                        Err(e) => {
                            warn!(server = %name, error = %e, "inventory fetch failed");
                            session.mark_degraded(e.to_string());
                            self.set_online(&name, false);
                        }
                    }
                }
                _ => self.set_online(&name, false),
            }
        }

        // Drop inventories for servers that no longer exist
        {
            let live: Vec<String> = sessions.iter().map(|s| s.name().to_string()).collect();
            let mut inventories = self
                .inventories
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inventories.retain(|name, _| live.contains(name));
        }

        self.publish(policy);
    }

    /// Records one server's inventory without fetching.
    pub(crate) fn install_inventory(
        &self,
        server: &str,
        tools: Vec<ToolDescriptor>,
        resources: Vec<ResourceDescriptor>,
        prompts: Vec<PromptDescriptor>,
        online: bool,
    ) {
        let mut inventories = self
            .inventories
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inventories.insert(
            server.to_string(),
            ServerInventory {
                tools,
                resources,
                prompts,
                online,
            },
        );
    }

    fn set_online(&self, server: &str, online: bool) {
        let mut inventories = self
            .inventories
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(inventory) = inventories.get_mut(server) {
            inventory.online = online;
        }
    }

    /// Rebuilds the published snapshot from the retained inventories.
    pub(crate) fn publish(&self, policy: &Policy) {
        let inventories = self
            .inventories
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let mut snapshot = CatalogSnapshot::default();
        let cap = policy.limits.max_tools_per_server;

        for (server, inventory) in &inventories {
            let availability = if inventory.online {
                Availability::Online
            } else {
                Availability::Offline
            };

            // Per-server cap by truncation in server-provided order
            let mut visible = 0usize;
            for tool in inventory.tools.iter().take(cap) {
                if tool.name.contains(NAME_SEPARATOR) {
                    debug!(server = %server, tool = %tool.name, "skipping tool with '::' in name");
                    continue;
                }
                let tool_id = make_tool_id(server, &tool.name);
                snapshot
                    .schemas
                    .insert(tool_id.clone(), build_schema(&tool_id, tool));
                if !policy.tool_visible(server, &tool_id) {
                    continue;
                }
                snapshot
                    .tools
                    .push(build_card(server, &tool_id, tool, availability));
                visible += 1;
            }
            if visible > 0 {
                snapshot.tool_counts.insert(server.clone(), visible);
            }

            if !policy.servers.allows(server) {
                continue;
            }
            for resource in &inventory.resources {
                if !policy.resources.allows(&resource.uri) {
                    continue;
                }
                snapshot.resources.push(ResourceEntry {
                    server: server.clone(),
                    uri: resource.uri.clone(),
                    name: resource.name.clone(),
                    description: resource.description.clone(),
                    mime_type: resource.mime_type.clone(),
                    availability,
                });
            }
            for prompt in &inventory.prompts {
                if prompt.name.contains(NAME_SEPARATOR) || !policy.prompts.allows(&prompt.name) {
                    continue;
                }
                snapshot.prompts.push(PromptEntry {
                    prompt_id: make_tool_id(server, &prompt.name),
                    server: server.clone(),
                    name: prompt.name.clone(),
                    description: prompt.description.clone(),
                    arguments: prompt.arguments.clone(),
                    availability,
                });
            }
        }

        *self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(snapshot);
    }
}

impl Default for CatalogRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogSnapshot {
    /// Looks up a tool's full schema, applying policy.
    ///
    /// # Errors
    ///
    /// Returns `ToolDenied` when policy blocks the id and `ToolNotFound`
    /// when no live inventory defines it. A card returned by search always
    /// resolves to one of schema or `ToolDenied`.
    pub fn describe(&self, tool_id: &str, policy: &Policy) -> Result<&ToolSchema, GatewayError> {
        let Some((server, _)) = split_tool_id(tool_id) else {
            return Err(GatewayError::ToolNotFound {
                tool_id: tool_id.to_string(),
            });
        };
        if !policy.tool_visible(server, tool_id) {
            return Err(GatewayError::ToolDenied {
                tool_id: tool_id.to_string(),
            });
        }
        self.schemas
            .get(tool_id)
            .ok_or_else(|| GatewayError::ToolNotFound {
                tool_id: tool_id.to_string(),
            })
    }

    /// Finds the card for a tool id.
    #[must_use]
    pub fn card(&self, tool_id: &str) -> Option<&ToolCard> {
        self.tools.iter().find(|card| card.tool_id == tool_id)
    }

    /// Finds the owning server for a resource URI.
    #[must_use]
    pub fn resource_owner(&self, uri: &str) -> Option<&ResourceEntry> {
        self.resources.iter().find(|entry| entry.uri == uri)
    }

    /// Finds a prompt entry by unqualified or namespaced name.
    #[must_use]
    pub fn prompt(&self, name: &str) -> Option<&PromptEntry> {
        self.prompts
            .iter()
            .find(|entry| entry.prompt_id == name || entry.name == name)
    }

    /// Total visible tools.
    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

fn build_card(
    server: &str,
    tool_id: &str,
    tool: &ToolDescriptor,
    availability: Availability,
) -> ToolCard {
    ToolCard {
        tool_id: tool_id.to_string(),
        server: server.to_string(),
        tool_name: tool.name.clone(),
        short_description: short_description(tool.description.as_deref().unwrap_or_default()),
        tags: derive_tags(tool),
        availability,
        risk_hint: risk_hint(tool.annotations.as_ref()),
    }
}

fn build_schema(tool_id: &str, tool: &ToolDescriptor) -> ToolSchema {
    ToolSchema {
        tool_id: tool_id.to_string(),
        description: tool.description.clone(),
        input_schema: tool.input_schema.clone(),
        safety_notes: safety_notes(tool.annotations.as_ref()),
    }
}

/// First sentence of a description, hard-capped at 140 characters with an
/// ellipsis suffix.
fn short_description(description: &str) -> String {
    let text = description.trim();
    let sentence = text
        .find(". ")
        .map_or(text, |idx| &text[..=idx])
        .trim_end();

    let mut out: String = sentence.chars().take(SHORT_DESCRIPTION_CHARS).collect();
    if sentence.chars().count() > SHORT_DESCRIPTION_CHARS {
        out.pop();
        out.push('…');
    }
    out
}

/// Tags from the tool's annotations, when the downstream provides them.
fn derive_tags(tool: &ToolDescriptor) -> Vec<String> {
    tool.annotations
        .as_ref()
        .and_then(|a| a.get("tags"))
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn risk_hint(annotations: Option<&Value>) -> Option<String> {
    let annotations = annotations?;
    if annotations.get("destructiveHint").and_then(Value::as_bool) == Some(true) {
        return Some("destructive".to_string());
    }
    if annotations.get("readOnlyHint").and_then(Value::as_bool) == Some(true) {
        return Some("read-only".to_string());
    }
    None
}

fn safety_notes(annotations: Option<&Value>) -> Option<String> {
    let annotations = annotations?;
    if let Some(notes) = annotations.get("safetyNotes").and_then(Value::as_str) {
        return Some(notes.to_string());
    }
    match risk_hint(Some(annotations)).as_deref() {
        Some("destructive") => Some("May modify or delete external state.".to_string()),
        Some("read-only") => Some("Does not modify external state.".to_string()),
        _ => None,
    }
}

async fn fetch_inventory(
    session: &Arc<Session>,
) -> Result<
    (
        Vec<ToolDescriptor>,
        Vec<ResourceDescriptor>,
        Vec<PromptDescriptor>,
    ),
    GatewayError,
> {
    let tools = session.list_tools().await?;
    let resources = session.list_resources().await?;
    let prompts = session.list_prompts().await?;
    Ok((tools, resources, prompts))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::policy::parse_policy;

    fn tool(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: Some(description.to_string()),
            input_schema: json!({"type": "object"}),
            annotations: None,
        }
    }

    fn registry_with(server: &str, tools: Vec<ToolDescriptor>, policy: &Policy) -> CatalogRegistry {
        let registry = CatalogRegistry::new();
        registry.install_inventory(server, tools, Vec::new(), Vec::new(), true);
        registry.publish(policy);
        registry
    }

    #[test]
    fn tools_are_namespaced() {
        let policy = Policy::permissive();
        let registry = registry_with("alpha", vec![tool("hello", "Says hello.")], &policy);
        let snapshot = registry.snapshot();

        assert_eq!(snapshot.tools.len(), 1);
        assert_eq!(snapshot.tools[0].tool_id, "alpha::hello");
        assert_eq!(snapshot.tools[0].server, "alpha");
        assert_eq!(snapshot.tools[0].tool_name, "hello");
        assert_eq!(snapshot.tools[0].availability, Availability::Online);
    }

    #[test]
    fn denied_tools_are_invisible_but_describable_as_denied() {
        let policy = parse_policy("tools:\n  denylist: ['*::delete_*']\n").unwrap();
        let registry = registry_with(
            "x",
            vec![tool("delete_all", "Deletes."), tool("list", "Lists.")],
            &policy,
        );
        let snapshot = registry.snapshot();

        assert_eq!(snapshot.tools.len(), 1);
        assert_eq!(snapshot.tools[0].tool_id, "x::list");

        let err = snapshot.describe("x::delete_all", &policy).unwrap_err();
        assert_eq!(err.code(), "ToolDenied");

        let err = snapshot.describe("x::never_existed", &policy).unwrap_err();
        assert_eq!(err.code(), "ToolNotFound");
    }

    #[test]
    fn denied_server_hides_all_entries() {
        let policy = parse_policy("servers:\n  denylist: [internal]\n").unwrap();
        let registry = registry_with("internal", vec![tool("anything", "Does.")], &policy);
        let snapshot = registry.snapshot();

        assert!(snapshot.tools.is_empty());
        let err = snapshot.describe("internal::anything", &policy).unwrap_err();
        assert_eq!(err.code(), "ToolDenied");
    }

    #[test]
    fn per_server_cap_truncates_in_order() {
        let policy = parse_policy("limits:\n  max_tools_per_server: 2\n").unwrap();
        let registry = registry_with(
            "s",
            vec![tool("a", "."), tool("b", "."), tool("c", ".")],
            &policy,
        );
        let snapshot = registry.snapshot();

        let names: Vec<&str> = snapshot.tools.iter().map(|t| t.tool_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn every_card_has_a_schema() {
        let policy = Policy::permissive();
        let registry = registry_with(
            "s",
            vec![tool("one", "First."), tool("two", "Second.")],
            &policy,
        );
        let snapshot = registry.snapshot();

        for card in &snapshot.tools {
            assert!(snapshot.describe(&card.tool_id, &policy).is_ok());
        }
    }

    #[test]
    fn tools_with_separator_in_name_are_skipped() {
        let policy = Policy::permissive();
        let registry = registry_with("s", vec![tool("bad::name", "Nope.")], &policy);
        assert!(registry.snapshot().tools.is_empty());
    }

    #[test]
    fn offline_entries_are_retained() {
        let policy = Policy::permissive();
        let registry = registry_with("s", vec![tool("hello", "Hi.")], &policy);

        registry.set_online("s", false);
        registry.publish(&policy);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.tools.len(), 1);
        assert_eq!(snapshot.tools[0].availability, Availability::Offline);
    }

    #[test]
    fn short_description_takes_first_sentence() {
        assert_eq!(
            short_description("Does a thing. Also does more. And more."),
            "Does a thing."
        );
        assert_eq!(short_description("No trailing period"), "No trailing period");
    }

    #[test]
    fn short_description_caps_at_140_chars() {
        let long = "word ".repeat(60);
        let short = short_description(&long);
        assert_eq!(short.chars().count(), 140);
        assert!(short.ends_with('…'));
    }

    #[test]
    fn risk_hint_from_annotations() {
        let mut t = tool("rm", "Removes files.");
        t.annotations = Some(json!({"destructiveHint": true}));
        let card = build_card("s", "s::rm", &t, Availability::Online);
        assert_eq!(card.risk_hint.as_deref(), Some("destructive"));

        let mut t = tool("ls", "Lists files.");
        t.annotations = Some(json!({"readOnlyHint": true}));
        let card = build_card("s", "s::ls", &t, Availability::Online);
        assert_eq!(card.risk_hint.as_deref(), Some("read-only"));
    }

    #[test]
    fn split_and_make_round_trip() {
        let id = make_tool_id("server", "tool");
        assert_eq!(id, "server::tool");
        assert_eq!(split_tool_id(&id), Some(("server", "tool")));
        assert_eq!(split_tool_id("no-separator"), None);
    }

    #[test]
    fn prompts_and_resources_are_policy_filtered() {
        let policy = parse_policy(
            "resources:\n  denylist: ['file:///etc/*']\nprompts:\n  denylist: [dangerous]\n",
        )
        .unwrap();
        let registry = CatalogRegistry::new();
        registry.install_inventory(
            "s",
            Vec::new(),
            vec![
                ResourceDescriptor {
                    uri: "file:///etc/passwd".to_string(),
                    name: None,
                    description: None,
                    mime_type: None,
                },
                ResourceDescriptor {
                    uri: "file:///data/ok.txt".to_string(),
                    name: None,
                    description: None,
                    mime_type: None,
                },
            ],
            vec![
                PromptDescriptor {
                    name: "dangerous".to_string(),
                    description: None,
                    arguments: None,
                },
                PromptDescriptor {
                    name: "review".to_string(),
                    description: None,
                    arguments: None,
                },
            ],
            true,
        );
        registry.publish(&policy);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.resources.len(), 1);
        assert_eq!(snapshot.resources[0].uri, "file:///data/ok.txt");
        assert_eq!(snapshot.prompts.len(), 1);
        assert_eq!(snapshot.prompts[0].prompt_id, "s::review");
    }
}
