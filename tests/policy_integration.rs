//! Policy enforcement through the full dispatch stack.
//!
//! Denied entries must be absent from every user-visible listing while
//! `describe` still distinguishes denial from absence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use mcp_gateway::catalog::CatalogRegistry;
use mcp_gateway::config::{McpConfig, ServerSpec};
use mcp_gateway::gateway::{ConfigSources, Dispatcher};
use mcp_gateway::manifest::Manifest;
use mcp_gateway::policy::parse_policy;
use mcp_gateway::provision::Provisioner;
use mcp_gateway::session::SessionManager;

/// A downstream exposing `delete_all` and `list_items`.
fn write_stub_script(dir: &Path) -> PathBuf {
    let script = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{"listChanged":false}},"serverInfo":{"name":"stub","version":"0.1.0"}}}\n' "$id"
      ;;
    *'"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"delete_all","description":"Deletes every item.","inputSchema":{"type":"object"}},{"name":"list_items","description":"Lists items.","inputSchema":{"type":"object"}}]}}\n' "$id"
      ;;
    *'"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"ok"}],"isError":false}}\n' "$id"
      ;;
    *)
      if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      fi
      ;;
  esac
done
"#;
    let path = dir.join("x-server.sh");
    std::fs::write(&path, script).unwrap();
    path
}

async fn gateway_with_policy(dir: &TempDir, policy_yaml: &str) -> Arc<Dispatcher> {
    let script = write_stub_script(dir.path());
    let mut config = McpConfig::default();
    config.mcp_servers.insert(
        "X".to_string(),
        ServerSpec::new("sh", vec![script.to_string_lossy().into_owned()]),
    );
    let config_path = dir.path().join("gateway.mcp.json");
    std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

    let manager = Arc::new(SessionManager::with_retry_delays(Vec::new()));
    let catalog = Arc::new(CatalogRegistry::new());
    let manifest = Arc::new(Manifest::builtin().unwrap());
    let provisioner = Arc::new(Provisioner::new(Arc::clone(&manifest), Arc::clone(&manager)));
    let dispatcher = Arc::new(Dispatcher::new(
        manager,
        catalog,
        parse_policy(policy_yaml).unwrap(),
        manifest,
        provisioner,
        ConfigSources {
            config_path: Some(config_path),
            policy_path: None,
            project_dir: dir.path().to_path_buf(),
        },
    ));
    dispatcher.startup(&config).await;
    dispatcher
}

#[tokio::test]
async fn test_denied_tool_absent_from_search_and_denied_on_describe() {
    let dir = TempDir::new().unwrap();
    let dispatcher = gateway_with_policy(&dir, "tools:\n  denylist: ['*::delete_*']\n").await;

    // Search for the denied name comes back empty
    let search = dispatcher
        .dispatch("catalog_search", json!({"query": "delete"}), None)
        .await
        .result
        .unwrap();
    assert_eq!(search["total_available"], 0);
    assert!(search["tools"].as_array().unwrap().is_empty());

    // The allowed sibling is still listed
    let search = dispatcher
        .dispatch("catalog_search", json!({}), None)
        .await
        .result
        .unwrap();
    let ids: Vec<&str> = search["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tool_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["X::list_items"]);

    // describe distinguishes denial from absence
    let denied = dispatcher
        .dispatch("describe", json!({"tool_id": "X::delete_all"}), None)
        .await;
    assert!(!denied.ok);
    assert_eq!(denied.error.unwrap().code, "ToolDenied");

    let missing = dispatcher
        .dispatch("describe", json!({"tool_id": "X::never_was"}), None)
        .await;
    assert_eq!(missing.error.unwrap().code, "ToolNotFound");
}

#[tokio::test]
async fn test_denied_tool_cannot_be_invoked() {
    let dir = TempDir::new().unwrap();
    let dispatcher = gateway_with_policy(&dir, "tools:\n  denylist: ['*::delete_*']\n").await;

    let envelope = dispatcher
        .dispatch(
            "invoke",
            json!({"tool_id": "X::delete_all", "arguments": {}}),
            None,
        )
        .await;
    assert!(!envelope.ok);
    assert_eq!(envelope.error.unwrap().code, "ToolDenied");
}

#[tokio::test]
async fn test_denied_server_disappears_entirely() {
    let dir = TempDir::new().unwrap();
    let dispatcher = gateway_with_policy(&dir, "servers:\n  denylist: ['X']\n").await;

    let search = dispatcher
        .dispatch("catalog_search", json!({}), None)
        .await
        .result
        .unwrap();
    assert_eq!(search["total_available"], 0);

    let denied = dispatcher
        .dispatch("describe", json!({"tool_id": "X::list_items"}), None)
        .await;
    assert_eq!(denied.error.unwrap().code, "ToolDenied");
}

#[tokio::test]
async fn test_allowlist_mode_hides_everything_else() {
    let dir = TempDir::new().unwrap();
    let dispatcher =
        gateway_with_policy(&dir, "tools:\n  allowlist: ['X::list_items']\n").await;

    let search = dispatcher
        .dispatch("catalog_search", json!({}), None)
        .await
        .result
        .unwrap();
    let ids: Vec<&str> = search["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tool_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["X::list_items"]);
}

#[tokio::test]
async fn test_per_server_tool_cap_truncates() {
    let dir = TempDir::new().unwrap();
    let dispatcher = gateway_with_policy(&dir, "limits:\n  max_tools_per_server: 1\n").await;

    let search = dispatcher
        .dispatch("catalog_search", json!({}), None)
        .await
        .result
        .unwrap();
    // Server-provided order: delete_all first, list_items dropped
    let ids: Vec<&str> = search["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["tool_id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["X::delete_all"]);
}
