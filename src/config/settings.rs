//! Configuration structures for deserialisation.
//!
//! These structures map directly to the standard MCP JSON config format:
//! `{"mcpServers": {"<name>": {"command": ..., "args": [...], ...}}}`.
//! Unknown extra keys are tolerated — configs in the wild carry editor
//! metadata the gateway must not choke on.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Separator used in namespaced tool ids; forbidden inside server names.
pub const NAME_SEPARATOR: &str = "::";

/// Root MCP configuration document.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct McpConfig {
    /// Server name → launch description.
    #[serde(rename = "mcpServers", default)]
    pub mcp_servers: BTreeMap<String, ServerSpec>,
}

impl McpConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any server name contains the `::` separator or
    /// any launch spec is incomplete.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, spec) in &self.mcp_servers {
            if name.is_empty() {
                return Err(ConfigError::ValidationError {
                    message: "server name cannot be empty".to_string(),
                });
            }
            if name.contains(NAME_SEPARATOR) {
                return Err(ConfigError::ValidationError {
                    message: format!("server name '{name}' must not contain '::'"),
                });
            }
            spec.validate(name)?;
        }
        Ok(())
    }

    /// Merges `overlay` on top of `self`: colliding names take the overlay's
    /// spec wholesale.
    pub fn merge_from(&mut self, overlay: Self) {
        for (name, spec) in overlay.mcp_servers {
            self.mcp_servers.insert(name, spec);
        }
    }
}

/// Launch description for one downstream server.
///
/// Immutable once loaded; refresh replaces the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServerSpec {
    /// Executable to launch.
    pub command: String,

    /// Arguments passed to the command.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overrides layered on top of the parent environment.
    /// Values may hold credentials and are never logged.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ServerSpec {
    /// Creates a spec with just a command and arguments.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::ValidationError {
                message: format!("command cannot be empty for server '{name}'"),
            });
        }
        Ok(())
    }
}

// Custom Debug that never reveals environment values
impl std::fmt::Debug for RedactedEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.0.keys()).finish()
    }
}

/// Debug helper listing environment variable names without their values.
pub struct RedactedEnv<'a>(pub &'a BTreeMap<String, String>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r#"{
            "mcpServers": {
                "github": {
                    "command": "npx",
                    "args": ["-y", "@modelcontextprotocol/server-github"]
                }
            }
        }"#;

        let config: McpConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.mcp_servers.len(), 1);
        assert_eq!(config.mcp_servers["github"].command, "npx");
    }

    #[test]
    fn parse_full_spec() {
        let json = r#"{
            "mcpServers": {
                "db": {
                    "command": "mcp-postgres",
                    "args": ["--readonly"],
                    "env": {"DATABASE_URL": "postgres://localhost/dev"},
                    "cwd": "/srv/db"
                }
            }
        }"#;

        let config: McpConfig = serde_json::from_str(json).unwrap();
        let spec = &config.mcp_servers["db"];
        assert_eq!(spec.args, vec!["--readonly"]);
        assert_eq!(spec.env["DATABASE_URL"], "postgres://localhost/dev");
        assert_eq!(spec.cwd.as_deref(), Some(std::path::Path::new("/srv/db")));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let json = r#"{
            "mcpServers": {
                "x": {"command": "x-server", "type": "stdio", "disabled": false}
            }
        }"#;

        let config: McpConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_separator_in_name() {
        let json = r#"{"mcpServers": {"a::b": {"command": "x"}}}"#;
        let config: McpConfig = serde_json::from_str(json).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("::"));
    }

    #[test]
    fn validate_rejects_empty_command() {
        let json = r#"{"mcpServers": {"a": {"command": ""}}}"#;
        let config: McpConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn merge_overlay_wins_on_collision() {
        let mut base: McpConfig =
            serde_json::from_str(r#"{"mcpServers": {"a": {"command": "user-a"}, "b": {"command": "user-b"}}}"#)
                .unwrap();
        let overlay: McpConfig =
            serde_json::from_str(r#"{"mcpServers": {"a": {"command": "project-a"}}}"#).unwrap();

        base.merge_from(overlay);
        assert_eq!(base.mcp_servers["a"].command, "project-a");
        assert_eq!(base.mcp_servers["b"].command, "user-b");
    }

    #[test]
    fn redacted_env_hides_values() {
        let mut env = BTreeMap::new();
        env.insert("API_KEY".to_string(), "supersecret".to_string());
        let debug = format!("{:?}", RedactedEnv(&env));
        assert!(debug.contains("API_KEY"));
        assert!(!debug.contains("supersecret"));
    }
}
