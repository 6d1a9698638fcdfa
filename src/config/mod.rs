//! MCP configuration discovery and loading.
//!
//! # Discovery Order
//!
//! 1. Explicit path (`--config` flag or `MCP_GATEWAY_CONFIG`) — replaces all
//!    other locations when present.
//! 2. `<project>/.mcp.json`
//! 3. `~/.mcp.json`
//! 4. `~/.claude/.mcp.json`
//!
//! Without an explicit path the existing files are merged, project over
//! user: a server name defined in both takes the project file's spec.

mod settings;

pub use settings::{McpConfig, RedactedEnv, ServerSpec, NAME_SEPARATOR};

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Environment variable naming an explicit config path.
pub const CONFIG_ENV_VAR: &str = "MCP_GATEWAY_CONFIG";

/// Returns the user-level config locations, highest precedence first.
#[must_use]
pub fn user_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".mcp.json"));
        paths.push(home.join(".claude").join(".mcp.json"));
    }
    paths
}

/// Loads the MCP configuration.
///
/// With `custom` set, only that file is consulted. Otherwise the discovery
/// locations are merged, lowest precedence first, so later files override
/// colliding server names.
///
/// # Errors
///
/// Returns an error when no file exists at any location, a file cannot be
/// read or parsed, or validation fails.
pub fn load_config(custom: Option<&Path>, project_dir: &Path) -> Result<McpConfig, ConfigError> {
    if let Some(path) = custom {
        let config = read_config_file(path)?;
        config.validate()?;
        return Ok(config);
    }

    // Lowest precedence first: ~/.claude/.mcp.json, ~/.mcp.json, project
    let mut candidates = user_config_paths();
    candidates.reverse();
    candidates.push(project_dir.join(".mcp.json"));

    let searched = candidates.len();
    let mut merged: Option<McpConfig> = None;
    for path in candidates {
        if !path.exists() {
            continue;
        }
        let layer = read_config_file(&path)?;
        match merged.as_mut() {
            Some(config) => config.merge_from(layer),
            None => merged = Some(layer),
        }
    }

    let config = merged.ok_or(ConfigError::NotFound { searched })?;
    config.validate()?;
    Ok(config)
}

fn read_config_file(path: &Path) -> Result<McpConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ReadError {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&contents).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Expands `~` to the user's home directory in a path string.
///
/// Returns the original path if `~` expansion fails or is not needed.
#[must_use]
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Returns the user-scoped cache directory (`~/.cache/mcp-gateway/`).
///
/// Holds logs and job/status snapshots; never authoritative state.
#[must_use]
pub fn cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|p| p.join("mcp-gateway"))
}
