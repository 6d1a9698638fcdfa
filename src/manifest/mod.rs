//! Static catalog of provisionable servers.
//!
//! The manifest is consumed as data: each entry names a known downstream
//! server with its install recipe, launch command, required environment
//! variables, and capability tags. The built-in catalog is embedded at
//! compile time; the capability matcher and the provisioner both draw from
//! it. The CLI probe list for `sync_environment` lives here too.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::ServerSpec;
use crate::error::ConfigError;

/// Embedded built-in catalog.
const BUILTIN_CATALOG: &str = include_str!("catalog.json");

/// One required (or optional) environment variable of a manifest entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EnvRequirement {
    /// Variable name, e.g. `GITHUB_PERSONAL_ACCESS_TOKEN`.
    pub name: String,
    /// Whether provisioning refuses to start without it.
    #[serde(default)]
    pub required: bool,
    /// Human-readable hint shown in capability results.
    #[serde(default)]
    pub description: Option<String>,
}

/// A provisionable server known to the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestEntry {
    /// What the server does; feeds the capability matcher.
    pub description: String,
    /// Executable used to run the server once installed.
    pub command: String,
    /// Arguments for the run command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Install recipe: command lines executed in order.
    #[serde(default)]
    pub install: Vec<Vec<String>>,
    /// Environment variables the server needs.
    #[serde(default)]
    pub env: Vec<EnvRequirement>,
    /// Capability tags for matching.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ManifestEntry {
    /// Names of required environment variables that `lookup` cannot resolve.
    pub fn missing_env<'a>(&'a self, lookup: impl Fn(&str) -> bool) -> Vec<&'a str> {
        self.env
            .iter()
            .filter(|req| req.required && !lookup(&req.name))
            .map(|req| req.name.as_str())
            .collect()
    }

    /// Whether the entry needs any API key or token to run.
    #[must_use]
    pub fn requires_api_key(&self) -> bool {
        self.env.iter().any(|req| req.required)
    }

    /// Builds the launch spec for a provisioned instance.
    #[must_use]
    pub fn to_server_spec(&self, extra_env: BTreeMap<String, String>) -> ServerSpec {
        ServerSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            env: extra_env,
            cwd: None,
        }
    }
}

/// The manifest document: entries plus the CLI probe list.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Manifest {
    /// Name → provisionable server.
    pub servers: BTreeMap<String, ManifestEntry>,
    /// Executables `sync_environment` probes for on the host.
    #[serde(default)]
    pub cli_probes: Vec<String>,
}

impl Manifest {
    /// Loads the embedded built-in catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedded document fails to parse; this
    /// indicates a packaging defect, not user input.
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::parse(BUILTIN_CATALOG)
    }

    /// Parses a manifest document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed JSON.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(contents).map_err(|e| ConfigError::ParseError {
            path: std::path::PathBuf::from("<manifest>"),
            message: e.to_string(),
        })
    }

    /// Looks up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ManifestEntry> {
        self.servers.get(name)
    }
}
