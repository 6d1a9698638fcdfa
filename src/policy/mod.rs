//! Policy loading and evaluation.
//!
//! The policy file holds allow/deny globs over server names, tool ids,
//! resource URIs, and prompt names, plus numeric output caps and redaction
//! regexes. YAML and JSON are both accepted (JSON is a YAML subset).
//!
//! # Discovery Order
//!
//! 1. `--policy` CLI flag
//! 2. `MCP_GATEWAY_POLICY` environment variable
//! 3. `~/.claude/gateway-policy.yaml`
//!
//! An absent file yields permissive defaults: everything allowed, default
//! caps, no redaction.
//!
//! Policy is applied **last**, after aggregation, so every user-visible
//! payload passes through redaction and the size cap.

mod output;
mod redact;
mod rules;

pub use output::{CappedOutput, Limits};
pub use redact::Redactor;
pub use rules::{PolicyPattern, RuleSet};

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

/// Environment variable naming an explicit policy path.
pub const POLICY_ENV_VAR: &str = "MCP_GATEWAY_POLICY";

/// Compiled gateway policy.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    /// Rules over server names.
    pub servers: RuleSet,
    /// Rules over namespaced tool ids.
    pub tools: RuleSet,
    /// Rules over resource URIs.
    pub resources: RuleSet,
    /// Rules over prompt names.
    pub prompts: RuleSet,
    /// Numeric caps.
    pub limits: Limits,
    /// Redaction patterns.
    pub redactor: Redactor,
}

impl Policy {
    /// The policy used when no file is present: everything allowed, default
    /// caps, no redaction.
    #[must_use]
    pub fn permissive() -> Self {
        Self::default()
    }

    /// A tool card is visible iff its server passes server policy and its
    /// tool id passes tool policy.
    #[must_use]
    pub fn tool_visible(&self, server: &str, tool_id: &str) -> bool {
        self.servers.allows(server) && self.tools.allows(tool_id)
    }

    /// Visibility check for a proxied resource.
    #[must_use]
    pub fn resource_visible(&self, server: &str, uri: &str) -> bool {
        self.servers.allows(server) && self.resources.allows(uri)
    }

    /// Visibility check for a proxied prompt.
    #[must_use]
    pub fn prompt_visible(&self, server: &str, name: &str) -> bool {
        self.servers.allows(server) && self.prompts.allows(name)
    }

    /// Redacts then size-caps one outgoing payload.
    ///
    /// This is the single choke point the dispatcher routes every result
    /// through. The raw size estimate reflects the redacted serialisation.
    #[must_use]
    pub fn shape_output(&self, value: &serde_json::Value) -> CappedOutput {
        let serialised = value.to_string();
        let redacted = self.redactor.redact(&serialised);
        let value: serde_json::Value = match serde_json::from_str(&redacted) {
            Ok(v) => v,
            // Redaction of pathological content can break JSON syntax
            // (e.g. a pattern spanning quotes); fall back to carrying the
            // redacted text as a string rather than leaking the original.
            Err(_) => serde_json::Value::String(redacted.into_owned()),
        };
        self.limits.cap(&value)
    }
}

/// On-disk policy document.
#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    servers: ListPair,
    #[serde(default)]
    tools: ListPair,
    #[serde(default)]
    resources: ListPair,
    #[serde(default)]
    prompts: ListPair,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    redaction: RedactionSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListPair {
    #[serde(default)]
    allowlist: Vec<String>,
    #[serde(default)]
    denylist: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RedactionSection {
    #[serde(default)]
    patterns: Vec<String>,
}

impl TryFrom<PolicyFile> for Policy {
    type Error = ConfigError;

    fn try_from(file: PolicyFile) -> Result<Self, Self::Error> {
        Ok(Self {
            servers: RuleSet::compile(&file.servers.allowlist, &file.servers.denylist)?,
            tools: RuleSet::compile(&file.tools.allowlist, &file.tools.denylist)?,
            resources: RuleSet::compile(&file.resources.allowlist, &file.resources.denylist)?,
            prompts: RuleSet::compile(&file.prompts.allowlist, &file.prompts.denylist)?,
            limits: file.limits,
            redactor: Redactor::compile(&file.redaction.patterns)?,
        })
    }
}

/// Returns the default policy file location.
#[must_use]
pub fn default_policy_path() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".claude").join("gateway-policy.yaml"))
}

/// Loads the policy.
///
/// With `custom` set, that file must exist and parse. Otherwise the default
/// location is tried; an absent file yields [`Policy::permissive`].
///
/// # Errors
///
/// Returns an error when an explicitly named file is missing, or any file
/// fails to read, parse, or compile.
pub fn load_policy(custom: Option<&Path>) -> Result<Policy, ConfigError> {
    let path = match custom {
        Some(p) => p.to_path_buf(),
        None => match default_policy_path() {
            Some(p) if p.exists() => p,
            _ => return Ok(Policy::permissive()),
        },
    };

    let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::ReadError {
        path: path.clone(),
        source: e,
    })?;
    let file: PolicyFile =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseError {
            path,
            message: e.to_string(),
        })?;
    Policy::try_from(file)
}

/// Parses a policy document from text (YAML or JSON).
///
/// # Errors
///
/// Returns an error on parse or compile failure.
pub fn parse_policy(contents: &str) -> Result<Policy, ConfigError> {
    let file: PolicyFile = serde_yaml::from_str(contents).map_err(|e| ConfigError::ParseError {
        path: PathBuf::from("<inline>"),
        message: e.to_string(),
    })?;
    Policy::try_from(file)
}
