//! Error types for mcp-gateway.
//!
//! # Security Note
//!
//! Error messages are carefully crafted to NEVER include downstream
//! environment values. Variants that touch launch environments or install
//! recipes name the variable or step, never its value.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while loading or evaluating configuration and
/// policy files.
///
/// All of these surface upstream under the single `ConfigInvalid` code:
/// fatal at startup, local to the affected server on refresh.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read configuration file: {path}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Configuration file could not be parsed.
    #[error("failed to parse configuration file: {path}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse failure.
        message: String,
    },

    /// No configuration file was found at any discovery location.
    #[error("no MCP configuration found (searched {searched} locations)")]
    NotFound {
        /// Number of discovery locations that were checked.
        searched: usize,
    },

    /// Configuration validation failed.
    #[error("configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation failure.
        message: String,
    },

    /// A policy glob pattern is malformed.
    #[error("invalid policy pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The malformed pattern.
        pattern: String,
        /// Description of why the pattern is invalid.
        reason: String,
    },

    /// A redaction regex is malformed.
    #[error("invalid redaction pattern '{pattern}': {reason}")]
    InvalidRedaction {
        /// The malformed regex.
        pattern: String,
        /// Description of why the regex is invalid.
        reason: String,
    },
}

/// Errors surfaced by the gateway runtime.
///
/// Each variant maps to one of the stable error codes visible to the
/// upstream client via [`GatewayError::code`]. The dispatcher converts every
/// one of these into an error envelope — they never become transport-level
/// failures.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration or policy problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The downstream session terminated; pending calls fail with this.
    #[error("session '{server}' is closed")]
    SessionClosed {
        /// Name of the closed server.
        server: String,
    },

    /// No heartbeat within the call deadline.
    #[error("request {request_id} timed out after {elapsed_secs}s without a heartbeat")]
    SessionTimeout {
        /// The `"<server>::<N>"` request id that timed out.
        request_id: String,
        /// Seconds since the request was sent or last heard from.
        elapsed_secs: u64,
    },

    /// Catalog lookup failed: no such tool id.
    #[error("tool '{tool_id}' not found")]
    ToolNotFound {
        /// The tool id that was looked up.
        tool_id: String,
    },

    /// Policy blocked the tool.
    #[error("tool '{tool_id}' is denied by policy")]
    ToolDenied {
        /// The blocked tool id.
        tool_id: String,
    },

    /// Schema validation of `invoke` arguments failed.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the validation failure.
        message: String,
    },

    /// Per-session pending table is full.
    #[error("server '{server}' is busy ({pending} requests in flight)")]
    ServerBusy {
        /// Name of the saturated server.
        server: String,
        /// Number of in-flight requests at the time of refusal.
        pending: usize,
    },

    /// The upstream caller cancelled an in-flight request.
    #[error("request {request_id} was cancelled by the caller")]
    UpstreamCancelled {
        /// The `"<server>::<N>"` request id that was cancelled.
        request_id: String,
    },

    /// A cancellation was refused because the downstream is still alive.
    ///
    /// Returned by non-force `cancel` when the last heartbeat is recent.
    #[error("request {request_id} has a recent heartbeat ({age_secs}s old); use force to cancel")]
    CancelRefused {
        /// The request id whose cancellation was refused.
        request_id: String,
        /// Age of the most recent heartbeat in seconds.
        age_secs: u64,
    },

    /// An install job reached terminal failure.
    #[error("provisioning failed: {message}")]
    ProvisionFailed {
        /// Which step failed and why. Never contains environment values.
        message: String,
    },

    /// Any unexpected condition. Logged with context; surfaced generically.
    #[error("internal gateway error: {message}")]
    Internal {
        /// Description for the log; the upstream sees a generic message.
        message: String,
    },
}

impl GatewayError {
    /// Returns the stable error code string for the upstream envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigInvalid",
            Self::SessionClosed { .. } => "SessionClosed",
            Self::SessionTimeout { .. } => "SessionTimeout",
            Self::ToolNotFound { .. } => "ToolNotFound",
            Self::ToolDenied { .. } => "ToolDenied",
            Self::InvalidArgument { .. } => "InvalidArgument",
            Self::ServerBusy { .. } => "ServerBusy",
            Self::UpstreamCancelled { .. } => "UpstreamCancelled",
            Self::CancelRefused { .. } => "CancelRefused",
            Self::ProvisionFailed { .. } => "ProvisionFailed",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Builds an `Internal` error from any displayable cause.
    pub fn internal(cause: impl std::fmt::Display) -> Self {
        Self::Internal {
            message: cause.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let err = GatewayError::SessionClosed {
            server: "github".to_string(),
        };
        assert_eq!(err.code(), "SessionClosed");

        let err = GatewayError::ToolDenied {
            tool_id: "x::delete_all".to_string(),
        };
        assert_eq!(err.code(), "ToolDenied");

        let err = GatewayError::Config(ConfigError::ValidationError {
            message: "bad".to_string(),
        });
        assert_eq!(err.code(), "ConfigInvalid");
    }

    /// Error text must never carry environment values; only names appear.
    #[test]
    fn provision_error_names_variable_only() {
        let err = GatewayError::ProvisionFailed {
            message: "missing required environment variable GITHUB_PERSONAL_ACCESS_TOKEN"
                .to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("GITHUB_PERSONAL_ACCESS_TOKEN"));
        assert!(!msg.contains("ghp_"));
    }

    #[test]
    fn cancel_refused_mentions_force() {
        let err = GatewayError::CancelRefused {
            request_id: "github::4".to_string(),
            age_secs: 5,
        };
        assert!(err.to_string().contains("force"));
    }
}
