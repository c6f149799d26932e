//! Error types for the proxy runtime.

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced to the downstream client as structured tool errors.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration or trust plumbing failed.
    #[error("configuration error: {0}")]
    Config(#[from] ica_mcp_config::ConfigError),

    /// A gated project stdio server was invoked without a trust seal.
    #[error("server '{server}' requires trust: {reason}")]
    TrustRequired { server: String, reason: String },

    /// The qualified name did not resolve to a configured server.
    #[error("unknown server '{name}'")]
    UnknownServer { name: String },

    /// The qualified name resolved to no mirrored or internal tool.
    #[error("unknown tool '{qualified_name}'")]
    UnknownTool { qualified_name: String },

    /// The session for a server repeatedly failed to reach Ready.
    #[error("upstream '{server}' unavailable: {cause}")]
    UpstreamUnavailable { server: String, cause: String },

    /// The upstream returned a protocol-level error for a call.
    #[error("upstream '{server}' failed tool '{tool}': {payload}")]
    UpstreamError {
        server: String,
        tool: String,
        payload: Value,
    },

    /// The effective deadline elapsed before the upstream responded.
    #[error("call to '{server}.{tool}' timed out after {deadline_s}s")]
    Timeout {
        server: String,
        tool: String,
        deadline_s: u64,
    },

    /// The upstream session died while the call was in flight.
    #[error("session for '{server}' failed: {cause}")]
    SessionFailed { server: String, cause: String },

    /// The downstream request was malformed.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

impl ProxyError {
    /// Stable machine-readable tag included in downstream tool errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Config(_) => "config_error",
            ProxyError::TrustRequired { .. } => "trust_required",
            ProxyError::UnknownServer { .. } => "unknown_server",
            ProxyError::UnknownTool { .. } => "unknown_tool",
            ProxyError::UpstreamUnavailable { .. } => "upstream_unavailable",
            ProxyError::UpstreamError { .. } => "upstream_error",
            ProxyError::Timeout { .. } => "timeout",
            ProxyError::SessionFailed { .. } => "session_failed",
            ProxyError::InvalidParams(_) => "invalid_params",
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        let err = ProxyError::TrustRequired {
            server: "p".into(),
            reason: "untrusted_project_stdio".into(),
        };
        assert_eq!(err.kind(), "trust_required");

        let err = ProxyError::Timeout {
            server: "s".into(),
            tool: "t".into(),
            deadline_s: 5,
        };
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().contains("s.t"));
    }
}
