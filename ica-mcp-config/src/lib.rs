//! Layered MCP server configuration for the ICA MCP proxy.
//!
//! Upstream server definitions come from up to three sources: the project's
//! `.mcp.json`, the home scope's `mcp-servers.json`, and an operator-named
//! override file. This crate reads and normalizes those layers, merges them
//! under a precedence policy, and gates project-defined executable servers
//! behind an operator trust seal bound to the project config's digest.

pub mod error;
pub mod layer;
pub mod merge;
pub mod security;
pub mod spec;
pub mod trust;

pub use error::{ConfigError, Result};
pub use layer::{canonical_digest, read_env_override, read_home, read_project, ConfigLayer};
pub use merge::{
    env_flag, load_servers_merged, load_servers_merged_with, truthy, trust_project,
    trust_project_with, MergedConfig, Policy, BLOCKED_UNTRUSTED,
};
pub use security::{is_loopback_host, validate_redirect_uri, validate_secure_url};
pub use spec::{LayerOrigin, OAuthFlow, OAuthSpec, ServerSpec, TransportSpec};
pub use trust::{TrustRecord, TrustStore};
