//! Aggregating MCP proxy.
//!
//! A single stdio MCP server fronting a dynamically-discovered set of
//! upstream MCP servers: their tool catalogs are merged into a flat
//! `<server>.<tool>` namespace, calls are multiplexed over one pooled
//! session per upstream, and project-defined executable upstreams are gated
//! behind an operator trust seal.

pub mod error;
pub mod mirror;
pub mod pool;
pub mod server;
pub mod session;

pub use error::{ProxyError, Result};
pub use mirror::{qualified_name, MirrorEntry, ToolMirror};
pub use pool::{PoolConfig, SessionPool};
pub use server::ProxyServer;
pub use session::{SessionState, ToolDescriptor, UpstreamSession};
