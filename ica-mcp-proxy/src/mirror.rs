//! The flat tool namespace exposed to the downstream client.
//!
//! Every upstream tool is mirrored as `<server>.<tool>`. The server name is
//! a literal prefix: an upstream tool whose own name contains a dot is still
//! admitted, and resolution is a map lookup on the qualified name rather
//! than a parse. Qualified names cannot collide because the merger already
//! deduplicated server names.

use crate::pool::SessionPool;
use ica_mcp_config::ServerSpec;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// One mirrored upstream tool.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntry {
    pub qualified_name: String,
    pub server_name: String,
    pub upstream_tool_name: String,
    pub description: Option<String>,
    pub schema_snapshot: Value,
}

/// Join a server name and tool name into the downstream-visible name.
pub fn qualified_name(server: &str, tool: &str) -> String {
    format!("{}.{}", server, tool)
}

/// Outcome of re-discovering one server's tools.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub server: String,
    pub tool_count: usize,
    pub error: Option<String>,
}

/// Maintains the qualified-name -> entry map behind the proxy's catalog.
#[derive(Default)]
pub struct ToolMirror {
    entries: RwLock<BTreeMap<String, MirrorEntry>>,
}

impl ToolMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-discover tools for one server (or all), replacing its entries.
    ///
    /// A server whose discovery fails loses its stale entries and is
    /// reported in the outcome; other servers are unaffected.
    pub async fn refresh(
        &self,
        pool: &SessionPool,
        servers: &BTreeMap<String, ServerSpec>,
        only: Option<&str>,
    ) -> Vec<RefreshOutcome> {
        let targets: Vec<&str> = match only {
            Some(server) => vec![server],
            None => servers.keys().map(String::as_str).collect(),
        };

        let mut outcomes = Vec::with_capacity(targets.len());
        for server in targets {
            pool.invalidate(server).await;
            let outcome = match pool.list_tools(server).await {
                Ok(tools) => {
                    let mut entries = self.entries.write().await;
                    entries.retain(|_, entry| entry.server_name != server);
                    let tool_count = tools.len();
                    for tool in tools {
                        let qualified = qualified_name(server, &tool.name);
                        entries.insert(
                            qualified.clone(),
                            MirrorEntry {
                                qualified_name: qualified,
                                server_name: server.to_string(),
                                upstream_tool_name: tool.name,
                                description: tool.description,
                                schema_snapshot: tool.input_schema,
                            },
                        );
                    }
                    RefreshOutcome {
                        server: server.to_string(),
                        tool_count,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(server = %server, error = %e, "tool discovery failed");
                    let mut entries = self.entries.write().await;
                    entries.retain(|_, entry| entry.server_name != server);
                    RefreshOutcome {
                        server: server.to_string(),
                        tool_count: 0,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Drop entries for servers that are no longer configured.
    pub async fn retain_servers(&self, servers: &BTreeMap<String, ServerSpec>) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| servers.contains_key(&entry.server_name));
    }

    /// Resolve a qualified name to `(server, upstream_tool)`.
    pub async fn resolve(&self, qualified: &str) -> Option<(String, String)> {
        self.entries.read().await.get(qualified).map(|entry| {
            (entry.server_name.clone(), entry.upstream_tool_name.clone())
        })
    }

    /// The current mirrored entries, sorted by qualified name.
    pub async fn snapshot(&self) -> Vec<MirrorEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, entry: MirrorEntry) {
        self.entries
            .write()
            .await
            .insert(entry.qualified_name.clone(), entry);
    }
}
