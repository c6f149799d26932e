//! The downstream MCP server surface.
//!
//! One `ProxyServer` fronts the whole merged upstream set: `list_tools`
//! returns the `proxy.*` control tools plus every mirrored `<server>.<tool>`
//! entry, and `call_tool` routes either to an internal handler or through
//! the session pool. Upstream failures come back as structured tool errors
//! with a stable kind tag, never as protocol failures.

use crate::error::{ProxyError, Result};
use crate::mirror::{MirrorEntry, RefreshOutcome, ToolMirror};
use crate::pool::{PoolConfig, SessionPool};
use ica_mcp_config::{
    load_servers_merged, trust_project, LayerOrigin, MergedConfig, Policy, TrustStore,
};
use rmcp::model::*;
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Downstream server name.
const SERVER_NAME: &str = "ica-mcp-proxy";

/// Aggregating proxy over every configured upstream.
#[derive(Clone)]
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

struct ProxyState {
    cwd: PathBuf,
    pool: Arc<SessionPool>,
    mirror: ToolMirror,
    merged: RwLock<MergedConfig>,
    /// Whether the project carries a valid trust seal, refreshed per reload.
    project_sealed: RwLock<bool>,
}

fn tool_descriptor(name: &str, description: Option<&str>, schema: Value) -> Tool {
    let schema = match schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    Tool::new_with_raw(
        Cow::Owned(name.to_string()),
        description.map(|text| Cow::Owned(text.to_string())),
        Arc::new(schema),
    )
}

/// The always-present control tools. Their catalog never touches upstreams.
fn proxy_tools() -> Vec<Tool> {
    vec![
        tool_descriptor(
            "proxy.list_servers",
            Some("List allowed upstream servers with transport, trust, and readiness"),
            json!({"type": "object", "properties": {}}),
        ),
        tool_descriptor(
            "proxy.list_blocked",
            Some("List upstream servers blocked by policy, with reasons"),
            json!({"type": "object", "properties": {}}),
        ),
        tool_descriptor(
            "proxy.call",
            Some("Invoke an upstream tool without using its dotted mirror name"),
            json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string"},
                    "tool": {"type": "string"},
                    "args": {"type": "object"}
                },
                "required": ["server", "tool"]
            }),
        ),
        tool_descriptor(
            "proxy.refresh",
            Some("Re-discover tools for one server, or all servers when omitted"),
            json!({
                "type": "object",
                "properties": {
                    "server": {"type": "string"}
                }
            }),
        ),
    ]
}

fn text_result(value: &Value) -> CallToolResult {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    CallToolResult::success(vec![Content::text(text)])
}

fn error_result(error: &ProxyError) -> CallToolResult {
    CallToolResult::error(vec![Content::text(format!("{}: {}", error.kind(), error))])
}

impl ProxyServer {
    pub fn new(cwd: PathBuf, pool_config: PoolConfig) -> Self {
        Self {
            state: Arc::new(ProxyState {
                cwd,
                pool: SessionPool::new(pool_config),
                mirror: ToolMirror::new(),
                merged: RwLock::new(MergedConfig::default()),
                project_sealed: RwLock::new(false),
            }),
        }
    }

    /// Re-run the merger and hand the allowed set to the pool.
    ///
    /// Environment policy is re-read on each call, so trust seals and flag
    /// flips take effect without restarting the proxy.
    pub async fn reload(&self) -> Result<()> {
        let merged = load_servers_merged(&self.state.cwd)?;
        for warning in &merged.warnings {
            tracing::warn!("config: {}", warning);
        }
        for (name, reason) in &merged.blocked_servers {
            tracing::warn!(server = %name, reason = %reason, "upstream blocked");
        }

        let sealed = {
            let policy = Policy::from_env();
            match (&policy.home_dir, merged.project_digest()) {
                (Some(home_dir), Some(digest)) => {
                    TrustStore::new(home_dir).is_trusted(&self.state.cwd, digest)
                }
                _ => false,
            }
        };

        self.state.pool.update_specs(merged.servers.clone());
        self.state.mirror.retain_servers(&merged.servers).await;
        *self.state.project_sealed.write().await = sealed;
        *self.state.merged.write().await = merged;
        Ok(())
    }

    /// Discover tools for every allowed server.
    pub async fn discover(&self) -> Vec<RefreshOutcome> {
        let servers = self.state.merged.read().await.servers.clone();
        let outcomes = self.state.mirror.refresh(&self.state.pool, &servers, None).await;
        for outcome in &outcomes {
            match &outcome.error {
                None => tracing::info!(
                    server = %outcome.server,
                    tools = outcome.tool_count,
                    "mirrored upstream tools"
                ),
                Some(error) => tracing::warn!(server = %outcome.server, error = %error, "dropping upstream from catalog"),
            }
        }
        outcomes
    }

    /// Seal the current project at its on-disk config digest.
    pub fn trust_current_project(&self) -> Result<ica_mcp_config::TrustRecord> {
        Ok(trust_project(&self.state.cwd)?)
    }

    pub async fn shutdown(&self) {
        self.state.pool.shutdown_all().await;
    }

    pub async fn mirror_snapshot(&self) -> Vec<MirrorEntry> {
        self.state.mirror.snapshot().await
    }

    /// Route one tool invocation. This is the whole `call_tool` surface,
    /// kept off the rmcp trait so tests can drive it directly.
    pub async fn dispatch_call(&self, name: &str, args: Value) -> Result<CallToolResult> {
        if let Some(internal) = name.strip_prefix("proxy.") {
            return self.dispatch_proxy(internal, args).await;
        }

        if let Some((server, tool)) = self.state.mirror.resolve(name).await {
            return self.call_upstream(&server, &tool, args).await.map_err(|e| {
                match e {
                    ProxyError::UnknownServer { .. } => ProxyError::UnknownTool {
                        qualified_name: name.to_string(),
                    },
                    other => other,
                }
            });
        }

        // Not mirrored (yet): route by the literal prefix so tools added
        // upstream after the last refresh still work.
        let Some((server, tool)) = name.split_once('.') else {
            return Err(ProxyError::UnknownTool {
                qualified_name: name.to_string(),
            });
        };
        self.call_upstream(server, tool, args).await.map_err(|e| match e {
            ProxyError::UnknownServer { .. } => ProxyError::UnknownTool {
                qualified_name: name.to_string(),
            },
            other => other,
        })
    }

    async fn call_upstream(&self, server: &str, tool: &str, args: Value) -> Result<CallToolResult> {
        {
            let merged = self.state.merged.read().await;
            if let Some(reason) = merged.blocked_servers.get(server) {
                return Err(ProxyError::TrustRequired {
                    server: server.to_string(),
                    reason: reason.clone(),
                });
            }
            if !merged.servers.contains_key(server) {
                return Err(ProxyError::UnknownServer {
                    name: server.to_string(),
                });
            }
        }

        let result = self.state.pool.call_tool(server, tool, args, None).await?;
        serde_json::from_value::<CallToolResult>(result.clone()).map_err(|e| {
            ProxyError::UpstreamError {
                server: server.to_string(),
                tool: tool.to_string(),
                payload: json!({
                    "message": format!("unrepresentable tool result: {}", e),
                    "result": result,
                }),
            }
        })
    }

    async fn dispatch_proxy(&self, tool: &str, args: Value) -> Result<CallToolResult> {
        match tool {
            "list_servers" => {
                let merged = self.state.merged.read().await;
                let sealed = *self.state.project_sealed.read().await;
                let ready = self.state.pool.ready_servers().await;
                let servers: Vec<Value> = merged
                    .servers
                    .values()
                    .map(|spec| {
                        let gated = spec.origin == LayerOrigin::Project && spec.is_stdio();
                        json!({
                            "name": spec.name,
                            "transport": spec.transport_name(),
                            "trusted": !gated || sealed,
                            "ready": ready.contains(&spec.name),
                        })
                    })
                    .collect();
                Ok(text_result(&Value::Array(servers)))
            }
            "list_blocked" => {
                let merged = self.state.merged.read().await;
                let blocked: Vec<Value> = merged
                    .blocked_servers
                    .iter()
                    .map(|(name, reason)| json!({"name": name, "reason": reason}))
                    .collect();
                Ok(text_result(&Value::Array(blocked)))
            }
            "call" => {
                let server = args
                    .get("server")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProxyError::InvalidParams("'server' is required".into()))?
                    .to_string();
                let tool_name = args
                    .get("tool")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProxyError::InvalidParams("'tool' is required".into()))?
                    .to_string();
                let call_args = match args.get("args") {
                    None | Some(Value::Null) => json!({}),
                    Some(Value::Object(map)) => Value::Object(map.clone()),
                    Some(_) => {
                        return Err(ProxyError::InvalidParams("'args' must be an object".into()))
                    }
                };
                self.call_upstream(&server, &tool_name, call_args).await
            }
            "refresh" => {
                let only = match args.get("server") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(server)) => Some(server.clone()),
                    Some(_) => {
                        return Err(ProxyError::InvalidParams("'server' must be a string".into()))
                    }
                };

                // A full refresh also re-merges config so newly added
                // servers are discovered in the same round trip.
                if only.is_none() {
                    if let Err(e) = self.reload().await {
                        tracing::warn!("reload during refresh failed: {}", e);
                    }
                }

                let servers = self.state.merged.read().await.servers.clone();
                if let Some(server) = &only {
                    if !servers.contains_key(server) {
                        return Err(ProxyError::UnknownServer {
                            name: server.clone(),
                        });
                    }
                }

                let outcomes = self
                    .state
                    .mirror
                    .refresh(&self.state.pool, &servers, only.as_deref())
                    .await;
                let report: Vec<Value> = outcomes
                    .iter()
                    .map(|outcome| {
                        json!({
                            "server": outcome.server,
                            "tools": outcome.tool_count,
                            "error": outcome.error,
                        })
                    })
                    .collect();
                Ok(text_result(&Value::Array(report)))
            }
            other => Err(ProxyError::UnknownTool {
                qualified_name: format!("proxy.{}", other),
            }),
        }
    }

    fn implementation() -> Implementation {
        let mut implementation = Implementation::new(SERVER_NAME, env!("CARGO_PKG_VERSION"));
        implementation.title = Some("ICA MCP Proxy".into());
        implementation
    }

    fn capabilities() -> ServerCapabilities {
        ServerCapabilities::builder()
            .enable_tools_with(ToolsCapability {
                list_changed: Some(false),
            })
            .build()
    }
}

impl ServerHandler for ProxyServer {
    /// Wire the merged config and tool mirror up when the client connects.
    ///
    /// Config and trust problems are logged and surface as dropped or
    /// blocked servers; they never abort the downstream session.
    async fn initialize(
        &self,
        _request: InitializeRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<InitializeResult, McpError> {
        if let Err(e) = self.reload().await {
            tracing::error!("config reload during initialize failed: {}", e);
        }
        self.discover().await;

        Ok(InitializeResult::new(Self::capabilities())
            .with_server_info(Self::implementation())
            .with_instructions(
                "Aggregating proxy: tools are exposed as <server>.<tool>; proxy.* tools control the upstream set",
            ))
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<ListToolsResult, McpError> {
        let mut tools = proxy_tools();
        for entry in self.state.mirror.snapshot().await {
            tools.push(tool_descriptor(
                &entry.qualified_name,
                entry.description.as_deref(),
                entry.schema_snapshot.clone(),
            ));
        }
        Ok(ListToolsResult {
            meta: None,
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let args = request
            .arguments
            .map(Value::Object)
            .unwrap_or_else(|| json!({}));

        match self.dispatch_call(&request.name, args).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::debug!(tool = %request.name, kind = e.kind(), "tool call failed: {}", e);
                Ok(error_result(&e))
            }
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(Self::capabilities())
            .with_server_info(Self::implementation())
            .with_instructions(
                "Aggregating proxy: tools are exposed as <server>.<tool>; proxy.* tools control the upstream set",
            )
    }
}
