//! Minimal MCP server used as an upstream by the integration tests.
//!
//! Exposes `echo`, `add`, `pid`, and `sleepy_pid` over stdio. The pid tools
//! exist so tests can witness that pooled calls share one subprocess.

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct EchoArgs {
    /// Text to echo back unchanged
    text: String,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
struct SleepyPidArgs {
    /// How long to sleep before answering, milliseconds
    delay_ms: Option<u64>,
}

#[derive(Clone)]
struct FixtureServer {
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl FixtureServer {
    fn new() -> Self {
        Self {
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Echo the input text")]
    async fn echo(&self, Parameters(args): Parameters<EchoArgs>) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(args.text)]))
    }

    #[tool(description = "Add two integers")]
    async fn add(&self, Parameters(args): Parameters<AddArgs>) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(
            (args.a + args.b).to_string(),
        )]))
    }

    #[tool(description = "Return this server's process id")]
    async fn pid(&self) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(
            std::process::id().to_string(),
        )]))
    }

    #[tool(description = "Sleep briefly, then return this server's process id")]
    async fn sleepy_pid(
        &self,
        Parameters(args): Parameters<SleepyPidArgs>,
    ) -> Result<CallToolResult, McpError> {
        let delay = std::time::Duration::from_millis(args.delay_ms.unwrap_or(5));
        tokio::time::sleep(delay).await;
        Ok(CallToolResult::success(vec![Content::text(
            std::process::id().to_string(),
        )]))
    }
}

#[tool_handler]
impl ServerHandler for FixtureServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo::new(ServerCapabilities::builder().enable_tools().build())
            .with_server_info(Implementation::new(
                "ica-mcp-fixture",
                env!("CARGO_PKG_VERSION"),
            ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let service = FixtureServer::new().serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
