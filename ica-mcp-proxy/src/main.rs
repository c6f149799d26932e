//! `ica-mcp-proxy` binary: serve the proxy over stdio, or trust-seal the
//! current project.

use clap::{Parser, Subcommand};
use ica_mcp_proxy::{PoolConfig, ProxyServer};
use rmcp::ServiceExt;
use std::process::ExitCode;

const EXIT_SUCCESS: u8 = 0;
/// Config parse failure at startup.
const EXIT_CONFIG_ERROR: u8 = 2;
/// Fatal transport error on the downstream stdio session.
const EXIT_TRANSPORT_ERROR: u8 = 3;

#[derive(Parser)]
#[command(name = "ica-mcp-proxy", version, about = "Aggregating MCP proxy over stdio")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server on stdio (the default).
    Serve,
    /// Trust-seal the current project's config for stdio upstreams.
    Trust,
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

    // stdout carries MCP frames; all logging goes to stderr.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rmcp=warn,info"));
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .init();
}

async fn serve() -> u8 {
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            tracing::error!("cannot determine working directory: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    let server = ProxyServer::new(cwd, PoolConfig::from_env());

    // Fail fast on an unusable configuration before accepting a client.
    if let Err(e) = server.reload().await {
        tracing::error!("configuration failed to load: {}", e);
        return EXIT_CONFIG_ERROR;
    }

    let shutdown_handle = server.clone();
    let running = match server.serve(rmcp::transport::stdio()).await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!("failed to start stdio transport: {}", e);
            shutdown_handle.shutdown().await;
            return EXIT_TRANSPORT_ERROR;
        }
    };

    let exit = match running.waiting().await {
        Ok(reason) => {
            tracing::info!(?reason, "downstream session ended");
            EXIT_SUCCESS
        }
        Err(e) => {
            tracing::error!("downstream stdio transport failed: {}", e);
            EXIT_TRANSPORT_ERROR
        }
    };

    shutdown_handle.shutdown().await;
    exit
}

fn trust() -> u8 {
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("cannot determine working directory: {}", e);
            return EXIT_CONFIG_ERROR;
        }
    };

    match ica_mcp_config::trust_project(&cwd) {
        Ok(record) => {
            println!(
                "{}",
                serde_json::json!({
                    "project": cwd.display().to_string(),
                    "config_digest": record.config_digest,
                    "trusted_at": record.trusted_at,
                })
            );
            EXIT_SUCCESS
        }
        Err(e) => {
            eprintln!("trust failed: {}", e);
            EXIT_CONFIG_ERROR
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let code = match cli.command {
        None | Some(Commands::Serve) => serve().await,
        Some(Commands::Trust) => trust(),
    };
    ExitCode::from(code)
}
