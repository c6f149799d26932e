//! End-to-end dispatch through the proxy surface: mirrored names, the
//! broker route, the trust gate, and refresh semantics.

use ica_mcp_proxy::{PoolConfig, ProxyServer};
use rmcp::model::CallToolResult;
use serde_json::json;
use serial_test::serial;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Restores the touched environment variables on drop so tests stay
/// hermetic even on panic.
struct EnvGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvGuard {
    fn set(updates: &[(&'static str, Option<&str>)]) -> Self {
        let saved = updates
            .iter()
            .map(|(name, value)| {
                let old = std::env::var(name).ok();
                match value {
                    Some(value) => std::env::set_var(name, value),
                    None => std::env::remove_var(name),
                }
                (*name, old)
            })
            .collect();
        Self { saved }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (name, old) in &self.saved {
            match old {
                Some(value) => std::env::set_var(name, value),
                None => std::env::remove_var(name),
            }
        }
    }
}

struct Scopes {
    _root: TempDir,
    project: PathBuf,
    home: PathBuf,
}

fn scopes_with_fixture() -> Scopes {
    let root = TempDir::new().unwrap();
    let project = root.path().join("project");
    let home = root.path().join("ica-home");
    fs::create_dir(&project).unwrap();
    fs::create_dir(&home).unwrap();

    fs::write(
        project.join(".mcp.json"),
        json!({
            "mcpServers": {
                "fixture": {
                    "command": env!("CARGO_BIN_EXE_ica-mcp-fixture"),
                    "args": []
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    Scopes {
        _root: root,
        project,
        home,
    }
}

fn baseline_env(home: &Path) -> EnvGuard {
    EnvGuard::set(&[
        ("ICA_HOME", Some(home.to_str().unwrap())),
        ("ICA_MCP_STRICT_TRUST", None),
        ("ICA_MCP_ALLOW_PROJECT_STDIO", None),
        ("ICA_MCP_CONFIG_PREFER_HOME", None),
        ("MCP_CONFIG", None),
        ("MCP_CONFIG_PATH", None),
    ])
}

async fn started_proxy(project: &Path) -> ProxyServer {
    let server = ProxyServer::new(project.to_path_buf(), PoolConfig::default());
    server.reload().await.unwrap();
    server.discover().await;
    server
}

fn result_text(result: &CallToolResult) -> String {
    result.content[0]
        .as_text()
        .map(|text| text.text.clone())
        .unwrap_or_default()
}

#[tokio::test]
#[serial]
async fn test_mirror_exposes_qualified_fixture_tools() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = started_proxy(&scopes.project).await;

    let names: Vec<String> = proxy
        .mirror_snapshot()
        .await
        .into_iter()
        .map(|entry| entry.qualified_name)
        .collect();
    for expected in ["fixture.add", "fixture.echo", "fixture.pid", "fixture.sleepy_pid"] {
        assert!(names.contains(&expected.to_string()), "missing {}", expected);
    }

    proxy.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_mirrored_call_and_broker_call_are_equivalent() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = started_proxy(&scopes.project).await;

    let mirrored = proxy
        .dispatch_call("fixture.echo", json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(result_text(&mirrored), "hi");

    let brokered = proxy
        .dispatch_call(
            "proxy.call",
            json!({"server": "fixture", "tool": "add", "args": {"a": 2, "b": 3}}),
        )
        .await
        .unwrap();
    assert!(result_text(&brokered).contains('5'));

    // Stdio pooling keeps one upstream process across repeated calls.
    let first = proxy.dispatch_call("fixture.pid", json!({})).await.unwrap();
    let second = proxy.dispatch_call("fixture.pid", json!({})).await.unwrap();
    assert_eq!(result_text(&first), result_text(&second));

    proxy.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
async fn test_mixed_burst_shares_one_upstream_process() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = Arc::new(started_proxy(&scopes.project).await);

    let mut handles = Vec::new();
    for i in 0..40 {
        let proxy = Arc::clone(&proxy);
        handles.push(tokio::spawn(async move {
            let result = if i % 2 == 0 {
                proxy
                    .dispatch_call("fixture.sleepy_pid", json!({"delay_ms": 8}))
                    .await
                    .unwrap()
            } else {
                proxy
                    .dispatch_call(
                        "proxy.call",
                        json!({"server": "fixture", "tool": "sleepy_pid", "args": {"delay_ms": 8}}),
                    )
                    .await
                    .unwrap()
            };
            result_text(&result)
        }));
    }

    let mut pids = Vec::new();
    for handle in handles {
        pids.push(handle.await.unwrap());
    }
    assert_eq!(pids.len(), 40);
    assert!(pids.iter().all(|pid| *pid == pids[0]));

    let follow_up = proxy.dispatch_call("fixture.pid", json!({})).await.unwrap();
    assert_eq!(result_text(&follow_up), pids[0]);

    proxy.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_list_servers_reports_transport_and_readiness() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = started_proxy(&scopes.project).await;

    let result = proxy.dispatch_call("proxy.list_servers", json!({})).await.unwrap();
    let servers: serde_json::Value = serde_json::from_str(&result_text(&result)).unwrap();
    let fixture = servers
        .as_array()
        .unwrap()
        .iter()
        .find(|entry| entry["name"] == "fixture")
        .expect("fixture listed");
    assert_eq!(fixture["transport"], "stdio");
    assert_eq!(fixture["ready"], true);

    proxy.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_trust_gate_blocks_then_seal_unblocks() {
    let scopes = scopes_with_fixture();
    let _env = EnvGuard::set(&[
        ("ICA_HOME", Some(scopes.home.to_str().unwrap())),
        ("ICA_MCP_STRICT_TRUST", Some("1")),
        ("ICA_MCP_ALLOW_PROJECT_STDIO", None),
        ("ICA_MCP_CONFIG_PREFER_HOME", None),
        ("MCP_CONFIG", None),
        ("MCP_CONFIG_PATH", None),
    ]);

    let proxy = ProxyServer::new(scopes.project.clone(), PoolConfig::default());
    proxy.reload().await.unwrap();
    proxy.discover().await;

    // Gated: visible in list_blocked, rejected on call.
    let blocked = proxy.dispatch_call("proxy.list_blocked", json!({})).await.unwrap();
    assert!(result_text(&blocked).contains("untrusted_project_stdio"));
    let err = proxy
        .dispatch_call("fixture.pid", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "trust_required");

    // Seal, reload, and the same call goes through.
    proxy.trust_current_project().unwrap();
    proxy.reload().await.unwrap();
    proxy.discover().await;
    let result = proxy.dispatch_call("fixture.pid", json!({})).await.unwrap();
    assert!(!result_text(&result).is_empty());

    // Editing the project config re-gates on the next reload.
    fs::write(
        scopes.project.join(".mcp.json"),
        json!({
            "mcpServers": {
                "fixture": {
                    "command": env!("CARGO_BIN_EXE_ica-mcp-fixture"),
                    "args": ["--changed"]
                }
            }
        })
        .to_string(),
    )
    .unwrap();
    proxy.reload().await.unwrap();
    let err = proxy
        .dispatch_call("fixture.pid", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "trust_required");

    proxy.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_unknown_tool_and_server_errors() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = started_proxy(&scopes.project).await;

    let err = proxy.dispatch_call("nodots", json!({})).await.unwrap_err();
    assert_eq!(err.kind(), "unknown_tool");

    let err = proxy
        .dispatch_call("ghost.echo", json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_tool");

    let err = proxy
        .dispatch_call("proxy.call", json!({"server": "ghost", "tool": "echo"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_server");

    let err = proxy
        .dispatch_call("proxy.call", json!({"tool": "echo"}))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "invalid_params");

    proxy.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_repeated_refresh_is_idempotent() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = started_proxy(&scopes.project).await;

    let before: Vec<String> = proxy
        .mirror_snapshot()
        .await
        .into_iter()
        .map(|entry| entry.qualified_name)
        .collect();

    proxy
        .dispatch_call("proxy.refresh", json!({"server": "fixture"}))
        .await
        .unwrap();
    proxy.dispatch_call("proxy.refresh", json!({})).await.unwrap();

    let after: Vec<String> = proxy
        .mirror_snapshot()
        .await
        .into_iter()
        .map(|entry| entry.qualified_name)
        .collect();
    assert_eq!(before, after);

    proxy.shutdown().await;
}

#[tokio::test]
#[serial]
async fn test_upstream_tool_error_is_tagged() {
    let scopes = scopes_with_fixture();
    let _env = baseline_env(&scopes.home);
    let proxy = started_proxy(&scopes.project).await;

    // Missing required argument makes the fixture reject the call.
    let outcome = proxy.dispatch_call("fixture.echo", json!({})).await;
    match outcome {
        Err(e) => assert_eq!(e.kind(), "upstream_error"),
        Ok(result) => assert_eq!(result.is_error, Some(true)),
    }

    proxy.shutdown().await;
}
