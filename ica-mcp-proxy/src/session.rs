//! A single live connection to one upstream MCP server.
//!
//! Stdio upstreams are spawned subprocesses speaking line-delimited JSON-RPC
//! over their stdio; http/sse upstreams are driven through per-request HTTP
//! POSTs. For stdio, one reader task demultiplexes responses back to waiting
//! callers by request id, and writers serialize on a stdin lock so every
//! frame hits the pipe as one whole line.

use crate::error::{ProxyError, Result};
use ica_mcp_config::{ServerSpec, TransportSpec};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

/// How long a cached `tools/list` snapshot stays fresh.
const TOOL_CACHE_REFRESH: Duration = Duration::from_secs(60);

/// MCP protocol revision spoken to upstreams.
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Ready,
    Closing,
    Closed,
    Failed,
}

/// One tool as reported by an upstream's `tools/list`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

struct StateCell {
    state: SessionState,
    failure: Option<String>,
}

/// State shared with the reader task.
struct Shared {
    server: String,
    state: RwLock<StateCell>,
    /// Request id -> waiter for the full response message. The reader
    /// completes these; dropping a sender is how session failure is
    /// broadcast to every pending caller.
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
}

impl Shared {
    async fn fail(&self, cause: &str) {
        {
            let mut cell = self.state.write().await;
            if matches!(cell.state, SessionState::Closed | SessionState::Failed) {
                return;
            }
            cell.state = SessionState::Failed;
            cell.failure = Some(cause.to_string());
        }
        tracing::warn!(server = %self.server, cause = %cause, "upstream session failed");
        // Dropping the senders resolves every pending waiter with failure.
        self.pending.lock().await.clear();
    }
}

enum Transport {
    Stdio {
        child: Mutex<Option<Child>>,
        stdin: Mutex<BufWriter<ChildStdin>>,
        reader: std::sync::Mutex<Option<JoinHandle<()>>>,
        stderr_drain: std::sync::Mutex<Option<JoinHandle<()>>>,
    },
    Remote {
        client: reqwest::Client,
        url: String,
        session_id: RwLock<Option<String>>,
    },
}

struct ToolsSnapshot {
    fetched_at: Instant,
    tools: Vec<ToolDescriptor>,
}

/// A live, multiplexing connection to one upstream server.
pub struct UpstreamSession {
    shared: Arc<Shared>,
    transport: Transport,
    next_id: AtomicU64,
    tools_cache: RwLock<Option<ToolsSnapshot>>,
}

/// Extract the JSON payload from a `text/event-stream` body.
fn sse_data_line(body: &str) -> Option<&str> {
    body.lines().find_map(|line| line.strip_prefix("data: "))
}

fn jsonrpc_request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

impl UpstreamSession {
    /// Launch the transport and run the MCP initialize handshake.
    ///
    /// Returns only once the session is Ready or has Failed; `init_timeout`
    /// bounds the whole handshake.
    pub async fn start(spec: &ServerSpec, init_timeout: Duration) -> Result<Self> {
        let shared = Arc::new(Shared {
            server: spec.name.clone(),
            state: RwLock::new(StateCell {
                state: SessionState::Starting,
                failure: None,
            }),
            pending: Mutex::new(HashMap::new()),
        });

        let transport = match &spec.transport {
            TransportSpec::Stdio {
                command,
                args,
                env,
                cwd,
            } => {
                tracing::info!(server = %spec.name, command = %command, "spawning stdio upstream");
                let mut cmd = Command::new(command);
                cmd.args(args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                for (name, value) in env {
                    cmd.env(name, value);
                }

                let mut child = cmd.spawn().map_err(|e| ProxyError::UpstreamUnavailable {
                    server: spec.name.clone(),
                    cause: format!("failed to spawn '{}': {}", command, e),
                })?;

                let stdin = child.stdin.take().ok_or_else(|| ProxyError::UpstreamUnavailable {
                    server: spec.name.clone(),
                    cause: "child stdin not available".to_string(),
                })?;
                let stdout = child.stdout.take().ok_or_else(|| ProxyError::UpstreamUnavailable {
                    server: spec.name.clone(),
                    cause: "child stdout not available".to_string(),
                })?;
                let stderr = child.stderr.take();

                let reader = tokio::spawn(reader_loop(Arc::clone(&shared), BufReader::new(stdout)));
                let stderr_drain = stderr.map(|stderr| {
                    let server = spec.name.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            tracing::debug!(server = %server, "upstream stderr: {}", line);
                        }
                    })
                });

                Transport::Stdio {
                    child: Mutex::new(Some(child)),
                    stdin: Mutex::new(BufWriter::new(stdin)),
                    reader: std::sync::Mutex::new(Some(reader)),
                    stderr_drain: std::sync::Mutex::new(stderr_drain),
                }
            }
            TransportSpec::Http { url, headers, .. } | TransportSpec::Sse { url, headers, .. } => {
                tracing::info!(server = %spec.name, url = %url, "opening HTTP upstream");
                let mut header_map = reqwest::header::HeaderMap::new();
                for (name, value) in headers {
                    if let (Ok(name), Ok(value)) = (
                        reqwest::header::HeaderName::from_bytes(name.as_bytes()),
                        reqwest::header::HeaderValue::from_str(value),
                    ) {
                        header_map.insert(name, value);
                    } else {
                        tracing::warn!(server = %spec.name, header = %name, "skipping invalid header");
                    }
                }
                let client = reqwest::Client::builder()
                    .default_headers(header_map)
                    .build()
                    .map_err(|e| ProxyError::UpstreamUnavailable {
                        server: spec.name.clone(),
                        cause: format!("failed to build HTTP client: {}", e),
                    })?;
                Transport::Remote {
                    client,
                    url: url.clone(),
                    session_id: RwLock::new(None),
                }
            }
        };

        let session = Self {
            shared,
            transport,
            next_id: AtomicU64::new(1),
            tools_cache: RwLock::new(None),
        };

        session.initialize(init_timeout).await?;
        session.shared.state.write().await.state = SessionState::Ready;
        tracing::info!(server = %session.shared.server, "upstream session ready");
        Ok(session)
    }

    pub fn server_name(&self) -> &str {
        &self.shared.server
    }

    pub async fn state(&self) -> SessionState {
        self.shared.state.read().await.state
    }

    pub async fn is_healthy(&self) -> bool {
        self.state().await == SessionState::Ready
    }

    pub async fn failure_reason(&self) -> Option<String> {
        self.shared.state.read().await.failure.clone()
    }

    async fn initialize(&self, init_timeout: Duration) -> Result<()> {
        let params = json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "ica-mcp-proxy",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let handshake = async {
            let response = self
                .raw_request("initialize", params, init_timeout, "initialize")
                .await?;
            self.unwrap_result(response, "initialize")?;
            self.notify("notifications/initialized").await
        };
        handshake.await.map_err(|e| ProxyError::UpstreamUnavailable {
            server: self.shared.server.clone(),
            cause: format!("initialize failed: {}", e),
        })
    }

    /// Fire a JSON-RPC notification (no id, no response).
    async fn notify(&self, method: &str) -> Result<()> {
        let message = json!({"jsonrpc": "2.0", "method": method});
        match &self.transport {
            Transport::Stdio { stdin, .. } => self.write_line(stdin, &message).await,
            Transport::Remote {
                client,
                url,
                session_id,
            } => {
                let mut request = client
                    .post(url)
                    .header("Accept", "application/json, text/event-stream")
                    .header("Content-Type", "application/json");
                if let Some(session) = session_id.read().await.as_ref() {
                    request = request.header("Mcp-Session-Id", session);
                }
                let response = request.json(&message).send().await.map_err(|e| {
                    ProxyError::SessionFailed {
                        server: self.shared.server.clone(),
                        cause: format!("notification POST failed: {}", e),
                    }
                })?;
                if response.status() != reqwest::StatusCode::ACCEPTED
                    && !response.status().is_success()
                {
                    tracing::warn!(
                        server = %self.shared.server,
                        status = %response.status(),
                        "unexpected status for {} notification",
                        method
                    );
                }
                Ok(())
            }
        }
    }

    async fn write_line(&self, stdin: &Mutex<BufWriter<ChildStdin>>, message: &Value) -> Result<()> {
        let line = format!("{}\n", message);
        let mut writer = stdin.lock().await;
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            let cause = format!("stdin write failed: {}", e);
            self.shared.fail(&cause).await;
            return Err(ProxyError::SessionFailed {
                server: self.shared.server.clone(),
                cause,
            });
        }
        Ok(())
    }

    /// Send one request and await its full response message.
    ///
    /// `label` names the operation in timeout and error payloads (the tool
    /// name for `tools/call`, otherwise the method).
    async fn raw_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
        label: &str,
    ) -> Result<Value> {
        {
            let cell = self.shared.state.read().await;
            if matches!(
                cell.state,
                SessionState::Failed | SessionState::Closing | SessionState::Closed
            ) {
                return Err(ProxyError::SessionFailed {
                    server: self.shared.server.clone(),
                    cause: cell.failure.clone().unwrap_or_else(|| "session not running".into()),
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = jsonrpc_request(id, method, params);

        match &self.transport {
            Transport::Stdio { stdin, .. } => {
                let (tx, rx) = oneshot::channel();
                self.shared.pending.lock().await.insert(id, tx);

                if let Err(e) = self.write_line(stdin, &message).await {
                    self.shared.pending.lock().await.remove(&id);
                    return Err(e);
                }

                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(response)) => Ok(response),
                    // Sender dropped: the reader loop failed the session.
                    Ok(Err(_)) => Err(ProxyError::SessionFailed {
                        server: self.shared.server.clone(),
                        cause: self
                            .failure_reason()
                            .await
                            .unwrap_or_else(|| "session closed".into()),
                    }),
                    Err(_) => {
                        // Abandon the waiter; the reader discards late replies.
                        self.shared.pending.lock().await.remove(&id);
                        Err(ProxyError::Timeout {
                            server: self.shared.server.clone(),
                            tool: label.to_string(),
                            deadline_s: timeout.as_secs(),
                        })
                    }
                }
            }
            Transport::Remote {
                client,
                url,
                session_id,
            } => {
                let mut request = client
                    .post(url)
                    .header("Accept", "application/json, text/event-stream")
                    .header("Content-Type", "application/json");
                if let Some(session) = session_id.read().await.as_ref() {
                    request = request.header("Mcp-Session-Id", session);
                }

                let response = match tokio::time::timeout(timeout, request.json(&message).send()).await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        return Err(ProxyError::SessionFailed {
                            server: self.shared.server.clone(),
                            cause: format!("{} POST failed: {}", method, e),
                        })
                    }
                    Err(_) => {
                        return Err(ProxyError::Timeout {
                            server: self.shared.server.clone(),
                            tool: label.to_string(),
                            deadline_s: timeout.as_secs(),
                        })
                    }
                };

                if !response.status().is_success() {
                    return Err(ProxyError::SessionFailed {
                        server: self.shared.server.clone(),
                        cause: format!("{} returned status {}", method, response.status()),
                    });
                }

                if method == "initialize" {
                    if let Some(value) = response.headers().get("Mcp-Session-Id") {
                        if let Ok(value) = value.to_str() {
                            *session_id.write().await = Some(value.to_string());
                        }
                    }
                }

                let content_type = response
                    .headers()
                    .get("Content-Type")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("application/json")
                    .to_string();
                let body = response.text().await.map_err(|e| ProxyError::SessionFailed {
                    server: self.shared.server.clone(),
                    cause: format!("failed to read {} response body: {}", method, e),
                })?;

                let payload = if content_type.contains("text/event-stream") {
                    sse_data_line(&body).ok_or_else(|| ProxyError::SessionFailed {
                        server: self.shared.server.clone(),
                        cause: format!("no data in SSE response for {}", method),
                    })?
                } else {
                    body.as_str()
                };

                serde_json::from_str(payload).map_err(|e| ProxyError::SessionFailed {
                    server: self.shared.server.clone(),
                    cause: format!("invalid JSON in {} response: {}", method, e),
                })
            }
        }
    }

    /// Pull the `result` out of a response message, mapping JSON-RPC errors.
    fn unwrap_result(&self, response: Value, label: &str) -> Result<Value> {
        if let Some(error) = response.get("error") {
            return Err(ProxyError::UpstreamError {
                server: self.shared.server.clone(),
                tool: label.to_string(),
                payload: error.clone(),
            });
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| ProxyError::UpstreamError {
                server: self.shared.server.clone(),
                tool: label.to_string(),
                payload: json!("response missing result"),
            })
    }

    /// The upstream's tool catalog, served from a bounded-age snapshot.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>> {
        {
            let cache = self.tools_cache.read().await;
            if let Some(snapshot) = cache.as_ref() {
                if snapshot.fetched_at.elapsed() < TOOL_CACHE_REFRESH {
                    return Ok(snapshot.tools.clone());
                }
            }
        }

        let response = self
            .raw_request("tools/list", json!({}), timeout, "tools/list")
            .await?;
        let result = self.unwrap_result(response, "tools/list")?;

        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("name")?.as_str()?.to_string();
                        Some(ToolDescriptor {
                            name,
                            description: item
                                .get("description")
                                .and_then(Value::as_str)
                                .map(str::to_string),
                            input_schema: item
                                .get("inputSchema")
                                .cloned()
                                .unwrap_or_else(|| json!({"type": "object"})),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        *self.tools_cache.write().await = Some(ToolsSnapshot {
            fetched_at: Instant::now(),
            tools: tools.clone(),
        });
        Ok(tools)
    }

    /// Drop the cached tool snapshot so the next `list_tools` refetches.
    pub async fn invalidate(&self) {
        *self.tools_cache.write().await = None;
    }

    /// Invoke one tool, returning the MCP `tools/call` result object.
    pub async fn call_tool(&self, tool: &str, args: Value, timeout: Duration) -> Result<Value> {
        let params = json!({"name": tool, "arguments": args});
        let response = self.raw_request("tools/call", params, timeout, tool).await?;
        let result = self.unwrap_result(response, tool)?;

        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            return Err(ProxyError::UpstreamError {
                server: self.shared.server.clone(),
                tool: tool.to_string(),
                payload: result,
            });
        }
        Ok(result)
    }

    /// Shut the session down, giving in-flight calls `grace` to drain.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut cell = self.shared.state.write().await;
            if matches!(cell.state, SessionState::Closed) {
                return;
            }
            cell.state = SessionState::Closing;
        }

        let deadline = Instant::now() + grace;
        loop {
            if self.shared.pending.lock().await.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        if let Transport::Stdio {
            child,
            reader,
            stderr_drain,
            ..
        } = &self.transport
        {
            if let Some(handle) = reader.lock().expect("reader lock").take() {
                handle.abort();
            }
            if let Some(handle) = stderr_drain.lock().expect("stderr lock").take() {
                handle.abort();
            }
            if let Some(mut child) = child.lock().await.take() {
                if let Err(e) = child.kill().await {
                    tracing::debug!(server = %self.shared.server, "kill after shutdown: {}", e);
                }
            }
        }

        self.shared.pending.lock().await.clear();
        let mut cell = self.shared.state.write().await;
        cell.state = SessionState::Closed;
        tracing::info!(server = %self.shared.server, "upstream session closed");
    }
}

impl Drop for UpstreamSession {
    fn drop(&mut self) {
        // The child itself dies via kill_on_drop; the tasks need an abort.
        if let Transport::Stdio {
            reader,
            stderr_drain,
            ..
        } = &self.transport
        {
            if let Ok(mut guard) = reader.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
            if let Ok(mut guard) = stderr_drain.lock() {
                if let Some(handle) = guard.take() {
                    handle.abort();
                }
            }
        }
    }
}

/// Demultiplex responses from the upstream's stdout.
///
/// Notifications and replies to abandoned requests are discarded. EOF or a
/// parse error fails the whole session: every pending waiter resolves with
/// `SessionFailed` via its dropped sender.
async fn reader_loop(shared: Arc<Shared>, stdout: BufReader<tokio::process::ChildStdout>) {
    let mut lines = stdout.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let message: Value = match serde_json::from_str(line) {
                    Ok(message) => message,
                    Err(e) => {
                        shared.fail(&format!("unparseable frame from upstream: {}", e)).await;
                        return;
                    }
                };
                match message.get("id").and_then(Value::as_u64) {
                    Some(id) => {
                        let waiter = shared.pending.lock().await.remove(&id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(message);
                            }
                            None => {
                                tracing::debug!(
                                    server = %shared.server,
                                    id,
                                    "discarding reply with no waiter"
                                );
                            }
                        }
                    }
                    None => {
                        tracing::debug!(
                            server = %shared.server,
                            method = message.get("method").and_then(|v| v.as_str()).unwrap_or("?"),
                            "ignoring notification from upstream"
                        );
                    }
                }
            }
            Ok(None) => {
                shared.fail("upstream closed its stdout").await;
                return;
            }
            Err(e) => {
                shared.fail(&format!("read from upstream failed: {}", e)).await;
                return;
            }
        }
    }
}
