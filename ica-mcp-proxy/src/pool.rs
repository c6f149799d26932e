//! Per-server session pooling with single-flight startup and idle eviction.
//!
//! Each configured server gets one slot holding at most one live
//! [`UpstreamSession`]. Callers acquiring a slot that is still starting
//! coalesce onto the same startup attempt; a failed session is replaced on
//! the next acquisition; idle sessions are reaped in the background. Slot
//! transitions happen under a per-server mutex that is never held across
//! I/O — session startup runs after publishing a Starting marker and
//! releasing the lock.

use crate::error::{ProxyError, Result};
use crate::session::{ToolDescriptor, UpstreamSession};
use ica_mcp_config::{truthy, ServerSpec};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Whether stdio upstreams are pooled at all (default on).
pub const ENV_POOL_STDIO: &str = "ICA_MCP_PROXY_POOL_STDIO";
/// Hard override forcing every call onto a fresh session.
pub const ENV_DISABLE_POOLING: &str = "ICA_MCP_PROXY_DISABLE_POOLING";
/// Idle eviction threshold, seconds.
pub const ENV_IDLE_TTL: &str = "ICA_MCP_PROXY_UPSTREAM_IDLE_TTL_S";
/// Default per-call timeout, seconds.
pub const ENV_REQUEST_TIMEOUT: &str = "ICA_MCP_PROXY_UPSTREAM_REQUEST_TIMEOUT_S";

const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn env_flag_or(name: &str, default: bool) -> bool {
    std::env::var(name).map(|value| truthy(&value)).unwrap_or(default)
}

fn env_secs_or(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Pool-wide knobs, captured from the environment at startup.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_stdio: bool,
    pub disable_pooling: bool,
    pub idle_ttl: Duration,
    pub default_timeout: Duration,
    pub init_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_stdio: true,
            disable_pooling: false,
            idle_ttl: DEFAULT_IDLE_TTL,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self {
            pool_stdio: env_flag_or(ENV_POOL_STDIO, true),
            disable_pooling: env_flag_or(ENV_DISABLE_POOLING, false),
            idle_ttl: env_secs_or(ENV_IDLE_TTL, DEFAULT_IDLE_TTL),
            default_timeout: env_secs_or(ENV_REQUEST_TIMEOUT, DEFAULT_REQUEST_TIMEOUT),
            ..Self::default()
        }
    }
}

enum SlotState {
    Idle,
    /// A start is in progress; late arrivals wait on the channel and then
    /// re-examine the slot (the mutex queue keeps the release order FIFO).
    Starting { done: watch::Receiver<bool> },
    Ready {
        session: Arc<UpstreamSession>,
        last_used: Instant,
        generation: u64,
    },
    Failed { cause: String },
}

struct ServerSlot {
    state: tokio::sync::Mutex<SlotState>,
    /// Calls currently using this slot's session. Mutated only while the
    /// state mutex is held, so the reaper's check cannot race an acquire.
    in_flight: AtomicUsize,
    generation: AtomicU64,
}

impl ServerSlot {
    fn new() -> Self {
        Self {
            state: tokio::sync::Mutex::new(SlotState::Idle),
            in_flight: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }
}

/// A lease on one pooled session for the duration of a single call.
struct Lease {
    session: Arc<UpstreamSession>,
    generation: u64,
    slot: Arc<ServerSlot>,
}

/// Brokers every upstream call onto at most one live session per server.
pub struct SessionPool {
    config: PoolConfig,
    specs: std::sync::RwLock<BTreeMap<String, ServerSpec>>,
    slots: std::sync::Mutex<HashMap<String, Arc<ServerSlot>>>,
    reaper: CancellationToken,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            specs: std::sync::RwLock::new(BTreeMap::new()),
            slots: std::sync::Mutex::new(HashMap::new()),
            reaper: CancellationToken::new(),
        });
        pool.spawn_reaper();
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Replace the server set. Slots for removed or redefined servers are
    /// shut down; an unchanged spec keeps its live session.
    pub fn update_specs(&self, specs: BTreeMap<String, ServerSpec>) {
        let old = {
            let mut current = self.specs.write().expect("specs lock");
            std::mem::replace(&mut *current, specs.clone())
        };
        let stale: Vec<String> = old
            .iter()
            .filter(|(name, spec)| specs.get(name.as_str()) != Some(spec))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.evict(name);
        }
    }

    fn spec_for(&self, server: &str) -> Result<ServerSpec> {
        self.specs
            .read()
            .expect("specs lock")
            .get(server)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownServer {
                name: server.to_string(),
            })
    }

    fn slot_for(&self, server: &str) -> Arc<ServerSlot> {
        let mut slots = self.slots.lock().expect("slots lock");
        Arc::clone(
            slots
                .entry(server.to_string())
                .or_insert_with(|| Arc::new(ServerSlot::new())),
        )
    }

    fn pooled(&self, spec: &ServerSpec) -> bool {
        if self.config.disable_pooling {
            return false;
        }
        if spec.is_stdio() && !self.config.pool_stdio {
            return false;
        }
        true
    }

    fn init_timeout(&self, spec: &ServerSpec) -> Duration {
        spec.init_timeout_s
            .map(Duration::from_secs)
            .unwrap_or(self.config.init_timeout)
    }

    fn idle_ttl(&self, spec: &ServerSpec) -> Duration {
        spec.idle_ttl_s
            .map(Duration::from_secs)
            .unwrap_or(self.config.idle_ttl)
    }

    /// Effective deadline for one call: the tightest of the caller's
    /// deadline, the server spec's, and the pool default.
    fn effective_timeout(&self, spec: &ServerSpec, caller: Option<Duration>) -> Duration {
        let mut timeout = self.config.default_timeout;
        if let Some(server_timeout) = spec.timeout_s.map(Duration::from_secs) {
            timeout = timeout.min(server_timeout);
        }
        if let Some(caller) = caller {
            timeout = timeout.min(caller);
        }
        timeout
    }

    /// Get a usable session for `server`, starting one if needed.
    async fn acquire(&self, server: &str, spec: &ServerSpec) -> Result<Lease> {
        // Decide under the lock, then act, so the state borrow stays simple.
        enum Next {
            Lease(Arc<UpstreamSession>, u64),
            MarkFailed(String),
            Wait(watch::Receiver<bool>),
            Unavailable(String),
            Start,
        }

        let slot = self.slot_for(server);
        let mut waited = false;

        loop {
            let mut state = slot.state.lock().await;

            let next = match &*state {
                SlotState::Ready {
                    session,
                    generation,
                    ..
                } => {
                    if session.is_healthy().await {
                        Next::Lease(Arc::clone(session), *generation)
                    } else {
                        Next::MarkFailed(
                            session
                                .failure_reason()
                                .await
                                .unwrap_or_else(|| "session unhealthy".to_string()),
                        )
                    }
                }
                SlotState::Starting { done } => Next::Wait(done.clone()),
                // We waited on someone else's start and it failed; do not
                // pile a retry storm onto a broken upstream.
                SlotState::Failed { cause } if waited => Next::Unavailable(cause.clone()),
                SlotState::Idle | SlotState::Failed { .. } => Next::Start,
            };

            match next {
                Next::Lease(session, generation) => {
                    slot.in_flight.fetch_add(1, Ordering::SeqCst);
                    drop(state);
                    return Ok(Lease {
                        session,
                        generation,
                        slot: Arc::clone(&slot),
                    });
                }
                Next::MarkFailed(cause) => {
                    *state = SlotState::Failed { cause };
                }
                Next::Wait(mut done) => {
                    drop(state);
                    // Either outcome (value change or sender drop) means the
                    // start resolved; re-examine the slot.
                    let _ = done.changed().await;
                    waited = true;
                }
                Next::Unavailable(cause) => {
                    drop(state);
                    return Err(ProxyError::UpstreamUnavailable {
                        server: server.to_string(),
                        cause,
                    });
                }
                Next::Start => {
                    let (done_tx, done_rx) = watch::channel(false);
                    *state = SlotState::Starting { done: done_rx };
                    let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    drop(state);

                    let started = UpstreamSession::start(spec, self.init_timeout(spec)).await;

                    let mut state = slot.state.lock().await;
                    match started {
                        Ok(session) => {
                            let session = Arc::new(session);
                            *state = SlotState::Ready {
                                session: Arc::clone(&session),
                                last_used: Instant::now(),
                                generation,
                            };
                            slot.in_flight.fetch_add(1, Ordering::SeqCst);
                            drop(state);
                            let _ = done_tx.send(true);
                            return Ok(Lease {
                                session,
                                generation,
                                slot: Arc::clone(&slot),
                            });
                        }
                        Err(e) => {
                            *state = SlotState::Failed {
                                cause: e.to_string(),
                            };
                            drop(state);
                            let _ = done_tx.send(true);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Close out a lease, updating slot bookkeeping from the call outcome.
    async fn release<T>(&self, lease: Lease, outcome: &Result<T>) {
        let session_failed = matches!(outcome, Err(ProxyError::SessionFailed { .. }));

        let mut state = lease.slot.state.lock().await;
        lease.slot.in_flight.fetch_sub(1, Ordering::SeqCst);

        let lease_is_current = matches!(
            &*state,
            SlotState::Ready { generation, .. } if *generation == lease.generation
        );
        if lease_is_current {
            if session_failed {
                let cause = lease
                    .session
                    .failure_reason()
                    .await
                    .unwrap_or_else(|| "session failed mid-call".to_string());
                *state = SlotState::Failed { cause };
            } else if let SlotState::Ready { last_used, .. } = &mut *state {
                *last_used = Instant::now();
            }
        }
        drop(state);

        if session_failed {
            let session = lease.session;
            let grace = self.config.shutdown_grace;
            tokio::spawn(async move { session.shutdown(grace).await });
        }
    }

    /// Invoke a tool on an upstream as if it were always available.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        caller_timeout: Option<Duration>,
    ) -> Result<Value> {
        let spec = self.spec_for(server)?;
        let timeout = self.effective_timeout(&spec, caller_timeout);

        if !self.pooled(&spec) {
            let session = UpstreamSession::start(&spec, self.init_timeout(&spec)).await?;
            let result = session.call_tool(tool, args, timeout).await;
            session.shutdown(self.config.shutdown_grace).await;
            return result;
        }

        let lease = self.acquire(server, &spec).await?;
        let result = lease.session.call_tool(tool, args, timeout).await;
        self.release(lease, &result).await;
        result
    }

    /// List an upstream's tools through its pooled session.
    pub async fn list_tools(&self, server: &str) -> Result<Vec<ToolDescriptor>> {
        let spec = self.spec_for(server)?;
        let timeout = self.effective_timeout(&spec, None);

        if !self.pooled(&spec) {
            let session = UpstreamSession::start(&spec, self.init_timeout(&spec)).await?;
            let result = session.list_tools(timeout).await;
            session.shutdown(self.config.shutdown_grace).await;
            return result;
        }

        let lease = self.acquire(server, &spec).await?;
        let result = lease.session.list_tools(timeout).await;
        self.release(lease, &result).await;
        result
    }

    /// Drop a server's cached tool snapshot ahead of a refresh.
    pub async fn invalidate(&self, server: &str) {
        let slot = {
            let slots = self.slots.lock().expect("slots lock");
            slots.get(server).cloned()
        };
        if let Some(slot) = slot {
            let session = {
                let state = slot.state.lock().await;
                match &*state {
                    SlotState::Ready { session, .. } => Some(Arc::clone(session)),
                    _ => None,
                }
            };
            if let Some(session) = session {
                session.invalidate().await;
            }
        }
    }

    /// Servers that currently hold a Ready session.
    pub async fn ready_servers(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<ServerSlot>)> = {
            let slots = self.slots.lock().expect("slots lock");
            slots
                .iter()
                .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
                .collect()
        };
        let mut ready = Vec::new();
        for (name, slot) in slots {
            let state = slot.state.lock().await;
            if matches!(&*state, SlotState::Ready { .. }) {
                ready.push(name);
            }
        }
        ready.sort();
        ready
    }

    /// Tear down one server's slot in the background.
    fn evict(&self, server: String) {
        let slot = {
            let mut slots = self.slots.lock().expect("slots lock");
            slots.remove(&server)
        };
        if let Some(slot) = slot {
            let grace = self.config.shutdown_grace;
            tokio::spawn(async move {
                let session = {
                    let mut state = slot.state.lock().await;
                    match std::mem::replace(&mut *state, SlotState::Idle) {
                        SlotState::Ready { session, .. } => Some(session),
                        other => {
                            *state = other;
                            None
                        }
                    }
                };
                if let Some(session) = session {
                    session.shutdown(grace).await;
                }
            });
        }
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let cancel = self.reaper.clone();
        let period = (self.config.idle_ttl / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(period) => {}
                }
                let Some(pool) = pool.upgrade() else { return };
                pool.reap_idle().await;
            }
        });
    }

    /// Evict Ready sessions that sat unused past their idle TTL.
    ///
    /// The in-flight check happens under the slot's state mutex, so an
    /// in-flight call can never be interrupted by eviction.
    async fn reap_idle(&self) {
        let slots: Vec<(String, Arc<ServerSlot>)> = {
            let slots = self.slots.lock().expect("slots lock");
            slots
                .iter()
                .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
                .collect()
        };

        for (name, slot) in slots {
            let Ok(spec) = self.spec_for(&name) else { continue };
            let ttl = self.idle_ttl(&spec);

            let expired = {
                let mut state = slot.state.lock().await;
                let idle_expired = matches!(
                    &*state,
                    SlotState::Ready { last_used, .. }
                        if slot.in_flight.load(Ordering::SeqCst) == 0
                            && last_used.elapsed() >= ttl
                );
                if idle_expired {
                    match std::mem::replace(&mut *state, SlotState::Idle) {
                        SlotState::Ready { session, .. } => Some(session),
                        _ => None,
                    }
                } else {
                    None
                }
            };

            if let Some(session) = expired {
                tracing::info!(server = %name, "evicting idle upstream session");
                session.shutdown(self.config.shutdown_grace).await;
            }
        }
    }

    /// Shut every session down and stop the reaper.
    pub async fn shutdown_all(&self) {
        self.reaper.cancel();
        let slots: Vec<Arc<ServerSlot>> = {
            let mut slots = self.slots.lock().expect("slots lock");
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let session = {
                let mut state = slot.state.lock().await;
                match std::mem::replace(&mut *state, SlotState::Idle) {
                    SlotState::Ready { session, .. } => Some(session),
                    _ => None,
                }
            };
            if let Some(session) = session {
                session.shutdown(self.config.shutdown_grace).await;
            }
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.reaper.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert!(config.pool_stdio);
        assert!(!config.disable_pooling);
        assert_eq!(config.idle_ttl, DEFAULT_IDLE_TTL);
        assert_eq!(config.default_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        std::env::set_var(ENV_POOL_STDIO, "0");
        std::env::set_var(ENV_DISABLE_POOLING, "yes");
        std::env::set_var(ENV_IDLE_TTL, "120");
        std::env::set_var(ENV_REQUEST_TIMEOUT, "7");

        let config = PoolConfig::from_env();
        assert!(!config.pool_stdio);
        assert!(config.disable_pooling);
        assert_eq!(config.idle_ttl, Duration::from_secs(120));
        assert_eq!(config.default_timeout, Duration::from_secs(7));

        for name in [ENV_POOL_STDIO, ENV_DISABLE_POOLING, ENV_IDLE_TTL, ENV_REQUEST_TIMEOUT] {
            std::env::remove_var(name);
        }

        let config = PoolConfig::from_env();
        assert!(config.pool_stdio, "stdio pooling defaults on");
        assert!(!config.disable_pooling);
    }

    #[test]
    #[serial]
    fn test_garbage_env_values_fall_back_to_defaults() {
        std::env::set_var(ENV_IDLE_TTL, "not-a-number");
        let config = PoolConfig::from_env();
        assert_eq!(config.idle_ttl, DEFAULT_IDLE_TTL);
        std::env::remove_var(ENV_IDLE_TTL);
    }

    #[tokio::test]
    async fn test_effective_timeout_takes_the_minimum() {
        let pool = SessionPool::new(PoolConfig {
            default_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        });
        let spec = ica_mcp_config::ServerSpec {
            name: "s".into(),
            origin: ica_mcp_config::LayerOrigin::Home,
            transport: ica_mcp_config::TransportSpec::Stdio {
                command: "true".into(),
                args: vec![],
                env: Default::default(),
                cwd: None,
            },
            timeout_s: Some(10),
            init_timeout_s: None,
            idle_ttl_s: None,
        };
        assert_eq!(pool.effective_timeout(&spec, None), Duration::from_secs(10));
        assert_eq!(
            pool.effective_timeout(&spec, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            pool.effective_timeout(&spec, Some(Duration::from_secs(60))),
            Duration::from_secs(10)
        );
    }

    #[tokio::test]
    async fn test_unknown_server_is_rejected() {
        let pool = SessionPool::new(PoolConfig::default());
        let err = pool
            .call_tool("nope", "echo", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownServer { .. }));
    }
}
