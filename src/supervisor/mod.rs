//! Child process supervision: lifecycle state machine, restart policy,
//! and the MCP readiness handshake.
//!
//! Exactly one instance exists per server id. The slot mutex serializes
//! transitions, so concurrent starts collapse onto one child and concurrent
//! stops collapse onto one termination.

use crate::child::{self, FramerConfig, LaunchSpec, RpcClient};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::logs::{LogRecord, LogRing};
use crate::registry::{validation, Registry, ServerConfig};
use crate::tools::ToolCache;
use crate::types::{RpcReply, ToolDescriptor};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Failed,
    Restarting,
    Terminating,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub state: ServerState,
    pub ready: bool,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub restart_count: u32,
    pub last_exit: Option<ExitInfo>,
    pub env_overlay: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub server_id: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
pub enum EventKind {
    StateChanged(ServerState),
    ReadyForRpc,
    Exited(ExitInfo),
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Forced,
    /// Kill after a failed handshake; final state is `Failed`, not `Stopped`.
    HandshakeFailed,
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub stop_grace: Duration,
    pub startup_timeout: Duration,
    pub write_deadline: Duration,
    /// Continuous running time after which the restart budget resets.
    pub stable_window: Duration,
    pub max_restarts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub ring_lines: usize,
    pub ring_bytes: usize,
}

impl SupervisorSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            stop_grace: config.stop_grace(),
            startup_timeout: config.startup_timeout(),
            write_deadline: config.child_write_deadline(),
            stable_window: Duration::from_secs(60),
            max_restarts: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            ring_lines: config.log_ring_lines,
            ring_bytes: config.log_ring_bytes,
        }
    }
}

/// Exponential backoff with +-25% jitter: 500ms, 1s, 2s, ... capped at 30s.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exp).min(cap);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(raw.as_secs_f64() * jitter).min(cap)
}

struct Running {
    pid: u32,
    rpc: Arc<RpcClient>,
    ready: bool,
    stop_tx: mpsc::Sender<StopMode>,
    exited_rx: watch::Receiver<bool>,
}

struct Instance {
    state: ServerState,
    running: Option<Running>,
    env_overlay: HashMap<String, String>,
    restart_count: u32,
    last_exit: Option<ExitInfo>,
    started_at: Option<(Instant, DateTime<Utc>)>,
    /// Bumped on every spawn so a stale monitor cannot clobber a newer child.
    epoch: u64,
}

struct Slot {
    id: String,
    ring: Arc<LogRing>,
    inner: Mutex<Instance>,
}

pub struct Supervisor {
    registry: Arc<Registry>,
    tools: Arc<ToolCache>,
    slots: DashMap<String, Arc<Slot>>,
    events: broadcast::Sender<ServerEvent>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        tools: Arc<ToolCache>,
        settings: SupervisorSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            registry,
            tools,
            slots: DashMap::new(),
            events,
            settings,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        self.slots
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    id: id.to_string(),
                    ring: Arc::new(LogRing::new(
                        self.settings.ring_lines,
                        self.settings.ring_bytes,
                    )),
                    inner: Mutex::new(Instance {
                        state: ServerState::Stopped,
                        running: None,
                        env_overlay: HashMap::new(),
                        restart_count: 0,
                        last_exit: None,
                        started_at: None,
                        epoch: 0,
                    }),
                })
            })
            .clone()
    }

    fn emit(&self, server_id: &str, kind: EventKind) {
        let _ = self.events.send(ServerEvent {
            server_id: server_id.to_string(),
            kind,
        });
    }

    /// Start a server and complete the MCP handshake before returning.
    ///
    /// Idempotent: a start on a running server returns its pid. The slot
    /// lock is held across spawn and handshake, so a concurrent start waits
    /// and then observes the same child.
    pub fn start<'a>(
        self: &'a Arc<Self>,
        id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32>> + Send + 'a>> {
        Box::pin(async move {
        let config = self.registry.get(id)?;
        validation::validate_command(&config.command)?;

        let slot = self.slot(id);
        let mut inner = slot.inner.lock().await;

        match inner.state {
            ServerState::Running | ServerState::Starting => {
                if let Some(running) = &inner.running {
                    return Ok(running.pid);
                }
            },
            ServerState::Terminating => {
                return Err(Error::AlreadyRunning(format!("{id} is stopping")));
            },
            ServerState::Stopped | ServerState::Failed | ServerState::Restarting => {},
        }

        inner.state = ServerState::Starting;
        self.emit(id, EventKind::StateChanged(ServerState::Starting));

        let spec = LaunchSpec {
            command: config.command.clone(),
            args: config.args.clone(),
            env: merged_env(&config, &inner.env_overlay),
            cwd: config.cwd.clone(),
        };

        let spawned = match child::spawn_mcp(
            &spec,
            slot.ring.clone(),
            FramerConfig {
                write_deadline: self.settings.write_deadline,
            },
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                inner.state = ServerState::Failed;
                inner.last_exit = Some(ExitInfo {
                    code: None,
                    signal: None,
                    reason: "child-spawn".into(),
                });
                self.emit(id, EventKind::StateChanged(ServerState::Failed));
                return Err(e);
            },
        };

        let pid = spawned.pid;
        let rpc = spawned.rpc.clone();
        let (stop_tx, stop_rx) = mpsc::channel(4);
        let (exited_tx, exited_rx) = watch::channel(false);

        inner.epoch += 1;
        let epoch = inner.epoch;
        inner.state = ServerState::Running;
        inner.started_at = Some((Instant::now(), Utc::now()));
        inner.running = Some(Running {
            pid,
            rpc: rpc.clone(),
            ready: false,
            stop_tx,
            exited_rx,
        });
        self.emit(id, EventKind::StateChanged(ServerState::Running));
        info!("started server {id} (pid {pid})");

        tokio::spawn(drain_observer(spawned.observer, id.to_string()));
        tokio::spawn(monitor(
            self.clone(),
            slot.clone(),
            spawned.child,
            rpc.clone(),
            stop_rx,
            exited_tx,
            epoch,
        ));

        // Readiness: initialize then tools/list. Failure of either kills the
        // child and leaves the slot in `failed` with reason mcp-handshake.
        match self.handshake(id, &rpc).await {
            Ok(tools) => {
                if let Some(running) = inner.running.as_mut() {
                    running.ready = true;
                }
                self.tools.refresh(id, tools.clone());
                if let Err(e) = self.registry.set_tools(id, tools).await {
                    warn!("failed to persist tools hint for {id}: {e}");
                }
                self.emit(id, EventKind::ReadyForRpc);
                Ok(pid)
            },
            Err(e) => {
                warn!("handshake with {id} failed: {e}");
                if let Some(running) = &inner.running {
                    let _ = running.stop_tx.try_send(StopMode::HandshakeFailed);
                }
                // The monitor finalizes into Failed once the child is gone.
                drop(inner);
                Err(match e {
                    Error::McpHandshake(_) => e,
                    other => Error::McpHandshake(other.to_string()),
                })
            },
        }
        })
    }

    async fn handshake(&self, id: &str, rpc: &Arc<RpcClient>) -> Result<Vec<ToolDescriptor>> {
        let deadline = self.settings.startup_timeout;
        let init_params = json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"roots": {"listChanged": true}, "sampling": {}},
            "clientInfo": {"name": "fluidmcp", "version": env!("CARGO_PKG_VERSION")},
        });

        match rpc.call("initialize", Some(init_params), deadline).await? {
            RpcReply::Result(_) => {},
            RpcReply::Error(e) => {
                return Err(Error::McpHandshake(format!("initialize: {}", e.message)));
            },
        }
        rpc.notify("notifications/initialized", None)?;

        let reply = rpc.call("tools/list", Some(json!({})), deadline).await?;
        let result = match reply {
            RpcReply::Result(result) => result,
            RpcReply::Error(e) => {
                return Err(Error::McpHandshake(format!("tools/list: {}", e.message)));
            },
        };
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| Error::McpHandshake("tools/list result missing tools".into()))?;
        let tools: Vec<ToolDescriptor> = serde_json::from_value(tools)
            .map_err(|e| Error::McpHandshake(format!("malformed tool descriptors: {e}")))?;
        debug!("server {id} advertises {} tools", tools.len());
        Ok(tools)
    }

    /// Stop a server. Graceful stop closes stdin, sends SIGTERM, waits out
    /// the grace period, then escalates to SIGKILL; forced stop skips grace.
    pub async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let Some(slot) = self.slots.get(id).map(|s| s.clone()) else {
            return Ok(());
        };

        let mut exited_rx = {
            let mut inner = slot.inner.lock().await;
            match inner.state {
                ServerState::Running | ServerState::Starting => {
                    let running = inner
                        .running
                        .as_ref()
                        .ok_or_else(|| Error::Internal(format!("{id}: running without child")))?;
                    let stop_tx = running.stop_tx.clone();
                    let exited_rx = running.exited_rx.clone();
                    inner.state = ServerState::Terminating;
                    self.emit(id, EventKind::StateChanged(ServerState::Terminating));
                    let mode = if force {
                        StopMode::Forced
                    } else {
                        StopMode::Graceful
                    };
                    let _ = stop_tx.try_send(mode);
                    exited_rx
                },
                ServerState::Terminating => match &inner.running {
                    Some(running) => running.exited_rx.clone(),
                    None => return Ok(()),
                },
                ServerState::Stopped | ServerState::Failed | ServerState::Restarting => {
                    inner.state = ServerState::Stopped;
                    return Ok(());
                },
            }
        };

        // The monitor enforces grace and escalation; this wait is bounded by
        // grace plus the SIGKILL reap.
        let deadline = self.settings.stop_grace + Duration::from_secs(15);
        let _ = tokio::time::timeout(deadline, async {
            while !*exited_rx.borrow() {
                if exited_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, id: &str) -> Result<u32> {
        self.stop(id, false).await?;
        self.start(id).await
    }

    /// Stop and forget a server's instance. Called when the registry row is
    /// soft-deleted.
    pub async fn remove(&self, id: &str) -> Result<()> {
        self.stop(id, false).await?;
        self.slots.remove(id);
        self.tools.invalidate(id);
        Ok(())
    }

    /// Clone the RPC handle for a ready child.
    pub async fn rpc(&self, id: &str) -> Result<Arc<RpcClient>> {
        let Some(slot) = self.slots.get(id).map(|s| s.clone()) else {
            return Err(Error::NotRunning(id.to_string()));
        };
        let inner = slot.inner.lock().await;
        match (&inner.state, &inner.running) {
            (ServerState::Running, Some(running)) if running.ready => Ok(running.rpc.clone()),
            _ => Err(Error::NotRunning(id.to_string())),
        }
    }

    pub async fn status(&self, id: &str) -> StatusSnapshot {
        let Some(slot) = self.slots.get(id).map(|s| s.clone()) else {
            return StatusSnapshot {
                id: id.to_string(),
                state: ServerState::Stopped,
                ready: false,
                pid: None,
                start_time: None,
                uptime_secs: None,
                restart_count: 0,
                last_exit: None,
                env_overlay: HashMap::new(),
            };
        };
        let inner = slot.inner.lock().await;
        StatusSnapshot {
            id: id.to_string(),
            state: inner.state,
            ready: inner.running.as_ref().map(|r| r.ready).unwrap_or(false),
            pid: inner.running.as_ref().map(|r| r.pid),
            start_time: inner.started_at.map(|(_, at)| at),
            uptime_secs: match inner.state {
                ServerState::Running => {
                    inner.started_at.map(|(instant, _)| instant.elapsed().as_secs())
                },
                _ => None,
            },
            restart_count: inner.restart_count,
            last_exit: inner.last_exit.clone(),
            env_overlay: inner.env_overlay.clone(),
        }
    }

    pub fn logs(&self, id: &str, lines: usize) -> Vec<LogRecord> {
        match self.slots.get(id) {
            Some(slot) => slot.ring.tail(lines),
            None => Vec::new(),
        }
    }

    pub async fn env_overlay(&self, id: &str) -> HashMap<String, String> {
        let Some(slot) = self.slots.get(id).map(|s| s.clone()) else {
            return HashMap::new();
        };
        let inner = slot.inner.lock().await;
        inner.env_overlay.clone()
    }

    /// Replace the env overlay. A running server is restarted so the new
    /// environment takes effect; the pid changes.
    pub async fn set_env_overlay(
        self: &Arc<Self>,
        id: &str,
        overlay: HashMap<String, String>,
    ) -> Result<()> {
        validation::validate_env(&overlay)?;
        let slot = self.slot(id);
        let was_running = {
            let mut inner = slot.inner.lock().await;
            inner.env_overlay = overlay;
            matches!(inner.state, ServerState::Running | ServerState::Starting)
        };
        if was_running {
            self.restart(id).await?;
        }
        Ok(())
    }

    /// Stop every child concurrently; used during gateway shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        let stops = ids.iter().map(|id| self.stop(id, false));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!("failed to stop {id} during shutdown: {e}");
            }
        }
    }
}

/// Overlay wins over config env; both win over the inherited process env,
/// which tokio's `Command` passes through implicitly.
fn merged_env(config: &ServerConfig, overlay: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env = config.env.clone();
    for (key, value) in overlay {
        env.insert(key.clone(), value.clone());
    }
    env
}

async fn drain_observer(mut observer: mpsc::Receiver<Value>, id: String) {
    while let Some(value) = observer.recv().await {
        if value.get("error").is_some() {
            warn!("synthetic error from {id}: {value}");
        } else {
            debug!("notification from {id}: {}", value["method"]);
        }
    }
}

/// Owns the child handle. Reacts to stop requests and natural exits, then
/// finalizes the slot state exactly once.
async fn monitor(
    supervisor: Arc<Supervisor>,
    slot: Arc<Slot>,
    mut child: tokio::process::Child,
    rpc: Arc<RpcClient>,
    mut stop_rx: mpsc::Receiver<StopMode>,
    exited_tx: watch::Sender<bool>,
    epoch: u64,
) {
    let pid = child.id();
    let grace = supervisor.settings.stop_grace;

    let (exit_status, stop_mode) = tokio::select! {
        status = child.wait() => (status.ok(), None),
        mode = stop_rx.recv() => {
            let mode = mode.unwrap_or(StopMode::Forced);
            // Close stdin first (EOF), then signal.
            rpc.close();
            #[cfg(unix)]
            if let Some(pid) = pid {
                match mode {
                    StopMode::Graceful => child::signal(pid, nix::sys::signal::Signal::SIGTERM),
                    StopMode::Forced | StopMode::HandshakeFailed => {
                        child::signal(pid, nix::sys::signal::Signal::SIGKILL)
                    },
                }
            }
            let wait_for = match mode {
                StopMode::Graceful => grace,
                StopMode::Forced | StopMode::HandshakeFailed => Duration::from_secs(5),
            };
            let status = match tokio::time::timeout(wait_for, child.wait()).await {
                Ok(status) => status.ok(),
                Err(_) => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        child::signal(pid, nix::sys::signal::Signal::SIGKILL);
                    }
                    child.wait().await.ok()
                },
            };
            (status, Some(mode))
        },
    };

    // All pending waiters fail with child-exited.
    rpc.close();
    let _ = exited_tx.send(true);

    let exit_info = exit_info_from(exit_status.as_ref(), stop_mode);
    let id = slot.id.clone();

    let mut inner = slot.inner.lock().await;
    if inner.epoch != epoch {
        // A newer child owns the slot; this exit is history.
        return;
    }
    inner.running = None;
    let uptime = inner.started_at.map(|(instant, _)| instant.elapsed());
    inner.last_exit = Some(exit_info.clone());

    let final_state = match stop_mode {
        Some(StopMode::Graceful) | Some(StopMode::Forced) => ServerState::Stopped,
        Some(StopMode::HandshakeFailed) => ServerState::Failed,
        None => {
            let clean = exit_status.map(|s| s.success()).unwrap_or(false);
            if clean {
                ServerState::Stopped
            } else {
                ServerState::Failed
            }
        },
    };
    inner.state = final_state;
    supervisor.emit(&id, EventKind::StateChanged(final_state));
    supervisor.emit(&id, EventKind::Exited(exit_info));

    // Restart policy applies only to abnormal natural exits.
    if final_state == ServerState::Failed && stop_mode.is_none() {
        if uptime.map(|u| u >= supervisor.settings.stable_window).unwrap_or(false) {
            inner.restart_count = 0;
        }
        let auto_restart = supervisor
            .registry
            .get(&id)
            .map(|c| c.auto_restart)
            .unwrap_or(false);
        if auto_restart && inner.restart_count < supervisor.settings.max_restarts {
            inner.restart_count += 1;
            let attempt = inner.restart_count;
            inner.state = ServerState::Restarting;
            supervisor.emit(&id, EventKind::StateChanged(ServerState::Restarting));
            let delay = backoff_delay(
                supervisor.settings.backoff_base,
                supervisor.settings.backoff_cap,
                attempt,
            );
            info!("restarting {id} in {delay:?} (attempt {attempt})");
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // An operator stop during the backoff wins over the restart.
                if supervisor.status(&id).await.state != ServerState::Restarting {
                    return;
                }
                if let Err(e) = Box::pin(supervisor.start(&id)).await {
                    warn!("scheduled restart of {id} failed: {e}");
                }
            });
        }
    }
}

fn exit_info_from(status: Option<&std::process::ExitStatus>, stop_mode: Option<StopMode>) -> ExitInfo {
    let code = status.and_then(|s| s.code());
    #[cfg(unix)]
    let signal = status.and_then(|s| {
        use std::os::unix::process::ExitStatusExt;
        s.signal()
    });
    #[cfg(not(unix))]
    let signal = None;

    let reason = match stop_mode {
        Some(StopMode::Graceful) => "stopped".to_string(),
        Some(StopMode::Forced) => "killed".to_string(),
        Some(StopMode::HandshakeFailed) => "mcp-handshake".to_string(),
        None => match (code, signal) {
            (Some(0), _) => "exited".to_string(),
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("killed by signal {signal}"),
            (None, None) => "exited".to_string(),
        },
    };

    ExitInfo {
        code,
        signal,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(30);
        // Jitter is +-25%, so check bands rather than exact values.
        let first = backoff_delay(base, cap, 1);
        assert!(first >= Duration::from_millis(375) && first <= Duration::from_millis(625));

        let third = backoff_delay(base, cap, 3);
        assert!(third >= Duration::from_millis(1500) && third <= Duration::from_millis(2500));

        let huge = backoff_delay(base, cap, 12);
        assert!(huge <= cap);
    }

    #[test]
    fn overlay_wins_over_config_env() {
        let config = ServerConfig {
            id: "fs".into(),
            name: "fs".into(),
            description: String::new(),
            command: "npx".into(),
            args: vec![],
            env: HashMap::from([
                ("LOG_LEVEL".to_string(), "info".to_string()),
                ("KEEP".to_string(), "yes".to_string()),
            ]),
            cwd: None,
            enabled: true,
            auto_restart: false,
            auth: None,
            tools: None,
            deleted_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let overlay = HashMap::from([("LOG_LEVEL".to_string(), "debug".to_string())]);

        let merged = merged_env(&config, &overlay);
        assert_eq!(merged["LOG_LEVEL"], "debug");
        assert_eq!(merged["KEEP"], "yes");
    }

    #[test]
    fn exit_reason_strings() {
        let info = exit_info_from(None, Some(StopMode::Graceful));
        assert_eq!(info.reason, "stopped");
        let info = exit_info_from(None, Some(StopMode::HandshakeFailed));
        assert_eq!(info.reason, "mcp-handshake");
        let info = exit_info_from(None, None);
        assert_eq!(info.reason, "exited");
    }
}
