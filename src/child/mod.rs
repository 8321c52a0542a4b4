//! Child process plumbing: stdio framing and JSON-RPC correlation.

pub mod framer;
pub mod rpc;

use crate::error::{Error, Result};
use crate::logs::{LogRing, Stream};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

pub use framer::{FramerConfig, FramerHandle};
pub use rpc::RpcClient;

/// Fully resolved launch contract for one child: env already merged,
/// command already validated against the allow-list.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

/// A freshly spawned MCP child with its IO tasks running.
pub struct SpawnedChild {
    pub pid: u32,
    pub child: Child,
    pub rpc: Arc<RpcClient>,
    /// Notifications and synthetic errors from the correlator.
    pub observer: mpsc::Receiver<Value>,
}

/// Spawn an MCP child and wire the framer and correlator onto its stdio.
pub fn spawn_mcp(spec: &LaunchSpec, ring: Arc<LogRing>, config: FramerConfig) -> Result<SpawnedChild> {
    let mut child = build_command(spec)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::ChildSpawn(format!("{}: {e}", spec.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::ChildSpawn("child exited before pid was read".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::ChildSpawn("no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::ChildSpawn("no stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::ChildSpawn("no stderr".into()))?;

    let (framer, inbound_rx) = framer::spawn(stdin, stdout, stderr, ring, config);
    let (observer_tx, observer_rx) = mpsc::channel(framer::QUEUE_CAPACITY);
    let rpc = RpcClient::new(framer, inbound_rx, observer_tx);

    debug!("spawned child pid={pid} command={}", spec.command);
    Ok(SpawnedChild {
        pid,
        child,
        rpc,
        observer: observer_rx,
    })
}

/// Spawn a non-MCP child (a process-backed LLM). Both stdio streams are
/// plain log output; the hook sees stderr lines for OOM pattern matching.
pub fn spawn_plain(
    spec: &LaunchSpec,
    ring: Arc<LogRing>,
    stderr_hook: Option<Box<dyn Fn(&str) + Send + Sync>>,
) -> Result<(u32, Child)> {
    let mut child = build_command(spec)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::ChildSpawn(format!("{}: {e}", spec.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::ChildSpawn("child exited before pid was read".into()))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(framer::capture_lines(
            stdout,
            ring.clone(),
            Stream::Stdout,
            None,
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(framer::capture_lines(
            stderr,
            ring,
            Stream::Stderr,
            stderr_hook,
        ));
    }

    Ok((pid, child))
}

fn build_command(spec: &LaunchSpec) -> Command {
    let mut command = Command::new(&spec.command);
    command.args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    command
}

/// Send a unix signal to a child by pid. No-op when the process is gone.
#[cfg(unix)]
pub fn signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!("signal {signal} to pid {pid} failed: {e}");
    }
}

#[cfg(not(unix))]
pub fn signal(_pid: u32, _signal: i32) {}
