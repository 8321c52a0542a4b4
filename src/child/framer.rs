//! Line-delimited JSON framing over a child's stdio.
//!
//! One writer task owns stdin, one reader task owns stdout, one tap owns
//! stderr. The framer is generic over the IO handles so tests can drive it
//! with in-memory duplex pipes instead of a real process.

use crate::logs::{LogRing, Stream};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded queue capacity between the framer and the correlator, each way.
pub const QUEUE_CAPACITY: usize = 1024;

/// One outbound JSON message. `id` identifies the waiter to fail if the
/// write misses its deadline; notifications carry `None`.
#[derive(Debug)]
pub struct OutboundFrame {
    pub id: Option<i64>,
    pub payload: Value,
}

/// Messages delivered from the child to the correlator.
#[derive(Debug)]
pub enum Inbound {
    /// A parsed JSON object from stdout.
    Message(Value),
    /// A stdout line that was not valid JSON. The child keeps running.
    Violation(String),
    /// Writing request `id` to stdin missed the deadline.
    WriteTimeout(i64),
    /// Stdout reached EOF.
    Eof,
}

#[derive(Debug, Clone)]
pub struct FramerConfig {
    pub write_deadline: Duration,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            write_deadline: Duration::from_secs(5),
        }
    }
}

/// Handle for pushing frames toward the child.
#[derive(Clone)]
pub struct FramerHandle {
    outbound_tx: mpsc::Sender<OutboundFrame>,
    cancel: CancellationToken,
}

impl FramerHandle {
    /// Enqueue a frame without waiting. A full queue is backpressure and
    /// fails the current write immediately.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<(), crate::Error> {
        self.outbound_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => crate::Error::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                crate::Error::ChildExited("stdin writer stopped".into())
            },
        })
    }

    /// Close stdin (EOF to the child) and stop the writer task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Spawn the three IO tasks for one child. Returns the outbound handle and
/// the inbound channel the correlator dispatches from.
pub fn spawn<W, R, E>(
    stdin: W,
    stdout: R,
    stderr: E,
    ring: Arc<LogRing>,
    config: FramerConfig,
) -> (FramerHandle, mpsc::Receiver<Inbound>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundFrame>(QUEUE_CAPACITY);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(QUEUE_CAPACITY);
    let cancel = CancellationToken::new();

    tokio::spawn(write_loop(
        stdin,
        outbound_rx,
        inbound_tx.clone(),
        cancel.clone(),
        config.write_deadline,
    ));
    tokio::spawn(read_loop(stdout, inbound_tx, ring.clone()));
    tokio::spawn(capture_lines(stderr, ring, Stream::Stderr, None));

    (
        FramerHandle {
            outbound_tx,
            cancel,
        },
        inbound_rx,
    )
}

/// Writer task: serializes frames one per line. Writes are serialized across
/// all concurrent callers because this task is the only stdin owner.
async fn write_loop<W>(
    mut stdin: W,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    inbound_tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    write_deadline: Duration,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let mut line = match serde_json::to_vec(&frame.payload) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to serialize outbound frame: {e}");
                continue;
            },
        };
        line.push(b'\n');

        let write = async {
            stdin.write_all(&line).await?;
            stdin.flush().await
        };
        match tokio::time::timeout(write_deadline, write).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => {
                debug!("child stdin write failed: {e}");
                break;
            },
            Err(_) => {
                if let Some(id) = frame.id {
                    let _ = inbound_tx.send(Inbound::WriteTimeout(id)).await;
                }
                warn!("child stdin write missed {write_deadline:?} deadline");
            },
        }
    }
    // stdin drops here: EOF to the child.
}

/// Stdout reader: one JSON object per line. Blank lines are tolerated for
/// children that flush intermediate whitespace; anything unparsable is a
/// protocol violation surfaced to the correlator, not a child death.
async fn read_loop<R>(stdout: R, inbound_tx: mpsc::Sender<Inbound>, ring: Arc<LogRing>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                ring.push(Stream::Stdout, trimmed.to_string());
                let inbound = match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) if value.is_object() => Inbound::Message(value),
                    _ => Inbound::Violation(truncate(trimmed, 256)),
                };
                if inbound_tx.send(inbound).await.is_err() {
                    break;
                }
            },
            Ok(None) => {
                let _ = inbound_tx.send(Inbound::Eof).await;
                break;
            },
            Err(e) => {
                debug!("child stdout read error: {e}");
                let _ = inbound_tx.send(Inbound::Eof).await;
                break;
            },
        }
    }
}

/// Line tap: every line goes into the ring under the given tag; an optional
/// hook sees each line first (the LLM manager uses it for CUDA OOM
/// detection). Also used standalone for non-MCP children whose stdout is
/// plain log output.
pub async fn capture_lines<S>(
    stream: S,
    ring: Arc<LogRing>,
    tag: Stream,
    hook: Option<Box<dyn Fn(&str) + Send + Sync>>,
) where
    S: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(hook) = &hook {
            hook(trimmed);
        }
        ring.push(tag, trimmed.to_string());
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}
