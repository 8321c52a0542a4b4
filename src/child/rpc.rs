//! Request/response correlation for one child.
//!
//! Allocates numeric request ids from a per-child monotonic counter, records
//! a waiter per id, and resolves waiters as responses arrive in any order.
//! Notifications never resolve a waiter; they flow to an observer sink, as
//! do the framer's synthetic errors (null or zero id).

use crate::child::framer::{FramerHandle, Inbound, OutboundFrame};
use crate::error::Error;
use crate::types::{RpcError, RpcReply};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Per-child cap on concurrently pending waiters.
pub const MAX_PENDING: usize = 10_000;

type Waiter = oneshot::Sender<Result<RpcReply, Error>>;

pub struct RpcClient {
    framer: FramerHandle,
    pending: Arc<Mutex<HashMap<i64, Waiter>>>,
    /// Monotonic, starting at 1. Zero and null ids are reserved for the
    /// framer's synthetic error channel.
    next_id: AtomicI64,
    closed: Arc<AtomicBool>,
    max_pending: usize,
}

impl RpcClient {
    /// Wire a correlator onto a framer. `observer` receives notifications
    /// and synthetic errors; dropping its receiver just discards them.
    pub fn new(
        framer: FramerHandle,
        inbound_rx: mpsc::Receiver<Inbound>,
        observer: mpsc::Sender<Value>,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            framer,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            closed: Arc::new(AtomicBool::new(false)),
            max_pending: MAX_PENDING,
        });

        tokio::spawn(dispatch_loop(
            inbound_rx,
            client.pending.clone(),
            client.closed.clone(),
            observer,
        ));

        client
    }

    /// Issue one JSON-RPC call and wait for the matching response.
    ///
    /// Returns the child's result or its own error object as `RpcReply`;
    /// gateway-level failures (timeout, backpressure, exit) are `Err`.
    /// Dropping the returned future releases the waiter and retires the id.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Duration,
    ) -> Result<RpcReply, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ChildExited("child is not running".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.len() >= self.max_pending {
                return Err(Error::Backpressure);
            }
            pending.insert(id, tx);
        }

        let mut payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            payload["params"] = params;
        }

        if let Err(e) = self.framer.try_send(OutboundFrame {
            id: Some(id),
            payload,
        }) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        // Releases the id slot if the caller times out or is cancelled; a
        // no-op when the dispatcher already resolved the waiter.
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ChildExited("waiter dropped".into())),
            Err(_) => Err(Error::McpTimeout(deadline.as_millis() as u64)),
        }
    }

    /// Send a notification (no id, no waiter).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), Error> {
        let mut payload = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            payload["params"] = params;
        }
        self.framer.try_send(OutboundFrame { id: None, payload })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close stdin and fail every outstanding waiter with `child-exited`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.framer.shutdown();
        fail_all(&self.pending, "child stopped");
    }

    #[cfg(test)]
    pub(crate) fn with_max_pending(
        framer: FramerHandle,
        inbound_rx: mpsc::Receiver<Inbound>,
        observer: mpsc::Sender<Value>,
        max_pending: usize,
    ) -> Arc<Self> {
        let client = Self::new(framer, inbound_rx, observer);
        // Arc has a single owner at this point.
        let mut inner = Arc::try_unwrap(client).ok().expect("fresh client");
        inner.max_pending = max_pending;
        Arc::new(inner)
    }
}

struct PendingGuard {
    pending: Arc<Mutex<HashMap<i64, Waiter>>>,
    id: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

fn fail_all(pending: &Mutex<HashMap<i64, Waiter>>, reason: &str) {
    let waiters: Vec<_> = pending.lock().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(Error::ChildExited(reason.to_string())));
    }
}

async fn dispatch_loop(
    mut inbound_rx: mpsc::Receiver<Inbound>,
    pending: Arc<Mutex<HashMap<i64, Waiter>>>,
    closed: Arc<AtomicBool>,
    observer: mpsc::Sender<Value>,
) {
    while let Some(inbound) = inbound_rx.recv().await {
        match inbound {
            Inbound::Message(value) => dispatch_message(value, &pending, &observer),
            Inbound::Violation(line) => {
                warn!("child protocol violation: {line}");
                let synthetic = json!({
                    "jsonrpc": "2.0",
                    "id": null,
                    "error": {
                        "code": -32700,
                        "message": "protocol violation on child stdout",
                        "data": line,
                    }
                });
                let _ = observer.try_send(synthetic);
            },
            Inbound::WriteTimeout(id) => {
                if let Some(tx) = pending.lock().remove(&id) {
                    let _ = tx.send(Err(Error::ChildWriteTimeout));
                }
            },
            Inbound::Eof => break,
        }
    }

    closed.store(true, Ordering::Release);
    fail_all(&pending, "child closed stdout");
}

fn dispatch_message(
    value: Value,
    pending: &Mutex<HashMap<i64, Waiter>>,
    observer: &mpsc::Sender<Value>,
) {
    let is_response = value.get("result").is_some() || value.get("error").is_some();
    let id = value.get("id").and_then(Value::as_i64);

    if is_response {
        match id {
            // Ids we never allocate (0, null, non-numeric) route to the
            // synthetic-error channel.
            Some(id) if id >= 1 => {
                let waiter = pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let reply = match value.get("error") {
                            Some(error) => {
                                match serde_json::from_value::<RpcError>(error.clone()) {
                                    Ok(error) => RpcReply::Error(error),
                                    Err(_) => RpcReply::Error(RpcError {
                                        code: -32603,
                                        message: "malformed error object".into(),
                                        data: Some(error.clone()),
                                    }),
                                }
                            },
                            None => RpcReply::Result(
                                value.get("result").cloned().unwrap_or(Value::Null),
                            ),
                        };
                        let _ = tx.send(Ok(reply));
                    },
                    None => {
                        debug!("dropping response with no waiter (late or duplicate): id={id:?}");
                    },
                }
            },
            _ => {
                let _ = observer.try_send(value);
            },
        }
    } else if value.get("method").is_some() {
        // Notification (or server-initiated request): forward, never resolve.
        let _ = observer.try_send(value);
    } else {
        debug!("dropping unrecognized frame from child");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::child::framer::{self, FramerConfig};
    use crate::logs::LogRing;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Wires a correlator to an in-memory peer and returns handles for the
    /// peer side: a reader over "child stdin" and a writer into "child
    /// stdout".
    fn harness() -> (
        Arc<RpcClient>,
        BufReader<tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
        mpsc::Receiver<Value>,
    ) {
        let (stdin_w, stdin_r) = tokio::io::duplex(64 * 1024);
        let (stdout_w, stdout_r) = tokio::io::duplex(64 * 1024);
        let (_stderr_w, stderr_r) = tokio::io::duplex(64);

        let ring = Arc::new(LogRing::new(1000, 1024 * 1024));
        let (handle, inbound_rx) =
            framer::spawn(stdin_w, stdout_r, stderr_r, ring, FramerConfig::default());
        let (observer_tx, observer_rx) = mpsc::channel(64);
        let client = RpcClient::new(handle, inbound_rx, observer_tx);

        (client, BufReader::new(stdin_r), stdout_w, observer_rx)
    }

    async fn read_request(reader: &mut BufReader<tokio::io::DuplexStream>) -> Value {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn ids_are_monotonic_from_one() {
        let (client, mut peer_in, mut peer_out, _obs) = harness();

        let echo = tokio::spawn(async move {
            for _ in 0..3 {
                let req = read_request(&mut peer_in).await;
                let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {"ok": true}});
                peer_out
                    .write_all(format!("{resp}\n").as_bytes())
                    .await
                    .unwrap();
            }
            peer_in
        });

        for _ in 0..3 {
            let reply = client
                .call("ping", None, Duration::from_secs(2))
                .await
                .unwrap();
            assert!(matches!(reply, RpcReply::Result(_)));
        }
        let _ = echo.await;
        assert_eq!(client.next_id.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn out_of_order_responses_resolve_by_id() {
        let (client, mut peer_in, mut peer_out, _obs) = harness();

        let peer = tokio::spawn(async move {
            let first = read_request(&mut peer_in).await;
            let second = read_request(&mut peer_in).await;
            // Answer in reverse arrival order.
            for req in [second, first] {
                let resp = json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": {"echo": req["method"]}
                });
                peer_out
                    .write_all(format!("{resp}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        let (a, b) = tokio::join!(
            client.call("alpha", None, Duration::from_secs(2)),
            client.call("beta", None, Duration::from_secs(2)),
        );
        peer.await.unwrap();

        match a.unwrap() {
            RpcReply::Result(v) => assert_eq!(v["echo"], "alpha"),
            other => panic!("unexpected {other:?}"),
        }
        match b.unwrap() {
            RpcReply::Result(v) => assert_eq!(v["echo"], "beta"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_retires_waiter_and_late_response_is_dropped() {
        let (client, mut peer_in, mut peer_out, _obs) = harness();

        let err = client
            .call("slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "mcp-timeout");
        assert_eq!(client.pending_count(), 0);

        // The late response must be discarded without disturbing anything.
        let req = read_request(&mut peer_in).await;
        let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {}});
        peer_out
            .write_all(format!("{resp}\n").as_bytes())
            .await
            .unwrap();

        // A fresh call still works and gets a fresh id.
        let follow_up = tokio::spawn(async move {
            let req = read_request(&mut peer_in).await;
            assert_eq!(req["id"], 2);
            let resp = json!({"jsonrpc": "2.0", "id": req["id"], "result": {}});
            peer_out
                .write_all(format!("{resp}\n").as_bytes())
                .await
                .unwrap();
        });
        client
            .call("fresh", None, Duration::from_secs(2))
            .await
            .unwrap();
        follow_up.await.unwrap();
    }

    #[tokio::test]
    async fn child_exit_fails_outstanding_waiters() {
        let (client, mut peer_in, peer_out, _obs) = harness();

        let pending_call = {
            let client = client.clone();
            tokio::spawn(async move { client.call("hang", None, Duration::from_secs(5)).await })
        };
        let _ = read_request(&mut peer_in).await;

        drop(peer_out); // stdout EOF

        let err = pending_call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), "child-exited");
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn notifications_reach_observer_not_waiters() {
        let (client, _peer_in, mut peer_out, mut obs) = harness();
        let _ = &client;

        let note = json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {"p": 1}});
        peer_out
            .write_all(format!("{note}\n").as_bytes())
            .await
            .unwrap();

        let seen = obs.recv().await.unwrap();
        assert_eq!(seen["method"], "notifications/progress");
    }

    #[tokio::test]
    async fn child_id_zero_routes_to_synthetic_channel() {
        let (client, _peer_in, mut peer_out, mut obs) = harness();
        let _ = &client;

        let bogus = json!({"jsonrpc": "2.0", "id": 0, "error": {"code": -1, "message": "boom"}});
        peer_out
            .write_all(format!("{bogus}\n").as_bytes())
            .await
            .unwrap();

        let seen = obs.recv().await.unwrap();
        assert_eq!(seen["id"], 0);
    }

    #[tokio::test]
    async fn pending_table_cap_is_backpressure() {
        let (stdin_w, _stdin_r) = tokio::io::duplex(64 * 1024);
        let (_stdout_w, stdout_r) = tokio::io::duplex(64);
        let (_stderr_w, stderr_r) = tokio::io::duplex(64);

        let ring = Arc::new(LogRing::new(100, 1024 * 1024));
        let (handle, inbound_rx) =
            framer::spawn(stdin_w, stdout_r, stderr_r, ring, FramerConfig::default());
        let (observer_tx, _observer_rx) = mpsc::channel(16);
        let client = RpcClient::with_max_pending(handle, inbound_rx, observer_tx, 2);

        let c1 = {
            let client = client.clone();
            tokio::spawn(async move { client.call("a", None, Duration::from_secs(5)).await })
        };
        let c2 = {
            let client = client.clone();
            tokio::spawn(async move { client.call("b", None, Duration::from_secs(5)).await })
        };
        // Give the first two calls time to register waiters.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = client
            .call("c", None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "backpressure");

        c1.abort();
        c2.abort();
    }
}
