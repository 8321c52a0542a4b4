//! Common test utilities for integration tests.

#![allow(dead_code)]

use fluidmcp::{Gateway, GatewayConfig};
use serde_json::{json, Value};

pub struct TestGateway {
    pub base: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Bind an ephemeral port, fix the config's public base URL to it, and
/// serve the gateway router in-process.
pub async fn start_gateway(mut config: GatewayConfig) -> TestGateway {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");

    config.host = "127.0.0.1".to_string();
    config.port = addr.port();
    if config.public_base_url.is_none() {
        config.public_base_url = Some(format!("http://{addr}"));
    }

    let gateway = Gateway::new(config).await.expect("gateway init");
    let router = gateway.router();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    TestGateway {
        base: format!("http://{addr}"),
        handle,
    }
}

pub async fn start_default_gateway() -> TestGateway {
    start_gateway(GatewayConfig::default()).await
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client")
}

/// Minimal create-server request body.
pub fn server_body(id: &str, command: &str, args: Vec<&str>) -> Value {
    json!({
        "id": id,
        "name": format!("{id} test server"),
        "command": command,
        "args": args,
    })
}

/// An inline MCP server speaking newline-delimited JSON-RPC over stdio.
/// Handles initialize, tools/list, and tools/call (echo); anything else
/// gets a method-not-found error back.
pub const ECHO_SERVER_PY: &str = r#"
import sys, json, os

print("LOG_LEVEL=" + os.environ.get("LOG_LEVEL", "unset"), file=sys.stderr, flush=True)

for line in sys.stdin:
    line = line.strip()
    if not line:
        continue
    try:
        req = json.loads(line)
    except ValueError:
        continue
    rid = req.get("id")
    method = req.get("method")
    if rid is None:
        continue
    if method == "initialize":
        result = {
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "echo", "version": "0.1.0"},
        }
    elif method == "tools/list":
        result = {
            "tools": [
                {
                    "name": "echo",
                    "description": "Echo the arguments back as text",
                    "inputSchema": {
                        "type": "object",
                        "properties": {"text": {"type": "string"}},
                    },
                }
            ]
        }
    elif method == "tools/call":
        args = req.get("params", {}).get("arguments", {})
        result = {"content": [{"type": "text", "text": json.dumps(args, sort_keys=True)}]}
    else:
        error = {"code": -32601, "message": "method not found: " + str(method)}
        print(json.dumps({"jsonrpc": "2.0", "id": rid, "error": error}), flush=True)
        continue
    print(json.dumps({"jsonrpc": "2.0", "id": rid, "result": result}), flush=True)
"#;

/// Create-server body wrapping the python echo server.
pub fn echo_server_body(id: &str) -> Value {
    json!({
        "id": id,
        "name": format!("{id} echo server"),
        "command": "python3",
        "args": ["-c", ECHO_SERVER_PY],
    })
}
