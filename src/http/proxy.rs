//! `POST /{server_id}/mcp`: the JSON-RPC proxy.
//!
//! Only `method` and `params` are forwarded; the child's reply is re-wrapped
//! with the client's original envelope id. A child's own JSON-RPC error
//! object passes through verbatim inside a 200 response; HTTP error codes
//! are reserved for gateway-level failures.

use crate::error::Error;
use crate::http::AppState;
use crate::types::{RpcReply, RpcRequest, RpcResponse};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize, Default)]
pub struct ProxyParams {
    /// Per-request timeout override, milliseconds.
    pub timeout_ms: Option<u64>,
    /// Start the server if it is not running, waiting up to the readiness
    /// deadline.
    #[serde(default)]
    pub auto_start: bool,
}

pub async fn handle_mcp(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(params): Query<ProxyParams>,
    body: Bytes,
) -> Result<Json<RpcResponse>, Error> {
    if state.is_shutting_down() {
        return Err(Error::ShuttingDown);
    }
    if !state.routes.load().has_mcp(&server_id) {
        return Err(Error::UnknownServer(server_id));
    }

    let envelope: Value = serde_json::from_slice(&body)
        .map_err(|e| Error::BadInput(format!("body is not JSON: {e}")))?;
    let request: RpcRequest = serde_json::from_value(envelope)
        .map_err(|e| Error::BadInput(format!("not a JSON-RPC envelope: {e}")))?;

    let deadline = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.proxy_timeout());

    let rpc = acquire_rpc(&state, &server_id, params.auto_start).await?;

    // Local gate for tools/call: reject unknown names without a round-trip.
    if request.method == "tools/call" {
        let tool = request
            .params
            .as_ref()
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadInput("tools/call requires params.name".into()))?;
        ensure_known_tool(&state, &server_id, &rpc, tool, deadline).await?;
    }

    let reply = rpc
        .call(&request.method, request.params.clone(), deadline)
        .await?;
    Ok(Json(reply.into_response(request.id)))
}

async fn acquire_rpc(
    state: &AppState,
    server_id: &str,
    auto_start: bool,
) -> Result<Arc<crate::child::RpcClient>, Error> {
    match state.supervisor.rpc(server_id).await {
        Ok(rpc) => Ok(rpc),
        Err(Error::NotRunning(_)) if auto_start => {
            debug!("auto-starting {server_id}");
            tokio::time::timeout(
                state.config.readiness_timeout(),
                state.supervisor.start(server_id),
            )
            .await
            .map_err(|_| Error::NotRunning(format!("{server_id} did not become ready in time")))??;
            state.supervisor.rpc(server_id).await
        },
        Err(e) => Err(e),
    }
}

/// Check the tool cache, repopulating it once after invalidation.
async fn ensure_known_tool(
    state: &AppState,
    server_id: &str,
    rpc: &Arc<crate::child::RpcClient>,
    tool: &str,
    deadline: Duration,
) -> Result<(), Error> {
    if let Some(known) = state.tools.has_tool(server_id, tool) {
        return if known {
            Ok(())
        } else {
            Err(Error::UnknownTool(tool.to_string()))
        };
    }

    // First call after invalidation: refresh from the child, then gate.
    let reply = rpc.call("tools/list", Some(json!({})), deadline).await?;
    if let RpcReply::Result(result) = reply {
        if let Some(tools) = result.get("tools") {
            if let Ok(tools) = serde_json::from_value(tools.clone()) {
                state.tools.refresh(server_id, tools);
            }
        }
    }

    match state.tools.has_tool(server_id, tool) {
        Some(true) => Ok(()),
        Some(false) => Err(Error::UnknownTool(tool.to_string())),
        // The refresh failed; let the child adjudicate the call itself.
        None => Ok(()),
    }
}
