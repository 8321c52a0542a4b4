//! Admin surface under `/api`: registry CRUD, lifecycle, logs, tools, env
//! overlay edits, and the LLM model registry. Every handler is a thin
//! translator over the owning component; validation happens at this edge.

use crate::error::Error;
use crate::http::AppState;
use crate::llm::{CreateLlmModel, UpdateLlmModel};
use crate::registry::{CreateServer, ListFilter, UpdateServer};
use crate::supervisor::ServerState;
use crate::types::{RpcReply, RpcResponse};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/servers", get(list_servers).post(create_server))
        .route(
            "/servers/:id",
            get(get_server).put(update_server).delete(delete_server),
        )
        .route("/servers/:id/start", post(start_server))
        .route("/servers/:id/stop", post(stop_server))
        .route("/servers/:id/restart", post(restart_server))
        .route("/servers/:id/status", get(server_status))
        .route("/servers/:id/logs", get(server_logs))
        .route("/servers/:id/tools", get(server_tools))
        .route("/servers/:id/tools/refresh", post(refresh_tools))
        .route("/servers/:id/tools/:tool/run", post(run_tool))
        .route(
            "/servers/:id/instance/env",
            get(get_env_overlay).put(put_env_overlay),
        )
        .route("/llm/models", get(list_models).post(create_model))
        .route(
            "/llm/models/:id",
            get(get_model).put(update_model).delete(delete_model),
        )
        .route("/llm/models/:id/start", post(start_model))
        .route("/llm/models/:id/stop", post(stop_model))
        .route("/llm/models/:id/restart", post(restart_model))
        .route("/llm/models/:id/status", get(model_status))
        .route("/llm/models/:id/health", get(model_health))
        .route("/llm/models/:id/logs", get(model_logs))
        .route("/llm/models/:id/invoke", post(invoke_model))
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Error> {
    serde_json::from_slice(body).map_err(|e| Error::BadInput(e.to_string()))
}

// ---- servers ----

#[derive(Debug, Deserialize, Default)]
struct ListParams {
    #[serde(default)]
    enabled_only: bool,
    #[serde(default)]
    include_deleted: bool,
}

async fn list_servers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<Value> {
    let servers = state.registry.list(ListFilter {
        enabled_only: params.enabled_only,
        include_deleted: params.include_deleted,
    });
    Json(json!({ "servers": servers }))
}

async fn create_server(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let request: CreateServer = parse_json(&body)?;
    let config = state.registry.create(request).await?;
    // Mounting is part of the same step: once create returns, the proxy and
    // auth routes resolve.
    state.mount(&config.id, config.auth.is_some());
    Ok(Json(json!({ "server": config })))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let config = state.registry.get(&id)?;
    Ok(Json(json!({ "server": config })))
}

async fn update_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let status = state.supervisor.status(&id).await;
    if !matches!(status.state, ServerState::Stopped | ServerState::Failed) {
        return Err(Error::AlreadyRunning(id));
    }

    let patch: UpdateServer = parse_json(&body)?;
    let config = state.registry.update(&id, patch).await?;
    state.mount(&config.id, config.auth.is_some());
    Ok(Json(json!({ "server": config })))
}

async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    // A running child is stopped before the row is marked deleted.
    state.supervisor.remove(&id).await?;
    let config = state.registry.delete(&id).await?;
    state.unmount(&id);
    Ok(Json(json!({ "server": config })))
}

async fn start_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let pid = state.supervisor.start(&id).await?;
    Ok(Json(json!({ "id": id, "pid": pid, "state": "running" })))
}

#[derive(Debug, Deserialize, Default)]
struct StopParams {
    #[serde(default)]
    force: bool,
}

async fn stop_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    state.supervisor.stop(&id, params.force).await?;
    Ok(Json(json!({ "id": id, "state": "stopped" })))
}

async fn restart_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    let pid = state.supervisor.restart(&id).await?;
    Ok(Json(json!({ "id": id, "pid": pid, "state": "running" })))
}

async fn server_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    let status = state.supervisor.status(&id).await;
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
struct LogParams {
    #[serde(default = "default_log_lines")]
    lines: usize,
}

fn default_log_lines() -> usize {
    100
}

async fn server_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    let records = state.supervisor.logs(&id, params.lines);
    Ok(Json(json!({ "logs": records })))
}

async fn server_tools(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let config = state.registry.get(&id)?;
    // Prefer the live cache; fall back to the persisted discovery hint.
    match state.tools.get(&id) {
        Some(cached) => Ok(Json(
            json!({ "tools": cached.tools, "version": cached.version }),
        )),
        None => Ok(Json(
            json!({ "tools": config.tools.unwrap_or_default(), "version": null }),
        )),
    }
}

async fn refresh_tools(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    let rpc = state.supervisor.rpc(&id).await?;
    let reply = rpc
        .call("tools/list", Some(json!({})), state.config.proxy_timeout())
        .await?;
    let tools: Vec<crate::types::ToolDescriptor> = match reply {
        RpcReply::Result(result) => {
            let tools = result
                .get("tools")
                .cloned()
                .ok_or_else(|| Error::McpProtocol("tools/list result missing tools".into()))?;
            serde_json::from_value(tools)
                .map_err(|e| Error::McpProtocol(format!("malformed tool descriptors: {e}")))?
        },
        RpcReply::Error(e) => {
            return Err(Error::McpProtocol(format!("tools/list failed: {}", e.message)));
        },
    };
    let version = state.tools.refresh(&id, tools.clone());
    state.registry.set_tools(&id, tools.clone()).await?;
    Ok(Json(json!({ "tools": tools, "version": version })))
}

async fn run_tool(
    State(state): State<AppState>,
    Path((id, tool)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<RpcResponse>, Error> {
    state.registry.get(&id)?;
    let arguments: Value = if body.is_empty() {
        json!({})
    } else {
        parse_json(&body)?
    };

    let rpc = state.supervisor.rpc(&id).await?;
    if let Some(false) = state.tools.has_tool(&id, &tool) {
        return Err(Error::UnknownTool(tool));
    }

    let reply = rpc
        .call(
            "tools/call",
            Some(json!({ "name": tool, "arguments": arguments })),
            state.config.proxy_timeout(),
        )
        .await?;
    // Pass-through: the child's result or error object, verbatim.
    Ok(Json(reply.into_response(None)))
}

async fn get_env_overlay(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    let overlay = state.supervisor.env_overlay(&id).await;
    Ok(Json(json!({ "env": overlay })))
}

async fn put_env_overlay(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    state.registry.get(&id)?;
    let overlay: HashMap<String, String> = parse_json(&body)?;
    // A running server restarts so the new environment takes effect.
    state.supervisor.set_env_overlay(&id, overlay).await?;
    let status = state.supervisor.status(&id).await;
    Ok(Json(json!({ "env": status.env_overlay, "status": status })))
}

// ---- llm models ----

async fn list_models(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "models": state.llm.list() }))
}

async fn create_model(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let request: CreateLlmModel = parse_json(&body)?;
    let model = state.llm.create(request)?;
    Ok(Json(json!({ "model": model })))
}

async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    Ok(Json(json!({ "model": state.llm.get(&id)? })))
}

async fn update_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let patch: UpdateLlmModel = parse_json(&body)?;
    Ok(Json(json!({ "model": state.llm.update(&id, patch)? })))
}

async fn delete_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    state.llm.delete(&id).await?;
    Ok(Json(json!({ "deleted": id })))
}

async fn start_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let pid = state.llm.start(&id).await?;
    Ok(Json(json!({ "id": id, "pid": pid })))
}

async fn stop_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StopParams>,
) -> Result<Json<Value>, Error> {
    state.llm.stop(&id, params.force).await?;
    Ok(Json(json!({ "id": id, "state": "stopped" })))
}

async fn restart_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let pid = state.llm.restart(&id).await?;
    Ok(Json(json!({ "id": id, "pid": pid })))
}

async fn model_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    Ok(Json(json!({ "status": state.llm.status(&id).await? })))
}

async fn model_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Error> {
    let healthy = state.llm.health_check(&id).await?;
    Ok(Json(json!({ "id": id, "healthy": healthy })))
}

async fn model_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LogParams>,
) -> Result<Json<Value>, Error> {
    Ok(Json(json!({ "logs": state.llm.logs(&id, params.lines)? })))
}

#[derive(Debug, Deserialize, Default)]
struct InvokeParams {
    timeout_ms: Option<u64>,
}

async fn invoke_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<InvokeParams>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let payload: Value = if body.is_empty() {
        json!({})
    } else {
        parse_json(&body)?
    };
    let deadline = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.proxy_timeout());
    let result = state.llm.invoke(&id, payload, deadline).await?;
    Ok(Json(result))
}
