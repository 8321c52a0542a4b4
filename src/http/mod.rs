//! HTTP multiplexer: router assembly, shared state, and the copy-on-write
//! table of dynamically mounted per-server routes.

pub mod admin;
pub mod auth_routes;
pub mod proxy;

use crate::auth::AuthBroker;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::llm::manager::LlmSettings;
use crate::llm::LlmManager;
use crate::registry::{ConfigStore, JsonFileStore, ListFilter, MemoryStore, Registry};
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::tools::ToolCache;
use arc_swap::ArcSwap;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Which server ids currently expose proxy and auth routes. Swapped
/// atomically on create/delete so readers see either the old or the new
/// table, never a half-installed one.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    mcp: HashSet<String>,
    auth: HashSet<String>,
}

impl RouteTable {
    pub fn has_mcp(&self, server_id: &str) -> bool {
        self.mcp.contains(server_id)
    }

    pub fn has_auth(&self, server_id: &str) -> bool {
        self.auth.contains(server_id)
    }

    fn with_server(&self, server_id: &str, has_auth: bool) -> Self {
        let mut next = self.clone();
        next.mcp.insert(server_id.to_string());
        if has_auth {
            next.auth.insert(server_id.to_string());
        } else {
            next.auth.remove(server_id);
        }
        next
    }

    fn without_server(&self, server_id: &str) -> Self {
        let mut next = self.clone();
        next.mcp.remove(server_id);
        next.auth.remove(server_id);
        next
    }
}

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    pub supervisor: Arc<Supervisor>,
    pub tools: Arc<ToolCache>,
    pub auth: Arc<AuthBroker>,
    pub llm: Arc<LlmManager>,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub shutting_down: Arc<AtomicBool>,
}

impl AppState {
    pub fn mount(&self, server_id: &str, has_auth: bool) {
        let next = self.routes.load().with_server(server_id, has_auth);
        self.routes.store(Arc::new(next));
    }

    pub fn unmount(&self, server_id: &str) {
        let next = self.routes.load().without_server(server_id);
        self.routes.store(Arc::new(next));
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

/// The assembled gateway: registry, supervisor, brokers, and router.
pub struct Gateway {
    state: AppState,
}

impl Gateway {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let store: Arc<dyn ConfigStore> = match &config.store_path {
            Some(path) => {
                info!("using JSON document store at {path:?}");
                Arc::new(JsonFileStore::open(path.clone()).await?)
            },
            None => {
                info!("no store configured; server configurations are in-memory only");
                Arc::new(MemoryStore)
            },
        };

        let registry = Arc::new(Registry::load(store.clone()).await?);
        let tools = Arc::new(ToolCache::new());
        let supervisor = Supervisor::new(
            registry.clone(),
            tools.clone(),
            SupervisorSettings::from_config(&config),
        );
        spawn_observability_writer(store, supervisor.clone());
        let auth = AuthBroker::new(config.pending_auth_capacity, config.auth_ttl());
        auth.spawn_sweeper();
        let llm = LlmManager::new(LlmSettings::default());

        // Mount routes for every server already in the store.
        let mut table = RouteTable::default();
        for server in registry.list(ListFilter {
            include_deleted: false,
            enabled_only: false,
        }) {
            table = table.with_server(&server.id, server.auth.is_some());
        }

        let state = AppState {
            config: Arc::new(config),
            registry,
            supervisor,
            tools,
            auth,
            llm,
            routes: Arc::new(ArcSwap::from_pointee(table)),
            shutting_down: Arc::new(AtomicBool::new(false)),
        };

        Ok(Self { state })
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Build the full router: per-server proxy and auth endpoints, the admin
    /// surface under `/api`, and a liveness probe.
    pub fn router(&self) -> Router {
        let state = self.state.clone();

        let admin = admin::router().layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

        Router::new()
            .route("/health", get(health))
            .route("/:server_id/mcp", post(proxy::handle_mcp))
            .route("/:server_id/auth/login", get(auth_routes::login))
            .route("/:server_id/auth/callback", get(auth_routes::callback))
            .nest("/api", admin)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(state)
    }

    /// Bind and serve until ctrl-c, then drain and stop every child.
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind {addr}: {e}")))?;
        info!("gateway listening on http://{addr}");

        let state = self.state.clone();
        let router = self.router();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received; draining");
                state.shutting_down.store(true, Ordering::Release);
            })
            .await
            .map_err(|e| Error::Internal(format!("server error: {e}")))?;

        self.state.supervisor.stop_all().await;
        self.state.llm.stop_all().await;
        info!("gateway stopped");
        Ok(())
    }
}

/// Mirror state transitions into the store's `server_instances` collection
/// and the capped `server_logs` tail on exit. Observability only; the
/// in-memory instance remains the truth.
fn spawn_observability_writer(
    store: Arc<dyn ConfigStore>,
    supervisor: Arc<Supervisor>,
) {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let snapshot = supervisor.status(&event.server_id).await;
            if let Err(e) = store.put_instance(&snapshot).await {
                tracing::debug!("instance snapshot write failed: {e}");
            }
            if matches!(event.kind, crate::supervisor::EventKind::Exited(_)) {
                let tail = supervisor.logs(&event.server_id, crate::registry::store::PERSISTED_LOG_CAP);
                if let Err(e) = store.put_log_tail(&event.server_id, &tail).await {
                    tracing::debug!("log tail write failed: {e}");
                }
            }
        }
    });
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let servers = state.registry.list(ListFilter::default());
    let mut running = 0usize;
    for server in &servers {
        let status = state.supervisor.status(&server.id).await;
        if status.state == crate::supervisor::ServerState::Running {
            running += 1;
        }
    }
    Json(json!({
        "status": "ok",
        "servers": servers.len(),
        "running": running,
    }))
}

/// Bearer-token check over the admin surface, toggled by config. When no
/// token is configured the surface is open.
async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.admin_bearer_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == expected.as_str() => next.run(request).await,
        Some(_) => error_response(StatusCode::FORBIDDEN, "bad-input", "invalid bearer token"),
        None => error_response(
            StatusCode::UNAUTHORIZED,
            "bad-input",
            "missing bearer token",
        ),
    }
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"kind": kind, "message": message}})),
    )
        .into_response()
}
