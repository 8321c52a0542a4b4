//! Registry and lifecycle driver for LLM backends.
//!
//! Process models get the same supervision treatment as MCP servers (spawn,
//! monitor, restart with backoff) plus an HTTP health probe; cloud models
//! skip supervision entirely and go straight to the provider.

use crate::child::{self, LaunchSpec};
use crate::error::{Error, Result};
use crate::llm::health::{self, HealthFlags, HealthSettings};
use crate::llm::replicate::ReplicateClient;
use crate::llm::{
    resolve_env_ref, CreateLlmModel, LlmModel, LlmSpec, LlmStatus, ProcessSpec, RestartPolicy,
    UpdateLlmModel,
};
use crate::logs::{LogRecord, LogRing};
use crate::registry::validation;
use crate::supervisor::{backoff_delay, ExitInfo, ServerState};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub health: HealthSettings,
    pub ring_lines: usize,
    pub ring_bytes: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub stable_window: Duration,
    pub stop_grace: Duration,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            health: HealthSettings::default(),
            ring_lines: 10_000,
            ring_bytes: 2 * 1024 * 1024,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            stable_window: Duration::from_secs(60),
            stop_grace: Duration::from_secs(10),
        }
    }
}

struct ProcInner {
    state: ServerState,
    pid: Option<u32>,
    restart_count: u32,
    last_exit: Option<ExitInfo>,
    started_at: Option<Instant>,
    stop_tx: Option<mpsc::Sender<bool>>,
    exited_rx: Option<watch::Receiver<bool>>,
    cancel_health: Option<CancellationToken>,
    epoch: u64,
}

struct ProcessRuntime {
    ring: Arc<LogRing>,
    flags: Arc<HealthFlags>,
    inner: Mutex<ProcInner>,
}

struct ModelEntry {
    model: RwLock<LlmModel>,
    runtime: Option<Arc<ProcessRuntime>>,
    replicate: Option<ReplicateClient>,
}

pub struct LlmManager {
    models: DashMap<String, Arc<ModelEntry>>,
    http: reqwest::Client,
    settings: LlmSettings,
}

impl LlmManager {
    pub fn new(settings: LlmSettings) -> Arc<Self> {
        Arc::new(Self {
            models: DashMap::new(),
            http: reqwest::Client::new(),
            settings,
        })
    }

    pub fn create(&self, request: CreateLlmModel) -> Result<LlmModel> {
        if self.models.contains_key(&request.model_id) {
            return Err(Error::Conflict(request.model_id));
        }

        let (runtime, replicate) = match &request.spec {
            LlmSpec::Process(spec) => {
                validation::validate_command(&spec.command)?;
                let runtime = Arc::new(ProcessRuntime {
                    ring: Arc::new(LogRing::new(
                        self.settings.ring_lines,
                        self.settings.ring_bytes,
                    )),
                    flags: Arc::new(HealthFlags::default()),
                    inner: Mutex::new(ProcInner {
                        state: ServerState::Stopped,
                        pid: None,
                        restart_count: 0,
                        last_exit: None,
                        started_at: None,
                        stop_tx: None,
                        exited_rx: None,
                        cancel_health: None,
                        epoch: 0,
                    }),
                });
                (Some(runtime), None)
            },
            LlmSpec::Replicate(spec) => {
                // Unresolvable credentials fail at create, not first use.
                let api_key = resolve_env_ref(&spec.api_key_ref)
                    .ok_or_else(|| Error::MissingCredential(spec.api_key_ref.clone()))?;
                (
                    None,
                    Some(ReplicateClient::new(self.http.clone(), api_key)),
                )
            },
        };

        let now = Utc::now();
        let model = LlmModel {
            model_id: request.model_id.clone(),
            spec: request.spec,
            created_at: now,
            updated_at: now,
        };
        self.models.insert(
            request.model_id,
            Arc::new(ModelEntry {
                model: RwLock::new(model.clone()),
                runtime,
                replicate,
            }),
        );
        Ok(model)
    }

    pub fn get(&self, model_id: &str) -> Result<LlmModel> {
        self.entry(model_id).map(|e| e.model.read().clone())
    }

    pub fn list(&self) -> Vec<LlmModel> {
        let mut models: Vec<LlmModel> = self
            .models
            .iter()
            .map(|e| e.value().model.read().clone())
            .collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }

    /// Only the Replicate tunables are mutable; anything else is a
    /// delete-and-recreate.
    pub fn update(&self, model_id: &str, patch: UpdateLlmModel) -> Result<LlmModel> {
        let entry = self.entry(model_id)?;
        let mut model = entry.model.write();
        match &mut model.spec {
            LlmSpec::Replicate(spec) => {
                if let Some(params) = patch.default_params {
                    spec.default_params = params;
                }
                if let Some(timeout) = patch.timeout_secs {
                    spec.timeout_secs = timeout;
                }
                if let Some(retries) = patch.max_retries {
                    spec.max_retries = retries;
                }
                model.updated_at = Utc::now();
                Ok(model.clone())
            },
            LlmSpec::Process(_) => Err(Error::ImmutableField(
                "process model fields require delete and recreate",
            )),
        }
    }

    pub async fn delete(self: &Arc<Self>, model_id: &str) -> Result<()> {
        self.entry(model_id)?;
        let _ = self.stop(model_id, true).await;
        self.models.remove(model_id);
        Ok(())
    }

    /// Spawn a process model and begin health probing. Idempotent like the
    /// server supervisor: starting a running model returns its pid.
    pub fn start<'a>(
        self: &'a Arc<Self>,
        model_id: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u32>> + Send + 'a>> {
        Box::pin(async move {
        let entry = self.entry(model_id)?;
        let runtime = entry
            .runtime
            .clone()
            .ok_or_else(|| Error::BadInput(format!("{model_id} is not a process model")))?;
        let spec = match &entry.model.read().spec {
            LlmSpec::Process(spec) => spec.clone(),
            _ => unreachable!("runtime exists only for process models"),
        };

        let mut inner = runtime.inner.lock().await;
        if let (ServerState::Running, Some(pid)) = (inner.state, inner.pid) {
            return Ok(pid);
        }
        if inner.state == ServerState::Terminating {
            return Err(Error::AlreadyRunning(format!("{model_id} is stopping")));
        }

        let launch = LaunchSpec {
            command: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: spec.cwd.clone(),
        };
        let oom_flags = runtime.flags.clone();
        let oom_pattern = spec.oom_pattern.clone();
        let stderr_hook: Box<dyn Fn(&str) + Send + Sync> = Box::new(move |line| {
            if line.contains(&oom_pattern) {
                oom_flags.cuda_oom.store(true, Ordering::Relaxed);
            }
        });

        let (pid, child) =
            match child::spawn_plain(&launch, runtime.ring.clone(), Some(stderr_hook)) {
                Ok(spawned) => spawned,
                Err(e) => {
                    inner.state = ServerState::Failed;
                    inner.last_exit = Some(ExitInfo {
                        code: None,
                        signal: None,
                        reason: "child-spawn".into(),
                    });
                    return Err(e);
                },
            };

        let (stop_tx, stop_rx) = mpsc::channel(4);
        let (exited_tx, exited_rx) = watch::channel(false);
        let cancel_health = CancellationToken::new();

        inner.epoch += 1;
        inner.state = ServerState::Running;
        inner.pid = Some(pid);
        inner.started_at = Some(Instant::now());
        inner.stop_tx = Some(stop_tx);
        inner.exited_rx = Some(exited_rx);
        inner.cancel_health = Some(cancel_health.clone());
        runtime.flags.reset();
        let epoch = inner.epoch;
        drop(inner);

        info!("started model {model_id} (pid {pid})");

        let on_unhealthy = {
            let manager = self.clone();
            let model_id = model_id.to_string();
            let policy = spec.restart_policy;
            move || {
                if policy != RestartPolicy::OnFailure {
                    return;
                }
                let manager = manager.clone();
                let model_id = model_id.clone();
                tokio::spawn(async move {
                    warn!("restarting {model_id} after failed health probes");
                    if let Err(e) = Box::pin(manager.restart(&model_id)).await {
                        warn!("health restart of {model_id} failed: {e}");
                    }
                });
            }
        };
        tokio::spawn(health::probe_loop(
            model_id.to_string(),
            spec.health_endpoint.clone(),
            self.http.clone(),
            runtime.flags.clone(),
            self.settings.health.clone(),
            cancel_health,
            on_unhealthy,
        ));

        tokio::spawn(monitor(
            self.clone(),
            model_id.to_string(),
            runtime,
            spec,
            child,
            stop_rx,
            exited_tx,
            epoch,
        ));

        Ok(pid)
        })
    }

    pub async fn stop(self: &Arc<Self>, model_id: &str, force: bool) -> Result<()> {
        let entry = self.entry(model_id)?;
        let Some(runtime) = entry.runtime.clone() else {
            return Ok(());
        };

        let mut exited_rx = {
            let mut inner = runtime.inner.lock().await;
            match inner.state {
                ServerState::Running => {
                    inner.state = ServerState::Terminating;
                    if let Some(cancel) = inner.cancel_health.take() {
                        cancel.cancel();
                    }
                    if let Some(stop_tx) = &inner.stop_tx {
                        let _ = stop_tx.try_send(force);
                    }
                    inner.exited_rx.clone()
                },
                ServerState::Terminating => inner.exited_rx.clone(),
                _ => {
                    inner.state = ServerState::Stopped;
                    return Ok(());
                },
            }
        };

        if let Some(exited_rx) = exited_rx.as_mut() {
            let deadline = self.settings.stop_grace + Duration::from_secs(15);
            let _ = tokio::time::timeout(deadline, async {
                while !*exited_rx.borrow() {
                    if exited_rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, model_id: &str) -> Result<u32> {
        self.stop(model_id, false).await?;
        Box::pin(self.start(model_id)).await
    }

    /// Uniform request interface: POST to a local process endpoint, or run a
    /// cloud prediction to a terminal state.
    pub async fn invoke(&self, model_id: &str, payload: Value, deadline: Duration) -> Result<Value> {
        let entry = self.entry(model_id)?;
        let model = entry.model.read().clone();

        match (&model.spec, &entry.runtime, &entry.replicate) {
            (LlmSpec::Process(spec), Some(runtime), _) => {
                {
                    let inner = runtime.inner.lock().await;
                    if inner.state != ServerState::Running {
                        return Err(Error::NotRunning(model_id.to_string()));
                    }
                }
                let response = self
                    .http
                    .post(&spec.endpoint)
                    .json(&payload)
                    .timeout(deadline)
                    .send()
                    .await
                    .map_err(|e| {
                        if runtime.flags.has_cuda_oom() {
                            Error::Internal(format!("model {model_id} hit CUDA OOM: {e}"))
                        } else if e.is_timeout() {
                            Error::McpTimeout(deadline.as_millis() as u64)
                        } else {
                            Error::Http(e)
                        }
                    })?;
                Ok(response.json().await?)
            },
            (LlmSpec::Replicate(spec), _, Some(client)) => {
                let deadline = deadline.min(Duration::from_secs(spec.timeout_secs));
                client.invoke(spec, payload, deadline).await
            },
            _ => Err(Error::Internal(format!("{model_id}: malformed model entry"))),
        }
    }

    pub async fn health_check(&self, model_id: &str) -> Result<bool> {
        let entry = self.entry(model_id)?;
        let model = entry.model.read().clone();
        match &model.spec {
            LlmSpec::Process(spec) => Ok(health::probe_once(
                &spec.health_endpoint,
                &self.http,
                self.settings.health.timeout,
            )
            .await),
            // Cloud availability is exercised per-invoke with retries; the
            // credential was already proven resolvable at create.
            LlmSpec::Replicate(_) => Ok(true),
        }
    }

    pub fn logs(&self, model_id: &str, lines: usize) -> Result<Vec<LogRecord>> {
        let entry = self.entry(model_id)?;
        Ok(entry
            .runtime
            .as_ref()
            .map(|r| r.ring.tail(lines))
            .unwrap_or_default())
    }

    pub async fn status(&self, model_id: &str) -> Result<LlmStatus> {
        let entry = self.entry(model_id)?;
        let model = entry.model.read().clone();

        match &entry.runtime {
            Some(runtime) => {
                let inner = runtime.inner.lock().await;
                Ok(LlmStatus {
                    model_id: model.model_id,
                    kind: "process",
                    state: Some(inner.state),
                    pid: inner.pid,
                    is_healthy: runtime.flags.is_healthy()
                        && inner.state == ServerState::Running,
                    consecutive_health_failures: runtime.flags.failures(),
                    has_cuda_oom: runtime.flags.has_cuda_oom(),
                    restart_count: inner.restart_count,
                })
            },
            None => Ok(LlmStatus {
                model_id: model.model_id,
                kind: "replicate",
                state: None,
                pid: None,
                is_healthy: true,
                consecutive_health_failures: 0,
                has_cuda_oom: false,
                restart_count: 0,
            }),
        }
    }

    pub async fn stop_all(self: &Arc<Self>) {
        let ids: Vec<String> = self.models.iter().map(|e| e.key().clone()).collect();
        let stops = ids.iter().map(|id| self.stop(id, false));
        for (id, result) in ids.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!("failed to stop model {id} during shutdown: {e}");
            }
        }
    }

    fn entry(&self, model_id: &str) -> Result<Arc<ModelEntry>> {
        self.models
            .get(model_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::UnknownServer(model_id.to_string()))
    }
}

/// Owns the child handle for one spawn; applies the model's restart policy
/// on natural exit.
#[allow(clippy::too_many_arguments)]
async fn monitor(
    manager: Arc<LlmManager>,
    model_id: String,
    runtime: Arc<ProcessRuntime>,
    spec: ProcessSpec,
    mut child: tokio::process::Child,
    mut stop_rx: mpsc::Receiver<bool>,
    exited_tx: watch::Sender<bool>,
    epoch: u64,
) {
    let pid = child.id();
    let grace = manager.settings.stop_grace;

    let (exit_status, stopped) = tokio::select! {
        status = child.wait() => (status.ok(), false),
        force = stop_rx.recv() => {
            let force = force.unwrap_or(true);
            #[cfg(unix)]
            if let Some(pid) = pid {
                let signal = if force {
                    nix::sys::signal::Signal::SIGKILL
                } else {
                    nix::sys::signal::Signal::SIGTERM
                };
                child::signal(pid, signal);
            }
            let wait_for = if force { Duration::from_secs(5) } else { grace };
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
            (status, true)
        },
    };

    let _ = exited_tx.send(true);

    let mut inner = runtime.inner.lock().await;
    if inner.epoch != epoch {
        return;
    }
    if let Some(cancel) = inner.cancel_health.take() {
        cancel.cancel();
    }
    inner.pid = None;
    inner.stop_tx = None;

    let clean = exit_status.as_ref().map(|s| s.success()).unwrap_or(false);
    let code = exit_status.as_ref().and_then(|s| s.code());
    inner.last_exit = Some(ExitInfo {
        code,
        signal: None,
        reason: if stopped {
            "stopped".to_string()
        } else if clean {
            "exited".to_string()
        } else {
            format!("exited with code {}", code.unwrap_or(-1))
        },
    });

    if stopped {
        inner.state = ServerState::Stopped;
        return;
    }

    let uptime = inner.started_at.map(|s| s.elapsed()).unwrap_or_default();
    if uptime >= manager.settings.stable_window {
        inner.restart_count = 0;
    }

    let wants_restart = match spec.restart_policy {
        RestartPolicy::Always => true,
        RestartPolicy::OnFailure => !clean,
        RestartPolicy::Never => false,
    };

    if wants_restart && inner.restart_count < spec.max_restarts {
        inner.restart_count += 1;
        let attempt = inner.restart_count;
        inner.state = ServerState::Restarting;
        let delay = backoff_delay(
            manager.settings.backoff_base,
            manager.settings.backoff_cap,
            attempt,
        );
        info!("restarting model {model_id} in {delay:?} (attempt {attempt}/{})", spec.max_restarts);
        drop(inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let inner = runtime.inner.lock().await;
                if inner.state != ServerState::Restarting {
                    return;
                }
            }
            if let Err(e) = Box::pin(manager.start(&model_id)).await {
                warn!("scheduled restart of model {model_id} failed: {e}");
            }
        });
    } else if clean {
        inner.state = ServerState::Stopped;
    } else {
        // Restart budget exhausted: terminal failed until an operator acts.
        inner.state = ServerState::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn replicate_request(id: &str) -> CreateLlmModel {
        std::env::set_var("FLUIDMCP_TEST_REPLICATE_KEY", "r8_test");
        CreateLlmModel {
            model_id: id.to_string(),
            spec: LlmSpec::Replicate(crate::llm::ReplicateSpec {
                model: "meta/llama-3-8b".into(),
                api_key_ref: "${FLUIDMCP_TEST_REPLICATE_KEY}".into(),
                default_params: json!({"temperature": 0.7}),
                timeout_secs: 60,
                max_retries: 2,
                endpoint: "https://api.replicate.com/v1/predictions".into(),
                poll_interval_secs: 2,
            }),
        }
    }

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let manager = LlmManager::new(LlmSettings::default());
        manager.create(replicate_request("m1")).unwrap();
        let err = manager.create(replicate_request("m1")).unwrap_err();
        assert_eq!(err.kind(), "conflict");
    }

    #[tokio::test]
    async fn create_fails_on_unresolvable_credential() {
        std::env::remove_var("FLUIDMCP_TEST_ABSENT_KEY");
        let manager = LlmManager::new(LlmSettings::default());
        let mut request = replicate_request("m2");
        if let LlmSpec::Replicate(spec) = &mut request.spec {
            spec.api_key_ref = "${FLUIDMCP_TEST_ABSENT_KEY}".into();
        }
        let err = manager.create(request).unwrap_err();
        assert_eq!(err.kind(), "missing-credential");
    }

    #[tokio::test]
    async fn update_touches_only_replicate_tunables() {
        let manager = LlmManager::new(LlmSettings::default());
        manager.create(replicate_request("m3")).unwrap();

        let updated = manager
            .update(
                "m3",
                UpdateLlmModel {
                    default_params: Some(json!({"temperature": 0.1})),
                    timeout_secs: Some(120),
                    max_retries: None,
                },
            )
            .unwrap();
        match updated.spec {
            LlmSpec::Replicate(spec) => {
                assert_eq!(spec.default_params["temperature"], 0.1);
                assert_eq!(spec.timeout_secs, 120);
                assert_eq!(spec.max_retries, 2);
            },
            _ => panic!("expected replicate spec"),
        }
    }

    #[tokio::test]
    async fn process_models_are_immutable_via_update() {
        let manager = LlmManager::new(LlmSettings::default());
        manager
            .create(CreateLlmModel {
                model_id: "proc".into(),
                spec: LlmSpec::Process(ProcessSpec {
                    command: "python3".into(),
                    args: vec![],
                    env: Default::default(),
                    cwd: None,
                    endpoint: "http://127.0.0.1:9000/predict".into(),
                    health_endpoint: "http://127.0.0.1:9000/health".into(),
                    restart_policy: RestartPolicy::OnFailure,
                    max_restarts: 3,
                    oom_pattern: "CUDA out of memory".into(),
                }),
            })
            .unwrap();

        let err = manager
            .update("proc", UpdateLlmModel::default())
            .unwrap_err();
        assert_eq!(err.kind(), "immutable-field");
    }

    #[tokio::test]
    async fn listing_is_sorted() {
        let manager = LlmManager::new(LlmSettings::default());
        manager.create(replicate_request("zeta")).unwrap();
        manager.create(replicate_request("alpha")).unwrap();
        let ids: Vec<_> = manager.list().into_iter().map(|m| m.model_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn replicate_status_has_no_process_fields() {
        let manager = LlmManager::new(LlmSettings::default());
        manager.create(replicate_request("m4")).unwrap();
        let status = manager.status("m4").await.unwrap();
        assert_eq!(status.kind, "replicate");
        assert!(status.state.is_none());
        assert!(status.is_healthy);
    }
}
