//! LLM backend registry: process-backed local models and cloud predictions
//! behind one health, restart, and request interface.

pub mod health;
pub mod manager;
pub mod replicate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

pub use manager::LlmManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    OnFailure,
    Always,
    Never,
}

/// A locally supervised inference process. It binds a loopback port and
/// serves predictions on `endpoint`; `health_endpoint` is probed on a fixed
/// interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    pub endpoint: String,
    pub health_endpoint: String,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: RestartPolicy,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Substring matched against stderr lines to flag GPU memory exhaustion.
    #[serde(default = "default_oom_pattern")]
    pub oom_pattern: String,
}

/// A Replicate-style cloud model: predictions are created with one POST and
/// polled until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateSpec {
    pub model: String,
    /// `${NAME}` reference resolved from the process env at create time.
    pub api_key_ref: String,
    #[serde(default)]
    pub default_params: Value,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_replicate_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LlmSpec {
    Process(ProcessSpec),
    Replicate(ReplicateSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmModel {
    pub model_id: String,
    pub spec: LlmSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Wire form for model creation.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateLlmModel {
    pub model_id: String,
    pub spec: LlmSpec,
}

/// Wire form for model updates. Only the Replicate variant's tunables are
/// mutable; everything else requires delete + create.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateLlmModel {
    pub default_params: Option<Value>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmStatus {
    pub model_id: String,
    pub kind: &'static str,
    pub state: Option<crate::supervisor::ServerState>,
    pub pid: Option<u32>,
    pub is_healthy: bool,
    pub consecutive_health_failures: u32,
    pub has_cuda_oom: bool,
    pub restart_count: u32,
}

/// Resolve a `${NAME}` environment reference; bare values pass through.
pub fn resolve_env_ref(reference: &str) -> Option<String> {
    match reference.strip_prefix("${").and_then(|r| r.strip_suffix('}')) {
        Some(name) => std::env::var(name).ok(),
        None => Some(reference.to_string()),
    }
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::OnFailure
}

fn default_max_restarts() -> u32 {
    3
}

fn default_oom_pattern() -> String {
    "CUDA out of memory".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_replicate_endpoint() -> String {
    "https://api.replicate.com/v1/predictions".to_string()
}

fn default_poll_interval_secs() -> u64 {
    2
}
