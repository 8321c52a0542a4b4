//! Gateway runtime configuration.
//!
//! The gateway itself is configured entirely through environment variables
//! and CLI flags; server definitions live in the registry, not here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variables consumed by the gateway itself.
pub const ENV_PORT: &str = "FLUIDMCP_PORT";
pub const ENV_STARTUP_TIMEOUT: &str = "FLUIDMCP_STARTUP_TIMEOUT";
pub const ENV_ADMIN_TOKEN: &str = "FLUIDMCP_ADMIN_TOKEN";
pub const ENV_STORE_PATH: &str = "FLUIDMCP_STORE_PATH";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL used to compute OAuth redirect URIs. Defaults to
    /// `http://{host}:{port}` when unset.
    #[serde(default)]
    pub public_base_url: Option<String>,

    /// Deadline for a child's MCP handshake after spawn, in seconds.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Bearer token guarding the admin surface. `None` leaves it open.
    #[serde(default)]
    pub admin_bearer_token: Option<String>,

    /// Directory for the JSON document store. `None` selects the in-memory
    /// fallback whose loss on restart is acceptable.
    #[serde(default)]
    pub store_path: Option<PathBuf>,

    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,

    /// How long an auto-started server may take to become ready for RPC.
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    #[serde(default = "default_write_deadline")]
    pub child_write_deadline_secs: u64,

    #[serde(default = "default_ring_lines")]
    pub log_ring_lines: usize,

    #[serde(default = "default_ring_bytes")]
    pub log_ring_bytes: usize,

    #[serde(default = "default_auth_capacity")]
    pub pending_auth_capacity: usize,

    #[serde(default = "default_auth_ttl")]
    pub auth_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_base_url: None,
            startup_timeout_secs: default_startup_timeout(),
            admin_bearer_token: None,
            store_path: None,
            stop_grace_secs: default_stop_grace(),
            proxy_timeout_secs: default_proxy_timeout(),
            readiness_timeout_secs: default_readiness_timeout(),
            child_write_deadline_secs: default_write_deadline(),
            log_ring_lines: default_ring_lines(),
            log_ring_bytes: default_ring_bytes(),
            pending_auth_capacity: default_auth_capacity(),
            auth_ttl_secs: default_auth_ttl(),
        }
    }
}

impl GatewayConfig {
    /// Resolve configuration from process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var(ENV_PORT) {
            if let Ok(port) = port.parse() {
                config.port = port;
            }
        }
        if let Ok(secs) = std::env::var(ENV_STARTUP_TIMEOUT) {
            if let Ok(secs) = secs.parse() {
                config.startup_timeout_secs = secs;
            }
        }
        if let Ok(token) = std::env::var(ENV_ADMIN_TOKEN) {
            if !token.is_empty() {
                config.admin_bearer_token = Some(token);
            }
        }
        if let Ok(path) = std::env::var(ENV_STORE_PATH) {
            if !path.is_empty() {
                config.store_path = Some(PathBuf::from(path));
            }
        }

        config
    }

    pub fn public_base_url(&self) -> String {
        self.public_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn child_write_deadline(&self) -> Duration {
        Duration::from_secs(self.child_write_deadline_secs)
    }

    pub fn auth_ttl(&self) -> Duration {
        Duration::from_secs(self.auth_ttl_secs)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8099
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_stop_grace() -> u64 {
    10
}

fn default_proxy_timeout() -> u64 {
    60
}

fn default_readiness_timeout() -> u64 {
    15
}

fn default_write_deadline() -> u64 {
    5
}

fn default_ring_lines() -> usize {
    10_000
}

fn default_ring_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_auth_capacity() -> usize {
    10_000
}

fn default_auth_ttl() -> u64 {
    600
}
