//! OAuth 2.0 authorization-code flow with PKCE, terminated per package.
//!
//! The broker issues PKCE pairs, parks pending authorization state keyed by
//! an opaque CSRF token, and exchanges callback codes for tokens. Tokens go
//! straight back to the client; the gateway retains nothing, and the
//! verifier never leaves the process.

use crate::error::{Error, Result};
use crate::registry::AuthConfig;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Minimum accepted length for a callback `state` parameter.
const MIN_STATE_LEN: usize = 16;

/// PKCE code verifier: 43-128 URL-safe characters.
#[derive(Debug, Clone)]
pub struct PkceVerifier(String);

impl PkceVerifier {
    /// 32 random bytes, base64url without padding: 43 characters.
    pub fn new_random() -> Self {
        let bytes: [u8; 32] = rand::random();
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `BASE64URL(SHA-256(verifier))` without padding.
    pub fn challenge(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
    }
}

/// Opaque CSRF token with at least 128 bits of entropy.
pub fn new_state() -> String {
    let bytes: [u8; 32] = rand::random();
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// One in-flight authorization, parked between login and callback.
#[derive(Debug, Clone)]
pub struct PendingAuthState {
    pub verifier: PkceVerifier,
    pub server_id: String,
    pub auth: AuthConfig,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

pub struct AuthBroker {
    pending: DashMap<String, PendingAuthState>,
    capacity: usize,
    ttl: ChronoDuration,
    http: reqwest::Client,
}

impl AuthBroker {
    pub fn new(capacity: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            capacity,
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::minutes(10)),
            http: reqwest::Client::new(),
        })
    }

    /// Background sweep removing entries past their TTL.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Utc::now();
                let before = broker.pending.len();
                broker.pending.retain(|_, entry| entry.expires_at > now);
                let swept = before - broker.pending.len();
                if swept > 0 {
                    debug!("swept {swept} expired pending authorizations");
                }
            }
        });
    }

    /// Begin a flow: issue a PKCE pair, park the state, and build the
    /// provider authorization URL to redirect the browser to.
    pub fn begin_login(&self, server_id: &str, auth: &AuthConfig, base_url: &str) -> Result<String> {
        let client_id = std::env::var(&auth.client_id_env)
            .map_err(|_| Error::MissingClientId(auth.client_id_env.clone()))?;

        let verifier = PkceVerifier::new_random();
        let challenge = verifier.challenge();
        let state = new_state();

        self.evict_if_full();
        let now = Utc::now();
        self.pending.insert(
            state.clone(),
            PendingAuthState {
                verifier,
                server_id: server_id.to_string(),
                auth: auth.clone(),
                created_at: now,
                expires_at: now + self.ttl,
            },
        );

        let redirect_uri = redirect_uri(base_url, server_id);
        let mut authorize = Url::parse(&auth.authorization_url)
            .map_err(|e| Error::BadInput(format!("invalid authorization_url: {e}")))?;
        authorize
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", &redirect_uri)
            .append_pair("scope", &auth.scopes.join(" "))
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &state);

        Ok(authorize.to_string())
    }

    /// Complete a flow. The state slot is consumed exactly once, before any
    /// further validation, so a replayed callback always fails.
    pub async fn finish_login(
        &self,
        server_id: &str,
        code: &str,
        state: &str,
        base_url: &str,
    ) -> Result<Value> {
        if state.len() < MIN_STATE_LEN {
            return Err(Error::InvalidAuthState);
        }

        let (_, pending) = self.pending.remove(state).ok_or(Error::InvalidAuthState)?;

        if pending.server_id != server_id {
            return Err(Error::InvalidAuthState);
        }
        if pending.expires_at < Utc::now() {
            return Err(Error::InvalidAuthState);
        }

        let redirect_uri = redirect_uri(base_url, server_id);
        let client_id = std::env::var(&pending.auth.client_id_env)
            .map_err(|_| Error::MissingClientId(pending.auth.client_id_env.clone()))?;

        let mut form = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), redirect_uri),
            ("client_id".to_string(), client_id),
            (
                "code_verifier".to_string(),
                pending.verifier.as_str().to_string(),
            ),
        ];
        if let Some(secret_env) = &pending.auth.client_secret_env {
            if let Ok(secret) = std::env::var(secret_env) {
                form.push(("client_secret".to_string(), secret));
            }
        }

        let response = self
            .http
            .post(&pending.auth.token_url)
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            // Relay the provider's error; the verifier stays out of it.
            let body = response.text().await.unwrap_or_default();
            return Err(Error::OauthExchange {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn evict_if_full(&self) {
        if self.pending.len() < self.capacity {
            return;
        }
        // Evict the oldest pending entry to make room.
        let oldest = self
            .pending
            .iter()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            self.pending.remove(&key);
            warn!(
                kind = "auth-overflow",
                "pending authorization store full; evicted oldest entry"
            );
        }
    }
}

fn redirect_uri(base_url: &str, server_id: &str) -> String {
    format!(
        "{}/{}/auth/callback",
        base_url.trim_end_matches('/'),
        server_id
    )
}
