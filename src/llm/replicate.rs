//! Cloud prediction client for Replicate-style APIs.
//!
//! One POST creates the prediction; if the provider answers asynchronously
//! the prediction status is polled until terminal or the model's timeout.
//! Transient failures retry with exponential backoff up to `max_retries`.

use crate::error::{Error, Result};
use crate::llm::ReplicateSpec;
use crate::supervisor::backoff_delay;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const TERMINAL_STATUSES: &[&str] = &["succeeded", "failed", "canceled"];

pub struct ReplicateClient {
    http: reqwest::Client,
    api_key: String,
}

impl ReplicateClient {
    pub fn new(http: reqwest::Client, api_key: String) -> Self {
        Self { http, api_key }
    }

    /// Create a prediction and drive it to a terminal state. The returned
    /// value is the provider's final prediction object, successes and
    /// provider-reported failures alike.
    pub async fn invoke(
        &self,
        spec: &ReplicateSpec,
        payload: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let started = Instant::now();
        let input = merge_params(&spec.default_params, payload);
        let body = json!({
            "version": spec.model,
            "input": input,
        });

        let mut prediction = self.create_with_retry(spec, &body, deadline).await?;

        let poll_interval = Duration::from_secs(spec.poll_interval_secs);
        loop {
            let status = prediction
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            if TERMINAL_STATUSES.contains(&status) {
                return Ok(prediction);
            }

            if started.elapsed() >= deadline {
                return Err(Error::McpTimeout(deadline.as_millis() as u64));
            }

            let poll_url = prediction
                .get("urls")
                .and_then(|u| u.get("get"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| {
                    prediction.get("id").and_then(Value::as_str).map(|id| {
                        format!("{}/{id}", spec.endpoint.trim_end_matches('/'))
                    })
                })
                .ok_or_else(|| {
                    Error::Internal("prediction response has no poll url or id".into())
                })?;

            tokio::time::sleep(poll_interval).await;
            debug!("polling prediction at {poll_url}");
            let response = self
                .http
                .get(&poll_url)
                .header("Authorization", format!("Token {}", self.api_key))
                .send()
                .await?;
            if !response.status().is_success() {
                warn!("prediction poll returned {}", response.status());
                continue;
            }
            prediction = response.json().await?;
        }
    }

    async fn create_with_retry(
        &self,
        spec: &ReplicateSpec,
        body: &Value,
        deadline: Duration,
    ) -> Result<Value> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .http
                .post(&spec.endpoint)
                .header("Authorization", format!("Token {}", self.api_key))
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }
                    if !(status.is_server_error() || status.as_u16() == 429) {
                        let body = response.text().await.unwrap_or_default();
                        return Err(Error::McpProtocol(format!(
                            "provider rejected prediction ({status}): {body}"
                        )));
                    }
                    warn!("prediction create returned {status}, retrying");
                },
                Err(e) => warn!("prediction create failed: {e}"),
            }

            attempt += 1;
            if attempt > spec.max_retries || started.elapsed() >= deadline {
                return Err(Error::Internal(format!(
                    "prediction create exhausted {} retries",
                    spec.max_retries
                )));
            }
            let delay = backoff_delay(
                Duration::from_millis(500),
                Duration::from_secs(30),
                attempt,
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Request params win over the model's defaults, key by key.
fn merge_params(defaults: &Value, payload: Value) -> Value {
    match (defaults.as_object(), payload.as_object()) {
        (Some(defaults), Some(overrides)) => {
            let mut merged = defaults.clone();
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        },
        _ => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_overrides_defaults() {
        let defaults = json!({"temperature": 0.7, "max_tokens": 256});
        let payload = json!({"prompt": "hi", "temperature": 0.2});
        let merged = merge_params(&defaults, payload);
        assert_eq!(merged["temperature"], 0.2);
        assert_eq!(merged["max_tokens"], 256);
        assert_eq!(merged["prompt"], "hi");
    }

    #[test]
    fn non_object_payload_passes_through() {
        let defaults = json!({"temperature": 0.7});
        let merged = merge_params(&defaults, json!("raw prompt"));
        assert_eq!(merged, json!("raw prompt"));
    }
}
