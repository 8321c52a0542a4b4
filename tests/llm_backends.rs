//! LLM backend integration: cloud predictions against a mock provider and
//! supervised local inference processes.

mod common;

use common::*;
use serde_json::{json, Value};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn replicate_body(id: &str, endpoint: &str) -> Value {
    std::env::set_var("LLM_TEST_REPLICATE_KEY", "r8_integration");
    json!({
        "model_id": id,
        "spec": {
            "type": "replicate",
            "model": "meta/llama-3-8b",
            "api_key_ref": "${LLM_TEST_REPLICATE_KEY}",
            "default_params": {"temperature": 0.5},
            "timeout_secs": 10,
            "max_retries": 2,
            "endpoint": endpoint,
            "poll_interval_secs": 1
        }
    })
}

#[tokio::test]
async fn replicate_invoke_polls_to_terminal_state() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/predictions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "p1",
            "status": "starting",
            "urls": {"get": format!("{}/v1/predictions/p1", provider.uri())}
        })))
        .mount(&provider)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/predictions/p1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "p1",
            "status": "succeeded",
            "output": ["hello from the model"]
        })))
        .mount(&provider)
        .await;

    let gateway = start_default_gateway().await;
    let client = client();
    let endpoint = format!("{}/v1/predictions", provider.uri());

    client
        .post(gateway.url("/api/llm/models"))
        .json(&replicate_body("llama", &endpoint))
        .send()
        .await
        .unwrap();

    let response = client
        .post(gateway.url("/api/llm/models/llama/invoke"))
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["output"][0], "hello from the model");
}

#[tokio::test]
async fn replicate_invoke_retries_transient_errors() {
    let provider = MockServer::start().await;
    // First create attempt fails with a 500, the retry succeeds.
    Mock::given(method("POST"))
        .and(path("/v1/predictions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&provider)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/predictions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "p2",
            "status": "succeeded",
            "output": "ok"
        })))
        .mount(&provider)
        .await;

    let gateway = start_default_gateway().await;
    let client = client();
    let endpoint = format!("{}/v1/predictions", provider.uri());

    client
        .post(gateway.url("/api/llm/models"))
        .json(&replicate_body("retry", &endpoint))
        .send()
        .await
        .unwrap();

    let response = client
        .post(gateway.url("/api/llm/models/retry/invoke"))
        .json(&json!({"prompt": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "succeeded");
}

fn process_body(id: &str, script: &str) -> Value {
    json!({
        "model_id": id,
        "spec": {
            "type": "process",
            "command": "python3",
            "args": ["-c", script],
            "endpoint": "http://127.0.0.1:1/predict",
            "health_endpoint": "http://127.0.0.1:1/health",
            "restart_policy": "on-failure",
            "max_restarts": 3
        }
    })
}

async fn wait_for_state(
    gateway: &TestGateway,
    client: &reqwest::Client,
    id: &str,
    state: &str,
    deadline: Duration,
) -> Value {
    let started = std::time::Instant::now();
    loop {
        let response = client
            .get(gateway.url(&format!("/api/llm/models/{id}/status")))
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        if body["status"]["state"] == state {
            return body;
        }
        assert!(
            started.elapsed() < deadline,
            "timed out waiting for {state}, last: {body}"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

#[tokio::test]
async fn process_model_runs_and_stops() {
    let gateway = start_default_gateway().await;
    let client = client();

    client
        .post(gateway.url("/api/llm/models"))
        .json(&process_body("sleeper", "import time; time.sleep(600)"))
        .send()
        .await
        .unwrap();

    let response = client
        .post(gateway.url("/api/llm/models/sleeper/start"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["pid"].is_u64());

    let status = wait_for_state(&gateway, &client, "sleeper", "running", Duration::from_secs(5)).await;
    assert_eq!(status["status"]["kind"], "process");

    let response = client
        .post(gateway.url("/api/llm/models/sleeper/stop"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    wait_for_state(&gateway, &client, "sleeper", "stopped", Duration::from_secs(10)).await;
}

#[tokio::test]
async fn crash_loop_exhausts_restart_budget() {
    let gateway = start_default_gateway().await;
    let client = client();

    client
        .post(gateway.url("/api/llm/models"))
        .json(&process_body("crasher", "import sys; sys.exit(3)"))
        .send()
        .await
        .unwrap();

    client
        .post(gateway.url("/api/llm/models/crasher/start"))
        .send()
        .await
        .unwrap();

    // Three restarts consume the budget, then the policy flips to terminal
    // failed.
    let status = wait_for_state(&gateway, &client, "crasher", "failed", Duration::from_secs(30)).await;
    assert_eq!(status["status"]["restart_count"].as_u64().unwrap(), 3);
}

#[tokio::test]
async fn cuda_oom_on_stderr_is_flagged() {
    let gateway = start_default_gateway().await;
    let client = client();

    let script =
        "import sys, time; print('RuntimeError: CUDA out of memory', file=sys.stderr, flush=True); time.sleep(600)";
    client
        .post(gateway.url("/api/llm/models"))
        .json(&process_body("oomer", script))
        .send()
        .await
        .unwrap();
    client
        .post(gateway.url("/api/llm/models/oomer/start"))
        .send()
        .await
        .unwrap();

    let started = std::time::Instant::now();
    loop {
        let response = client
            .get(gateway.url("/api/llm/models/oomer/status"))
            .send()
            .await
            .unwrap();
        let body: Value = response.json().await.unwrap();
        if body["status"]["has_cuda_oom"] == true {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(10),
            "oom flag never set: {body}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The stderr line also landed in the log ring.
    let response = client
        .get(gateway.url("/api/llm/models/oomer/logs?lines=10"))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert!(body["logs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["line"].as_str().unwrap_or("").contains("CUDA out of memory")));

    client
        .post(gateway.url("/api/llm/models/oomer/stop"))
        .send()
        .await
        .unwrap();
}
