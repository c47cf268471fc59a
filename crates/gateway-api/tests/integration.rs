use gateway_api::app;
use gateway_common::config::GatewayConfig;

fn fast_config() -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.scheduler_decode_step_seconds = 0.001;
    cfg.scheduler_idle_sleep_seconds = 0.001;
    cfg.default_tenant_policy.rate_tokens_per_sec = 10_000.0;
    cfg.default_tenant_policy.burst_tokens = 10_000.0;
    cfg
}

#[tokio::test]
async fn generate_health_and_metrics_round_trip() {
    let (router, gateway) = app(fast_config());
    gateway.start().await;

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();

    let body = serde_json::json!({"tenant_id": "tenant-a", "prompt": "hello there", "max_new_tokens": 4});
    let response = client.post(format!("{base}/v1/generate")).json(&body).send().await.unwrap();
    assert!(response.status().is_success());
    let payload: serde_json::Value = response.json().await.unwrap();
    assert_eq!(payload["completion_tokens"], 4);
    assert_eq!(payload["tenant_id"], "tenant-a");

    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert!(health.status().is_success());
    let health_body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(health_body["status"], "ok");

    let metrics = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert!(metrics.status().is_success());
    let metrics_text = metrics.text().await.unwrap();
    assert!(metrics_text.contains("gateway_requests_total"));

    server.abort();
    gateway.stop().await;
}

#[tokio::test]
async fn generate_rejects_oversize_request_with_bad_request() {
    let mut config = fast_config();
    config.max_request_tokens = 20;
    config.enable_prompt_truncation = false;
    let (router, gateway) = app(config);
    gateway.start().await;

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let base = format!("http://{}:{}", addr.ip(), addr.port());
    let client = reqwest::Client::new();
    let body = serde_json::json!({"tenant_id": "tenant-a", "prompt": "x".repeat(80), "max_new_tokens": 5});
    let response = client.post(format!("{base}/v1/generate")).json(&body).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let payload: serde_json::Value = response.json().await.unwrap();
    assert!(payload["detail"].as_str().unwrap().contains("exceeds max_request_tokens=20"));

    server.abort();
    gateway.stop().await;
}
