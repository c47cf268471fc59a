//! HTTP surface: `POST /v1/generate`, `GET /health`, `GET /metrics`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use gateway_common::config::GatewayConfig;
use gateway_common::GatewayError;
use gateway_core::gateway::{GenerateRequest as CoreRequest, GenerateResponse as CoreResponse};
use gateway_core::Gateway;
use gateway_obs::PrometheusTelemetry;

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<Gateway>,
    telemetry: Arc<PrometheusTelemetry>,
}

/// Builds the router with a freshly constructed gateway and Prometheus sink,
/// loading configuration from the environment. The returned gateway's
/// scheduler has not been started; callers own the lifespan (see
/// `gateway-cli`'s `serve` command for the start/stop bracket).
pub fn app(config: GatewayConfig) -> (Router, Arc<Gateway>) {
    let telemetry = Arc::new(PrometheusTelemetry::new());
    let gateway = Arc::new(Gateway::new(config, telemetry.clone()));
    let state = AppState { gateway: gateway.clone(), telemetry };
    (router(state), gateway)
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/generate", post(generate))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn default_max_new_tokens() -> u32 {
    128
}

#[derive(Debug, Deserialize)]
struct GenerateRequestBody {
    tenant_id: String,
    prompt: String,
    #[serde(default = "default_max_new_tokens")]
    max_new_tokens: u32,
    #[serde(default)]
    adapter_id: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateResponseBody {
    request_id: String,
    tenant_id: String,
    adapter_id: String,
    output: String,
    prompt_tokens: u32,
    original_prompt_tokens: u32,
    effective_prompt_tokens: u32,
    prompt_truncated: bool,
    completion_tokens: u32,
    total_tokens: u32,
    queue_time_seconds: f64,
    ttft_seconds: f64,
    avg_tpot_seconds: f64,
    total_time_seconds: f64,
}

impl From<CoreResponse> for GenerateResponseBody {
    fn from(r: CoreResponse) -> Self {
        Self {
            request_id: r.request_id,
            tenant_id: r.tenant_id,
            adapter_id: r.adapter_id,
            output: r.output,
            prompt_tokens: r.prompt_tokens,
            original_prompt_tokens: r.original_prompt_tokens,
            effective_prompt_tokens: r.effective_prompt_tokens,
            prompt_truncated: r.prompt_truncated,
            completion_tokens: r.completion_tokens,
            total_tokens: r.total_tokens,
            queue_time_seconds: r.queue_time_seconds,
            ttft_seconds: r.ttft_seconds,
            avg_tpot_seconds: r.avg_tpot_seconds,
            total_time_seconds: r.total_time_seconds,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    queue_depth: usize,
    active_sequences: usize,
    kv_cache_utilization_ratio: f64,
}

struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let detail = self.0.to_string();
        let status = match self.0 {
            GatewayError::Invalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::RequestIdCollision(_) => StatusCode::CONFLICT,
            GatewayError::RateLimited | GatewayError::KvPressure | GatewayError::QueueFull => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::AllocationExhausted | GatewayError::SchedulerStopped(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

fn validate(body: &GenerateRequestBody) -> Result<(), ApiError> {
    if body.tenant_id.is_empty() || body.tenant_id.chars().count() > 128 {
        return Err(ApiError(GatewayError::Invalid("tenant_id must be 1-128 characters".into())));
    }
    if body.prompt.is_empty() {
        return Err(ApiError(GatewayError::Invalid("prompt must not be empty".into())));
    }
    if body.max_new_tokens < 1 || body.max_new_tokens > 4096 {
        return Err(ApiError(GatewayError::Invalid("max_new_tokens must be between 1 and 4096".into())));
    }
    if let Some(adapter_id) = &body.adapter_id {
        if adapter_id.chars().count() > 128 {
            return Err(ApiError(GatewayError::Invalid("adapter_id must be at most 128 characters".into())));
        }
    }
    if let Some(request_id) = &body.request_id {
        if request_id.chars().count() > 128 {
            return Err(ApiError(GatewayError::Invalid("request_id must be at most 128 characters".into())));
        }
    }
    Ok(())
}

async fn generate(
    State(state): State<AppState>,
    Json(body): Json<GenerateRequestBody>,
) -> Result<Json<GenerateResponseBody>, ApiError> {
    validate(&body)?;
    let request = CoreRequest {
        tenant_id: body.tenant_id,
        prompt: body.prompt,
        max_new_tokens: body.max_new_tokens,
        adapter_id: body.adapter_id,
        request_id: body.request_id,
    };
    let response = state.gateway.generate(request).await?;
    Ok(Json(response.into()))
}

async fn health(State(state): State<AppState>) -> Json<HealthBody> {
    Json(HealthBody {
        status: "ok",
        queue_depth: state.gateway.queue_depth(),
        active_sequences: state.gateway.active_count(),
        kv_cache_utilization_ratio: state.gateway.kv_utilization_ratio(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let (body, content_type) = state.telemetry.scrape();
    ([("content-type", content_type)], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.scheduler_decode_step_seconds = 0.001;
        cfg.scheduler_idle_sleep_seconds = 0.001;
        cfg.default_tenant_policy.rate_tokens_per_sec = 10_000.0;
        cfg.default_tenant_policy.burst_tokens = 10_000.0;
        cfg
    }

    #[tokio::test]
    async fn validate_rejects_empty_tenant_and_prompt() {
        let body = GenerateRequestBody {
            tenant_id: String::new(),
            prompt: "hi".into(),
            max_new_tokens: 10,
            adapter_id: None,
            request_id: None,
        };
        assert!(validate(&body).is_err());
    }

    #[tokio::test]
    async fn health_reports_zero_load_before_any_traffic() {
        let (_, gateway) = app(test_config());
        assert_eq!(gateway.queue_depth(), 0);
        assert_eq!(gateway.active_count(), 0);
    }
}
