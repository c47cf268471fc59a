//! Admission pipeline: the orchestrator that turns a request into an
//! [`InferenceJob`] or a typed rejection.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use uuid::Uuid;

use gateway_common::config::GatewayConfig;
use gateway_common::{GatewayError, Result};
use gateway_obs::Telemetry;

use crate::capacity::{KvCapacityEstimator, KvPressureTracker};
use crate::context_window::ContextWindowOptimizer;
use crate::identity::InflightRequestRegistry;
use crate::rate_limit::TokenRateLimiter;
use crate::scheduler::{GenerationResult, InferenceJob, Scheduler};

const MAX_ID_CLAIM_ATTEMPTS: usize = 5;

pub struct GenerateRequest {
    pub tenant_id: String,
    pub prompt: String,
    pub max_new_tokens: u32,
    pub adapter_id: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub request_id: String,
    pub tenant_id: String,
    pub adapter_id: String,
    pub output: String,
    pub prompt_tokens: u32,
    pub original_prompt_tokens: u32,
    pub effective_prompt_tokens: u32,
    pub prompt_truncated: bool,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub queue_time_seconds: f64,
    pub ttft_seconds: f64,
    pub avg_tpot_seconds: f64,
    pub total_time_seconds: f64,
}

/// The admission pipeline and the services it shares with the scheduler. One
/// `Gateway` per process; its `scheduler` must be started before the first
/// request is admitted.
pub struct Gateway {
    config: GatewayConfig,
    telemetry: Arc<dyn Telemetry>,
    registry: InflightRequestRegistry,
    rate_limiter: Mutex<TokenRateLimiter>,
    kv_estimator: KvCapacityEstimator,
    kv_tracker: Arc<Mutex<KvPressureTracker>>,
    context_optimizer: ContextWindowOptimizer,
    clock_epoch: Instant,
    pub scheduler: Scheduler,
}

impl Gateway {
    pub fn new(config: GatewayConfig, telemetry: Arc<dyn Telemetry>) -> Self {
        let kv_tracker = Arc::new(Mutex::new(KvPressureTracker::new(config.kv_budget_bytes)));
        let scheduler = Scheduler::new(&config, kv_tracker.clone(), telemetry.clone());
        let context_optimizer = ContextWindowOptimizer::new(
            config.chars_per_token,
            config.truncation_head_ratio,
            config.truncation_marker.clone(),
        );
        let rate_limiter = Mutex::new(TokenRateLimiter::new(&config));
        let kv_estimator = KvCapacityEstimator::new(config.kv_bytes_per_token);
        telemetry.set_kv_utilization(0.0);
        Self {
            config,
            telemetry,
            registry: InflightRequestRegistry::new(),
            rate_limiter,
            kv_estimator,
            kv_tracker,
            context_optimizer,
            clock_epoch: Instant::now(),
            scheduler,
        }
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth()
    }

    pub fn active_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn kv_utilization_ratio(&self) -> f64 {
        self.kv_tracker.lock().unwrap().utilization_ratio()
    }

    pub async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let admitted_at = Instant::now();
        let request_id = self.claim_request_id(&request).await?;
        let result = self.run_pipeline(request, request_id.clone(), admitted_at).await;
        self.registry.release(&request_id).await;
        result
    }

    async fn claim_request_id(&self, request: &GenerateRequest) -> Result<String> {
        if let Some(ref supplied) = request.request_id {
            if self.registry.claim(supplied).await {
                return Ok(supplied.clone());
            }
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "request_id_collision");
            self.telemetry.record_request_id_collision(&request.tenant_id);
            return Err(GatewayError::RequestIdCollision(supplied.clone()));
        }

        for _ in 0..MAX_ID_CLAIM_ATTEMPTS {
            let candidate = Uuid::new_v4().to_string();
            if self.registry.claim(&candidate).await {
                return Ok(candidate);
            }
        }
        Err(GatewayError::AllocationExhausted)
    }

    async fn run_pipeline(
        &self,
        request: GenerateRequest,
        request_id: String,
        admitted_at: Instant,
    ) -> Result<GenerateResponse> {
        let policy = self.config.policy_for(&request.tenant_id);
        let adapter_id = request.adapter_id.clone().unwrap_or(policy.default_adapter_id.clone());

        let prompt_budget = self.config.max_request_tokens as i64 - request.max_new_tokens as i64;
        if prompt_budget <= 0 {
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "invalid");
            return Err(GatewayError::Invalid(format!(
                "max_new_tokens={} leaves no room under max_request_tokens={}",
                request.max_new_tokens, self.config.max_request_tokens
            )));
        }

        let optimized = self.context_optimizer.optimize(&request.prompt, prompt_budget);
        if optimized.prompt_truncated && !self.config.enable_prompt_truncation {
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "invalid");
            return Err(GatewayError::Invalid(format!(
                "prompt requires truncation to fit budget {prompt_budget} tokens but truncation is disabled"
            )));
        }
        if optimized.prompt_truncated {
            self.telemetry.record_prompt_truncation(&request.tenant_id);
        }

        let estimated_total_tokens = optimized.effective_prompt_tokens + request.max_new_tokens;
        if estimated_total_tokens > self.config.max_request_tokens {
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "invalid");
            return Err(GatewayError::Invalid(format!(
                "request token budget {estimated_total_tokens} exceeds max_request_tokens={}",
                self.config.max_request_tokens
            )));
        }

        let now_seconds = self.clock_epoch.elapsed().as_secs_f64();
        let consumed = self.rate_limiter.lock().unwrap().try_consume(
            &request.tenant_id,
            estimated_total_tokens as f64,
            now_seconds,
        );
        if !consumed {
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "rate_limit");
            return Err(GatewayError::RateLimited);
        }

        let estimated_kv_bytes = self.kv_estimator.estimate_request_bytes(estimated_total_tokens);
        let reserved = self.kv_tracker.lock().unwrap().try_reserve(
            &request_id,
            estimated_kv_bytes,
            self.config.shed_threshold,
        );
        if !reserved {
            self.rate_limiter.lock().unwrap().refund(&request.tenant_id, estimated_total_tokens as f64);
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "kv_pressure");
            return Err(GatewayError::KvPressure);
        }
        self.telemetry.set_kv_utilization(self.kv_tracker.lock().unwrap().utilization_ratio());

        let (result_tx, result_rx) = oneshot::channel();
        let job = InferenceJob {
            request_id: request_id.clone(),
            tenant_id: request.tenant_id.clone(),
            adapter_id: adapter_id.clone(),
            prompt: optimized.prompt.clone(),
            prompt_tokens: optimized.effective_prompt_tokens,
            max_new_tokens: request.max_new_tokens,
            estimated_total_tokens,
            admitted_at,
            enqueued_at: Instant::now(),
            result_tx,
        };

        if !self.scheduler.enqueue(job) {
            self.kv_tracker.lock().unwrap().release(&request_id);
            self.rate_limiter.lock().unwrap().refund(&request.tenant_id, estimated_total_tokens as f64);
            self.telemetry.set_kv_utilization(self.kv_tracker.lock().unwrap().utilization_ratio());
            self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "queue_full");
            return Err(GatewayError::QueueFull);
        }
        self.telemetry.record_request_outcome(&request.tenant_id, "accepted", "accepted");

        let timeout = std::time::Duration::from_secs_f64(self.config.generation_timeout_seconds);
        let generation: GenerationResult = match tokio::time::timeout(timeout, result_rx).await {
            Ok(Ok(Ok(result))) => result,
            Ok(Ok(Err(scheduler_err))) => {
                self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "timeout");
                return Err(scheduler_err);
            }
            Ok(Err(_)) => {
                self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "timeout");
                return Err(GatewayError::SchedulerStopped("result channel dropped".into()));
            }
            Err(_) => {
                self.telemetry.record_request_outcome(&request.tenant_id, "rejected", "timeout");
                return Err(GatewayError::Timeout);
            }
        };

        Ok(GenerateResponse {
            request_id: generation.request_id,
            tenant_id: generation.tenant_id,
            adapter_id: generation.adapter_id,
            output: generation.output,
            prompt_tokens: optimized.effective_prompt_tokens,
            original_prompt_tokens: optimized.original_prompt_tokens,
            effective_prompt_tokens: optimized.effective_prompt_tokens,
            prompt_truncated: optimized.prompt_truncated,
            completion_tokens: generation.completion_tokens,
            total_tokens: optimized.effective_prompt_tokens + generation.completion_tokens,
            queue_time_seconds: generation.queue_time_seconds,
            ttft_seconds: generation.ttft_seconds,
            avg_tpot_seconds: generation.avg_tpot_seconds,
            total_time_seconds: generation.total_time_seconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_obs::NoopTelemetry;

    fn request(tenant: &str, prompt: &str, max_new_tokens: u32) -> GenerateRequest {
        GenerateRequest {
            tenant_id: tenant.to_string(),
            prompt: prompt.to_string(),
            max_new_tokens,
            adapter_id: None,
            request_id: None,
        }
    }

    fn fast_config() -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.scheduler_decode_step_seconds = 0.001;
        cfg.scheduler_idle_sleep_seconds = 0.001;
        cfg
    }

    #[tokio::test]
    async fn oversize_prompt_without_truncation_is_rejected() {
        let mut cfg = fast_config();
        cfg.max_request_tokens = 20;
        cfg.enable_prompt_truncation = false;
        cfg.tenant_policies.clear();
        cfg.default_tenant_policy.rate_tokens_per_sec = 10_000.0;
        cfg.default_tenant_policy.burst_tokens = 10_000.0;
        let gateway = Gateway::new(cfg, Arc::new(NoopTelemetry));
        gateway.start().await;

        let err = gateway.generate(request("tenant-x", &"x".repeat(80), 5)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Invalid(msg) if msg.contains("exceeds max_request_tokens=20")));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn truncation_allows_an_oversize_prompt_through() {
        let mut cfg = fast_config();
        cfg.max_request_tokens = 20;
        cfg.enable_prompt_truncation = true;
        cfg.tenant_policies.clear();
        cfg.default_tenant_policy.rate_tokens_per_sec = 10_000.0;
        cfg.default_tenant_policy.burst_tokens = 10_000.0;
        let gateway = Gateway::new(cfg, Arc::new(NoopTelemetry));
        gateway.start().await;

        let response = gateway.generate(request("tenant-x", &"x".repeat(80), 5)).await.unwrap();
        assert!(response.prompt_truncated);
        assert!(response.original_prompt_tokens > response.effective_prompt_tokens);
        assert!(response.effective_prompt_tokens + 5 <= 20);
        gateway.stop().await;
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected_while_in_flight() {
        let mut cfg = fast_config();
        cfg.scheduler_max_active_sequences = 1;
        cfg.default_tenant_policy.rate_tokens_per_sec = 10_000.0;
        cfg.default_tenant_policy.burst_tokens = 10_000.0;
        let gateway = Arc::new(Gateway::new(cfg, Arc::new(NoopTelemetry)));
        gateway.start().await;

        let first = {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                let mut req = request("tenant-x", "hello", 50);
                req.request_id = Some("dup-1".to_string());
                gateway.generate(req).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut second_req = request("tenant-x", "hello", 1);
        second_req.request_id = Some("dup-1".to_string());
        let second = gateway.generate(second_req).await;
        assert!(matches!(second, Err(GatewayError::RequestIdCollision(id)) if id == "dup-1"));

        let first = first.await.unwrap();
        assert!(first.is_ok());
        gateway.stop().await;
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_is_rejected() {
        let mut cfg = fast_config();
        cfg.tenant_policies.clear();
        cfg.default_tenant_policy.rate_tokens_per_sec = 1.0;
        cfg.default_tenant_policy.burst_tokens = 5.0;
        let gateway = Gateway::new(cfg, Arc::new(NoopTelemetry));
        gateway.start().await;

        let err = gateway.generate(request("tenant-x", "hi", 1)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited));
        gateway.stop().await;
    }

    #[tokio::test]
    async fn kv_pressure_sheds_requests_over_threshold() {
        let mut cfg = fast_config();
        cfg.kv_budget_bytes = 1_000;
        cfg.kv_bytes_per_token = 100;
        cfg.shed_threshold = 0.5;
        cfg.default_tenant_policy.rate_tokens_per_sec = 10_000.0;
        cfg.default_tenant_policy.burst_tokens = 10_000.0;
        let gateway = Gateway::new(cfg, Arc::new(NoopTelemetry));
        gateway.start().await;

        let err = gateway.generate(request("tenant-x", "hi", 10)).await.unwrap_err();
        assert!(matches!(err, GatewayError::KvPressure));
        gateway.stop().await;
    }
}
