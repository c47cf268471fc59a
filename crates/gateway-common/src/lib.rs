pub type Result<T> = core::result::Result<T, GatewayError>;

#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Invalid(String),
    #[error("request id '{0}' already in flight")]
    RequestIdCollision(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("request shed due to KV-cache pressure threshold")]
    KvPressure,
    #[error("scheduler queue is full")]
    QueueFull,
    #[error("generation timeout")]
    Timeout,
    #[error("could not allocate a unique request id")]
    AllocationExhausted,
    #[error("scheduler stopped: {0}")]
    SchedulerStopped(String),
}

pub mod config {
    use serde::Deserialize;
    use std::collections::HashMap;
    use std::env;

    #[derive(Debug, Clone, Deserialize, PartialEq)]
    pub struct TenantPolicy {
        pub rate_tokens_per_sec: f64,
        pub burst_tokens: f64,
        pub default_adapter_id: String,
    }

    impl TenantPolicy {
        pub fn new(rate_tokens_per_sec: f64, burst_tokens: f64, default_adapter_id: impl Into<String>) -> Self {
            Self { rate_tokens_per_sec, burst_tokens, default_adapter_id: default_adapter_id.into() }
        }
    }

    fn default_tenant_policies() -> HashMap<String, TenantPolicy> {
        let mut policies = HashMap::new();
        policies.insert(
            "tenant-a".to_string(),
            TenantPolicy::new(4000.0, 8000.0, "adapter-analytics-v1"),
        );
        policies.insert(
            "tenant-b".to_string(),
            TenantPolicy::new(2500.0, 5000.0, "adapter-chat-v1"),
        );
        policies
    }

    /// Immutable gateway configuration. Every field is externally settable
    /// (see `GatewayConfig::load`); the values here are the shipped defaults.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(default)]
    pub struct GatewayConfig {
        pub max_request_tokens: u32,
        pub generation_timeout_seconds: f64,

        pub shed_threshold: f64,
        pub kv_budget_bytes: u64,
        pub kv_bytes_per_token: u64,

        pub scheduler_max_active_sequences: usize,
        pub scheduler_queue_capacity: usize,
        pub scheduler_decode_step_seconds: f64,
        pub scheduler_idle_sleep_seconds: f64,

        pub tenant_policies: HashMap<String, TenantPolicy>,
        pub default_tenant_policy: TenantPolicy,

        pub enable_prompt_truncation: bool,
        pub truncation_head_ratio: f64,
        pub truncation_marker: String,
        pub chars_per_token: f64,
    }

    impl Default for GatewayConfig {
        fn default() -> Self {
            Self {
                max_request_tokens: 8192,
                generation_timeout_seconds: 120.0,

                shed_threshold: 0.90,
                kv_budget_bytes: 8 * 1024 * 1024 * 1024,
                kv_bytes_per_token: 16_384,

                scheduler_max_active_sequences: 16,
                scheduler_queue_capacity: 1024,
                scheduler_decode_step_seconds: 0.02,
                scheduler_idle_sleep_seconds: 0.005,

                tenant_policies: default_tenant_policies(),
                default_tenant_policy: TenantPolicy::new(1500.0, 3000.0, "adapter-default"),

                enable_prompt_truncation: true,
                truncation_head_ratio: 0.35,
                truncation_marker: "\n[...context truncated...]\n".to_string(),
                chars_per_token: 4.0,
            }
        }
    }

    impl GatewayConfig {
        pub fn policy_for(&self, tenant_id: &str) -> TenantPolicy {
            self.tenant_policies
                .get(tenant_id)
                .cloned()
                .unwrap_or_else(|| self.default_tenant_policy.clone())
        }

        /// Loads from `GATEWAY_CONFIG` (a YAML file path) if set, falling back
        /// to the default with individual `GATEWAY_*` env var overrides, and
        /// finally the built-in default.
        pub fn load() -> Self {
            if let Ok(path) = env::var("GATEWAY_CONFIG") {
                let Ok(text) = std::fs::read_to_string(&path) else {
                    tracing::warn!(target: "config", path, "GATEWAY_CONFIG set but unreadable, using defaults");
                    return Self::default();
                };
                return match serde_yaml::from_str::<GatewayConfig>(&text) {
                    Ok(cfg) => cfg,
                    Err(err) => {
                        tracing::warn!(target: "config", %err, "failed to parse GATEWAY_CONFIG, using defaults");
                        Self::default()
                    }
                };
            }

            let mut cfg = Self::default();
            if let Some(v) = env_parsed("GATEWAY_MAX_REQUEST_TOKENS") { cfg.max_request_tokens = v; }
            if let Some(v) = env_parsed("GATEWAY_GENERATION_TIMEOUT_SECONDS") { cfg.generation_timeout_seconds = v; }
            if let Some(v) = env_parsed("GATEWAY_SHED_THRESHOLD") { cfg.shed_threshold = v; }
            if let Some(v) = env_parsed("GATEWAY_KV_BUDGET_BYTES") { cfg.kv_budget_bytes = v; }
            if let Some(v) = env_parsed("GATEWAY_KV_BYTES_PER_TOKEN") { cfg.kv_bytes_per_token = v; }
            if let Some(v) = env_parsed("GATEWAY_MAX_ACTIVE_SEQUENCES") { cfg.scheduler_max_active_sequences = v; }
            if let Some(v) = env_parsed("GATEWAY_QUEUE_CAPACITY") { cfg.scheduler_queue_capacity = v; }
            if let Some(v) = env_parsed("GATEWAY_DECODE_STEP_SECONDS") { cfg.scheduler_decode_step_seconds = v; }
            if let Some(v) = env_parsed("GATEWAY_IDLE_SLEEP_SECONDS") { cfg.scheduler_idle_sleep_seconds = v; }
            if let Some(v) = env_parsed("GATEWAY_ENABLE_PROMPT_TRUNCATION") { cfg.enable_prompt_truncation = v; }
            cfg
        }
    }

    fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
        env::var(key).ok().and_then(|v| v.parse().ok())
    }

}
