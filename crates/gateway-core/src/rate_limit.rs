//! Per-tenant token-bucket admission credits.

use std::collections::HashMap;

use gateway_common::config::{GatewayConfig, TenantPolicy};

#[derive(Debug, Clone)]
struct TokenBucket {
    rate_tokens_per_sec: f64,
    burst_tokens: f64,
    tokens: f64,
    last_refill_ts: f64,
}

impl TokenBucket {
    fn from_policy(policy: &TenantPolicy, now: f64) -> Self {
        Self {
            rate_tokens_per_sec: policy.rate_tokens_per_sec,
            burst_tokens: policy.burst_tokens,
            tokens: policy.burst_tokens,
            last_refill_ts: now,
        }
    }

    fn refill(&mut self, now: f64) {
        let elapsed = (now - self.last_refill_ts).max(0.0);
        self.tokens = (self.tokens + elapsed * self.rate_tokens_per_sec).min(self.burst_tokens);
        self.last_refill_ts = now;
    }

    fn try_consume(&mut self, amount: f64, now: f64) -> bool {
        if amount <= 0.0 {
            return true;
        }
        self.refill(now);
        if self.tokens < amount {
            return false;
        }
        self.tokens -= amount;
        true
    }

    fn refund(&mut self, amount: f64) {
        if amount <= 0.0 {
            return;
        }
        self.tokens = (self.tokens + amount).min(self.burst_tokens);
    }
}

/// One bucket per observed tenant, lazily constructed from policy on first
/// mention. Unknown tenants use the gateway's default policy.
pub struct TokenRateLimiter {
    default_policy: TenantPolicy,
    tenant_policies: HashMap<String, TenantPolicy>,
    buckets: HashMap<String, TokenBucket>,
}

impl TokenRateLimiter {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            default_policy: config.default_tenant_policy.clone(),
            tenant_policies: config.tenant_policies.clone(),
            buckets: HashMap::new(),
        }
    }

    fn policy_for(&self, tenant_id: &str) -> &TenantPolicy {
        self.tenant_policies.get(tenant_id).unwrap_or(&self.default_policy)
    }

    fn bucket_for(&mut self, tenant_id: &str, now: f64) -> &mut TokenBucket {
        if !self.buckets.contains_key(tenant_id) {
            let bucket = TokenBucket::from_policy(self.policy_for(tenant_id), now);
            self.buckets.insert(tenant_id.to_string(), bucket);
        }
        self.buckets.get_mut(tenant_id).expect("just inserted")
    }

    pub fn try_consume(&mut self, tenant_id: &str, amount: f64, now: f64) -> bool {
        self.bucket_for(tenant_id, now).try_consume(amount, now)
    }

    pub fn refund(&mut self, tenant_id: &str, amount: f64) {
        if let Some(bucket) = self.buckets.get_mut(tenant_id) {
            bucket.refund(amount);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_common::config::TenantPolicy;

    fn config_with(tenant: &str, rate: f64, burst: f64) -> GatewayConfig {
        let mut cfg = GatewayConfig::default();
        cfg.tenant_policies.clear();
        cfg.tenant_policies.insert(tenant.to_string(), TenantPolicy::new(rate, burst, "adapter-x"));
        cfg
    }

    #[test]
    fn token_bucket_refill_and_refund() {
        let cfg = config_with("tenant-x", 100.0, 200.0);
        let mut limiter = TokenRateLimiter::new(&cfg);

        assert!(limiter.try_consume("tenant-x", 200.0, 0.0));
        assert!(!limiter.try_consume("tenant-x", 1.0, 0.0));

        assert!(limiter.try_consume("tenant-x", 50.0, 0.5));
        assert!(!limiter.try_consume("tenant-x", 1.0, 0.5));

        limiter.refund("tenant-x", 25.0);
        assert!(limiter.try_consume("tenant-x", 25.0, 0.5));
    }

    #[test]
    fn refund_never_exceeds_burst() {
        let cfg = config_with("tenant-x", 0.0, 10.0);
        let mut limiter = TokenRateLimiter::new(&cfg);
        limiter.refund("tenant-x", 5.0); // no bucket exists yet, no-op
        assert!(limiter.try_consume("tenant-x", 10.0, 0.0));
        limiter.refund("tenant-x", 1000.0);
        assert!(!limiter.try_consume("tenant-x", 10.1, 0.0));
        assert!(limiter.try_consume("tenant-x", 10.0, 0.0));
    }

    #[test]
    fn refund_is_exact_inverse_of_consume_when_no_time_passes() {
        let cfg = config_with("tenant-x", 10.0, 500.0);
        let mut limiter = TokenRateLimiter::new(&cfg);
        assert!(limiter.try_consume("tenant-x", 123.0, 10.0));
        limiter.refund("tenant-x", 123.0);
        assert!(limiter.try_consume("tenant-x", 500.0, 10.0));
    }

    #[test]
    fn unknown_tenant_uses_default_policy() {
        let cfg = GatewayConfig::default();
        let mut limiter = TokenRateLimiter::new(&cfg);
        assert!(limiter.try_consume("nonexistent-tenant", 1.0, 0.0));
    }
}
