//! KV-cache byte accounting, shared between admission and the scheduler.

use std::collections::HashMap;

/// Maps an estimated total token count to a reserved byte footprint.
pub struct KvCapacityEstimator {
    bytes_per_token: u64,
}

impl KvCapacityEstimator {
    pub fn new(bytes_per_token: u64) -> Self {
        Self { bytes_per_token }
    }

    pub fn estimate_request_bytes(&self, estimated_total_tokens: u32) -> u64 {
        estimated_total_tokens as u64 * self.bytes_per_token
    }
}

/// Tracks active KV-cache bytes against a fixed budget. `try_reserve` is the
/// only producer of allocations; `release` is the only consumer.
pub struct KvPressureTracker {
    kv_budget_bytes: u64,
    active_bytes: u64,
    allocations: HashMap<String, u64>,
}

impl KvPressureTracker {
    pub fn new(kv_budget_bytes: u64) -> Self {
        assert!(kv_budget_bytes > 0, "kv_budget_bytes must be positive");
        Self {
            kv_budget_bytes,
            active_bytes: 0,
            allocations: HashMap::new(),
        }
    }

    pub fn active_bytes(&self) -> u64 {
        self.active_bytes
    }

    pub fn utilization_ratio(&self) -> f64 {
        (self.active_bytes as f64 / self.kv_budget_bytes as f64).min(1.0)
    }

    /// Reserves `bytes_needed` for `request_id` unless the projected
    /// utilization would be at or above `shed_threshold`. The threshold value
    /// itself is shedding territory (`>=`, not `>`).
    pub fn try_reserve(&mut self, request_id: &str, bytes_needed: u64, shed_threshold: f64) -> bool {
        let projected = self.active_bytes + bytes_needed;
        let projected_ratio = projected as f64 / self.kv_budget_bytes as f64;
        if projected_ratio >= shed_threshold {
            return false;
        }
        self.allocations.insert(request_id.to_string(), bytes_needed);
        self.active_bytes = projected;
        true
    }

    /// Releasing an unknown id is a no-op.
    pub fn release(&mut self, request_id: &str) {
        if let Some(bytes_reserved) = self.allocations.remove(request_id) {
            self.active_bytes = self.active_bytes.saturating_sub(bytes_reserved);
        }
    }
}
