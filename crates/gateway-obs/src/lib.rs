//! Telemetry sink for the admission pipeline and scheduler.
//!
//! A no-op implementation is accepted when no metrics backend is configured;
//! `PrometheusTelemetry` is the production sink, exporting the series named
//! in the gateway's metrics-scrape contract.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, IntCounter, Opts, Registry, TextEncoder};

pub trait Telemetry: Send + Sync {
    fn record_request_outcome(&self, tenant_id: &str, result: &str, reason: &str);
    fn observe_ttft(&self, tenant_id: &str, value: f64);
    fn observe_tpot(&self, tenant_id: &str, value: f64);
    fn observe_queue_wait(&self, tenant_id: &str, value: f64);
    fn add_generated_tokens(&self, tenant_id: &str, count: u64);
    fn record_prompt_truncation(&self, tenant_id: &str);
    fn record_request_id_collision(&self, tenant_id: &str);
    fn tick_scheduler(&self, queue_depth: i64, active_sequences: i64);
    fn set_kv_utilization(&self, utilization_ratio: f64);
}

/// Accepted when no metrics backend is configured.
#[derive(Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn record_request_outcome(&self, _tenant_id: &str, _result: &str, _reason: &str) {}
    fn observe_ttft(&self, _tenant_id: &str, _value: f64) {}
    fn observe_tpot(&self, _tenant_id: &str, _value: f64) {}
    fn observe_queue_wait(&self, _tenant_id: &str, _value: f64) {}
    fn add_generated_tokens(&self, _tenant_id: &str, _count: u64) {}
    fn record_prompt_truncation(&self, _tenant_id: &str) {}
    fn record_request_id_collision(&self, _tenant_id: &str) {}
    fn tick_scheduler(&self, _queue_depth: i64, _active_sequences: i64) {}
    fn set_kv_utilization(&self, _utilization_ratio: f64) {}
}

/// Prometheus-backed sink. Owns a private `Registry` (rather than the
/// process-global default registry) so multiple gateway instances — e.g. one
/// per integration test — can coexist in the same process without
/// re-registration panics.
pub struct PrometheusTelemetry {
    registry: Registry,
    requests_total: CounterVec,
    tokens_generated_total: CounterVec,
    prompt_truncations_total: CounterVec,
    request_id_collisions_total: CounterVec,
    scheduler_ticks_total: IntCounter,
    kv_cache_utilization_ratio: Gauge,
    queue_depth: Gauge,
    active_sequences: Gauge,
    ttft_seconds: HistogramVec,
    tpot_seconds: HistogramVec,
    queue_wait_seconds: HistogramVec,
}

impl PrometheusTelemetry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("gateway_requests_total", "Ingress request outcomes."),
            &["tenant_id", "result", "reason"],
        )
        .expect("valid metric");
        let tokens_generated_total = CounterVec::new(
            Opts::new("tokens_generated_total", "Generated output tokens by tenant."),
            &["tenant_id"],
        )
        .expect("valid metric");
        let prompt_truncations_total = CounterVec::new(
            Opts::new("prompt_truncations_total", "Prompt truncation count by tenant."),
            &["tenant_id"],
        )
        .expect("valid metric");
        let request_id_collisions_total = CounterVec::new(
            Opts::new(
                "request_id_collisions_total",
                "Concurrent request-id collision rejections.",
            ),
            &["tenant_id"],
        )
        .expect("valid metric");
        let scheduler_ticks_total =
            IntCounter::new("scheduler_ticks_total", "Continuous batching ticks.").expect("valid metric");
        let kv_cache_utilization_ratio = Gauge::new(
            "kv_cache_utilization_ratio",
            "Active KV cache utilization (0..1).",
        )
        .expect("valid metric");
        let queue_depth = Gauge::new("queue_depth", "Inference queue depth.").expect("valid metric");
        let active_sequences =
            Gauge::new("active_sequences", "Active decode sequences.").expect("valid metric");
        let ttft_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("request_ttft_seconds", "Time to first token."),
            &["tenant_id"],
        )
        .expect("valid metric");
        let tpot_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "request_tpot_seconds",
                "Time per output token after first token.",
            ),
            &["tenant_id"],
        )
        .expect("valid metric");
        let queue_wait_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("queue_wait_seconds", "Time from enqueue to first decode step."),
            &["tenant_id"],
        )
        .expect("valid metric");

        registry.register(Box::new(requests_total.clone())).expect("register");
        registry.register(Box::new(tokens_generated_total.clone())).expect("register");
        registry.register(Box::new(prompt_truncations_total.clone())).expect("register");
        registry.register(Box::new(request_id_collisions_total.clone())).expect("register");
        registry.register(Box::new(scheduler_ticks_total.clone())).expect("register");
        registry.register(Box::new(kv_cache_utilization_ratio.clone())).expect("register");
        registry.register(Box::new(queue_depth.clone())).expect("register");
        registry.register(Box::new(active_sequences.clone())).expect("register");
        registry.register(Box::new(ttft_seconds.clone())).expect("register");
        registry.register(Box::new(tpot_seconds.clone())).expect("register");
        registry.register(Box::new(queue_wait_seconds.clone())).expect("register");

        Self {
            registry,
            requests_total,
            tokens_generated_total,
            prompt_truncations_total,
            request_id_collisions_total,
            scheduler_ticks_total,
            kv_cache_utilization_ratio,
            queue_depth,
            active_sequences,
            ttft_seconds,
            tpot_seconds,
            queue_wait_seconds,
        }
    }

    /// Renders the text-exposition format consumed by a scrape collector.
    pub fn scrape(&self) -> (Vec<u8>, String) {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).expect("encode metrics");
        (buffer, encoder.format_type().to_string())
    }
}

impl Default for PrometheusTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for PrometheusTelemetry {
    fn record_request_outcome(&self, tenant_id: &str, result: &str, reason: &str) {
        self.requests_total.with_label_values(&[tenant_id, result, reason]).inc();
    }

    fn observe_ttft(&self, tenant_id: &str, value: f64) {
        self.ttft_seconds.with_label_values(&[tenant_id]).observe(value.max(0.0));
    }

    fn observe_tpot(&self, tenant_id: &str, value: f64) {
        self.tpot_seconds.with_label_values(&[tenant_id]).observe(value.max(0.0));
    }

    fn observe_queue_wait(&self, tenant_id: &str, value: f64) {
        self.queue_wait_seconds.with_label_values(&[tenant_id]).observe(value.max(0.0));
    }

    fn add_generated_tokens(&self, tenant_id: &str, count: u64) {
        self.tokens_generated_total.with_label_values(&[tenant_id]).inc_by(count as f64);
    }

    fn record_prompt_truncation(&self, tenant_id: &str) {
        self.prompt_truncations_total.with_label_values(&[tenant_id]).inc();
    }

    fn record_request_id_collision(&self, tenant_id: &str) {
        self.request_id_collisions_total.with_label_values(&[tenant_id]).inc();
    }

    fn tick_scheduler(&self, queue_depth: i64, active_sequences: i64) {
        self.scheduler_ticks_total.inc();
        self.queue_depth.set(queue_depth.max(0) as f64);
        self.active_sequences.set(active_sequences.max(0) as f64);
    }

    fn set_kv_utilization(&self, utilization_ratio: f64) {
        self.kv_cache_utilization_ratio.set(utilization_ratio.clamp(0.0, 1.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_telemetry_accepts_every_call() {
        let telemetry = NoopTelemetry;
        telemetry.record_request_outcome("tenant-a", "accepted", "accepted");
        telemetry.observe_ttft("tenant-a", 0.01);
        telemetry.set_kv_utilization(2.0);
    }

    #[test]
    fn prometheus_telemetry_scrapes_recorded_series() {
        let telemetry = PrometheusTelemetry::new();
        telemetry.record_request_outcome("tenant-a", "accepted", "accepted");
        telemetry.set_kv_utilization(0.42);
        let (body, content_type) = telemetry.scrape();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("kv_cache_utilization_ratio"));
        assert!(content_type.contains("text"));
    }

    #[test]
    fn kv_utilization_gauge_is_clamped() {
        let telemetry = PrometheusTelemetry::new();
        telemetry.set_kv_utilization(5.0);
        let (body, _) = telemetry.scrape();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("kv_cache_utilization_ratio 1"));
    }
}
