//! Multi-tenant chaos/load runner against a running gateway.

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Clone, Copy)]
struct TenantProfile {
    tenant_id: &'static str,
    min_prompt_tokens: u32,
    max_prompt_tokens: u32,
    min_new_tokens: u32,
    max_new_tokens: u32,
    weight: u32,
}

fn scenario(name: &str) -> Vec<TenantProfile> {
    match name {
        "baseline" => vec![
            TenantProfile { tenant_id: "tenant-a", min_prompt_tokens: 80, max_prompt_tokens: 240, min_new_tokens: 24, max_new_tokens: 64, weight: 1 },
            TenantProfile { tenant_id: "tenant-b", min_prompt_tokens: 40, max_prompt_tokens: 160, min_new_tokens: 24, max_new_tokens: 64, weight: 1 },
        ],
        _ => vec![
            TenantProfile { tenant_id: "tenant-a", min_prompt_tokens: 1200, max_prompt_tokens: 2800, min_new_tokens: 256, max_new_tokens: 512, weight: 1 },
            TenantProfile { tenant_id: "tenant-b", min_prompt_tokens: 40, max_prompt_tokens: 220, min_new_tokens: 32, max_new_tokens: 128, weight: 4 },
        ],
    }
}

fn weighted_choice<'a>(rng: &mut impl Rng, profiles: &'a [TenantProfile]) -> &'a TenantProfile {
    let total: u32 = profiles.iter().map(|p| p.weight).sum();
    let mut pick = rng.gen_range(1..=total);
    for profile in profiles {
        if pick <= profile.weight {
            return profile;
        }
        pick -= profile.weight;
    }
    profiles.last().unwrap()
}

fn make_prompt(token_count: u32) -> String {
    vec!["token"; token_count as usize].join(" ")
}

fn percentile(values: &mut [f64], quantile: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let index = (((values.len() - 1) as f64) * quantile).round() as usize;
    values[index.min(values.len() - 1)]
}

#[derive(Default)]
struct LoadStats {
    sent: u64,
    succeeded: u64,
    rejected_429: u64,
    failed: u64,
    latencies: Vec<f64>,
    ttft_values: Vec<f64>,
    tpot_values: Vec<f64>,
}

impl LoadStats {
    fn merge(&mut self, mut other: LoadStats) {
        self.sent += other.sent;
        self.succeeded += other.succeeded;
        self.rejected_429 += other.rejected_429;
        self.failed += other.failed;
        self.latencies.append(&mut other.latencies);
        self.ttft_values.append(&mut other.ttft_values);
        self.tpot_values.append(&mut other.tpot_values);
    }
}

async fn worker(base_url: String, scenario_name: String, duration: Duration, target_rps: f64) -> LoadStats {
    let profiles = scenario(&scenario_name);
    let mut rng = rand::thread_rng();
    let mut stats = LoadStats::default();
    let client = reqwest::Client::new();
    let started = Instant::now();

    while started.elapsed() < duration {
        let profile = *weighted_choice(&mut rng, &profiles);
        let prompt_tokens = rng.gen_range(profile.min_prompt_tokens..=profile.max_prompt_tokens);
        let max_new_tokens = rng.gen_range(profile.min_new_tokens..=profile.max_new_tokens);
        let payload = serde_json::json!({
            "tenant_id": profile.tenant_id,
            "prompt": make_prompt(prompt_tokens),
            "max_new_tokens": max_new_tokens,
        });

        stats.sent += 1;
        let req_started = Instant::now();
        match client.post(format!("{base_url}/v1/generate")).json(&payload).send().await {
            Ok(response) => {
                stats.latencies.push(req_started.elapsed().as_secs_f64());
                if response.status().as_u16() == 200 {
                    if let Ok(body) = response.json::<serde_json::Value>().await {
                        stats.succeeded += 1;
                        stats.ttft_values.push(body["ttft_seconds"].as_f64().unwrap_or(0.0));
                        stats.tpot_values.push(body["avg_tpot_seconds"].as_f64().unwrap_or(0.0));
                    } else {
                        stats.failed += 1;
                    }
                } else if response.status().as_u16() == 429 {
                    stats.rejected_429 += 1;
                } else {
                    stats.failed += 1;
                }
            }
            Err(_) => stats.failed += 1,
        }

        if target_rps > 0.0 {
            let sleep_seconds: f64 = -rng.gen::<f64>().ln() / target_rps;
            tokio::time::sleep(Duration::from_secs_f64(sleep_seconds.min(1.0))).await;
        }
    }

    stats
}

#[tokio::main]
async fn main() {
    let base_url = std::env::var("BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".into());
    let scenario_name = std::env::var("SCENARIO").unwrap_or_else(|_| "skewed-burst".into());
    let workers: usize = std::env::var("WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or(20);
    let duration_seconds: u64 = std::env::var("DURATION_SECONDS").ok().and_then(|v| v.parse().ok()).unwrap_or(60);
    let target_rps: f64 = std::env::var("TARGET_RPS").ok().and_then(|v| v.parse().ok()).unwrap_or(2.0);
    let duration = Duration::from_secs(duration_seconds);

    let mut tasks = Vec::with_capacity(workers);
    for _ in 0..workers {
        let base_url = base_url.clone();
        let scenario_name = scenario_name.clone();
        tasks.push(tokio::spawn(worker(base_url, scenario_name, duration, target_rps)));
    }

    let mut merged = LoadStats::default();
    for task in tasks {
        if let Ok(result) = task.await {
            merged.merge(result);
        }
    }

    let success_rate = if merged.sent > 0 { merged.succeeded as f64 / merged.sent as f64 } else { 0.0 };
    let rejection_rate = if merged.sent > 0 { merged.rejected_429 as f64 / merged.sent as f64 } else { 0.0 };
    let tpot_avg_ms = if merged.tpot_values.is_empty() {
        0.0
    } else {
        merged.tpot_values.iter().sum::<f64>() / merged.tpot_values.len() as f64 * 1000.0
    };

    let report = serde_json::json!({
        "scenario": scenario_name,
        "workers": workers,
        "duration_seconds": duration_seconds,
        "sent": merged.sent,
        "succeeded": merged.succeeded,
        "rejected_429": merged.rejected_429,
        "failed": merged.failed,
        "success_rate": success_rate,
        "rejection_rate": rejection_rate,
        "latency_p50_ms": percentile(&mut merged.latencies.clone(), 0.50) * 1000.0,
        "latency_p95_ms": percentile(&mut merged.latencies.clone(), 0.95) * 1000.0,
        "ttft_p95_ms": percentile(&mut merged.ttft_values.clone(), 0.95) * 1000.0,
        "tpot_avg_ms": tpot_avg_ms,
    });
    println!("{}", serde_json::to_string_pretty(&report).unwrap());
}
