//! Deterministic, length-derived token estimation.
//!
//! This is the authoritative definition of "token count" across the core —
//! the context window optimizer, rate limiter, and KV estimator all defer to
//! it rather than running their own heuristics.

/// `max(1, ceil(len(text) / chars_per_token))`, or 0 for an empty string.
pub fn estimate_tokens(text: &str, chars_per_token: f64) -> u32 {
    if text.is_empty() {
        return 0;
    }
    let estimate = (text.chars().count() as f64 / chars_per_token).ceil();
    estimate.max(1.0) as u32
}
