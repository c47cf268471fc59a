//! Deduplication of concurrent request ids.

use std::collections::HashSet;

use tokio::sync::Mutex;

/// Tracks in-flight request ids to prevent concurrent collisions. Membership
/// test and insert are atomic with respect to each other.
#[derive(Default)]
pub struct InflightRequestRegistry {
    active: Mutex<HashSet<String>>,
}

impl InflightRequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly once per contiguous in-flight window for
    /// `request_id`; a concurrent duplicate claim returns `false`.
    pub async fn claim(&self, request_id: &str) -> bool {
        let mut active = self.active.lock().await;
        if active.contains(request_id) {
            return false;
        }
        active.insert(request_id.to_string());
        true
    }

    pub async fn release(&self, request_id: &str) {
        let mut active = self.active.lock().await;
        active.remove(request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn claim_then_release_allows_reclaim() {
        let registry = InflightRequestRegistry::new();
        assert!(registry.claim("req-1").await);
        assert!(!registry.claim("req-1").await);
        registry.release("req-1").await;
        assert!(registry.claim("req-1").await);
    }

    #[tokio::test]
    async fn release_of_unknown_id_is_noop() {
        let registry = InflightRequestRegistry::new();
        registry.release("never-claimed").await;
    }

    #[tokio::test]
    async fn concurrent_claims_of_same_id_exactly_one_wins() {
        let registry = Arc::new(InflightRequestRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.claim("contended").await }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
