//! The five routing policies the router may apply to a filtered candidate
//! set (§4.3 step 5).

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;

use crate::registry::hash_ring::HashRing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingPolicy {
    ConsistentHash,
    LeastConnections,
    RoundRobin,
    Random,
    WeightedRandom,
}

impl RoutingPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "least_connections" => Self::LeastConnections,
            "round_robin" => Self::RoundRobin,
            "random" => Self::Random,
            "weighted_random" => Self::WeightedRandom,
            _ => Self::ConsistentHash,
        }
    }
}

/// Process-wide round-robin counter, shared across all snapshots (mirrors
/// the reference router's per-process atomic counter).
static ROUND_ROBIN_COUNTER: AtomicUsize = AtomicUsize::new(0);

pub fn select(
    policy: RoutingPolicy,
    routing_key: &str,
    candidates: &[String],
    hash_ring: &HashRing,
    connection_counts: &DashMap<String, std::sync::atomic::AtomicUsize>,
    weights: &DashMap<String, u32>,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    if candidates.len() == 1 {
        return Some(candidates[0].clone());
    }
    match policy {
        RoutingPolicy::ConsistentHash => hash_ring
            .locate(routing_key, candidates)
            .or_else(|| candidates.first().cloned()),
        RoutingPolicy::LeastConnections => {
            let mut rng = rand::thread_rng();
            let pair: Vec<&String> = candidates.choose_multiple(&mut rng, 2.min(candidates.len())).collect();
            pair.into_iter()
                .min_by_key(|id| {
                    connection_counts
                        .get(id.as_str())
                        .map(|c| c.load(Ordering::Relaxed))
                        .unwrap_or(0)
                })
                .cloned()
        }
        RoutingPolicy::RoundRobin => {
            let idx = ROUND_ROBIN_COUNTER.fetch_add(1, Ordering::Relaxed) % candidates.len();
            Some(candidates[idx].clone())
        }
        RoutingPolicy::Random => {
            let mut rng = rand::thread_rng();
            candidates.choose(&mut rng).cloned()
        }
        RoutingPolicy::WeightedRandom => {
            let ws: Vec<u32> = candidates
                .iter()
                .map(|id| weights.get(id.as_str()).map(|w| *w).unwrap_or(1).max(1))
                .collect();
            let dist = WeightedIndex::new(&ws).ok()?;
            let mut rng = rand::thread_rng();
            Some(candidates[dist.sample(&mut rng)].clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_candidates() {
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ring = HashRing::new(10);
        let counts = DashMap::new();
        let weights = DashMap::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let picked = select(
                RoutingPolicy::RoundRobin,
                "k",
                &candidates,
                &ring,
                &counts,
                &weights,
            )
            .unwrap();
            seen.insert(picked);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn least_connections_prefers_idle_backend() {
        let candidates = vec!["busy".to_string(), "idle".to_string()];
        let ring = HashRing::new(10);
        let counts = DashMap::new();
        counts.insert("busy".to_string(), std::sync::atomic::AtomicUsize::new(50));
        counts.insert("idle".to_string(), std::sync::atomic::AtomicUsize::new(0));
        let weights = DashMap::new();
        for _ in 0..20 {
            let picked = select(
                RoutingPolicy::LeastConnections,
                "k",
                &candidates,
                &ring,
                &counts,
                &weights,
            )
            .unwrap();
            assert_eq!(picked, "idle");
        }
    }

    #[test]
    fn single_candidate_always_selected() {
        let candidates = vec!["only".to_string()];
        let ring = HashRing::new(10);
        let counts = DashMap::new();
        let weights = DashMap::new();
        for policy in [
            RoutingPolicy::ConsistentHash,
            RoutingPolicy::LeastConnections,
            RoutingPolicy::RoundRobin,
            RoutingPolicy::Random,
            RoutingPolicy::WeightedRandom,
        ] {
            assert_eq!(
                select(policy, "k", &candidates, &ring, &counts, &weights),
                Some("only".to_string())
            );
        }
    }

    #[test]
    fn weighted_random_never_selects_zero_weight_when_alternative_exists() {
        let candidates = vec!["heavy".to_string(), "light".to_string()];
        let ring = HashRing::new(10);
        let counts = DashMap::new();
        let weights = DashMap::new();
        weights.insert("heavy".to_string(), 1000);
        weights.insert("light".to_string(), 1);
        let mut heavy_count = 0;
        for _ in 0..200 {
            if select(RoutingPolicy::WeightedRandom, "k", &candidates, &ring, &counts, &weights)
                == Some("heavy".to_string())
            {
                heavy_count += 1;
            }
        }
        assert!(heavy_count > 150, "heavy_count={heavy_count}");
    }
}
