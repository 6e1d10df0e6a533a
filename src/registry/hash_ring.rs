//! Consistent-hash ring with virtual nodes, used by the router's default
//! selection policy. The ring is rebuilt whenever the registry publishes a
//! new generation; it is never mutated in place.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::xxh3_64;

/// A consistent-hash ring over a fixed key space (`u64`). Each backend owns
/// `virtual_nodes` points on the ring so that adding or removing one backend
/// remaps only a small, bounded fraction of keys.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    virtual_nodes: usize,
    ring: BTreeMap<u64, String>,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: BTreeMap::new(),
        }
    }

    pub fn build(virtual_nodes: usize, backend_ids: impl IntoIterator<Item = String>) -> Self {
        let mut ring = Self::new(virtual_nodes);
        for id in backend_ids {
            ring.add_backend(&id);
        }
        ring
    }

    pub fn add_backend(&mut self, backend_id: &str) {
        for vnode in 0..self.virtual_nodes {
            let point = hash_key(&format!("{backend_id}#{vnode}"));
            self.ring.insert(point, backend_id.to_string());
        }
    }

    pub fn remove_backend(&mut self, backend_id: &str) {
        self.ring.retain(|_, id| id != backend_id);
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Locate the first backend clockwise of `key`'s hash whose id is in
    /// `candidates`, wrapping around the ring exactly once.
    pub fn locate(&self, key: &str, candidates: &[String]) -> Option<String> {
        if self.ring.is_empty() || candidates.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        let from_point = self
            .ring
            .range(hash..)
            .map(|(_, id)| id.clone())
            .chain(self.ring.values().cloned())
            .find(|id| candidates.contains(id));
        from_point
    }
}

pub fn hash_key(key: &str) -> u64 {
    xxh3_64(key.as_bytes())
}
