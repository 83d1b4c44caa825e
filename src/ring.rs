//!
//! Consistent-hash ring
//! --------------------
//! Distributes keys over the configured peer servers. Each node is inserted
//! `replicas` times under `xxh32(node || replica_index)`; a key maps to the
//! first ring entry at or after its own hash, wrapping at the end. The
//! backup node is the next *distinct* node on the ring, so primary and
//! backup always differ when at least two nodes are present.

use std::collections::BTreeMap;

use xxhash_rust::xxh32::xxh32;

pub const DEFAULT_RING_REPLICAS: u32 = 2;

/// 32-bit key hash shared by the ring and its tests.
pub fn hash32(key: &str) -> u32 {
    xxh32(key.as_bytes(), 0)
}

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    ring: BTreeMap<u32, String>,
    replicas: u32,
}

impl HashRing {
    pub fn new(replicas: u32) -> Self {
        HashRing {
            ring: BTreeMap::new(),
            replicas: replicas.max(1),
        }
    }

    pub fn add_node(&mut self, node: &str) {
        for replica in 0..self.replicas {
            self.ring.insert(hash32(&format!("{node}{replica}")), node.to_string());
        }
    }

    pub fn remove_node(&mut self, node: &str) {
        self.ring.retain(|_, n| n != node);
    }

    pub fn clear(&mut self) {
        self.ring.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of distinct nodes on the ring.
    pub fn len(&self) -> usize {
        let mut nodes: Vec<&str> = self.ring.values().map(|s| s.as_str()).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes.len()
    }

    /// The node responsible for `key`: first ring entry >= hash(key),
    /// wrapping around to the start.
    pub fn get_node(&self, key: &str) -> Option<&str> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash32(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.as_str())
    }

    /// The next distinct node after the primary, or `None` when the ring
    /// holds fewer than two distinct nodes.
    pub fn get_backup_node(&self, key: &str) -> Option<&str> {
        let primary = self.get_node(key)?;
        let hash = hash32(key);
        let after = self.ring.range(hash..).map(|(_, n)| n);
        let wrapped = self.ring.values();
        for node in after.chain(wrapped) {
            if node != primary {
                return Some(node.as_str());
            }
        }
        None
    }
}
