//! Node-route table: which local link slots can currently reach a node.
//!
//! Reads (every directed send) vastly outnumber writes (connect/disconnect),
//! so the whole table sits behind a single read-write lock and every
//! operation stays O(1) amortized. Callers receive a copy of the selected
//! slot id, never a reference into the table.

use std::collections::HashMap;
use std::sync::RwLock;

use ahash::RandomState;
use rand::Rng;

/// `nid -> bounded list of local link slots`.
pub struct NodeRouteTable {
    inner: RwLock<HashMap<u32, Vec<u64>, RandomState>>,
    slots_per_node: usize,
}

impl NodeRouteTable {
    pub fn new(slots_per_node: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
            slots_per_node,
        }
    }

    /// Register `slot` as a route to `nid`. Idempotent; returns `false` only
    /// when the per-node slot list is already at capacity.
    pub fn add(&self, nid: u32, slot: u64) -> bool {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let slots = map.entry(nid).or_default();
        if slots.contains(&slot) {
            return true;
        }
        if slots.len() >= self.slots_per_node {
            return false;
        }
        slots.push(slot);
        true
    }

    /// Drop one `(nid, slot)` association. Removing the last slot removes the
    /// node entry entirely, so a later `pick` reports the node as unroutable
    /// rather than returning a stale slot.
    pub fn remove(&self, nid: u32, slot: u64) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slots) = map.get_mut(&nid) {
            if let Some(i) = slots.iter().position(|s| *s == slot) {
                slots.swap_remove(i);
            }
            if slots.is_empty() {
                map.remove(&nid);
            }
        }
    }

    /// Uniformly pick one live slot for `nid`.
    pub fn pick<R: Rng>(&self, nid: u32, rng: &mut R) -> Option<u64> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let slots = map.get(&nid)?;
        debug_assert!(!slots.is_empty());
        Some(slots[rng.gen_range(0..slots.len())])
    }

    pub fn slot_count(&self, nid: u32) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&nid).map_or(0, Vec::len)
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
