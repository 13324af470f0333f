//! Subscription table: `type -> group -> members`, driving one-per-group
//! fan-out.
//!
//! Group membership is capped low by configuration upstream, so the
//! existence scan on subscribe is a linear walk over a short list. Entries
//! are created lazily and cascade-deleted: an empty group removes itself,
//! and a type with no groups left removes its entry too.

use std::collections::HashMap;
use std::sync::RwLock;

use ahash::RandomState;
use rand::Rng;

/// One `(nid, sid)` group member. The `nid` is a reference into the route
/// table, not an ownership link: a member may outlive every route to its
/// node, and publish treats that as an expected drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub nid: u32,
    pub sid: u64,
}

type Groups = HashMap<u32, Vec<Member>, RandomState>;

pub struct SubscriptionTable {
    inner: RwLock<HashMap<u32, Groups, RandomState>>,
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::default()),
        }
    }

    /// Add `(nid, sid)` to the group `gid` under `topic`. Appending an
    /// already-present member is a no-op.
    pub fn subscribe(&self, topic: u32, gid: u32, nid: u32, sid: u64) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let members = map
            .entry(topic)
            .or_default()
            .entry(gid)
            .or_default();
        let member = Member { nid, sid };
        if !members.contains(&member) {
            members.push(member);
        }
    }

    /// Remove `(nid, sid)` from the group. Idempotent: unsubscribing a
    /// non-member leaves the table unchanged. Empty groups and then empty
    /// type entries are deleted on the way out.
    pub fn unsubscribe(&self, topic: u32, gid: u32, nid: u32, sid: u64) {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let Some(groups) = map.get_mut(&topic) else {
            return;
        };
        if let Some(members) = groups.get_mut(&gid) {
            let member = Member { nid, sid };
            if let Some(i) = members.iter().position(|m| *m == member) {
                members.swap_remove(i);
            }
            if members.is_empty() {
                groups.remove(&gid);
            }
        }
        if groups.is_empty() {
            map.remove(&topic);
        }
    }

    /// Select exactly one member, uniformly at random, from every group
    /// under `topic`. One publish yields at most one delivery attempt per
    /// group; whether the chosen member is actually routable is the
    /// caller's problem.
    pub fn pick_one_per_group<R: Rng>(&self, topic: u32, rng: &mut R) -> Vec<Member> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(groups) = map.get(&topic) else {
            return Vec::new();
        };
        groups
            .values()
            .filter(|members| !members.is_empty())
            .map(|members| members[rng.gen_range(0..members.len())])
            .collect()
    }

    pub fn group_count(&self, topic: u32) -> usize {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(&topic).map_or(0, HashMap::len)
    }

    pub fn topic_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}
