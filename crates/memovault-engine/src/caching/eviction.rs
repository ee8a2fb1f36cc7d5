//! Adaptive eviction for the durable tier.
//!
//! An ARC-style policy (Megiddo & Modha, FAST '03): two resident lists — T1
//! for entries seen once (recency), T2 for entries seen again (frequency) —
//! and two ghost lists B1/B2 remembering recently evicted keys. A hit in a
//! ghost list adapts the target size `p` of T1, steering capacity towards
//! whichever list the workload currently rewards.
//!
//! The index tracks bookkeeping only; entry payloads live in the durable
//! store. `admit` returns the keys whose payloads the caller must delete.
//! Eviction never blocks correctness: an evicted entry is a future miss.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

pub(crate) type IndexKey = Arc<[u8]>;

/// Bookkeeping for one resident entry.
#[derive(Debug, Clone)]
pub(crate) struct EntryMeta {
    /// Payload size in the durable store.
    pub bytes: u64,
    /// Tracked dependency inputs (`Local` entries only).
    pub deps: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct ArcIndex {
    /// Resident entry budget.
    capacity: usize,
    /// Resident byte budget.
    max_bytes: u64,
    /// Adaptive target size for T1.
    p: usize,
    t1: VecDeque<IndexKey>,
    t2: VecDeque<IndexKey>,
    b1: VecDeque<IndexKey>,
    b2: VecDeque<IndexKey>,
    resident: FxHashMap<IndexKey, EntryMeta>,
    total_bytes: u64,
    dep_index: FxHashMap<String, FxHashSet<IndexKey>>,
}

fn remove_key(list: &mut VecDeque<IndexKey>, key: &[u8]) -> bool {
    match list.iter().position(|k| **k == *key) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

impl ArcIndex {
    pub fn new(capacity: usize, max_bytes: u64) -> Self {
        ArcIndex {
            capacity: capacity.max(1),
            max_bytes,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            resident: FxHashMap::default(),
            total_bytes: 0,
            dep_index: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.resident.len()
    }

    pub fn bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.resident.contains_key(key)
    }

    pub fn keys(&self) -> Vec<IndexKey> {
        self.resident.keys().cloned().collect()
    }

    pub fn keys_depending_on(&self, input: &str) -> Vec<IndexKey> {
        self.dep_index
            .get(input)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a hit on a resident entry: promote it into the frequency list.
    pub fn touch(&mut self, key: &[u8]) {
        if remove_key(&mut self.t1, key) || remove_key(&mut self.t2, key) {
            let key = self
                .resident
                .get_key_value(key)
                .map(|(k, _)| k.clone())
                .expect("touched key must be resident");
            self.t2.push_back(key);
        }
    }

    /// Admit an entry, running the ARC REQUEST algorithm. Returns the keys
    /// evicted to make room; the caller deletes their payloads.
    pub fn admit(&mut self, key: IndexKey, meta: EntryMeta) -> Vec<IndexKey> {
        let mut victims = Vec::new();

        if self.resident.contains_key(&key) {
            self.touch(&key);
            self.update_meta(&key, meta);
            self.enforce_byte_budget(&mut victims);
            return victims;
        }

        if self.b1.iter().any(|k| *k == key) {
            // Ghost hit in the recency history: grow T1's target.
            let delta = (self.b2.len() / self.b1.len().max(1)).max(1);
            self.p = (self.p + delta).min(self.capacity);
            self.replace(false, &mut victims);
            remove_key(&mut self.b1, &key);
            self.insert_resident(key, meta, true);
        } else if self.b2.iter().any(|k| *k == key) {
            // Ghost hit in the frequency history: shrink T1's target.
            let delta = (self.b1.len() / self.b2.len().max(1)).max(1);
            self.p = self.p.saturating_sub(delta);
            self.replace(true, &mut victims);
            remove_key(&mut self.b2, &key);
            self.insert_resident(key, meta, true);
        } else {
            let l1 = self.t1.len() + self.b1.len();
            if l1 == self.capacity {
                if self.t1.len() < self.capacity {
                    self.b1.pop_front();
                    self.replace(false, &mut victims);
                } else if let Some(victim) = self.t1.pop_front() {
                    // B1 is empty; drop the T1 LRU without a ghost.
                    self.evict_resident(&victim);
                    victims.push(victim);
                }
            } else {
                let total = l1 + self.t2.len() + self.b2.len();
                if total >= self.capacity {
                    if total == 2 * self.capacity {
                        self.b2.pop_front();
                    }
                    self.replace(false, &mut victims);
                }
            }
            self.insert_resident(key, meta, false);
        }

        self.enforce_byte_budget(&mut victims);
        self.trim_ghosts();
        victims
    }

    /// Drop an entry outright (explicit invalidation).
    pub fn remove(&mut self, key: &[u8]) -> bool {
        if self.resident.contains_key(key) {
            remove_key(&mut self.t1, key);
            remove_key(&mut self.t2, key);
            self.evict_resident_by(key);
            true
        } else {
            remove_key(&mut self.b1, key) || remove_key(&mut self.b2, key)
        }
    }

    /// The ARC REPLACE step: demote one resident entry into a ghost list.
    fn replace(&mut self, ghost_hit_in_b2: bool, victims: &mut Vec<IndexKey>) {
        let from_t1 = !self.t1.is_empty()
            && (self.t1.len() > self.p || (ghost_hit_in_b2 && self.t1.len() == self.p));

        let demoted = if from_t1 {
            self.t1.pop_front().map(|victim| {
                self.b1.push_back(victim.clone());
                victim
            })
        } else if let Some(victim) = self.t2.pop_front() {
            self.b2.push_back(victim.clone());
            Some(victim)
        } else {
            // T2 is empty and T1 is within target; fall back to T1.
            self.t1.pop_front().map(|victim| {
                self.b1.push_back(victim.clone());
                victim
            })
        };

        if let Some(victim) = demoted {
            self.evict_resident(&victim);
            victims.push(victim);
        }
    }

    fn enforce_byte_budget(&mut self, victims: &mut Vec<IndexKey>) {
        while self.total_bytes > self.max_bytes && !self.resident.is_empty() {
            let before = self.resident.len();
            self.replace(false, victims);
            if self.resident.len() == before {
                break;
            }
        }
    }

    fn trim_ghosts(&mut self) {
        while self.b1.len() > self.capacity {
            self.b1.pop_front();
        }
        while self.b2.len() > self.capacity {
            self.b2.pop_front();
        }
    }

    fn insert_resident(&mut self, key: IndexKey, meta: EntryMeta, frequent: bool) {
        self.total_bytes += meta.bytes;
        for dep in &meta.deps {
            self.dep_index
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        if frequent {
            self.t2.push_back(key.clone());
        } else {
            self.t1.push_back(key.clone());
        }
        self.resident.insert(key, meta);
    }

    fn update_meta(&mut self, key: &IndexKey, meta: EntryMeta) {
        if let Some(old) = self.resident.get(key) {
            self.total_bytes = self.total_bytes - old.bytes + meta.bytes;
            for dep in &old.deps.clone() {
                if let Some(keys) = self.dep_index.get_mut(dep) {
                    keys.remove(key);
                }
            }
        }
        for dep in &meta.deps {
            self.dep_index
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        self.resident.insert(key.clone(), meta);
    }

    fn evict_resident(&mut self, key: &IndexKey) {
        self.evict_resident_by(key);
    }

    fn evict_resident_by(&mut self, key: &[u8]) {
        if let Some((key, meta)) = self.resident.remove_entry(key) {
            self.total_bytes -= meta.bytes;
            for dep in &meta.deps {
                if let Some(keys) = self.dep_index.get_mut(dep) {
                    keys.remove(&key);
                    if keys.is_empty() {
                        self.dep_index.remove(dep);
                    }
                }
            }
        }
    }
}
