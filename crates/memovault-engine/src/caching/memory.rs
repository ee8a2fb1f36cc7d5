//! The in-memory identity tier (L1).
//!
//! A concurrent map from [`IdentityKey`] to cached force outcomes, scoped to
//! one evaluation run. Lookup happens before any content hashing — this is
//! the fast path for forcing a structurally identical thunk more than once
//! within a run.
//!
//! Entries hold a weak reference to the cell they were produced for. When the
//! backing object has been reclaimed, the mapping is dropped on the next
//! lookup rather than lingering until its epoch mismatches, bounding memory
//! retention. The memory manager's reclaim notifications remove mappings
//! proactively via predicate invalidation.

use std::sync::{Arc, Weak};

use memovault_values::{EvalError, ObjectId, Value, ValueCell, ValueRef};

use crate::config::InMemoryCacheConfig;
use crate::durability::Classification;
use crate::epoch::Epoch;
use crate::stats::CacheStats;

use super::IdentityKey;

/// One memoized force outcome together with its durability verdict.
#[derive(Debug, Clone)]
pub struct CachedForce {
    pub outcome: Result<Value, EvalError>,
    pub classification: Classification,
}

#[derive(Clone)]
struct L1Entry {
    cached: CachedForce,
    /// The cell this outcome was produced for. A dead anchor means the
    /// backing object was reclaimed and the mapping is stale.
    anchor: Weak<ValueCell>,
}

pub struct MemoryCache {
    cache: moka::sync::Cache<IdentityKey, L1Entry>,
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

/// Rough cost of keeping an outcome in memory, in bytes. The bookkeeping
/// structures are counted into the weight as well.
fn entry_weight(entry: &L1Entry) -> u32 {
    let value_weight = match &entry.cached.outcome {
        Ok(value) => value_estimate(value),
        Err(_) => std::mem::size_of::<EvalError>() as u32,
    };
    let deps = entry.cached.classification.deps.len() as u32 * 64;
    std::mem::size_of::<(IdentityKey, L1Entry)>() as u32 + value_weight + deps
}

fn value_estimate(value: &Value) -> u32 {
    let payload = match value {
        Value::Text(text) => text.content().len() + text.context().len() * 16,
        Value::List(items) => items.len() * 16,
        Value::Attrs(bindings) => bindings.len() * 32,
        Value::PrimOpPartial(partial) => partial.args.len() * 16,
        _ => 0,
    };
    std::mem::size_of::<Value>() as u32 + payload as u32
}

impl MemoryCache {
    pub fn new(config: &InMemoryCacheConfig, stats: Arc<CacheStats>) -> Self {
        let eviction_stats = Arc::clone(&stats);
        let mut builder = moka::sync::Cache::builder()
            .name("memovault-identity")
            .max_capacity(config.max_capacity)
            .support_invalidation_closures()
            .weigher(|_key, entry: &L1Entry| entry_weight(entry))
            .eviction_listener(move |_key, _entry, cause| {
                use moka::notification::RemovalCause;
                if matches!(cause, RemovalCause::Size | RemovalCause::Expired) {
                    eviction_stats.count_memory_eviction();
                }
            });
        if let Some(tti) = config.time_to_idle {
            builder = builder.time_to_idle(tti);
        }

        MemoryCache {
            cache: builder.build(),
        }
    }

    pub fn get(&self, key: &IdentityKey) -> Option<CachedForce> {
        let entry = self.cache.get(key)?;
        if entry.anchor.upgrade().is_none() {
            // Backing object reclaimed; disappear the mapping proactively.
            self.cache.invalidate(key);
            return None;
        }
        Some(entry.cached)
    }

    pub fn insert(&self, key: IdentityKey, cached: CachedForce, anchor: &ValueRef) {
        self.cache.insert(
            key,
            L1Entry {
                cached,
                anchor: Arc::downgrade(anchor),
            },
        );
    }

    /// Drop every entry minted under an older epoch. The whole tier is cheap
    /// to rebuild, so trading it for aliasing safety is acceptable.
    pub fn purge_stale(&self, current: Epoch) {
        if let Err(error) = self
            .cache
            .invalidate_entries_if(move |key, _| key.epoch != current)
        {
            tracing::warn!(%error, "failed to purge stale identity entries");
        }
    }

    /// Drop every entry whose dependency set references the changed input.
    pub fn invalidate_dependency(&self, input: &str) {
        let input = input.to_owned();
        if let Err(error) = self.cache.invalidate_entries_if(move |_, entry| {
            entry
                .cached
                .classification
                .deps
                .iter()
                .any(|dep| dep.input == input)
        }) {
            tracing::warn!(%error, "failed to invalidate dependent identity entries");
        }
    }

    /// Reclaim notification: drop every entry keyed by this environment.
    pub fn drop_object(&self, id: ObjectId) {
        if let Err(error) = self.cache.invalidate_entries_if(move |key, _| key.env == id) {
            tracing::warn!(%error, "failed to drop reclaimed object's entries");
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush pending maintenance so counts and invalidations are visible.
    #[cfg(test)]
    pub fn sync(&self) {
        self.cache.run_pending_tasks();
    }
}
