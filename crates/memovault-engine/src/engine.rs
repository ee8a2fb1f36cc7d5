//! The engine facade driven by the evaluator.
//!
//! [`Engine::force`] orchestrates one force end to end: cell fast path, L1 by
//! identity, content key, L2 by content, then claim-and-compute with effect
//! tracking, tier insertion and waiter release. The evaluator reports reads
//! of external state through [`Engine::record_effect`] while computing, and
//! brackets try/catch-like contexts with
//! [`push_try_context`](Engine::push_try_context) /
//! [`pop_try_context`](Engine::pop_try_context) so error-context-sensitive
//! results never leak across catch boundaries.

use std::cell::Cell;
use std::io;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;

use memovault_values::{EvalError, ObjectId, Peek, Thunk, Value, ValueRef};

use crate::caching::{
    CacheError, CachedForce, ContentCache, ContentKey, DurableStore, FilesystemStore, IdentityKey,
    MemoryCache,
};
use crate::config::Config;
use crate::durability::{self, Classification, Durability, EffectKind};
use crate::epoch::{Epoch, EpochCoordinator};
use crate::force::{self, ForcePolicy};
use crate::stats::{CacheStats, CacheStatsSnapshot};

thread_local! {
    /// Nesting depth of try/error-catching contexts on this thread.
    static TRY_DEPTH: Cell<u32> = const { Cell::new(0) };
}

fn try_depth() -> u32 {
    TRY_DEPTH.with(|depth| depth.get())
}

pub struct Engine {
    policy: ForcePolicy,
    memory: MemoryCache,
    durable: Option<ContentCache>,
    epochs: EpochCoordinator,
    stats: Arc<CacheStats>,
    /// Durability verdicts for cells forced through this engine, so a later
    /// re-read of an already-forced cell still taints its consumers
    /// correctly. Entries are dropped on reclaim notifications.
    forced_meta: Mutex<FxHashMap<ObjectId, Classification>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("memory", &self.memory)
            .field("durable", &self.durable)
            .field("epoch", &self.epochs.current())
            .finish()
    }
}

impl Engine {
    /// Build an engine from configuration, using the filesystem store under
    /// `cache_dir` for the durable tier (or no durable tier when unset).
    pub fn new(config: &Config) -> io::Result<Self> {
        let store = match &config.cache_dir {
            Some(dir) => Some(Box::new(FilesystemStore::new(dir)?) as Box<dyn DurableStore>),
            None => None,
        };
        Ok(Self::with_store(config, store))
    }

    /// Build an engine over a custom durable store backend.
    pub fn with_store(config: &Config, store: Option<Box<dyn DurableStore>>) -> Self {
        let stats = Arc::new(CacheStats::default());
        let durable = store
            .map(|store| ContentCache::new(store, &config.caches.durable, Arc::clone(&stats)));
        Engine {
            policy: ForcePolicy {
                cheap_duplicate_eval: config.cheap_thunk_fast_path,
            },
            memory: MemoryCache::new(&config.caches.in_memory, Arc::clone(&stats)),
            durable,
            epochs: EpochCoordinator::new(),
            stats,
            forced_meta: Mutex::new(FxHashMap::default()),
        }
    }

    /// Force a cell, computing through `eval` only on a miss in every tier.
    ///
    /// The result's durability classification is folded into the enclosing
    /// force, if any: a composite is as durable as its least durable
    /// constituent.
    pub fn force<F>(&self, cell: &ValueRef, eval: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&Thunk) -> Result<Value, EvalError>,
    {
        self.force_inner(cell, eval, true)
    }

    /// Force a cell purely for its effects (`seq`-like strictness).
    ///
    /// The forced value's durability does not taint the enclosing force;
    /// only the returned value's own durability propagates to whoever
    /// actually demands it.
    pub fn force_for_effect<F>(&self, cell: &ValueRef, eval: F) -> Result<Value, EvalError>
    where
        F: FnOnce(&Thunk) -> Result<Value, EvalError>,
    {
        self.force_inner(cell, eval, false)
    }

    fn force_inner<F>(&self, cell: &ValueRef, eval: F, demanded: bool) -> Result<Value, EvalError>
    where
        F: FnOnce(&Thunk) -> Result<Value, EvalError>,
    {
        self.stats.count_access();

        // 1. The cell itself: in-place replacement is the innermost memo.
        match cell.peek() {
            Peek::Forced(value) => {
                if demanded {
                    durability::absorb_into_current(&self.classification_for(cell.id()));
                }
                return Ok(value);
            }
            Peek::Failed(error) => {
                if demanded {
                    durability::absorb_into_current(&self.classification_for(cell.id()));
                }
                return Err(error);
            }
            Peek::Pending { .. } => {}
        }

        let Some(thunk) = cell.peek_thunk() else {
            // Raced against a concurrent publish; the cell is ready now.
            return self.force_inner(cell, eval, demanded);
        };

        // 2. L1 by identity: the common case of forcing a structurally
        // identical thunk again within this run.
        let identity_key = IdentityKey::new(&thunk, self.epochs.current());
        if let Some(cached) = self.memory.get(&identity_key) {
            self.stats.count_memory_hit();
            return self.finish_from_cache(cell, cached, demanded);
        }

        // 3. Content key, only worth computing when a durable tier exists.
        // An unforced thunk in the environment makes the key unavailable,
        // which routes this force past the durable tier entirely.
        let content_key = self
            .durable
            .as_ref()
            .and_then(|_| ContentKey::compute(&thunk, try_depth()).ok());

        // 4. L2 by content.
        if let (Some(durable), Some(key)) = (self.durable.as_ref(), content_key.as_ref()) {
            if let Some(cached) = durable.lookup(key) {
                self.stats.count_durable_hit();
                self.memory.insert(identity_key, cached.clone(), cell);
                return self.finish_from_cache(cell, cached, demanded);
            }
        }

        // 5. Claim and compute. Everything inside the closure runs only on
        // the winning evaluator; losers wait and observe the published
        // outcome.
        let mut winner_classification = None;
        let outcome = force::force(cell, &self.policy, |thunk| {
            self.stats.count_computation();
            let (result, classification) = durability::with_frame(|| eval(thunk));
            self.store_result(cell, identity_key, content_key.as_ref(), &result, &classification);
            winner_classification = Some(classification);
            result
        });

        let classification = match winner_classification {
            Some(classification) => classification,
            None => self.classification_for(cell.id()),
        };
        if demanded {
            durability::absorb_into_current(&classification);
        }
        outcome
    }

    /// Publish a cached outcome into the cell and fold its classification.
    fn finish_from_cache(
        &self,
        cell: &ValueRef,
        cached: CachedForce,
        demanded: bool,
    ) -> Result<Value, EvalError> {
        self.remember_meta(cell.id(), &cached.classification);
        if demanded {
            durability::absorb_into_current(&cached.classification);
        }
        let outcome = cached.outcome;
        force::force(cell, &self.policy, move |_| outcome)
    }

    /// Insert a freshly computed result into the tiers its durability allows.
    fn store_result(
        &self,
        cell: &ValueRef,
        identity_key: IdentityKey,
        content_key: Option<&ContentKey>,
        outcome: &Result<Value, EvalError>,
        classification: &Classification,
    ) {
        // Recorded even for volatile results: later re-reads of the forced
        // cell must still taint their consumers.
        self.remember_meta(cell.id(), classification);

        if classification.durability < Durability::Local {
            // Volatile results are never cached, not even within this run;
            // the owning cell's in-place result is the only memo they get.
            return;
        }

        self.memory.insert(
            identity_key,
            CachedForce {
                outcome: outcome.clone(),
                classification: classification.clone(),
            },
            cell,
        );

        if let (Some(durable), Some(key)) = (self.durable.as_ref(), content_key) {
            match durable.insert(key, outcome, classification) {
                Ok(()) => {}
                Err(CacheError::Unserializable(kind)) => {
                    self.stats.count_unserializable();
                    tracing::debug!(kind, "suppressing durable write");
                }
                Err(CacheError::Collision) => {
                    self.stats.count_collision();
                    tracing::error!(%key, "refusing to overwrite colliding entry");
                }
                Err(error) => {
                    tracing::warn!(%key, %error, "durable cache write failed");
                }
            }
        }
    }

    fn remember_meta(&self, id: ObjectId, classification: &Classification) {
        self.forced_meta
            .lock()
            .expect("meta mutex poisoned")
            .entry(id)
            .or_insert_with(|| classification.clone());
    }

    fn classification_for(&self, id: ObjectId) -> Classification {
        self.forced_meta
            .lock()
            .expect("meta mutex poisoned")
            .get(&id)
            .cloned()
            .unwrap_or_else(Classification::portable)
    }

    /// Report a read of external mutable state performed by the innermost
    /// in-flight force on this thread.
    pub fn record_effect(&self, effect: EffectKind) {
        durability::record_effect(effect);
    }

    /// Enter an error-catching context. Content keys computed inside embed
    /// the context depth, so results that observed an error are never reused
    /// at a different catch depth.
    pub fn push_try_context(&self) {
        TRY_DEPTH.with(|depth| depth.set(depth.get() + 1));
    }

    /// Leave an error-catching context.
    pub fn pop_try_context(&self) {
        TRY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }

    /// The memory manager's per-collection-cycle callback. Stale identity
    /// keys become unreachable immediately; their entries are purged.
    pub fn collection_started(&self) -> Epoch {
        let epoch = self.epochs.collection_started();
        self.memory.purge_stale(epoch);
        epoch
    }

    /// The memory manager's "object about to be reclaimed" notification.
    pub fn object_reclaimed(&self, id: ObjectId) {
        self.memory.drop_object(id);
        self.forced_meta
            .lock()
            .expect("meta mutex poisoned")
            .remove(&id);
    }

    pub fn current_epoch(&self) -> Epoch {
        self.epochs.current()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drop every `Local` cache entry depending on the changed input, in
    /// both tiers. Portable entries depend on nothing local and are never
    /// touched.
    pub fn invalidate_dependency(&self, input: &str) -> usize {
        self.memory.invalidate_dependency(input);
        match &self.durable {
            Some(durable) => durable.invalidate_dependency(input),
            None => 0,
        }
    }

    /// Bulk export of portable durable entries for migration.
    pub fn export_portable(&self) -> Vec<(Vec<u8>, bytes::Bytes)> {
        match &self.durable {
            Some(durable) => durable.export_portable(),
            None => Vec::new(),
        }
    }

    /// Bulk import of previously exported entries.
    pub fn import_portable(
        &self,
        entries: impl IntoIterator<Item = (Vec<u8>, bytes::Bytes)>,
    ) -> usize {
        match &self.durable {
            Some(durable) => durable.import_portable(entries),
            None => 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &MemoryCache {
        &self.memory
    }
}
