use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use memovault_test as test;
use memovault_test::ThunkFactory;
use memovault_values::{EnvFrame, EvalError, Value};

use crate::config::Config;
use crate::durability::{Classification, Durability, EffectKind};
use crate::engine::Engine;
use crate::hasher::Digest;

use super::*;

/// An in-memory durable store double, shareable between engines to model
/// separate runs against the same persistent cache.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<Vec<u8>, Bytes>>,
    fail_reads: Mutex<bool>,
}

impl MemoryStore {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Flip a byte in every stored entry, simulating on-disk corruption.
    pub fn corrupt_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for value in entries.values_mut() {
            let mut bytes = value.to_vec();
            if let Some(byte) = bytes.first_mut() {
                *byte ^= 0xff;
            }
            *value = bytes.into();
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        *self.fail_reads.lock().unwrap() = fail;
    }
}

impl DurableStore for Arc<MemoryStore> {
    fn get(&self, key: &[u8]) -> io::Result<Option<Bytes>> {
        if *self.fail_reads.lock().unwrap() {
            return Err(io::Error::other("injected read failure"));
        }
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Bytes) -> io::Result<()> {
        self.entries.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> io::Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

fn engine_with_store(store: Arc<MemoryStore>) -> Engine {
    Engine::with_store(&Config::default(), Some(Box::new(store)))
}

fn memory_only_engine() -> Engine {
    Engine::with_store(&Config::default(), None)
}

#[test]
fn identity_tier_serves_repeat_forces() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(1);
    let counter = test::EvalCounter::new();

    let first = engine
        .force(&factory.cell(), counter.returning(Value::Int(1)))
        .unwrap();
    let second = engine
        .force(&factory.cell(), counter.returning(Value::Int(1)))
        .unwrap();

    assert_eq!(first.as_int(), Some(1));
    assert_eq!(second.as_int(), Some(1));
    assert_eq!(counter.count(), 1);

    let stats = engine.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.memory_hits, 1);
}

#[test]
fn volatile_results_are_never_cached() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(2);
    let counter = test::EvalCounter::new();

    for _ in 0..2 {
        engine
            .force(&factory.cell(), |thunk| {
                engine.record_effect(EffectKind::Clock);
                counter.returning(Value::Int(1))(thunk)
            })
            .unwrap();
    }

    // Both forces computed: a volatile result does not cross cells even
    // within one run.
    assert_eq!(counter.count(), 2);
}

#[test]
fn durable_tier_survives_into_a_new_engine() {
    test::setup();
    let store = MemoryStore::shared();

    let counter = test::EvalCounter::new();
    {
        let engine = engine_with_store(Arc::clone(&store));
        let factory = ThunkFactory::opaque(3);
        let value = engine
            .force(&factory.cell(), counter.returning(Value::Int(77)))
            .unwrap();
        assert_eq!(value.as_int(), Some(77));
        assert_eq!(engine.stats().computations, 1);
        assert!(store.len() > 0);
    }

    // A separate run: same code shape, fresh code identity, fresh engine.
    // The identity tier cannot help; the content tier must.
    let engine = engine_with_store(Arc::clone(&store));
    let factory = ThunkFactory::opaque(3);
    let value = engine
        .force(&factory.cell(), counter.returning(Value::Int(77)))
        .unwrap();

    assert_eq!(value.as_int(), Some(77));
    assert_eq!(counter.count(), 1);
    assert_eq!(engine.stats().durable_hits, 1);
    assert_eq!(engine.stats().computations, 0);
}

#[test]
fn unforced_environment_slots_skip_the_durable_tier() {
    test::setup();
    let store = MemoryStore::shared();
    let engine = engine_with_store(Arc::clone(&store));

    // The environment contains an unforced thunk, so no portable key exists.
    let pending = ThunkFactory::opaque(10).cell();
    let env = EnvFrame::root(vec![pending]);
    let factory = ThunkFactory::new(test::opaque_shape(4), env);
    let counter = test::EvalCounter::new();

    engine
        .force(&factory.cell(), counter.returning(Value::Int(5)))
        .unwrap();

    // Nothing was persisted, but the identity tier still works.
    assert_eq!(store.len(), 0);
    engine
        .force(&factory.cell(), counter.returning(Value::Int(5)))
        .unwrap();
    assert_eq!(counter.count(), 1);
}

#[test]
fn failures_replay_identically_from_the_cache() {
    test::setup();
    let store = MemoryStore::shared();
    let engine = engine_with_store(Arc::clone(&store));
    let factory = ThunkFactory::opaque(5);
    let counter = test::EvalCounter::new();

    let error = engine
        .force(
            &factory.cell(),
            counter.failing(EvalError::Throw("boom".into())),
        )
        .unwrap_err();

    // Same cell: replayed from the slot. New cell: replayed from L1.
    let replayed = engine
        .force(&factory.cell(), counter.failing(EvalError::Throw("no".into())))
        .unwrap_err();
    assert_eq!(error, replayed);
    assert_eq!(counter.count(), 1);

    // New engine over the same store: replayed from L2, bit for bit.
    let engine = engine_with_store(store);
    let factory = ThunkFactory::opaque(5);
    let replayed = engine
        .force(&factory.cell(), counter.failing(EvalError::Throw("no".into())))
        .unwrap_err();
    assert_eq!(error, replayed);
    assert_eq!(counter.count(), 1);
}

#[test]
fn closures_skip_the_durable_tier_but_not_l1() {
    test::setup();
    let store = MemoryStore::shared();
    let engine = engine_with_store(Arc::clone(&store));
    let factory = ThunkFactory::opaque(6);
    let counter = test::EvalCounter::new();

    let closure = Value::Closure(memovault_values::Closure {
        code: factory.code().clone(),
        env: factory.env().clone(),
    });

    engine
        .force(&factory.cell(), counter.returning(closure.clone()))
        .unwrap();
    assert_eq!(store.len(), 0);
    assert_eq!(engine.stats().unserializable, 1);

    engine
        .force(&factory.cell(), counter.returning(closure))
        .unwrap();
    assert_eq!(counter.count(), 1);
    assert_eq!(engine.stats().memory_hits, 1);
}

#[test]
fn epoch_bump_invalidates_identity_entries() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(7);
    let counter = test::EvalCounter::new();

    engine
        .force(&factory.cell(), counter.returning(Value::Int(1)))
        .unwrap();
    engine.collection_started();
    engine
        .force(&factory.cell(), counter.returning(Value::Int(1)))
        .unwrap();

    assert_eq!(counter.count(), 2);
}

#[test]
fn reclaim_notification_drops_identity_entries() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(8);
    let counter = test::EvalCounter::new();

    engine
        .force(&factory.cell(), counter.returning(Value::Int(1)))
        .unwrap();
    engine.object_reclaimed(factory.env().id());
    engine.memory().sync();

    engine
        .force(&factory.cell(), counter.returning(Value::Int(1)))
        .unwrap();
    assert_eq!(counter.count(), 2);
}

#[test]
fn dependency_invalidation_drops_local_entries() {
    test::setup();
    let store = MemoryStore::shared();
    let engine = engine_with_store(Arc::clone(&store));
    let factory = ThunkFactory::opaque(9);
    let counter = test::EvalCounter::new();

    let force_once = || {
        engine
            .force(&factory.cell(), |thunk| {
                engine.record_effect(EffectKind::FileRead {
                    path: "/input".into(),
                    content_digest: Some(Digest::of(b"v1")),
                });
                counter.returning(Value::Int(1))(thunk)
            })
            .unwrap()
    };

    force_once();
    assert_eq!(counter.count(), 1);

    // Cached while the input is unchanged.
    force_once();
    assert_eq!(counter.count(), 1);

    // The input changed: local entries in both tiers are dropped.
    let dropped = engine.invalidate_dependency("file:/input");
    assert!(dropped > 0);
    engine.memory().sync();

    force_once();
    assert_eq!(counter.count(), 2);
    assert!(engine.stats().invalidations > 0);
}

#[test]
fn corrupt_entries_degrade_to_recomputation() {
    test::setup();
    let store = MemoryStore::shared();
    let counter = test::EvalCounter::new();

    {
        let engine = engine_with_store(Arc::clone(&store));
        engine
            .force(
                &ThunkFactory::opaque(11).cell(),
                counter.returning(Value::Int(1)),
            )
            .unwrap();
    }
    store.corrupt_all();

    let engine = engine_with_store(Arc::clone(&store));
    let value = engine
        .force(
            &ThunkFactory::opaque(11).cell(),
            counter.returning(Value::Int(1)),
        )
        .unwrap();

    // Slow but correct: the corrupt entry was dropped and recomputed.
    assert_eq!(value.as_int(), Some(1));
    assert_eq!(counter.count(), 2);
    assert_eq!(engine.stats().corruptions, 1);
    assert_eq!(engine.stats().durable_hits, 0);
}

#[test]
fn store_read_failures_degrade_to_recomputation() {
    test::setup();
    let store = MemoryStore::shared();
    let engine = engine_with_store(Arc::clone(&store));
    let counter = test::EvalCounter::new();

    store.set_fail_reads(true);
    let value = engine
        .force(
            &ThunkFactory::opaque(12).cell(),
            counter.returning(Value::Int(3)),
        )
        .unwrap();
    assert_eq!(value.as_int(), Some(3));
    assert_eq!(counter.count(), 1);
}

#[test]
fn collision_is_detected_not_served() {
    test::setup();
    let stats = Arc::new(crate::stats::CacheStats::default());
    let cache = ContentCache::new(
        Box::new(MemoryStore::shared()),
        &Config::default().caches.durable,
        Arc::clone(&stats),
    );

    // Two distinct preimages engineered to share a digest.
    let digest = [42u8; 32];
    let original = ContentKey::for_testing(digest, 0, b"preimage-one");
    let impostor = ContentKey::for_testing(digest, 0, b"preimage-two");

    cache
        .insert(&original, &Ok(Value::Int(1)), &Classification::portable())
        .unwrap();

    // Inserting a different entry under an equal key is a collision error.
    assert_eq!(
        cache.insert(&impostor, &Ok(Value::Int(2)), &Classification::portable()),
        Err(CacheError::Collision)
    );

    // Looking up with the impostor preimage must not return the stored
    // value; the entry is dropped and counted instead.
    assert!(cache.lookup(&impostor).is_none());
    assert_eq!(stats.snapshot().collisions, 1);

    // Re-inserting an equal entry is a no-op.
    cache
        .insert(&original, &Ok(Value::Int(1)), &Classification::portable())
        .unwrap();
}

#[test]
fn insert_is_idempotent() {
    test::setup();
    let store = MemoryStore::shared();
    let stats = Arc::new(crate::stats::CacheStats::default());
    let cache = ContentCache::new(
        Box::new(Arc::clone(&store)),
        &Config::default().caches.durable,
        stats,
    );

    let key = ContentKey::for_testing([1; 32], 0, b"pre");
    cache
        .insert(&key, &Ok(Value::Int(9)), &Classification::portable())
        .unwrap();
    cache
        .insert(&key, &Ok(Value::Int(9)), &Classification::portable())
        .unwrap();
    assert_eq!(cache.entry_count(), 1);

    let hit = cache.lookup(&key).unwrap();
    assert_eq!(hit.outcome.unwrap().as_int(), Some(9));
    assert_eq!(hit.classification.durability, Durability::Portable);
}

#[test]
fn volatile_entries_are_refused_by_the_durable_tier() {
    test::setup();
    let cache = ContentCache::new(
        Box::new(MemoryStore::shared()),
        &Config::default().caches.durable,
        Arc::new(crate::stats::CacheStats::default()),
    );
    let key = ContentKey::for_testing([2; 32], 0, b"pre");
    let volatile = Classification {
        durability: Durability::Volatile,
        deps: vec![],
    };
    assert!(matches!(
        cache.insert(&key, &Ok(Value::Int(1)), &volatile),
        Err(CacheError::Unserializable(_))
    ));
}

#[test]
fn export_import_moves_portable_entries() {
    test::setup();
    let source = MemoryStore::shared();
    let counter = test::EvalCounter::new();

    let exported = {
        let engine = engine_with_store(Arc::clone(&source));
        engine
            .force(
                &ThunkFactory::opaque(13).cell(),
                counter.returning(Value::Int(21)),
            )
            .unwrap();
        let exported = engine.export_portable();
        assert_eq!(exported.len(), 1);
        exported
    };

    let target = MemoryStore::shared();
    let engine = engine_with_store(Arc::clone(&target));
    assert_eq!(engine.import_portable(exported), 1);

    let value = engine
        .force(
            &ThunkFactory::opaque(13).cell(),
            counter.returning(Value::Int(21)),
        )
        .unwrap();
    assert_eq!(value.as_int(), Some(21));
    assert_eq!(counter.count(), 1);
    assert_eq!(engine.stats().durable_hits, 1);
}

#[test]
fn filesystem_store_backs_a_real_warm_start() {
    test::setup();
    let dir = test::tempdir();
    let config = Config {
        cache_dir: Some(dir.path().join("cache")),
        ..Default::default()
    };
    let counter = test::EvalCounter::new();

    {
        let engine = Engine::new(&config).unwrap();
        engine
            .force(
                &ThunkFactory::opaque(14).cell(),
                counter.returning(Value::Int(8)),
            )
            .unwrap();
    }

    let engine = Engine::new(&config).unwrap();
    let value = engine
        .force(
            &ThunkFactory::opaque(14).cell(),
            counter.returning(Value::Int(8)),
        )
        .unwrap();
    assert_eq!(value.as_int(), Some(8));
    assert_eq!(counter.count(), 1);
    assert_eq!(engine.stats().durable_hits, 1);
}
