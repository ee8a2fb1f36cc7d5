//! End-to-end tests of the engine facade: the soundness, idempotence,
//! concurrency and durability-propagation properties the caching layer
//! guarantees to the evaluator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use memovault_engine::Engine;
use memovault_engine::config::Config;
use memovault_engine::durability::EffectKind;
use memovault_test::{self as test, EvalCounter, ThunkFactory};
use memovault_values::{EvalError, Value};

fn memory_only_engine() -> Engine {
    Engine::with_store(&Config::default(), None)
}

#[test]
fn caching_is_invisible_to_results() {
    test::setup();

    // The same two-stage computation, evaluated cold and warm: the child
    // produces 21, the parent doubles whatever the child produced.
    let run = |engine: &Engine, child: &ThunkFactory, parent: &ThunkFactory| -> i64 {
        let child_cell = child.cell();
        engine
            .force(&parent.cell(), |_| {
                let child_value = engine.force(&child_cell, |_| Ok(Value::Int(21)))?;
                let n = child_value
                    .as_int()
                    .ok_or_else(|| EvalError::Type("expected an integer".into()))?;
                Ok(Value::Int(n * 2))
            })
            .unwrap()
            .as_int()
            .unwrap()
    };

    let engine = memory_only_engine();
    let child = ThunkFactory::opaque(1);
    let parent = ThunkFactory::opaque(2);

    let cold = run(&engine, &child, &parent);
    let warm = run(&engine, &child, &parent);
    let uncached = run(&memory_only_engine(), &ThunkFactory::opaque(1), &ThunkFactory::opaque(2));

    assert_eq!(cold, 42);
    assert_eq!(warm, 42);
    assert_eq!(uncached, 42);
}

#[test]
fn forcing_twice_performs_the_work_once() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(3);
    let counter = EvalCounter::new();

    for _ in 0..3 {
        let value = engine
            .force(&factory.cell(), counter.returning(Value::Int(9)))
            .unwrap();
        assert_eq!(value.as_int(), Some(9));
    }
    assert_eq!(counter.count(), 1);
}

#[test]
fn concurrent_forcers_observe_one_canonical_result() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(4);
    let cell = factory.cell();
    let evals = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let engine = &engine;
            let cell = cell.clone();
            let evals = Arc::clone(&evals);
            scope.spawn(move || {
                let value = engine
                    .force(&cell, |_| {
                        evals.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        Ok(Value::Int(7))
                    })
                    .unwrap();
                assert_eq!(value.as_int(), Some(7));
            });
        }
    });

    assert_eq!(evals.load(Ordering::SeqCst), 1);
}

#[test]
fn a_volatile_constituent_taints_the_composite() {
    test::setup();
    let engine = memory_only_engine();
    let child = ThunkFactory::opaque(5);
    let parent = ThunkFactory::opaque(6);

    let run = || {
        let child_cell = child.cell();
        engine
            .force(&parent.cell(), |_| {
                let clock = engine.force(&child_cell, |_| {
                    engine.record_effect(EffectKind::Clock);
                    Ok(Value::Int(12))
                })?;
                Ok(Value::List(Arc::from([memovault_test::forced(clock)])))
            })
            .unwrap()
    };

    run();
    run();

    // The parent demanded a volatile child, so the parent itself became
    // volatile and was recomputed on the second force.
    assert_eq!(engine.stats().computations, 4);
}

#[test]
fn composing_portable_values_stays_portable() {
    test::setup();
    let engine = memory_only_engine();
    let child = ThunkFactory::opaque(7);
    let parent = ThunkFactory::opaque(8);

    let run = || {
        let child_cell = child.cell();
        engine
            .force(&parent.cell(), |_| {
                let n = engine
                    .force(&child_cell, |_| Ok(Value::Int(4)))?
                    .as_int()
                    .expect("child is an integer");
                Ok(Value::Int(n + 1))
            })
            .unwrap()
    };

    assert_eq!(run().as_int(), Some(5));
    assert_eq!(run().as_int(), Some(5));

    // Two portable constituents: the parent was served from the identity
    // tier on the second force.
    let stats = engine.stats();
    assert_eq!(stats.computations, 2);
    assert!(stats.memory_hits >= 1);
}

#[test]
fn forcing_for_effect_does_not_taint_the_result() {
    test::setup();
    let engine = memory_only_engine();
    let child = ThunkFactory::opaque(9);
    let parent = ThunkFactory::opaque(10);

    let run = || {
        let child_cell = child.cell();
        engine
            .force(&parent.cell(), |_| {
                // Strict-for-effect: the child's volatility must not leak
                // into the returned value.
                engine.force_for_effect(&child_cell, |_| {
                    engine.record_effect(EffectKind::Trace);
                    Ok(Value::Null)
                })?;
                Ok(Value::Int(1))
            })
            .unwrap()
    };

    run();
    run();

    // The parent stayed portable and was served from the identity tier on
    // the second run, so its effect-only child was not demanded again.
    assert_eq!(engine.stats().computations, 2);
}

#[test]
fn try_context_depth_separates_durable_reuse() {
    test::setup();
    let dir = test::tempdir();
    let config = Config {
        cache_dir: Some(dir.path().join("cache")),
        ..Default::default()
    };
    let counter = EvalCounter::new();

    {
        let engine = Engine::new(&config).unwrap();
        engine
            .force(&ThunkFactory::opaque(11).cell(), counter.returning(Value::Int(1)))
            .unwrap();
    }

    let engine = Engine::new(&config).unwrap();

    // Inside a try context the stored depth-0 entry must not be reused.
    engine.push_try_context();
    engine
        .force(&ThunkFactory::opaque(11).cell(), counter.returning(Value::Int(1)))
        .unwrap();
    engine.pop_try_context();
    assert_eq!(counter.count(), 2);

    // At the original depth the durable entry is reused.
    engine
        .force(&ThunkFactory::opaque(11).cell(), counter.returning(Value::Int(1)))
        .unwrap();
    assert_eq!(counter.count(), 2);
    assert_eq!(engine.stats().durable_hits, 1);
}

#[test]
fn statistics_reflect_the_tier_walk() {
    test::setup();
    let engine = memory_only_engine();
    let factory = ThunkFactory::opaque(12);
    let counter = EvalCounter::new();

    engine
        .force(&factory.cell(), counter.returning(Value::Int(2)))
        .unwrap();
    engine
        .force(&factory.cell(), counter.returning(Value::Int(2)))
        .unwrap();

    let stats = engine.stats();
    assert_eq!(stats.computations, 1);
    assert_eq!(stats.memory_hits, 1);
    assert!(stats.accesses >= 2);
    assert!(stats.hit_rate_pct() > 0.0);
}
