//! Helpers for testing the memovault engine.
//!
//! When writing tests, keep the following points in mind:
//!
//! - In every test, call [`setup`]. This sets up the logger so that all
//!   console output is captured by the test runner.
//!
//! - When using [`tempdir`], hold the handle for the entire lifetime of the
//!   test (`let _cache_dir = test::tempdir()`); dropping it early silently
//!   deletes the directory under a live cache.
//!
//! - Thunk cells are single-use: a forced cell never re-evaluates. Tests
//!   that want to observe recomputation must build a fresh cell with the
//!   same code and environment, which is what [`ThunkFactory`] is for.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use memovault_values::code::CodeShape;
use memovault_values::{
    CodeId, CodeRef, EnvFrame, EnvRef, EvalError, Symbol, Thunk, Value, ValueCell, ValueRef,
};

pub use tempfile::TempDir;

/// Set up the test environment.
///
/// - Initializes logs: the logger only captures logs from the memovault
///   crates and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("memovault_engine=trace,memovault_values=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it
/// as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

pub fn sym(name: &str) -> Symbol {
    Symbol::new(name)
}

pub fn forced(value: Value) -> ValueRef {
    ValueCell::forced(value)
}

pub fn forced_int(value: i64) -> ValueRef {
    forced(Value::Int(value))
}

/// An opaque code shape that is never eligible for the cheap-thunk fast
/// path.
pub fn opaque_shape(op: u16) -> CodeShape {
    CodeShape::Node {
        op,
        children: vec![],
    }
}

/// Mints fresh cells for one logical thunk: same code identity, same
/// environment, a new cell each time. Forcing two cells from the same
/// factory models forcing two structurally identical thunks.
#[derive(Debug, Clone)]
pub struct ThunkFactory {
    code: CodeRef,
    env: EnvRef,
}

impl ThunkFactory {
    pub fn new(shape: CodeShape, env: EnvRef) -> Self {
        ThunkFactory {
            code: CodeRef::new(CodeId::fresh(), shape),
            env,
        }
    }

    /// A factory for an opaque computation over an empty environment.
    pub fn opaque(op: u16) -> Self {
        Self::new(opaque_shape(op), EnvFrame::root(vec![]))
    }

    pub fn cell(&self) -> ValueRef {
        ValueCell::thunk(self.code.clone(), self.env.clone())
    }

    pub fn thunk(&self) -> Thunk {
        Thunk {
            code: self.code.clone(),
            env: self.env.clone(),
        }
    }

    pub fn code(&self) -> &CodeRef {
        &self.code
    }

    pub fn env(&self) -> &EnvRef {
        &self.env
    }
}

/// Counts underlying evaluations, for asserting that cached paths do not
/// recompute.
#[derive(Debug, Default)]
pub struct EvalCounter {
    count: AtomicUsize,
}

impl EvalCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// An evaluation function returning `value`, counting each actual run.
    pub fn returning(
        self: &Arc<Self>,
        value: Value,
    ) -> impl FnOnce(&Thunk) -> Result<Value, EvalError> + use<> {
        let counter = Arc::clone(self);
        move |_thunk| {
            counter.count.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    }

    /// An evaluation function failing with `error`, counting each actual run.
    pub fn failing(
        self: &Arc<Self>,
        error: EvalError,
    ) -> impl FnOnce(&Thunk) -> Result<Value, EvalError> + use<> {
        let counter = Arc::clone(self);
        move |_thunk| {
            counter.count.fetch_add(1, Ordering::SeqCst);
            Err(error)
        }
    }
}
