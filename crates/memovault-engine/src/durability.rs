//! Durability classification.
//!
//! While a thunk is being forced, the evaluator reports every read of
//! external mutable state to the engine. The resulting effect ledger decides
//! how broadly the computed value may be reused: not at all beyond this force
//! (`Volatile`), on this machine with its dependency set tracked (`Local`),
//! or anywhere (`Portable`).
//!
//! Ledger frames form a per-thread stack mirroring the force nesting. When a
//! nested force completes, its classification is folded into the enclosing
//! frame — durability of a composite is the minimum over everything used to
//! build it, transitively — unless the evaluator reports the nested force as
//! demanded purely for its side effects, in which case only the effects'
//! frame is popped and the parent is left untouched.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;

use crate::hasher::Digest;

/// How broadly a cached result may be reused. The order is meaningful:
/// a composite value is as durable as its least durable constituent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Durability {
    /// Never cached beyond the current force.
    Volatile,
    /// Cacheable on this machine; invalidated when a tracked input changes.
    Local,
    /// Content-pure; cacheable and shareable unconditionally.
    Portable,
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Durability::Volatile => "volatile",
            Durability::Local => "local",
            Durability::Portable => "portable",
        };
        f.write_str(name)
    }
}

/// An external input a `Local` result depends on, with the content digest
/// recorded when it was read.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dependency {
    /// Canonical input identifier, e.g. `file:/etc/hosts` or `env:HOME`.
    pub input: String,
    pub digest: Digest,
}

/// A read of external mutable state, as reported by the evaluator.
///
/// Reads that capture a content digest are deterministic given their recorded
/// input and only demote the result to `Local`; reads without one demote it
/// to `Volatile`.
#[derive(Debug, Clone)]
pub enum EffectKind {
    /// Reading the current time.
    Clock,
    /// Reading an environment variable.
    EnvRead {
        name: String,
        value_digest: Option<Digest>,
    },
    /// Reading filesystem content outside a content-addressed store.
    FileRead {
        path: PathBuf,
        content_digest: Option<Digest>,
    },
    /// Fetching over the network.
    Fetch {
        url: String,
        content_digest: Option<Digest>,
    },
    /// Source-position or provenance introspection. Always volatile: the
    /// result depends on the invocation context even when the text of the
    /// answer looks identical.
    Introspection,
    /// Emitting a diagnostic trace.
    Trace,
}

/// The durability verdict for one completed force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub durability: Durability,
    /// Tracked inputs; non-empty only for `Local` results.
    pub deps: Vec<Dependency>,
}

impl Classification {
    /// The classification of a result computed without any effects.
    pub fn portable() -> Self {
        Classification {
            durability: Durability::Portable,
            deps: Vec::new(),
        }
    }
}

/// The effect ledger of one in-flight force.
#[derive(Debug)]
pub struct EffectLedger {
    floor: Durability,
    deps: Vec<Dependency>,
}

impl EffectLedger {
    pub fn new() -> Self {
        EffectLedger {
            floor: Durability::Portable,
            deps: Vec::new(),
        }
    }

    pub fn record(&mut self, effect: EffectKind) {
        match effect {
            EffectKind::Clock | EffectKind::Introspection | EffectKind::Trace => {
                self.demote(Durability::Volatile);
            }
            EffectKind::EnvRead { name, value_digest } => {
                self.record_input(format!("env:{name}"), value_digest);
            }
            EffectKind::FileRead {
                path,
                content_digest,
            } => {
                self.record_input(format!("file:{}", path.display()), content_digest);
            }
            EffectKind::Fetch { url, content_digest } => {
                self.record_input(format!("fetch:{url}"), content_digest);
            }
        }
    }

    fn record_input(&mut self, input: String, digest: Option<Digest>) {
        match digest {
            Some(digest) => {
                self.demote(Durability::Local);
                self.deps.push(Dependency { input, digest });
            }
            None => self.demote(Durability::Volatile),
        }
    }

    /// Fold a completed constituent into this ledger.
    pub fn absorb(&mut self, child: &Classification) {
        self.demote(child.durability);
        self.deps.extend(child.deps.iter().cloned());
    }

    fn demote(&mut self, to: Durability) {
        self.floor = self.floor.min(to);
    }

    pub fn classify(mut self) -> Classification {
        if self.floor == Durability::Volatile {
            // A volatile result is never cached; its dependency set is moot.
            self.deps.clear();
        }
        self.deps.sort();
        self.deps.dedup();
        Classification {
            durability: self.floor,
            deps: self.deps,
        }
    }
}

impl Default for EffectLedger {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static LEDGERS: RefCell<Vec<EffectLedger>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` inside a fresh ledger frame and classify what it recorded.
///
/// The frame is popped even if `f` unwinds; the classification of an unwound
/// frame is discarded along with it.
pub(crate) fn with_frame<R>(f: impl FnOnce() -> R) -> (R, Classification) {
    LEDGERS.with(|ledgers| ledgers.borrow_mut().push(EffectLedger::new()));
    let mut guard = crate::utils::defer(|| {
        LEDGERS.with(|ledgers| {
            ledgers.borrow_mut().pop();
        });
    });
    let result = f();
    guard.disarm();
    let ledger = LEDGERS
        .with(|ledgers| ledgers.borrow_mut().pop())
        .unwrap_or_default();
    (result, ledger.classify())
}

/// Record an effect against the innermost in-flight force, if any.
pub(crate) fn record_effect(effect: EffectKind) {
    LEDGERS.with(|ledgers| match ledgers.borrow_mut().last_mut() {
        Some(ledger) => ledger.record(effect),
        None => tracing::debug!(?effect, "effect recorded outside any force; ignored"),
    });
}

/// Fold a completed constituent into the innermost in-flight force, if any.
pub(crate) fn absorb_into_current(child: &Classification) {
    LEDGERS.with(|ledgers| {
        if let Some(ledger) = ledgers.borrow_mut().last_mut() {
            ledger.absorb(child);
        }
    });
}
