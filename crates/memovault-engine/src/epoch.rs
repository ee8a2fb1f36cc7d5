use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// A memory-manager collection cycle counter value.
///
/// Identity-based cache keys embed the epoch current at their creation and
/// are only trusted while it matches: once the memory manager has run, a
/// reclaimed-and-reused storage slot can never be mistaken for the original
/// logical object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(u64);

impl Epoch {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The one piece of cross-cutting global state: a monotonic collection-cycle
/// counter with a single writer (the memory manager's callback) and many
/// readers.
///
/// It is explicit state threaded into every identity-key construction rather
/// than an ambient global, so the engine stays testable in isolation.
#[derive(Debug, Default)]
pub struct EpochCoordinator {
    counter: CachePadded<AtomicU64>,
}

impl EpochCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Epoch {
        Epoch(self.counter.load(Ordering::Acquire))
    }

    /// The memory manager's registration hook, invoked exactly once at the
    /// start of each collection cycle. Returns the new epoch.
    pub fn collection_started(&self) -> Epoch {
        Epoch(self.counter.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
