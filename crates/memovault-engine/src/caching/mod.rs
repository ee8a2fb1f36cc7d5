//! # The two-tier cache store
//!
//! Caching is front and center in memovault: it exists to make forcing a
//! thunk cheap the second time, whether "the second time" happens a
//! microsecond later on another thread or a week later in a different
//! process.
//!
//! ## Cache tiers
//!
//! - **L1, the identity tier** ([`MemoryCache`]): a concurrent in-memory map from
//!   [`IdentityKey`] — (code identity, environment identity, epoch) — to
//!   memoized force outcomes. Building the key is two id reads, so this tier
//!   is consulted before any content hashing. It is scoped to one evaluation
//!   run: keys embed the collection epoch and go stale wholesale when the
//!   memory manager runs, and entries disappear proactively when their
//!   backing object is reclaimed.
//! - **L2, the content tier** ([`ContentCache`]): a content-addressed map from
//!   [`ContentKey`] — a portable structural digest plus try-context depth —
//!   to durably encoded entries behind the [`DurableStore`] trait. Only
//!   results classified `Local` or better are written; only `Portable`
//!   entries may leave the machine. Lookup requires a full content hash, so
//!   it is only attempted on an L1 miss.
//!
//! A force request goes through the following steps:
//!
//! 1. The owning cell itself: a thunk forced before holds its result in
//!    place.
//! 2. L1 by identity key.
//! 3. On miss, the structural hasher computes a content key — unless an
//!    unforced thunk in the environment makes the key unavailable, which
//!    simply skips the durable tier.
//! 4. L2 by content key, validating checksum and key preimage.
//! 5. On miss, the thunk is claimed and evaluated; the durability classifier
//!    tags the result, and it is inserted into whichever tiers its
//!    durability allows.
//!
//! ## Validation before trust
//!
//! Every L2 hit re-validates the entry checksum (corruption) and compares
//! the stored key preimage byte-for-byte (collision). Both faults drop the
//! entry, bump a counter, and fall through to recomputation: the cache is an
//! optimization layer whose failures must degrade to "slow but correct",
//! never propagate as evaluation errors.
//!
//! ## Eviction
//!
//! L1 budgets are enforced by the in-memory cache itself (weigher + capacity,
//! optional time-to-idle). L2 uses an adaptive two-list policy balancing
//! recency against frequency, with separate entry-count and byte budgets.
//! Eviction never blocks correctness; an evicted entry is a future miss.

mod error;
mod eviction;
mod fs;
mod key;
mod memory;
mod store;
#[cfg(test)]
mod tests;

pub use error::{CacheError, CacheResult};
pub use fs::FilesystemStore;
pub use key::{ContentKey, IdentityKey, STORE_KEY_VERSION};
pub use memory::{CachedForce, MemoryCache};
pub use store::{ContentCache, DurableStore};
