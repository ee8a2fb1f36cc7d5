//! # The memovault engine
//!
//! A memoization layer for a call-by-need evaluator. The evaluator represents
//! deferred computations as thunks (code + captured environment) held in
//! shared cells; the engine makes forcing them cheap by serving repeat forces
//! from two cache tiers, persisting eligible results across runs, and
//! coordinating concurrent forcers of the same thunk — all without ever
//! forcing a thunk just to compute a cache key, and without looping on the
//! cyclic values that self-referential bindings produce.
//!
//! The moving parts, leaves first:
//!
//! - [`hasher`] computes deterministic, cycle-safe structural digests of
//!   values and thunks without forcing anything.
//! - [`force`] is the per-thunk coordination protocol ("black-holing"):
//!   exactly one evaluator computes, everyone else observes the one canonical
//!   result, and same-stack re-entry is reported as an evaluation cycle
//!   instead of hanging.
//! - [`durability`] classifies every computed result by how broadly it may be
//!   reused (this force only / this machine / anywhere), from a ledger of the
//!   effects performed while computing it.
//! - [`caching`] holds the two cache tiers and the durable-store plumbing.
//! - [`epoch`] tracks memory-manager collection cycles so identity-based keys
//!   can never alias reclaimed-and-reused storage.
//! - [`serialize`] is the deterministic portable encoding used by the durable
//!   tier.
//! - [`engine`] ties the pieces together behind the facade the evaluator
//!   drives.
//!
//! See the [`caching`] module docs for the cache architecture and the exact
//! path a force takes through the tiers.

pub mod caching;
pub mod config;
pub mod durability;
pub mod engine;
pub mod epoch;
pub mod force;
pub mod hasher;
pub mod logging;
pub mod serialize;
pub mod stats;
mod utils;
mod wire;

pub use engine::Engine;
