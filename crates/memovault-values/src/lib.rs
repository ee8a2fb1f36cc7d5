//! The value, thunk and environment model shared by the memovault engine and
//! its tests.
//!
//! This crate is deliberately passive: it defines the data the engine operates
//! on (values, unevaluated thunks, environment frames) and the low-level slot
//! state machine used by the force protocol, but contains no caching, hashing
//! or scheduling logic of its own.
//!
//! Laziness is modelled through [`ValueCell`]: every lazily-bound position in
//! a value graph (list elements, attribute values, environment slots) is a
//! shared cell which starts out as an unevaluated [`Thunk`] and is replaced in
//! place by its result the first time it is forced. Cycles produced by
//! self-referential bindings therefore only ever occur between *cells holding
//! evaluated values*; the lexical and dynamic environment chains are acyclic
//! by construction.

pub mod cell;
pub mod code;
pub mod env;
pub mod error;
pub mod value;

pub use cell::{Claim, ObjectId, Peek, Thunk, ValueCell, ValueRef};
pub use code::{CodeId, CodeRef, CodeShape};
pub use env::{EnvFrame, EnvRef};
pub use error::EvalError;
pub use value::{
    Bindings, Closure, PartialApply, Provenance, ResourceRef, Symbol, Text, Value,
};
