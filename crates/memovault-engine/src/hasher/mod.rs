//! The structural hasher.
//!
//! Computes deterministic, cycle-safe fingerprints of values and of
//! code+environment pairs without ever forcing a thunk. Each node contributes
//! a canonical token stream (tag, canonicalized scalars, child digests) which
//! is folded into a [`Digest`]; traversal of self-referential values is
//! terminated by depth-based back-reference tokens against a stack of open
//! ancestors, never by unbounded recursion.
//!
//! Two hashing modes exist:
//!
//! - [`HashMode::Identity`]: an unforced thunk contributes its identity
//!   components (code id, environment id). The result is only meaningful
//!   within the current run.
//! - [`HashMode::Portable`]: an unforced thunk poisons the whole computation
//!   with [`HashUnavailable`] — a routing signal meaning "do not persist this
//!   result", not an error. Portable digests are deterministic across
//!   processes and machines.
//!
//! Name binding is normalized so that hashes track meaning, not spelling:
//! lexically-resolved references are hashed as de Bruijn coordinates, while
//! dynamically-resolved references feed both the identifier and a digest of
//! the full ordered chain of enclosing dynamic scopes that could supply it.

mod digest;

pub use digest::Digest;

use std::fmt;

use memovault_values::{
    Bindings, EnvRef, EvalError, ObjectId, Peek, Thunk, Value, ValueRef,
};
use memovault_values::code::CodeShape;

use crate::wire::{canonical_f64_bits, put_uvarint, put_ivarint};

/// Routing signal: an unforced thunk was encountered while computing a
/// portable digest. The caller must not persist the affected result;
/// evaluation itself proceeds normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashUnavailable;

impl fmt::Display for HashUnavailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("structural hash unavailable: unforced thunk in portable context")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashMode {
    /// Unforced thunks hash by identity; valid within the current run only.
    Identity,
    /// Fully content-determined; unforced thunks yield [`HashUnavailable`].
    Portable,
}

// Value-level tags.
const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_RESOURCE: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_ATTRS: u8 = 0x08;
const TAG_CLOSURE: u8 = 0x09;
const TAG_PARTIAL: u8 = 0x0a;
const TAG_PENDING: u8 = 0x0b;
const TAG_FAILED: u8 = 0x0c;
const TAG_BACKREF: u8 = 0x0d;

// Environment tags.
const TAG_ENV: u8 = 0x10;
const TAG_ENV_ROOT: u8 = 0x11;
const TAG_CHAIN_FRAME: u8 = 0x12;

// Code-shape tags.
const TAG_S_LEAF: u8 = 0x20;
const TAG_S_LEXREF: u8 = 0x21;
const TAG_S_DYNREF: u8 = 0x22;
const TAG_S_BIND: u8 = 0x23;
const TAG_S_DYNBIND: u8 = 0x24;
const TAG_S_NODE: u8 = 0x25;

const TAG_THUNK: u8 = 0x30;

/// Hash an evaluated (or partially evaluated) value graph.
pub fn hash_value_ref(cell: &ValueRef, mode: HashMode) -> Result<Digest, HashUnavailable> {
    Hasher::new(mode).hash_cell(cell)
}

/// Hash a bare value (e.g. a freshly computed force result).
pub fn hash_value(value: &Value, mode: HashMode) -> Result<Digest, HashUnavailable> {
    Hasher::new(mode).hash_value(value)
}

/// Hash a code+environment pair.
///
/// In identity mode this is the cheap identity fingerprint; in portable mode
/// it walks the code skeleton and the full environment content.
pub fn hash_thunk(thunk: &Thunk, mode: HashMode) -> Result<Digest, HashUnavailable> {
    Hasher::new(mode).hash_thunk(thunk)
}

/// Portable thunk hash together with its canonical preimage token stream.
///
/// The preimage is retained beside durable cache entries and compared
/// byte-for-byte on every hit, so a digest collision can never silently
/// return a wrong value.
pub(crate) fn hash_thunk_with_preimage(
    thunk: &Thunk,
) -> Result<(Digest, Vec<u8>), HashUnavailable> {
    let mut hasher = Hasher::new(HashMode::Portable);
    hasher.preimage = Some(Vec::new());
    let digest = hasher.hash_thunk(thunk)?;
    Ok((digest, hasher.preimage.take().unwrap_or_default()))
}

struct Hasher {
    mode: HashMode,
    /// Object identities of the cells currently open in this traversal,
    /// outermost first. Re-encountering one emits a back-reference.
    ancestors: Vec<ObjectId>,
    /// When set, collects the full pre-order token stream.
    preimage: Option<Vec<u8>>,
}

impl Hasher {
    fn new(mode: HashMode) -> Self {
        Hasher {
            mode,
            ancestors: Vec::new(),
            preimage: None,
        }
    }

    /// Append canonical tokens to a node's local stream and the preimage.
    fn emit(&mut self, local: &mut Vec<u8>, bytes: &[u8]) {
        local.extend_from_slice(bytes);
        if let Some(preimage) = &mut self.preimage {
            preimage.extend_from_slice(bytes);
        }
    }

    fn emit_uvarint(&mut self, local: &mut Vec<u8>, value: u64) {
        let mut scratch = Vec::with_capacity(10);
        put_uvarint(&mut scratch, value);
        self.emit(local, &scratch);
    }

    fn emit_str(&mut self, local: &mut Vec<u8>, text: &str) {
        self.emit_uvarint(local, text.len() as u64);
        self.emit(local, text.as_bytes());
    }

    /// A node whose digest is entirely its own tokens.
    fn leaf(&mut self, build: impl FnOnce(&mut Self, &mut Vec<u8>)) -> Digest {
        let mut local = Vec::new();
        build(self, &mut local);
        Digest::of(&local)
    }

    fn hash_cell(&mut self, cell: &ValueRef) -> Result<Digest, HashUnavailable> {
        if let Some(pos) = self.ancestors.iter().rposition(|&id| id == cell.id()) {
            // Already open in this traversal: terminate with a back-reference
            // encoding the number of open frames back to the ancestor, so two
            // isomorphic cyclic graphs produce identical digests.
            let distance = (self.ancestors.len() - pos) as u64;
            return Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_BACKREF]);
                hasher.emit_uvarint(local, distance);
            }));
        }

        match cell.peek() {
            Peek::Pending { code, env } => match self.mode {
                HashMode::Identity => Ok(self.leaf(|hasher, local| {
                    hasher.emit(local, &[TAG_PENDING]);
                    hasher.emit_uvarint(local, code.as_u64());
                    hasher.emit_uvarint(local, env.as_u64());
                })),
                HashMode::Portable => Err(HashUnavailable),
            },
            Peek::Failed(error) => Ok(self.hash_eval_error(&error)),
            Peek::Forced(value) => {
                self.ancestors.push(cell.id());
                let result = self.hash_value(&value);
                self.ancestors.pop();
                result
            }
        }
    }

    fn hash_eval_error(&mut self, error: &EvalError) -> Digest {
        self.leaf(|hasher, local| {
            hasher.emit(local, &[TAG_FAILED]);
            let (variant, message): (u8, &str) = match error {
                EvalError::Cycle => (0, ""),
                EvalError::Aborted => (1, ""),
                EvalError::Throw(message) => (2, message),
                EvalError::Type(message) => (3, message),
            };
            hasher.emit(local, &[variant]);
            hasher.emit_str(local, message);
        })
    }

    fn hash_value(&mut self, value: &Value) -> Result<Digest, HashUnavailable> {
        match value {
            Value::Null => Ok(self.leaf(|hasher, local| hasher.emit(local, &[TAG_NULL]))),
            Value::Bool(b) => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_BOOL, u8::from(*b)]);
            })),
            Value::Int(i) => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_INT]);
                let mut scratch = Vec::with_capacity(10);
                put_ivarint(&mut scratch, *i);
                hasher.emit(local, &scratch);
            })),
            Value::Float(f) => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_FLOAT]);
                hasher.emit(local, &canonical_f64_bits(*f).to_be_bytes());
            })),
            Value::Text(text) => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_TEXT]);
                hasher.emit_str(local, text.content());
                hasher.emit_uvarint(local, text.context().len() as u64);
                for token in text.context() {
                    hasher.emit_str(local, token.as_str());
                }
            })),
            Value::Resource(resource) => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_RESOURCE]);
                hasher.emit_str(local, resource.token());
            })),
            Value::List(items) => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_LIST]);
                self.emit_uvarint(&mut local, items.len() as u64);
                for item in items.iter() {
                    let child = self.hash_cell(item)?;
                    local.extend_from_slice(child.as_bytes());
                }
                Ok(Digest::of(&local))
            }
            Value::Attrs(bindings) => self.hash_bindings(bindings),
            Value::Closure(closure) => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_CLOSURE]);
                let shape = self.hash_code(&closure.code.shape, &closure.env)?;
                local.extend_from_slice(shape.as_bytes());
                let env = self.hash_env(&closure.env)?;
                local.extend_from_slice(env.as_bytes());
                Ok(Digest::of(&local))
            }
            Value::PrimOpPartial(partial) => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_PARTIAL]);
                self.emit_str(&mut local, partial.prim.as_str());
                self.emit_uvarint(&mut local, partial.args.len() as u64);
                for arg in partial.args.iter() {
                    let child = self.hash_cell(arg)?;
                    local.extend_from_slice(child.as_bytes());
                }
                Ok(Digest::of(&local))
            }
        }
    }

    /// Mappings hash over the deterministic merged view in canonical key
    /// order, never over raw layers or insertion order.
    fn hash_bindings(&mut self, bindings: &Bindings) -> Result<Digest, HashUnavailable> {
        let merged = bindings.merged();
        let mut local = Vec::new();
        self.emit(&mut local, &[TAG_ATTRS]);
        self.emit_uvarint(&mut local, merged.len() as u64);
        for (name, cell) in &merged {
            self.emit_str(&mut local, name.as_str());
            let child = self.hash_cell(cell)?;
            local.extend_from_slice(child.as_bytes());
        }
        Ok(Digest::of(&local))
    }

    fn hash_thunk(&mut self, thunk: &Thunk) -> Result<Digest, HashUnavailable> {
        match self.mode {
            HashMode::Identity => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_PENDING]);
                hasher.emit_uvarint(local, thunk.code.id.as_u64());
                hasher.emit_uvarint(local, thunk.env.id().as_u64());
            })),
            HashMode::Portable => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_THUNK]);
                let shape = self.hash_code(&thunk.code.shape, &thunk.env)?;
                local.extend_from_slice(shape.as_bytes());
                let env = self.hash_env(&thunk.env)?;
                local.extend_from_slice(env.as_bytes());
                Ok(Digest::of(&local))
            }
        }
    }

    /// Environment content: slot digests in order, this frame's dynamic-scope
    /// names (if any), then the parent frame. The chains are acyclic by
    /// construction; any cycle through captured values passes through a cell
    /// and is cut there.
    fn hash_env(&mut self, env: &EnvRef) -> Result<Digest, HashUnavailable> {
        let mut local = Vec::new();
        self.emit(&mut local, &[TAG_ENV]);
        self.emit_uvarint(&mut local, env.slots().len() as u64);
        for slot in env.slots() {
            let child = self.hash_cell(slot)?;
            local.extend_from_slice(child.as_bytes());
        }
        match env.names() {
            Some(names) => {
                self.emit(&mut local, &[1]);
                self.emit_uvarint(&mut local, names.len() as u64);
                for name in names {
                    self.emit_str(&mut local, name.as_str());
                }
            }
            None => self.emit(&mut local, &[0]),
        }
        match env.parent() {
            Some(parent) => {
                let parent = self.hash_env(parent)?;
                local.extend_from_slice(parent.as_bytes());
            }
            None => self.emit(&mut local, &[TAG_ENV_ROOT]),
        }
        Ok(Digest::of(&local))
    }

    fn hash_code(
        &mut self,
        shape: &CodeShape,
        env: &EnvRef,
    ) -> Result<Digest, HashUnavailable> {
        // The runtime part of the dynamic chain: every enclosing dynamic
        // scope the environment supplies, nearest first.
        let env_chain: Vec<Digest> = env
            .dynamic_chain()
            .iter()
            .map(|frame| self.chain_frame_digest(frame.names().unwrap_or_default()))
            .collect();
        let mut static_stack = Vec::new();
        self.hash_shape(shape, &mut static_stack, &env_chain)
    }

    fn chain_frame_digest(&mut self, names: &[memovault_values::Symbol]) -> Digest {
        self.leaf(|hasher, local| {
            hasher.emit(local, &[TAG_CHAIN_FRAME]);
            hasher.emit_uvarint(local, names.len() as u64);
            for name in names {
                hasher.emit_str(local, name.as_str());
            }
        })
    }

    fn hash_shape(
        &mut self,
        shape: &CodeShape,
        static_stack: &mut Vec<Digest>,
        env_chain: &[Digest],
    ) -> Result<Digest, HashUnavailable> {
        match shape {
            CodeShape::Leaf(fingerprint) => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_S_LEAF]);
                hasher.emit(local, fingerprint);
            })),
            // De Bruijn coordinates: the spelling of lexically bound names
            // never reaches the digest, so alpha-equivalent binders hash
            // identically.
            CodeShape::LexicalRef { depth, index } => Ok(self.leaf(|hasher, local| {
                hasher.emit(local, &[TAG_S_LEXREF]);
                hasher.emit_uvarint(local, u64::from(*depth));
                hasher.emit_uvarint(local, u64::from(*index));
            })),
            // A dynamically-resolved reference hashes the identifier *and*
            // the full ordered chain of enclosing dynamic scopes that could
            // supply it: the name alone would collide for different names at
            // equal depth, and the name plus nearest scope would collide for
            // differently-ordered chains.
            CodeShape::DynamicRef { name } => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_S_DYNREF]);
                self.emit_str(&mut local, name.as_str());
                let chain_len = static_stack.len() + env_chain.len();
                self.emit_uvarint(&mut local, chain_len as u64);
                for frame in static_stack.iter().rev() {
                    local.extend_from_slice(frame.as_bytes());
                }
                for frame in env_chain {
                    local.extend_from_slice(frame.as_bytes());
                }
                Ok(Digest::of(&local))
            }
            CodeShape::Bind { slots, body } => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_S_BIND]);
                self.emit_uvarint(&mut local, u64::from(*slots));
                let body = self.hash_shape(body, static_stack, env_chain)?;
                local.extend_from_slice(body.as_bytes());
                Ok(Digest::of(&local))
            }
            CodeShape::DynamicBind { names, body } => {
                let frame = self.chain_frame_digest(names);
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_S_DYNBIND]);
                local.extend_from_slice(frame.as_bytes());
                static_stack.push(frame);
                let body = self.hash_shape(body, static_stack, env_chain);
                static_stack.pop();
                local.extend_from_slice(body?.as_bytes());
                Ok(Digest::of(&local))
            }
            CodeShape::Node { op, children } => {
                let mut local = Vec::new();
                self.emit(&mut local, &[TAG_S_NODE]);
                self.emit(&mut local, &op.to_be_bytes());
                self.emit_uvarint(&mut local, children.len() as u64);
                for child in children {
                    let child = self.hash_shape(child, static_stack, env_chain)?;
                    local.extend_from_slice(child.as_bytes());
                }
                Ok(Digest::of(&local))
            }
        }
    }
}
