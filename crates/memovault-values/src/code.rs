use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Symbol;

static NEXT_CODE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a piece of code, assigned by the evaluator.
///
/// Two thunks created from the same source expression share a `CodeId`; the
/// id is the "code identity" half of an identity-based cache key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CodeId(u64);

impl CodeId {
    pub fn new(raw: u64) -> Self {
        CodeId(raw)
    }

    /// Mints a fresh id. Intended for evaluators that do not keep their own
    /// code table, and for tests.
    pub fn fresh() -> Self {
        CodeId(NEXT_CODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Code as the engine sees it: a stable identity plus a binding-structure
/// skeleton used for content hashing.
#[derive(Debug, Clone)]
pub struct CodeRef {
    pub id: CodeId,
    pub shape: Arc<CodeShape>,
}

impl CodeRef {
    pub fn new(id: CodeId, shape: CodeShape) -> Self {
        CodeRef {
            id,
            shape: Arc::new(shape),
        }
    }
}

/// The language-independent skeleton of an expression, as supplied by the
/// evaluator alongside each piece of code.
///
/// The skeleton carries exactly the information the structural hasher needs
/// for binding normalization and nothing else:
///
/// - lexically-resolved references appear as de Bruijn coordinates, so the
///   spelling of bound variables never reaches a digest and alpha-equivalent
///   code hashes identically;
/// - dynamically-resolved references keep their identifier, because for those
///   the name *is* part of the meaning — together with the ordered chain of
///   enclosing dynamic scopes that could supply it;
/// - everything the engine has no opinion about is folded into opaque leaf
///   fingerprints by the evaluator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeShape {
    /// A subterm with no binding structure, pre-fingerprinted deterministically
    /// by the evaluator.
    Leaf([u8; 32]),
    /// A reference to a lexically bound name: `depth` enclosing binders up,
    /// slot `index` within that binder.
    LexicalRef { depth: u32, index: u32 },
    /// A reference resolved through the dynamic scope chain at run time.
    DynamicRef { name: Symbol },
    /// A binder introducing `slots` anonymous lexical slots.
    Bind { slots: u32, body: Arc<CodeShape> },
    /// A binder introducing a dynamic scope supplying the listed names.
    DynamicBind {
        names: Vec<Symbol>,
        body: Arc<CodeShape>,
    },
    /// An interior node: an operator discriminant chosen by the evaluator and
    /// the operand subterms in order.
    Node {
        op: u16,
        children: Vec<Arc<CodeShape>>,
    },
}
