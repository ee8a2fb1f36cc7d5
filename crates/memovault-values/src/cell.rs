use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::code::{CodeId, CodeRef};
use crate::env::EnvRef;
use crate::error::EvalError;
use crate::value::Value;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-unique handle for a heap object (cell or environment frame).
///
/// Ids are minted from a monotonic counter and never reused, so they can be
/// embedded in identity-based cache keys without ever aliasing a different
/// object. They are handles, not addresses: the memory manager is free to
/// relocate the underlying storage.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    pub fn fresh() -> Self {
        ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A deferred computation: code plus the environment needed to run it.
#[derive(Debug, Clone)]
pub struct Thunk {
    pub code: CodeRef,
    pub env: EnvRef,
}

/// The slot state machine: `Unforced → Evaluating → {Forced, Failed}`.
///
/// `Evaluating` retains the thunk so that identity information stays readable
/// while the owner computes, and so that duplicate evaluation of provably
/// cheap thunks can proceed without waiting.
#[derive(Debug)]
enum Slot {
    Unforced(Thunk),
    Evaluating(Thunk),
    Forced(Value),
    Failed(EvalError),
}

/// Result of [`ValueCell::try_claim`].
#[derive(Debug)]
pub enum Claim {
    /// The slot already holds a result; no evaluation is needed.
    Ready(Result<Value, EvalError>),
    /// The caller won the race and is now the sole evaluator of this thunk.
    Claimed(Thunk),
    /// Another evaluator currently owns the slot.
    InFlight(Thunk),
}

/// A non-blocking snapshot of a cell's state. Never forces anything.
#[derive(Debug, Clone)]
pub enum Peek {
    /// Unforced or currently being forced elsewhere; only identity is known.
    Pending { code: CodeId, env: ObjectId },
    Forced(Value),
    Failed(EvalError),
}

impl Peek {
    pub fn into_forced(self) -> Option<Value> {
        match self {
            Peek::Forced(value) => Some(value),
            _ => None,
        }
    }
}

/// A shared slot holding a thunk until it is forced, then its result forever.
///
/// The cell is the sole serialization point of the force protocol: claiming,
/// publishing and waiting all go through the internal mutex; the actual
/// evaluation happens outside it.
pub struct ValueCell {
    id: ObjectId,
    state: Mutex<Slot>,
    ready: Condvar,
}

pub type ValueRef = Arc<ValueCell>;

impl fmt::Debug for ValueCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock().expect("cell mutex poisoned") {
            Slot::Unforced(_) => "unforced",
            Slot::Evaluating(_) => "evaluating",
            Slot::Forced(_) => "forced",
            Slot::Failed(_) => "failed",
        };
        f.debug_struct("ValueCell")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}

impl ValueCell {
    pub fn thunk(code: CodeRef, env: EnvRef) -> ValueRef {
        Arc::new(ValueCell {
            id: ObjectId::fresh(),
            state: Mutex::new(Slot::Unforced(Thunk { code, env })),
            ready: Condvar::new(),
        })
    }

    pub fn forced(value: Value) -> ValueRef {
        Arc::new(ValueCell {
            id: ObjectId::fresh(),
            state: Mutex::new(Slot::Forced(value)),
            ready: Condvar::new(),
        })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Snapshot the current state without blocking on in-flight evaluation.
    pub fn peek(&self) -> Peek {
        match &*self.state.lock().expect("cell mutex poisoned") {
            Slot::Unforced(thunk) | Slot::Evaluating(thunk) => Peek::Pending {
                code: thunk.code.id,
                env: thunk.env.id(),
            },
            Slot::Forced(value) => Peek::Forced(value.clone()),
            Slot::Failed(error) => Peek::Failed(error.clone()),
        }
    }

    /// The thunk, if the cell has not produced a result yet.
    pub fn peek_thunk(&self) -> Option<Thunk> {
        match &*self.state.lock().expect("cell mutex poisoned") {
            Slot::Unforced(thunk) | Slot::Evaluating(thunk) => Some(thunk.clone()),
            _ => None,
        }
    }

    /// Atomically transition `Unforced → Evaluating`.
    pub fn try_claim(&self) -> Claim {
        let mut state = self.state.lock().expect("cell mutex poisoned");
        match &*state {
            Slot::Forced(value) => Claim::Ready(Ok(value.clone())),
            Slot::Failed(error) => Claim::Ready(Err(error.clone())),
            Slot::Evaluating(thunk) => Claim::InFlight(thunk.clone()),
            Slot::Unforced(thunk) => {
                let thunk = thunk.clone();
                *state = Slot::Evaluating(thunk.clone());
                Claim::Claimed(thunk)
            }
        }
    }

    /// Publish an outcome and wake all waiters.
    ///
    /// The first published outcome wins: if the slot already holds a result
    /// (duplicate evaluation of a cheap thunk), the stored one is returned so
    /// every forcer observes the same canonical result.
    pub fn fulfill(&self, outcome: Result<Value, EvalError>) -> Result<Value, EvalError> {
        let mut state = self.state.lock().expect("cell mutex poisoned");
        match &*state {
            Slot::Forced(value) => return Ok(value.clone()),
            Slot::Failed(error) => return Err(error.clone()),
            _ => {}
        }
        *state = match &outcome {
            Ok(value) => Slot::Forced(value.clone()),
            Err(error) => Slot::Failed(error.clone()),
        };
        drop(state);
        self.ready.notify_all();
        outcome
    }

    /// Block while another evaluator owns the slot.
    ///
    /// Returns once the slot is no longer `Evaluating`; the caller re-inspects
    /// it via [`try_claim`](Self::try_claim).
    pub fn wait_while_evaluating(&self) {
        let mut state = self.state.lock().expect("cell mutex poisoned");
        while matches!(&*state, Slot::Evaluating(_)) {
            state = self.ready.wait(state).expect("cell mutex poisoned");
        }
    }

    /// Replace the stored value outright.
    ///
    /// This is a reconstruction hook for deserializers that rebuild cyclic
    /// value graphs: a placeholder cell is registered first so children can
    /// refer back to it, then overwritten once its payload has been decoded.
    /// It must not be used on cells that are part of a live force protocol.
    pub fn overwrite_forced(&self, value: Value) {
        let mut state = self.state.lock().expect("cell mutex poisoned");
        *state = Slot::Forced(value);
    }
}
