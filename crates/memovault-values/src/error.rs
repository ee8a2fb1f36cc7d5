use thiserror::Error;

/// An evaluation error, memoized in the owning cell exactly like a success.
///
/// Errors are cloneable and comparable so that every forcer of a failed thunk
/// observes bit-for-bit the same error, whether it came fresh from the
/// evaluator or was replayed from a cache tier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// A thunk was re-entered on its own forcing stack.
    #[error("infinite recursion encountered")]
    Cycle,
    /// The owning evaluation was aborted before it could publish a result.
    #[error("evaluation aborted")]
    Aborted,
    /// An error raised by the evaluated program.
    #[error("{0}")]
    Throw(String),
    /// The evaluator rejected an operand.
    #[error("type error: {0}")]
    Type(String),
}
