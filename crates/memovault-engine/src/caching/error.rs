use std::io;

use thiserror::Error;

/// A fault in the caching layer.
///
/// The cache is an optimization layer: none of these variants may surface as
/// an evaluation error. `Collision` and `Corruption` drop the affected entry
/// and degrade to a recomputation; `Unserializable` suppresses one durable
/// write; `Store` wraps backend I/O problems, which are logged and likewise
/// degrade to a miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Two distinct key preimages produced equal content digests.
    #[error("content key collision detected")]
    Collision,
    /// Stored bytes failed checksum or decode validation.
    #[error("stored entry failed validation: {0}")]
    Corruption(String),
    /// The value cannot be represented in the portable encoding.
    #[error("cannot persist a value containing a {0}")]
    Unserializable(&'static str),
    /// The durable store backend reported an error.
    #[error("durable store error: {0}")]
    Store(String),
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        let dynerr: &dyn std::error::Error = &err;
        tracing::error!(error = dynerr, "durable store I/O error");
        CacheError::Store(err.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
