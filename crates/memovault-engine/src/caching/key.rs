use std::fmt;

use memovault_values::{CodeId, ObjectId, Thunk};

use crate::epoch::Epoch;
use crate::hasher::{self, Digest, HashUnavailable};

/// The intra-run cache key: the identity components of a thunk plus the
/// epoch current when the key was built.
///
/// Building one is two id reads — no hashing, no traversal. The embedded
/// epoch makes keys self-invalidating: a lookup only ever matches entries
/// created in the same collection cycle, so a reclaimed-and-reused slot can
/// never alias the original logical object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub code: CodeId,
    pub env: ObjectId,
    pub epoch: Epoch,
}

impl IdentityKey {
    pub fn new(thunk: &Thunk, epoch: Epoch) -> Self {
        IdentityKey {
            code: thunk.code.id,
            env: thunk.env.id(),
            epoch,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}@{}",
            self.code, self.env, self.epoch
        )
    }
}

/// Version prefix of durable store keys. Bump when the key derivation or the
/// entry encoding changes incompatibly; old entries become unreachable and
/// age out through eviction.
pub const STORE_KEY_VERSION: u8 = 1;

/// The portable cache key: a 256-bit structural digest of the thunk's code
/// and environment content, plus the try/error-context depth at force time.
///
/// Equality and hashing consider only digest and depth — like the digest in
/// the durable store path — while the retained canonical preimage is what
/// hit verification compares byte-for-byte to rule out digest collisions.
#[derive(Debug, Clone)]
pub struct ContentKey {
    digest: Digest,
    try_depth: u32,
    preimage: Vec<u8>,
}

impl PartialEq for ContentKey {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.try_depth == other.try_depth
    }
}

impl Eq for ContentKey {}

impl std::hash::Hash for ContentKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
        self.try_depth.hash(state);
    }
}

impl ContentKey {
    /// Compute the portable key for a thunk, never forcing anything.
    ///
    /// Fails with [`HashUnavailable`] when the thunk's environment contains
    /// an unforced thunk — the routing signal to skip the durable tier.
    pub fn compute(thunk: &Thunk, try_depth: u32) -> Result<Self, HashUnavailable> {
        let (digest, preimage) = hasher::hash_thunk_with_preimage(thunk)?;
        Ok(ContentKey {
            digest,
            try_depth,
            preimage,
        })
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn try_depth(&self) -> u32 {
        self.try_depth
    }

    /// The canonical preimage token stream this key's digest was computed
    /// over. Stored beside durable entries for collision verification.
    pub fn preimage(&self) -> &[u8] {
        &self.preimage
    }

    /// The byte key under which entries for this key live in a durable store.
    pub fn store_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(1 + 32 + 4);
        key.push(STORE_KEY_VERSION);
        key.extend_from_slice(self.digest.as_bytes());
        key.extend_from_slice(&self.try_depth.to_be_bytes());
        key
    }

    #[cfg(test)]
    pub fn for_testing(digest: [u8; 32], try_depth: u32, preimage: &[u8]) -> Self {
        ContentKey {
            digest: Digest::from_bytes(digest),
            try_depth,
            preimage: preimage.to_vec(),
        }
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.digest, self.try_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use memovault_values::code::CodeShape;
    use memovault_values::{CodeRef, EnvFrame, Value, ValueCell};

    fn sample_thunk() -> Thunk {
        Thunk {
            code: CodeRef::new(CodeId::fresh(), CodeShape::Leaf([3; 32])),
            env: EnvFrame::root(vec![ValueCell::forced(Value::Int(1))]),
        }
    }

    #[test]
    fn try_depth_distinguishes_keys() {
        let thunk = sample_thunk();
        let shallow = ContentKey::compute(&thunk, 0).unwrap();
        let nested = ContentKey::compute(&thunk, 1).unwrap();
        assert_eq!(shallow.digest(), nested.digest());
        assert_ne!(shallow, nested);
        assert_ne!(shallow.store_key(), nested.store_key());
    }

    #[test]
    fn store_keys_are_stable() {
        let thunk = sample_thunk();
        let a = ContentKey::compute(&thunk, 0).unwrap();
        let b = ContentKey::compute(&thunk, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.store_key(), b.store_key());
        assert_eq!(a.preimage(), b.preimage());
    }
}
