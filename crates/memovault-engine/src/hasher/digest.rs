use std::fmt;

use sha2::{Digest as _, Sha256};

/// A 256-bit structural digest.
///
/// Equal digests imply semantic equality of the hashed structure, up to the
/// collision probability of the hash; the caching layer additionally verifies
/// key preimages on every durable hit, so a collision degrades to a cache
/// miss, never to a wrong value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        let hash = Sha256::digest(bytes);
        Digest(<[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes"))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first eight bytes are plenty to tell digests apart in logs.
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…")
    }
}
