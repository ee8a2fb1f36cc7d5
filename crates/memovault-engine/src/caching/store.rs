//! The durable content tier (L2).
//!
//! Entries are keyed by [`ContentKey`] and live behind the [`DurableStore`]
//! trait: durable bytes in, bytes out, under multi-reader/single-writer,
//! crash-consistent semantics. The engine is agnostic to the backend as long
//! as it offers atomic commit and consistent reads during concurrent writes;
//! the shipped implementation is the filesystem store in [`super::fs`].
//!
//! Every hit is defended twice before being trusted: the entry envelope ends
//! with a checksum (corruption detection), and the stored key preimage is
//! compared byte-for-byte against the requested key's preimage (collision
//! detection). Either fault drops the entry, bumps a counter, and degrades to
//! a recomputation — "slow but correct", never "wrong".
//!
//! Failed forces that are durable enough to persist are stored with a marker
//! prefix instead of a value payload, so replayed errors are bit-for-bit the
//! errors the evaluator produced.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use sha2::{Digest as _, Sha256};

use memovault_values::EvalError;

use crate::durability::{Classification, Dependency, Durability};
use crate::hasher::Digest;
use crate::serialize::{deserialize_value, serialize_value};
use crate::stats::CacheStats;
use crate::wire::{get_uvarint, put_uvarint};

use super::eviction::{ArcIndex, EntryMeta, IndexKey};
use super::key::ContentKey;
use super::memory::CachedForce;
use super::{CacheError, CacheResult};
use crate::config::DurableCacheConfig;

/// Durable bytes in, bytes out.
///
/// Implementations must provide atomic commit per `put` and consistent reads
/// during concurrent writes; readers must never observe a torn entry.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &[u8]) -> io::Result<Option<Bytes>>;
    fn put(&self, key: &[u8], value: Bytes) -> io::Result<()>;
    fn delete(&self, key: &[u8]) -> io::Result<()>;
}

const MAGIC: &[u8; 4] = b"MVLT";
const ENVELOPE_VERSION: u8 = 1;

const PAYLOAD_VALUE: u8 = 0;
const PAYLOAD_ERROR: u8 = 1;

/// Prefix byte for dependency records, disjoint from entry keys (which start
/// with [`super::key::STORE_KEY_VERSION`]).
const DEP_RECORD_PREFIX: u8 = 0xd0;

/// Fixed size of an entry store key: version byte + digest + try depth.
const STORE_KEY_LEN: usize = 1 + 32 + 4;

const CYCLE_MARKER: &[u8] = b"cycle";
const THROW_MARKER: &[u8] = b"throw:";
const TYPE_MARKER: &[u8] = b"type:";

fn eval_error_to_bytes(error: &EvalError) -> CacheResult<Vec<u8>> {
    match error {
        EvalError::Cycle => Ok(CYCLE_MARKER.to_vec()),
        EvalError::Throw(message) => {
            let mut bytes = THROW_MARKER.to_vec();
            bytes.extend_from_slice(message.as_bytes());
            Ok(bytes)
        }
        EvalError::Type(message) => {
            let mut bytes = TYPE_MARKER.to_vec();
            bytes.extend_from_slice(message.as_bytes());
            Ok(bytes)
        }
        // An aborted evaluation has no stable meaning outside the run that
        // aborted it.
        EvalError::Aborted => Err(CacheError::Unserializable("aborted evaluation")),
    }
}

fn eval_error_from_bytes(bytes: &[u8]) -> CacheResult<EvalError> {
    if bytes == CYCLE_MARKER {
        Ok(EvalError::Cycle)
    } else if let Some(message) = bytes.strip_prefix(THROW_MARKER) {
        let message = String::from_utf8(message.to_vec())
            .map_err(|_| CacheError::Corruption("invalid error message".into()))?;
        Ok(EvalError::Throw(message))
    } else if let Some(message) = bytes.strip_prefix(TYPE_MARKER) {
        let message = String::from_utf8(message.to_vec())
            .map_err(|_| CacheError::Corruption("invalid error message".into()))?;
        Ok(EvalError::Type(message))
    } else {
        Err(CacheError::Corruption("unknown error marker".into()))
    }
}

struct StoredEntry {
    durability: Durability,
    deps: Vec<Dependency>,
    preimage: Vec<u8>,
    outcome: Result<memovault_values::Value, EvalError>,
}

fn encode_entry(
    key: &ContentKey,
    outcome: &Result<memovault_values::Value, EvalError>,
    classification: &Classification,
) -> CacheResult<Bytes> {
    let payload = match outcome {
        Ok(value) => serialize_value(value)?,
        Err(error) => eval_error_to_bytes(error)?.into(),
    };

    let mut buf = Vec::with_capacity(payload.len() + key.preimage().len() + 128);
    buf.extend_from_slice(MAGIC);
    buf.push(ENVELOPE_VERSION);
    buf.push(match classification.durability {
        Durability::Local => 1,
        Durability::Portable => 2,
        Durability::Volatile => {
            return Err(CacheError::Unserializable("volatile result"));
        }
    });
    put_uvarint(&mut buf, classification.deps.len() as u64);
    for dep in &classification.deps {
        put_uvarint(&mut buf, dep.input.len() as u64);
        buf.extend_from_slice(dep.input.as_bytes());
        buf.extend_from_slice(dep.digest.as_bytes());
    }
    put_uvarint(&mut buf, key.preimage().len() as u64);
    buf.extend_from_slice(key.preimage());
    buf.push(match outcome {
        Ok(_) => PAYLOAD_VALUE,
        Err(_) => PAYLOAD_ERROR,
    });
    put_uvarint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(&payload);

    let checksum = Sha256::digest(&buf);
    buf.extend_from_slice(&checksum);
    Ok(buf.into())
}

fn take<'a>(body: &'a [u8], pos: &mut usize, len: usize) -> CacheResult<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= body.len())
        .ok_or_else(|| CacheError::Corruption("truncated envelope".into()))?;
    let slice = &body[*pos..end];
    *pos = end;
    Ok(slice)
}

fn decode_entry(bytes: &[u8]) -> CacheResult<StoredEntry> {
    let corrupt = |detail: &str| CacheError::Corruption(detail.into());

    let payload_len = bytes
        .len()
        .checked_sub(32)
        .ok_or_else(|| corrupt("shorter than checksum"))?;
    let (body, stored_checksum) = bytes.split_at(payload_len);
    if Sha256::digest(body).as_slice() != stored_checksum {
        return Err(corrupt("checksum mismatch"));
    }

    let mut pos = 0usize;

    if take(body, &mut pos, 4)? != MAGIC {
        return Err(corrupt("bad magic"));
    }
    if take(body, &mut pos, 1)?[0] != ENVELOPE_VERSION {
        return Err(corrupt("unsupported envelope version"));
    }
    let durability = match take(body, &mut pos, 1)?[0] {
        1 => Durability::Local,
        2 => Durability::Portable,
        _ => return Err(corrupt("bad durability tag")),
    };

    let dep_count = get_uvarint(body, &mut pos).ok_or_else(|| corrupt("bad dep count"))?;
    let mut deps = Vec::new();
    for _ in 0..dep_count {
        let input_len =
            get_uvarint(body, &mut pos).ok_or_else(|| corrupt("bad dep length"))? as usize;
        let input = String::from_utf8(take(body, &mut pos, input_len)?.to_vec())
            .map_err(|_| corrupt("invalid dep input"))?;
        let digest = <[u8; 32]>::try_from(take(body, &mut pos, 32)?).expect("fixed width");
        deps.push(Dependency {
            input,
            digest: Digest::from_bytes(digest),
        });
    }

    let preimage_len =
        get_uvarint(body, &mut pos).ok_or_else(|| corrupt("bad preimage length"))? as usize;
    let preimage = take(body, &mut pos, preimage_len)?.to_vec();

    let payload_kind = take(body, &mut pos, 1)?[0];
    let payload_len =
        get_uvarint(body, &mut pos).ok_or_else(|| corrupt("bad payload length"))? as usize;
    let payload = take(body, &mut pos, payload_len)?;
    if pos != body.len() {
        return Err(corrupt("trailing bytes in envelope"));
    }

    let outcome = match payload_kind {
        PAYLOAD_VALUE => Ok(deserialize_value(payload)?),
        PAYLOAD_ERROR => Err(eval_error_from_bytes(payload)?),
        _ => return Err(corrupt("bad payload kind")),
    };

    Ok(StoredEntry {
        durability,
        deps,
        preimage,
        outcome,
    })
}

/// Store key of the dependency record for an input.
fn dep_record_key(input: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(DEP_RECORD_PREFIX);
    key.extend_from_slice(&Sha256::digest(input.as_bytes()));
    key
}

/// The content-addressed cache front.
///
/// Commits are serialized through a single writer lock (batched where the
/// operation allows); readers go straight to the store and never block on
/// writers beyond what the backend requires.
pub struct ContentCache {
    store: Box<dyn DurableStore>,
    index: Mutex<ArcIndex>,
    writer: Mutex<()>,
    stats: Arc<CacheStats>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let index = self.index.lock().expect("index mutex poisoned");
        f.debug_struct("ContentCache")
            .field("entries", &index.len())
            .field("bytes", &index.bytes())
            .finish()
    }
}

impl ContentCache {
    pub fn new(
        store: Box<dyn DurableStore>,
        config: &DurableCacheConfig,
        stats: Arc<CacheStats>,
    ) -> Self {
        ContentCache {
            store,
            index: Mutex::new(ArcIndex::new(config.max_entries, config.max_bytes)),
            writer: Mutex::new(()),
            stats,
        }
    }

    /// Look an entry up, validating it before trusting it.
    ///
    /// Collision and corruption faults are counted, logged, and degrade to a
    /// miss; they are never surfaced to the evaluation.
    pub fn lookup(&self, key: &ContentKey) -> Option<CachedForce> {
        let store_key = key.store_key();
        let bytes = match self.store.get(&store_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(%key, %error, "durable store read failed; treating as miss");
                return None;
            }
        };

        let entry = match decode_entry(&bytes) {
            Ok(entry) => entry,
            Err(error) => {
                self.stats.count_corruption();
                tracing::warn!(%key, %error, "dropping corrupt cache entry");
                self.drop_entry(&store_key);
                return None;
            }
        };

        if entry.preimage != key.preimage() {
            // Same digest, different structure. Returning the stored value
            // would be silently wrong; dropping it is merely slow.
            self.stats.count_collision();
            tracing::error!(%key, "content key collision detected; dropping entry");
            self.drop_entry(&store_key);
            return None;
        }

        self.note_resident(store_key.into(), &bytes, &entry.deps);
        Some(CachedForce {
            outcome: entry.outcome,
            classification: Classification {
                durability: entry.durability,
                deps: entry.deps,
            },
        })
    }

    /// Insert an entry. Idempotent: re-inserting an equal entry is a no-op;
    /// inserting a *different* entry under an equal key is a collision.
    pub fn insert(
        &self,
        key: &ContentKey,
        outcome: &Result<memovault_values::Value, EvalError>,
        classification: &Classification,
    ) -> CacheResult<()> {
        if classification.durability < Durability::Local {
            return Err(CacheError::Unserializable("volatile result"));
        }
        let bytes = encode_entry(key, outcome, classification)?;
        let store_key = key.store_key();

        let _commit = self.writer.lock().expect("writer mutex poisoned");

        if let Some(existing) = self.store.get(&store_key)? {
            match decode_entry(&existing) {
                Ok(entry) if entry.preimage == key.preimage() => return Ok(()),
                Ok(_) => return Err(CacheError::Collision),
                Err(_) => {
                    // A corrupt predecessor is overwritten below.
                    self.stats.count_corruption();
                }
            }
        }

        self.store.put(&store_key, bytes.clone())?;
        for dep in &classification.deps {
            self.append_dep_record(&dep.input, &store_key)?;
        }
        self.note_resident(store_key.into(), &bytes, &classification.deps);
        Ok(())
    }

    /// Remove every entry whose dependency set references the changed input.
    ///
    /// Portable entries depend on nothing local by construction and are
    /// never touched by this.
    pub fn invalidate_dependency(&self, input: &str) -> usize {
        let _commit = self.writer.lock().expect("writer mutex poisoned");

        let record_key = dep_record_key(input);
        let recorded = match self.store.get(&record_key) {
            Ok(Some(bytes)) => bytes
                .chunks(STORE_KEY_LEN)
                .map(|chunk| chunk.to_vec())
                .collect(),
            Ok(None) => Vec::new(),
            Err(error) => {
                tracing::warn!(input, %error, "failed to read dependency record");
                Vec::new()
            }
        };

        let mut dropped = 0;
        {
            let mut index = self.index.lock().expect("index mutex poisoned");
            for key in &recorded {
                index.remove(key);
            }
            // Also cover entries admitted this run whose record write failed.
            for key in index.keys_depending_on(input) {
                index.remove(&key);
            }
        }
        for key in &recorded {
            if let Err(error) = self.store.delete(key) {
                tracing::warn!(%error, "failed to delete invalidated entry");
            } else {
                dropped += 1;
                self.stats.count_invalidation();
            }
        }
        if let Err(error) = self.store.delete(&record_key) {
            tracing::warn!(%error, "failed to delete dependency record");
        }
        dropped
    }

    /// Bulk export of portable entries for migration to another machine.
    /// Local entries are tied to this machine's inputs and stay behind.
    pub fn export_portable(&self) -> Vec<(Vec<u8>, Bytes)> {
        let keys = self.index.lock().expect("index mutex poisoned").keys();
        let mut exported = Vec::new();
        for key in keys {
            let Ok(Some(bytes)) = self.store.get(&key) else {
                continue;
            };
            match decode_entry(&bytes) {
                Ok(entry) if entry.durability == Durability::Portable => {
                    exported.push((key.to_vec(), bytes));
                }
                _ => {}
            }
        }
        exported
    }

    /// Bulk import of previously exported entries. Entries that fail
    /// validation or are not portable are skipped, not errors.
    pub fn import_portable(&self, entries: impl IntoIterator<Item = (Vec<u8>, Bytes)>) -> usize {
        // One writer acquisition for the whole batch.
        let _commit = self.writer.lock().expect("writer mutex poisoned");
        let mut imported = 0;
        for (key, bytes) in entries {
            let entry = match decode_entry(&bytes) {
                Ok(entry) if entry.durability == Durability::Portable => entry,
                Ok(_) => continue,
                Err(error) => {
                    tracing::warn!(%error, "skipping invalid entry on import");
                    continue;
                }
            };
            if let Err(error) = self.store.put(&key, bytes.clone()) {
                tracing::warn!(%error, "failed to import entry");
                continue;
            }
            self.note_resident(key.into(), &bytes, &entry.deps);
            imported += 1;
        }
        imported
    }

    pub fn entry_count(&self) -> usize {
        self.index.lock().expect("index mutex poisoned").len()
    }

    /// Record an entry as resident in the eviction index and delete any
    /// victims that made room for it.
    fn note_resident(&self, key: IndexKey, bytes: &Bytes, deps: &[Dependency]) {
        let meta = EntryMeta {
            bytes: bytes.len() as u64,
            deps: deps.iter().map(|dep| dep.input.clone()).collect(),
        };
        let victims = self
            .index
            .lock()
            .expect("index mutex poisoned")
            .admit(key, meta);
        for victim in victims {
            self.stats.count_durable_eviction();
            if let Err(error) = self.store.delete(&victim) {
                tracing::warn!(%error, "failed to delete evicted entry");
            }
        }
    }

    fn drop_entry(&self, store_key: &[u8]) {
        self.index
            .lock()
            .expect("index mutex poisoned")
            .remove(store_key);
        if let Err(error) = self.store.delete(store_key) {
            tracing::warn!(%error, "failed to delete invalid entry");
        }
    }

    fn append_dep_record(&self, input: &str, store_key: &[u8]) -> CacheResult<()> {
        let record_key = dep_record_key(input);
        let mut record = self
            .store
            .get(&record_key)?
            .map(|bytes| bytes.to_vec())
            .unwrap_or_default();
        if record.chunks(STORE_KEY_LEN).any(|chunk| chunk == store_key) {
            return Ok(());
        }
        record.extend_from_slice(store_key);
        self.store.put(&record_key, record.into())?;
        Ok(())
    }
}
