//! Deterministic, portable value encoding for the durable tier.
//!
//! The format is canonical by construction: mapping keys in sorted order over
//! the merged view, minimal-width varint integers, one canonical NaN, no
//! indefinite-length constructs — every length is an explicit prefix. Shared
//! and cyclic structure is preserved with an index-based back-reference
//! table: every cell is assigned an index on first visit and re-visits emit
//! `Ref(index)`. This is deliberately different from the hasher's depth-based
//! back-references: the serialized form must support *reconstruction*, not
//! just comparison.
//!
//! Closures, partially-applied primitives and unforced thunks are refused
//! with [`CacheError::Unserializable`]; a captured environment is never
//! reconstructed across process boundaries.
//!
//! The encoded form ends with a Sha256 checksum over the payload. Decoding
//! re-validates it and reports [`CacheError::Corruption`] on any mismatch —
//! wrong data is never returned silently.

use bytes::Bytes;
use rustc_hash::FxHashMap;

use memovault_values::{Bindings, ObjectId, Peek, Symbol, Text, Value, ValueCell, ValueRef};
use memovault_values::value::{Provenance, ResourceRef};

use crate::caching::{CacheError, CacheResult};
use crate::hasher::Digest;
use crate::wire::{canonical_f64_bits, get_ivarint, get_uvarint, put_ivarint, put_uvarint};

const TAG_NULL: u8 = 0x01;
const TAG_BOOL: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_TEXT: u8 = 0x05;
const TAG_RESOURCE: u8 = 0x06;
const TAG_LIST: u8 = 0x07;
const TAG_ATTRS: u8 = 0x08;
const TAG_REF: u8 = 0x09;

const CHECKSUM_LEN: usize = 32;

/// Encode a value into its canonical portable byte form.
pub fn serialize_value(value: &Value) -> CacheResult<Bytes> {
    let mut encoder = Encoder {
        buf: Vec::new(),
        indices: FxHashMap::default(),
    };
    encoder.encode_value(value)?;
    let checksum = Digest::of(&encoder.buf);
    encoder.buf.extend_from_slice(checksum.as_bytes());
    Ok(encoder.buf.into())
}

/// Decode a value previously produced by [`serialize_value`].
pub fn deserialize_value(bytes: &[u8]) -> CacheResult<Value> {
    let payload_len = bytes
        .len()
        .checked_sub(CHECKSUM_LEN)
        .ok_or_else(|| CacheError::Corruption("shorter than checksum".into()))?;
    let (payload, stored) = bytes.split_at(payload_len);
    if Digest::of(payload).as_bytes() != stored {
        return Err(CacheError::Corruption("checksum mismatch".into()));
    }

    let mut decoder = Decoder {
        data: payload,
        pos: 0,
        cells: Vec::new(),
    };
    let value = decoder.decode_value()?;
    if decoder.pos != payload.len() {
        return Err(CacheError::Corruption("trailing bytes after value".into()));
    }
    Ok(value)
}

struct Encoder {
    buf: Vec<u8>,
    indices: FxHashMap<ObjectId, u32>,
}

impl Encoder {
    fn encode_value(&mut self, value: &Value) -> CacheResult<()> {
        match value {
            Value::Null => self.buf.push(TAG_NULL),
            Value::Bool(b) => {
                self.buf.push(TAG_BOOL);
                self.buf.push(u8::from(*b));
            }
            Value::Int(i) => {
                self.buf.push(TAG_INT);
                put_ivarint(&mut self.buf, *i);
            }
            Value::Float(f) => {
                self.buf.push(TAG_FLOAT);
                self.buf
                    .extend_from_slice(&canonical_f64_bits(*f).to_be_bytes());
            }
            Value::Text(text) => {
                self.buf.push(TAG_TEXT);
                self.put_str(text.content());
                put_uvarint(&mut self.buf, text.context().len() as u64);
                for token in text.context() {
                    self.put_str(token.as_str());
                }
            }
            Value::Resource(resource) => {
                self.buf.push(TAG_RESOURCE);
                self.put_str(resource.token());
            }
            Value::List(items) => {
                self.buf.push(TAG_LIST);
                put_uvarint(&mut self.buf, items.len() as u64);
                for item in items.iter() {
                    self.encode_cell(item)?;
                }
            }
            Value::Attrs(bindings) => {
                let merged = bindings.merged();
                self.buf.push(TAG_ATTRS);
                put_uvarint(&mut self.buf, merged.len() as u64);
                for (name, cell) in &merged {
                    self.put_str(name.as_str());
                    self.encode_cell(cell)?;
                }
            }
            Value::Closure(_) => return Err(CacheError::Unserializable("closure")),
            Value::PrimOpPartial(_) => {
                return Err(CacheError::Unserializable("partially applied primitive"));
            }
        }
        Ok(())
    }

    fn encode_cell(&mut self, cell: &ValueRef) -> CacheResult<()> {
        if let Some(&index) = self.indices.get(&cell.id()) {
            self.buf.push(TAG_REF);
            put_uvarint(&mut self.buf, u64::from(index));
            return Ok(());
        }

        match cell.peek() {
            Peek::Pending { .. } => Err(CacheError::Unserializable("thunk")),
            Peek::Failed(_) => Err(CacheError::Unserializable("failed value")),
            Peek::Forced(value) => {
                // Register before descending so re-visits inside the value
                // (cycles) resolve to this index.
                let index = self.indices.len() as u32;
                self.indices.insert(cell.id(), index);
                self.encode_value(&value)
            }
        }
    }

    fn put_str(&mut self, text: &str) {
        put_uvarint(&mut self.buf, text.len() as u64);
        self.buf.extend_from_slice(text.as_bytes());
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    cells: Vec<ValueRef>,
}

impl Decoder<'_> {
    fn corrupt(detail: &str) -> CacheError {
        CacheError::Corruption(detail.into())
    }

    fn next_byte(&mut self) -> CacheResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Self::corrupt("truncated input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn next_uvarint(&mut self) -> CacheResult<u64> {
        get_uvarint(self.data, &mut self.pos).ok_or_else(|| Self::corrupt("bad varint"))
    }

    fn next_len(&mut self) -> CacheResult<usize> {
        let len = self.next_uvarint()?;
        let remaining = (self.data.len() - self.pos) as u64;
        if len > remaining {
            return Err(Self::corrupt("length prefix exceeds input"));
        }
        Ok(len as usize)
    }

    fn next_str(&mut self) -> CacheResult<String> {
        let len = self.next_len()?;
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        String::from_utf8(bytes.to_vec()).map_err(|_| Self::corrupt("invalid utf-8"))
    }

    fn decode_value(&mut self) -> CacheResult<Value> {
        let tag = self.next_byte()?;
        self.decode_value_with_tag(tag)
    }

    fn decode_value_with_tag(&mut self, tag: u8) -> CacheResult<Value> {
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_BOOL => match self.next_byte()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                _ => Err(Self::corrupt("bad boolean")),
            },
            TAG_INT => get_ivarint(self.data, &mut self.pos)
                .map(Value::Int)
                .ok_or_else(|| Self::corrupt("bad integer")),
            TAG_FLOAT => {
                if self.data.len() - self.pos < 8 {
                    return Err(Self::corrupt("truncated float"));
                }
                let mut bits = [0u8; 8];
                bits.copy_from_slice(&self.data[self.pos..self.pos + 8]);
                self.pos += 8;
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(bits))))
            }
            TAG_TEXT => {
                let content = self.next_str()?;
                let count = self.next_len()?;
                let mut context = Vec::with_capacity(count);
                for _ in 0..count {
                    context.push(Provenance::new(self.next_str()?));
                }
                Ok(Value::Text(Text::with_context(content, context)))
            }
            TAG_RESOURCE => Ok(Value::Resource(ResourceRef::new(self.next_str()?))),
            TAG_LIST => {
                let count = self.next_len()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.decode_cell()?);
                }
                Ok(Value::List(items.into()))
            }
            TAG_ATTRS => {
                let count = self.next_len()?;
                let mut layer = std::collections::BTreeMap::new();
                for _ in 0..count {
                    let name = Symbol::new(self.next_str()?);
                    layer.insert(name, self.decode_cell()?);
                }
                let mut bindings = Bindings::new();
                bindings.push_layer(layer);
                Ok(Value::Attrs(bindings))
            }
            TAG_REF => Err(Self::corrupt("back-reference outside cell position")),
            _ => Err(Self::corrupt("unknown tag")),
        }
    }

    fn decode_cell(&mut self) -> CacheResult<ValueRef> {
        let tag = self.next_byte()?;
        if tag == TAG_REF {
            let index = self.next_uvarint()? as usize;
            return self
                .cells
                .get(index)
                .cloned()
                .ok_or_else(|| Self::corrupt("dangling back-reference"));
        }

        // Register a placeholder first, in the same visit order as the
        // encoder, so back-references inside this cell's own payload resolve.
        let cell = ValueCell::forced(Value::Null);
        self.cells.push(cell.clone());
        let value = self.decode_value_with_tag(tag)?;
        cell.overwrite_forced(value);
        Ok(cell)
    }
}
