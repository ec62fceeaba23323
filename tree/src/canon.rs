//! Deterministic, self-describing binary encoding for [`Value`].
//!
//! Mappings serialize in sorted key order, sets in sorted element
//! order, and records in declared field order -- `BTreeMap`/`BTreeSet`
//! iteration already gives us the first two for free. This is the
//! single encoding used both to derive a value's content [`Hash`] and
//! to carry values and patches over the wire, so bit-identical values
//! are a hard requirement, not a nicety.

use crate::error::TreeError;
use crate::value::{Leaf, Record, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_STR: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_RECORD: u8 = 5;
const TAG_MAPPING: u8 = 6;
const TAG_SET: u8 = 7;
const TAG_SEQUENCE: u8 = 8;

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend((bytes.len() as u32).to_be_bytes());
    buf.extend(bytes);
}

fn encode_leaf(buf: &mut Vec<u8>, leaf: &Leaf) {
    match leaf {
        Leaf::Null => buf.push(TAG_NULL),
        Leaf::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(if *b { 1 } else { 0 });
        }
        Leaf::Int(i) => {
            buf.push(TAG_INT);
            buf.extend(i.to_be_bytes());
        }
        Leaf::Str(s) => {
            buf.push(TAG_STR);
            push_bytes(buf, s.as_bytes());
        }
        Leaf::Bytes(b) => {
            buf.push(TAG_BYTES);
            push_bytes(buf, b);
        }
    }
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Leaf(leaf) => encode_leaf(buf, leaf),
        Value::Record(record) => {
            buf.push(TAG_RECORD);
            buf.extend((record.fields().len() as u32).to_be_bytes());
            for (name, value) in record.fields() {
                push_bytes(buf, name.as_bytes());
                encode_value(buf, value);
            }
        }
        Value::Mapping(map) => {
            buf.push(TAG_MAPPING);
            buf.extend((map.len() as u32).to_be_bytes());
            for (key, value) in map {
                encode_leaf(buf, key);
                encode_value(buf, value);
            }
        }
        Value::Set(set) => {
            buf.push(TAG_SET);
            buf.extend((set.len() as u32).to_be_bytes());
            for item in set {
                encode_value(buf, item);
            }
        }
        Value::Sequence(seq) => {
            buf.push(TAG_SEQUENCE);
            buf.extend((seq.len() as u32).to_be_bytes());
            for item in seq {
                encode_value(buf, item);
            }
        }
    }
}

/// Encodes a value into its canonical byte representation.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_value(&mut buf, value);
    buf
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], TreeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(TreeError::Truncated)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8, TreeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, TreeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn len_prefixed(&mut self) -> Result<&'a [u8], TreeError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn leaf(&mut self) -> Result<Leaf, TreeError> {
        match self.byte()? {
            TAG_NULL => Ok(Leaf::Null),
            TAG_BOOL => Ok(Leaf::Bool(self.byte()? != 0)),
            TAG_INT => Ok(Leaf::Int(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))),
            TAG_STR => Ok(Leaf::Str(
                String::from_utf8(self.len_prefixed()?.to_vec())
                    .map_err(|_| TreeError::Malformed("invalid utf8 in Str leaf"))?,
            )),
            TAG_BYTES => Ok(Leaf::Bytes(self.len_prefixed()?.to_vec())),
            _ => Err(TreeError::Malformed("unexpected leaf tag")),
        }
    }

    fn value(&mut self) -> Result<Value, TreeError> {
        match self.bytes.get(self.pos).copied().ok_or(TreeError::Truncated)? {
            TAG_RECORD => {
                self.pos += 1;
                let count = self.u32()? as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = String::from_utf8(self.len_prefixed()?.to_vec())
                        .map_err(|_| TreeError::Malformed("invalid utf8 in field name"))?;
                    let value = self.value()?;
                    fields.push((Arc::from(name.as_str()), value));
                }
                Ok(Value::Record(Record::new(fields)))
            }
            TAG_MAPPING => {
                self.pos += 1;
                let count = self.u32()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let key = self.leaf()?;
                    let value = self.value()?;
                    map.insert(key, value);
                }
                Ok(Value::Mapping(map))
            }
            TAG_SET => {
                self.pos += 1;
                let count = self.u32()? as usize;
                let mut set = BTreeSet::new();
                for _ in 0..count {
                    set.insert(self.value()?);
                }
                Ok(Value::Set(set))
            }
            TAG_SEQUENCE => {
                self.pos += 1;
                let count = self.u32()? as usize;
                let mut seq = Vec::with_capacity(count);
                for _ in 0..count {
                    seq.push(self.value()?);
                }
                Ok(Value::Sequence(seq))
            }
            _ => Ok(Value::Leaf(self.leaf()?)),
        }
    }
}

/// Decodes a value from its canonical byte representation, rejecting
/// trailing garbage.
pub fn decode(bytes: &[u8]) -> Result<Value, TreeError> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let value = cursor.value()?;
    if cursor.pos != bytes.len() {
        return Err(TreeError::Malformed("trailing bytes after value"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn roundtrips_every_shape() {
        let v = Value::record(vec![
            ("hosts", Value::set([Value::leaf("y"), Value::leaf("z")])),
            (
                "applications",
                Value::mapping([(
                    Leaf::Str("a".into()),
                    Value::record(vec![("image", Value::leaf("busybox:2"))]),
                )]),
            ),
            ("tags", Value::Sequence(vec![Value::leaf(1i64), Value::leaf(2i64)])),
        ]);
        let bytes = encode(&v);
        assert_eq!(decode(&bytes).unwrap(), v);
    }

    #[test]
    fn equal_values_encode_identically() {
        let a = Value::set([Value::leaf("a"), Value::leaf("b")]);
        let b = Value::set([Value::leaf("b"), Value::leaf("a")]);
        assert_eq!(encode(&a), encode(&b));
    }
}
