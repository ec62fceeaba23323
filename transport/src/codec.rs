//! Binary encoding for [`Command`]/[`Response`] values, and the
//! large-value chunking scheme described in the transport module
//! docs.
//!
//! Composite fields (tree [`Value`]s, [`Patch`]es, paths) are each
//! encoded to their own length-prefixed byte string via
//! [`orchd_tree::encode`] or the local patch/path encoders, so a
//! frame's argument dictionary is a flat list of `(name, bytes)`
//! pairs -- exactly the shape [`chunk`]/[`rejoin`] operate on.

use bytecheck::CheckBytes;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::ser::Serializer;
use rkyv::validation::validators::{check_archived_root, DefaultValidator};

use crate::command::{Command, DomainError, Response};
use crate::error::TransportError;
use orchd::{Era, NodeUuid};
use orchd_diff::{Patch, PatchOp};
use orchd_tree::{Hash, Leaf, PathBuf, Segment, Value};

/// Encodes a fixed-size id newtype (`Era`, `NodeUuid`) to its rkyv
/// archived form. These types archive as themselves (`#[archive(as =
/// "...")]`), so the bytes produced are the plain `[u8; 16]`
/// underneath -- the point is the validated read on the decode side,
/// not a different wire shape.
fn encode_id<T>(value: &T) -> Vec<u8>
where
    T: rkyv::Serialize<AllocSerializer<16>>,
{
    let mut serializer = AllocSerializer::<16>::default();
    serializer
        .serialize_value(value)
        .expect("fixed-size id serialization cannot fail");
    serializer.into_serializer().into_inner().to_vec()
}

/// Validates and decodes a fixed-size id newtype out of untrusted wire
/// bytes via `bytecheck`, rather than trusting the byte count alone.
fn decode_id<T>(bytes: &[u8]) -> Result<T, TransportError>
where
    T: rkyv::Archive<Archived = T> + Copy,
    T: for<'a> CheckBytes<DefaultValidator<'a>>,
{
    check_archived_root::<T>(bytes)
        .map(|archived| *archived)
        .map_err(|error| TransportError::ProtocolViolation(format!("invalid id bytes: {error}")))
}

/// Per-value byte limit before an argument is split into numbered
/// fragments.
pub const CHUNK_LIMIT: usize = 64 * 1024;

/// Splits a named argument into `(name, bytes)` fragments no larger
/// than [`CHUNK_LIMIT`]. Small arguments are returned as a single
/// `(name, bytes)` pair, unchanged.
pub fn chunk(name: &str, bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    if bytes.len() <= CHUNK_LIMIT {
        return vec![(name.to_string(), bytes.to_vec())];
    }
    bytes
        .chunks(CHUNK_LIMIT)
        .enumerate()
        .map(|(i, part)| (format!("{name}.{i}"), part.to_vec()))
        .collect()
}

/// Reassembles the fragments of `name` out of `args`, removing them,
/// and returns the rejoined bytes. Accepts either a single unsplit
/// `name` entry or a contiguous `name.0, name.1, ...` run.
pub fn rejoin(name: &str, args: &mut Vec<(String, Vec<u8>)>) -> Result<Vec<u8>, TransportError> {
    if let Some(pos) = args.iter().position(|(n, _)| n == name) {
        return Ok(args.remove(pos).1);
    }
    let prefix = format!("{name}.");
    let mut indexed = Vec::new();
    args.retain(|(n, bytes)| match n.strip_prefix(&prefix).and_then(|s| s.parse::<usize>().ok()) {
        Some(idx) => {
            indexed.push((idx, bytes.clone()));
            false
        }
        None => true,
    });
    if indexed.is_empty() {
        return Err(TransportError::ChunkReassembly {
            name: name.to_string(),
            reason: "no fragments present",
        });
    }
    indexed.sort_by_key(|(idx, _)| *idx);
    for (expected, (idx, _)) in indexed.iter().enumerate() {
        if *idx != expected {
            return Err(TransportError::ChunkReassembly {
                name: name.to_string(),
                reason: "fragment index gap",
            });
        }
    }
    Ok(indexed.into_iter().flat_map(|(_, bytes)| bytes).collect())
}

fn push_u32(buf: &mut Vec<u8>, n: u32) {
    buf.extend(n.to_be_bytes());
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    push_u32(buf, bytes.len() as u32);
    buf.extend(bytes);
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    push_bytes(buf, s.as_bytes());
}

fn push_hash(buf: &mut Vec<u8>, h: Hash) {
    buf.extend(<[u8; 32]>::from(h));
}

fn push_value(buf: &mut Vec<u8>, v: &Value) {
    push_bytes(buf, &orchd_tree::encode(v));
}

const SEG_FIELD: u8 = 0;
const SEG_KEY: u8 = 1;
const SEG_ITEM: u8 = 2;

fn push_segment(buf: &mut Vec<u8>, segment: &Segment) {
    match segment {
        Segment::Field(name) => {
            buf.push(SEG_FIELD);
            push_str(buf, name);
        }
        Segment::Key(key) => {
            buf.push(SEG_KEY);
            push_value(buf, &Value::Leaf(key.clone()));
        }
        Segment::Item(item) => {
            buf.push(SEG_ITEM);
            push_value(buf, item);
        }
    }
}

fn push_path(buf: &mut Vec<u8>, path: &PathBuf) {
    let segments = path.as_path().segments();
    push_u32(buf, segments.len() as u32);
    for segment in segments {
        push_segment(buf, segment);
    }
}

const OP_SET: u8 = 0;
const OP_ADD: u8 = 1;
const OP_REMOVE: u8 = 2;

fn push_patch(buf: &mut Vec<u8>, patch: &Patch) {
    push_u32(buf, patch.ops().len() as u32);
    for op in patch.ops() {
        match op {
            PatchOp::Set { path, value } => {
                buf.push(OP_SET);
                push_path(buf, path);
                push_value(buf, value);
            }
            PatchOp::Add { path, item } => {
                buf.push(OP_ADD);
                push_path(buf, path);
                push_value(buf, item);
            }
            PatchOp::Remove { path, item } => {
                buf.push(OP_REMOVE);
                push_path(buf, path);
                push_value(buf, item);
            }
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| TransportError::ProtocolViolation("truncated frame".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, TransportError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn bytes_field(&mut self) -> Result<&'a [u8], TransportError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn str_field(&mut self) -> Result<String, TransportError> {
        String::from_utf8(self.bytes_field()?.to_vec())
            .map_err(|_| TransportError::ProtocolViolation("invalid utf8 in frame".to_string()))
    }

    fn hash(&mut self) -> Result<Hash, TransportError> {
        let bytes: [u8; 32] = self.take(32)?.try_into().unwrap();
        Ok(Hash::from(bytes))
    }

    fn fixed16(&mut self) -> Result<[u8; 16], TransportError> {
        Ok(self.take(16)?.try_into().unwrap())
    }

    fn value(&mut self) -> Result<Value, TransportError> {
        let raw = self.bytes_field()?;
        orchd_tree::decode(raw).map_err(|e| TransportError::ProtocolViolation(e.to_string()))
    }

    fn leaf(&mut self) -> Result<Leaf, TransportError> {
        match self.value()? {
            Value::Leaf(leaf) => Ok(leaf),
            _ => Err(TransportError::ProtocolViolation(
                "expected leaf-shaped value".to_string(),
            )),
        }
    }

    fn segment(&mut self) -> Result<Segment, TransportError> {
        match self.u8()? {
            SEG_FIELD => Ok(Segment::Field(self.str_field()?)),
            SEG_KEY => Ok(Segment::Key(self.leaf()?)),
            SEG_ITEM => Ok(Segment::Item(self.value()?)),
            tag => Err(TransportError::ProtocolViolation(format!(
                "unknown path segment tag {tag}"
            ))),
        }
    }

    fn path(&mut self) -> Result<PathBuf, TransportError> {
        let count = self.u32()? as usize;
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            segments.push(self.segment()?);
        }
        Ok(PathBuf::from(segments))
    }

    fn patch(&mut self) -> Result<Patch, TransportError> {
        let count = self.u32()? as usize;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            let op = match self.u8()? {
                OP_SET => PatchOp::Set {
                    path: self.path()?,
                    value: self.value()?,
                },
                OP_ADD => PatchOp::Add {
                    path: self.path()?,
                    item: self.value()?,
                },
                OP_REMOVE => PatchOp::Remove {
                    path: self.path()?,
                    item: self.value()?,
                },
                tag => {
                    return Err(TransportError::ProtocolViolation(format!(
                        "unknown patch op tag {tag}"
                    )))
                }
            };
            ops.push(op);
        }
        Ok(Patch::from_ops(ops))
    }
}

/// Encodes a command's name and its argument dictionary, chunking any
/// oversized argument. The frame layer concatenates these with a
/// length prefix; that part is [`crate::connection`]'s concern.
pub fn encode_command(command: &Command) -> (String, Vec<(String, Vec<u8>)>) {
    let mut raw: Vec<(&str, Vec<u8>)> = Vec::new();
    match command {
        Command::Version | Command::Noop => {}
        Command::NodeState {
            fragments,
            eliot_context,
        } => {
            let mut buf = Vec::new();
            push_u32(&mut buf, fragments.len() as u32);
            for fragment in fragments {
                push_value(&mut buf, fragment);
            }
            raw.push(("fragments", buf));
            raw.push(("eliot_context", eliot_context.as_bytes().to_vec()));
        }
        Command::SetNodeEra { era, node_uuid } => {
            raw.push(("era", encode_id(era)));
            raw.push(("node_uuid", encode_id(node_uuid)));
        }
        Command::SetBlockdeviceId {
            dataset_id,
            blockdevice_id,
        } => {
            raw.push(("dataset_id", dataset_id.as_bytes().to_vec()));
            raw.push(("blockdevice_id", blockdevice_id.as_bytes().to_vec()));
        }
        Command::UpdateFull {
            configuration,
            configuration_generation,
            state,
            state_generation,
            eliot_context,
        } => {
            raw.push(("configuration", orchd_tree::encode(configuration)));
            raw.push((
                "configuration_generation",
                (*configuration_generation).into_bytes(),
            ));
            raw.push(("state", orchd_tree::encode(state)));
            raw.push(("state_generation", (*state_generation).into_bytes()));
            raw.push(("eliot_context", eliot_context.as_bytes().to_vec()));
        }
        Command::UpdateDiff {
            configuration_diff,
            start_configuration_generation,
            end_configuration_generation,
            state_diff,
            start_state_generation,
            end_state_generation,
            eliot_context,
        } => {
            let mut cfg_diff_buf = Vec::new();
            push_patch(&mut cfg_diff_buf, configuration_diff);
            raw.push(("configuration_diff", cfg_diff_buf));
            raw.push((
                "start_configuration_generation",
                (*start_configuration_generation).into_bytes(),
            ));
            raw.push((
                "end_configuration_generation",
                (*end_configuration_generation).into_bytes(),
            ));
            let mut state_diff_buf = Vec::new();
            push_patch(&mut state_diff_buf, state_diff);
            raw.push(("state_diff", state_diff_buf));
            raw.push(("start_state_generation", (*start_state_generation).into_bytes()));
            raw.push(("end_state_generation", (*end_state_generation).into_bytes()));
            raw.push(("eliot_context", eliot_context.as_bytes().to_vec()));
        }
    }
    let args = raw
        .into_iter()
        .flat_map(|(name, bytes)| chunk(name, &bytes))
        .collect();
    (command.name().to_string(), args)
}

trait HashBytes {
    fn into_bytes(self) -> Vec<u8>;
}

impl HashBytes for Hash {
    fn into_bytes(self) -> Vec<u8> {
        <[u8; 32]>::from(self).to_vec()
    }
}

/// Decodes a command from its wire name and (already rejoined, per
/// [`rejoin`]) argument dictionary.
pub fn decode_command(name: &str, mut args: Vec<(String, Vec<u8>)>) -> Result<Command, TransportError> {
    let mut take = |field: &str| rejoin(field, &mut args);
    match name {
        "VERSION" => Ok(Command::Version),
        "NOOP" => Ok(Command::Noop),
        "NODE_STATE" => {
            let fragments_bytes = take("fragments")?;
            let mut cursor = Cursor::new(&fragments_bytes);
            let count = cursor.u32()? as usize;
            let mut fragments = Vec::with_capacity(count);
            for _ in 0..count {
                fragments.push(cursor.value()?);
            }
            let eliot_context = String::from_utf8(take("eliot_context")?)
                .map_err(|_| TransportError::ProtocolViolation("invalid utf8".to_string()))?;
            Ok(Command::NodeState {
                fragments,
                eliot_context,
            })
        }
        "SET_NODE_ERA" => {
            let era: Era = decode_id(&take("era")?)?;
            let node_uuid: NodeUuid = decode_id(&take("node_uuid")?)?;
            Ok(Command::SetNodeEra { era, node_uuid })
        }
        "SET_BLOCKDEVICE_ID" => {
            let dataset_id = String::from_utf8(take("dataset_id")?)
                .map_err(|_| TransportError::ProtocolViolation("invalid utf8".to_string()))?;
            let blockdevice_id = String::from_utf8(take("blockdevice_id")?)
                .map_err(|_| TransportError::ProtocolViolation("invalid utf8".to_string()))?;
            Ok(Command::SetBlockdeviceId {
                dataset_id,
                blockdevice_id,
            })
        }
        "UPDATE_FULL" => {
            let configuration = orchd_tree::decode(&take("configuration")?)
                .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
            let configuration_generation = hash_from_bytes(&take("configuration_generation")?)?;
            let state = orchd_tree::decode(&take("state")?)
                .map_err(|e| TransportError::ProtocolViolation(e.to_string()))?;
            let state_generation = hash_from_bytes(&take("state_generation")?)?;
            let eliot_context = String::from_utf8(take("eliot_context")?)
                .map_err(|_| TransportError::ProtocolViolation("invalid utf8".to_string()))?;
            Ok(Command::UpdateFull {
                configuration,
                configuration_generation,
                state,
                state_generation,
                eliot_context,
            })
        }
        "UPDATE_DIFF" => {
            let configuration_diff = Cursor::new(&take("configuration_diff")?).patch()?;
            let start_configuration_generation =
                hash_from_bytes(&take("start_configuration_generation")?)?;
            let end_configuration_generation =
                hash_from_bytes(&take("end_configuration_generation")?)?;
            let state_diff = Cursor::new(&take("state_diff")?).patch()?;
            let start_state_generation = hash_from_bytes(&take("start_state_generation")?)?;
            let end_state_generation = hash_from_bytes(&take("end_state_generation")?)?;
            let eliot_context = String::from_utf8(take("eliot_context")?)
                .map_err(|_| TransportError::ProtocolViolation("invalid utf8".to_string()))?;
            Ok(Command::UpdateDiff {
                configuration_diff,
                start_configuration_generation,
                end_configuration_generation,
                state_diff,
                start_state_generation,
                end_state_generation,
                eliot_context,
            })
        }
        other => Err(TransportError::ProtocolViolation(format!(
            "unknown command {other}"
        ))),
    }
}

fn hash_from_bytes(bytes: &[u8]) -> Result<Hash, TransportError> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TransportError::ProtocolViolation("generation hash must be 32 bytes".to_string()))?;
    Ok(Hash::from(array))
}

const RESP_VERSION: u8 = 0;
const RESP_EMPTY: u8 = 1;
const RESP_ACK: u8 = 2;
const RESP_ERROR: u8 = 3;

/// Encodes a [`Response`] as a single self-describing byte string (no
/// chunking -- responses never carry a bulk tree value).
pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut buf = Vec::new();
    match response {
        Response::Version { major } => {
            buf.push(RESP_VERSION);
            push_u32(&mut buf, *major);
        }
        Response::Empty => buf.push(RESP_EMPTY),
        Response::Ack {
            current_configuration_generation,
            current_state_generation,
        } => {
            buf.push(RESP_ACK);
            push_hash(&mut buf, *current_configuration_generation);
            push_hash(&mut buf, *current_state_generation);
        }
        Response::Error(DomainError::AlreadyOwned) => buf.push(RESP_ERROR),
    }
    buf
}

/// Decodes a [`Response`] from [`encode_response`]'s output.
pub fn decode_response(bytes: &[u8]) -> Result<Response, TransportError> {
    let mut cursor = Cursor::new(bytes);
    match cursor.u8()? {
        RESP_VERSION => Ok(Response::Version { major: cursor.u32()? }),
        RESP_EMPTY => Ok(Response::Empty),
        RESP_ACK => Ok(Response::Ack {
            current_configuration_generation: cursor.hash()?,
            current_state_generation: cursor.hash()?,
        }),
        RESP_ERROR => Ok(Response::Error(DomainError::AlreadyOwned)),
        tag => Err(TransportError::ProtocolViolation(format!(
            "unknown response tag {tag}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_of_small_argument_is_single_fragment() {
        let fragments = chunk("eliot_context", b"short");
        assert_eq!(fragments, vec![("eliot_context".to_string(), b"short".to_vec())]);
    }

    #[test]
    fn chunk_then_rejoin_recovers_large_argument() {
        let payload = vec![7u8; CHUNK_LIMIT * 2 + 13];
        let mut fragments = chunk("configuration", &payload);
        assert!(fragments.len() > 1);
        let rejoined = rejoin("configuration", &mut fragments).unwrap();
        assert_eq!(rejoined, payload);
        assert!(fragments.is_empty());
    }

    #[test]
    fn rejoin_missing_argument_errors() {
        let mut fragments = Vec::new();
        assert!(rejoin("missing", &mut fragments).is_err());
    }

    #[test]
    fn command_roundtrips_through_encode_decode() {
        let command = Command::NodeState {
            fragments: vec![Value::leaf("observed")],
            eliot_context: "ctx-1".to_string(),
        };
        let (name, args) = encode_command(&command);
        let decoded = decode_command(&name, args).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn update_full_roundtrips() {
        let command = Command::UpdateFull {
            configuration: Value::record(vec![("a", Value::leaf(1i64))]),
            configuration_generation: orchd_tree::hash(&Value::leaf(1i64)),
            state: Value::record(vec![("b", Value::leaf(2i64))]),
            state_generation: orchd_tree::hash(&Value::leaf(2i64)),
            eliot_context: "ctx".to_string(),
        };
        let (name, args) = encode_command(&command);
        let decoded = decode_command(&name, args).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn response_roundtrips() {
        let response = Response::Ack {
            current_configuration_generation: orchd_tree::hash(&Value::leaf(1i64)),
            current_state_generation: orchd_tree::hash(&Value::leaf(2i64)),
        };
        let bytes = encode_response(&response);
        assert_eq!(decode_response(&bytes).unwrap(), response);
    }
}
