//! Serialization for chunk payloads, and chunk framing.
//!
//! Chunk payloads are a flat sequence of fields with no names or type tags in
//! the data itself; reader and writer must agree on the field order. The
//! `ChunkBuilder` and `Payload` types take a field name anyway, which the
//! builder logs at trace level and the reader attaches to errors.
//!
//! Encodings:
//!
//! - Unsigned integers (and `ResourceId`s) are unsigned LEB128. Signed
//!   integers are signed LEB128.
//!
//! - `f32` is its IEEE bit pattern as a little-endian `u32`.
//!
//! - `bool` is a single byte, 0 or 1.
//!
//! - Slices and vectors are a length followed by the elements. Byte slices
//!   are written as a single block.
//!
//! - Strings are serialized like their UTF-8 bytes.
//!
//! - `Option<T>` is a `bool` followed by the value, if present.
//!
//! In the file, each chunk is framed as its tag and its payload length, both
//! unsigned LEB128, followed by the payload. `ChunkReader` walks that framing;
//! see `push_context` and `pop_context`.

use crate::chunk::{Chunk, ChunkType};
use crate::id::ResourceId;

/// A type that can be written into a chunk payload.
pub trait Serialize {
    fn serialize(&self, out: &mut Vec<u8>);

    /// Serialize a `[Self]` slice.
    ///
    /// The default definition writes the length and then each element.
    /// Types that can be written as a single block should override this.
    fn serialize_seq(seq: &[Self], out: &mut Vec<u8>)
    where
        Self: Sized,
    {
        write_unsigned(out, seq.len() as u64);
        for elt in seq {
            elt.serialize(out);
        }
    }
}

/// A type that can be read back out of a chunk payload.
pub trait Deserialize: Sized {
    /// Extract a value from the front of `buf`, and advance `buf` past it.
    fn deserialize(buf: &mut &[u8]) -> Result<Self, DeserializeError>;

    /// Read `len` elements written by `Serialize::serialize_seq`, whose
    /// length has already been consumed.
    fn deserialize_seq(buf: &mut &[u8], len: usize) -> Result<Vec<Self>, DeserializeError> {
        // Every element takes at least one byte, so a length longer than the
        // remaining data is certainly bogus. Check before allocating.
        if len > buf.len() {
            return Err(DeserializeError::UnexpectedEof);
        }
        let mut vec = Vec::with_capacity(len);
        for _ in 0..len {
            vec.push(Self::deserialize(buf)?);
        }
        Ok(vec)
    }
}

pub(crate) fn write_unsigned(out: &mut Vec<u8>, value: u64) {
    // Writing to a `Vec<u8>` never fails.
    let _ = leb128::write::unsigned(out, value);
}

fn write_signed(out: &mut Vec<u8>, value: i64) {
    let _ = leb128::write::signed(out, value);
}

pub(crate) fn read_unsigned(buf: &mut &[u8]) -> Result<u64, DeserializeError> {
    Ok(leb128::read::unsigned(buf)?)
}

fn read_signed(buf: &mut &[u8]) -> Result<i64, DeserializeError> {
    Ok(leb128::read::signed(buf)?)
}

/// Split `len` bytes off the front of `buf`.
pub(crate) fn take_bytes<'b>(buf: &mut &'b [u8], len: usize) -> Result<&'b [u8], DeserializeError> {
    if buf.len() < len {
        return Err(DeserializeError::UnexpectedEof);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

macro_rules! implement_serialize_for_unsigned {
    ( $( $type:ty ),* ) => {
        $(
            impl Serialize for $type {
                fn serialize(&self, out: &mut Vec<u8>) {
                    write_unsigned(out, *self as u64);
                }
            }

            impl Deserialize for $type {
                fn deserialize(buf: &mut &[u8]) -> Result<$type, DeserializeError> {
                    let value = read_unsigned(buf)?;
                    if value > <$type>::MAX as u64 {
                        return Err(DeserializeError::OutOfRange(value));
                    }
                    Ok(value as $type)
                }
            }
        )*
    }
}

implement_serialize_for_unsigned!(u16, u32, u64, usize);

impl Serialize for i32 {
    fn serialize(&self, out: &mut Vec<u8>) {
        write_signed(out, *self as i64);
    }
}

impl Deserialize for i32 {
    fn deserialize(buf: &mut &[u8]) -> Result<i32, DeserializeError> {
        let value = read_signed(buf)?;
        if value < i32::MIN as i64 || value > i32::MAX as i64 {
            return Err(DeserializeError::OutOfRange(value as u64));
        }
        Ok(value as i32)
    }
}

impl Serialize for i64 {
    fn serialize(&self, out: &mut Vec<u8>) {
        write_signed(out, *self);
    }
}

impl Deserialize for i64 {
    fn deserialize(buf: &mut &[u8]) -> Result<i64, DeserializeError> {
        read_signed(buf)
    }
}

/// Bytes are written raw; byte slices as a single block.
impl Serialize for u8 {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }

    fn serialize_seq(seq: &[u8], out: &mut Vec<u8>) {
        write_unsigned(out, seq.len() as u64);
        out.extend_from_slice(seq);
    }
}

impl Deserialize for u8 {
    fn deserialize(buf: &mut &[u8]) -> Result<u8, DeserializeError> {
        Ok(take_bytes(buf, 1)?[0])
    }

    fn deserialize_seq(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, DeserializeError> {
        Ok(take_bytes(buf, len)?.to_vec())
    }
}

impl Serialize for bool {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(*self as u8);
    }
}

impl Deserialize for bool {
    fn deserialize(buf: &mut &[u8]) -> Result<bool, DeserializeError> {
        match u8::deserialize(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DeserializeError::BadEnum { what: "bool", value: other as u64 }),
        }
    }
}

impl Serialize for f32 {
    fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_bits().to_le_bytes());
    }
}

impl Deserialize for f32 {
    fn deserialize(buf: &mut &[u8]) -> Result<f32, DeserializeError> {
        let bytes = take_bytes(buf, 4)?;
        Ok(f32::from_bits(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])))
    }
}

impl Serialize for [f32; 4] {
    fn serialize(&self, out: &mut Vec<u8>) {
        for v in self {
            v.serialize(out);
        }
    }
}

impl Deserialize for [f32; 4] {
    fn deserialize(buf: &mut &[u8]) -> Result<[f32; 4], DeserializeError> {
        Ok([
            f32::deserialize(buf)?,
            f32::deserialize(buf)?,
            f32::deserialize(buf)?,
            f32::deserialize(buf)?,
        ])
    }
}

impl Serialize for ResourceId {
    fn serialize(&self, out: &mut Vec<u8>) {
        write_unsigned(out, self.raw());
    }
}

impl Deserialize for ResourceId {
    fn deserialize(buf: &mut &[u8]) -> Result<ResourceId, DeserializeError> {
        Ok(ResourceId::from_raw(read_unsigned(buf)?))
    }
}

impl<T: Serialize> Serialize for [T] {
    fn serialize(&self, out: &mut Vec<u8>) {
        // Let the element type choose how to write the slice.
        T::serialize_seq(self, out)
    }
}

impl<T: Serialize> Serialize for Vec<T> {
    fn serialize(&self, out: &mut Vec<u8>) {
        T::serialize_seq(self, out)
    }
}

impl<T: Deserialize> Deserialize for Vec<T> {
    fn deserialize(buf: &mut &[u8]) -> Result<Vec<T>, DeserializeError> {
        let len = read_unsigned(buf)?;
        let len = usize::try_from(len).map_err(|_| DeserializeError::OutOfRange(len))?;
        T::deserialize_seq(buf, len)
    }
}

impl Serialize for str {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.as_bytes().serialize(out)
    }
}

impl Serialize for String {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.as_str().serialize(out)
    }
}

impl Deserialize for String {
    fn deserialize(buf: &mut &[u8]) -> Result<String, DeserializeError> {
        String::from_utf8(Vec::<u8>::deserialize(buf)?).map_err(|_| DeserializeError::BadUtf8)
    }
}

impl<T: Serialize> Serialize for Option<T> {
    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            None => false.serialize(out),
            Some(value) => {
                true.serialize(out);
                value.serialize(out);
            }
        }
    }
}

impl<T: Deserialize> Deserialize for Option<T> {
    fn deserialize(buf: &mut &[u8]) -> Result<Option<T>, DeserializeError> {
        if bool::deserialize(buf)? {
            Ok(Some(T::deserialize(buf)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Serialize, B: Serialize> Serialize for (A, B) {
    fn serialize(&self, out: &mut Vec<u8>) {
        self.0.serialize(out);
        self.1.serialize(out);
    }
}

impl<A: Deserialize, B: Deserialize> Deserialize for (A, B) {
    fn deserialize(buf: &mut &[u8]) -> Result<(A, B), DeserializeError> {
        Ok((A::deserialize(buf)?, B::deserialize(buf)?))
    }
}

/// References are transparent to serialization.
impl<T: Serialize + ?Sized> Serialize for &T {
    fn serialize(&self, out: &mut Vec<u8>) {
        (*self).serialize(out)
    }
}

/// Accumulates the payload of a chunk being recorded.
pub struct ChunkBuilder {
    ty: ChunkType,
    payload: Vec<u8>,
}

impl ChunkBuilder {
    pub fn new(ty: ChunkType) -> ChunkBuilder {
        ChunkBuilder { ty, payload: Vec::new() }
    }

    /// Append a field to the payload.
    pub fn field<T: Serialize + ?Sized>(&mut self, name: &str, value: &T) -> &mut ChunkBuilder {
        let start = self.payload.len();
        value.serialize(&mut self.payload);
        tracing::trace!(chunk = self.ty.name(), field = name, bytes = self.payload.len() - start);
        self
    }

    /// Append a block of bytes to the payload.
    pub fn buffer(&mut self, name: &str, bytes: &[u8]) -> &mut ChunkBuilder {
        self.field(name, bytes)
    }

    pub fn finish(&mut self) -> Chunk {
        Chunk::new(self.ty, std::mem::take(&mut self.payload))
    }
}

/// The unread portion of a chunk's payload.
#[derive(Clone, Debug)]
pub struct Payload<'b> {
    buf: &'b [u8],
}

impl<'b> Payload<'b> {
    pub fn new(buf: &'b [u8]) -> Payload<'b> {
        Payload { buf }
    }

    /// Read the next field of the payload.
    pub fn field<T: Deserialize>(&mut self, name: &'static str) -> Result<T, DeserializeError> {
        T::deserialize(&mut self.buf).map_err(|err| err.in_field(name))
    }

    /// Borrow the next block of bytes from the payload.
    pub fn buffer(&mut self, name: &'static str) -> Result<&'b [u8], DeserializeError> {
        let mut buf = self.buf;
        let bytes = read_unsigned(&mut buf)
            .and_then(|len| {
                let len = usize::try_from(len).map_err(|_| DeserializeError::OutOfRange(len))?;
                take_bytes(&mut buf, len)
            })
            .map_err(|err| err.in_field(name))?;
        self.buf = buf;
        Ok(bytes)
    }

    pub fn remaining(&self) -> &'b [u8] {
        self.buf
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// The framing of a chunk that `ChunkReader::push_context` has entered.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ChunkHeader {
    /// The raw tag. It may not be a `ChunkType` this build knows.
    pub tag: u32,
    /// Offset of the chunk's framing within the stream.
    pub offset: usize,
    payload_start: usize,
    end: usize,
}

impl ChunkHeader {
    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_u32(self.tag)
    }

    pub fn payload_len(&self) -> usize {
        self.end - self.payload_start
    }
}

/// Walks the framed chunks of a capture held in memory.
///
/// A reader is always either between chunks, or inside one chunk entered
/// with `push_context`. Leaving the chunk with `pop_context` or
/// `skip_current_chunk` moves to the start of the next one, however much of
/// the payload was consumed.
#[derive(Debug)]
pub struct ChunkReader {
    data: Vec<u8>,
    offset: usize,
    current: Option<ChunkHeader>,
    persistent_start: Option<usize>,
}

impl ChunkReader {
    pub fn new(data: Vec<u8>) -> ChunkReader {
        ChunkReader {
            data,
            offset: 0,
            current: None,
            persistent_start: None,
        }
    }

    /// Enter the chunk at the current offset, returning its framing.
    pub fn push_context(&mut self) -> Result<ChunkHeader, DeserializeError> {
        if let Some(current) = self.current {
            fatal!("push_context at offset {} while inside chunk tag {}", self.offset, current.tag);
            self.offset = current.end;
            self.current = None;
        }

        let start = self.offset;
        let mut buf = &self.data[start..];
        let before = buf.len();
        let tag = read_unsigned(&mut buf)?;
        let tag = u32::try_from(tag).map_err(|_| DeserializeError::OutOfRange(tag))?;
        let len = read_unsigned(&mut buf)?;
        let len = usize::try_from(len).map_err(|_| DeserializeError::OutOfRange(len))?;
        let payload_start = start + (before - buf.len());
        if len > buf.len() {
            return Err(DeserializeError::ChunkOverrun { offset: start, len });
        }

        let header = ChunkHeader {
            tag,
            offset: start,
            payload_start,
            end: payload_start + len,
        };
        self.offset = payload_start;
        self.current = Some(header);
        Ok(header)
    }

    /// The payload of the chunk we're in.
    pub fn payload(&self) -> Payload<'_> {
        match self.current {
            Some(header) => Payload::new(&self.data[header.payload_start..header.end]),
            None => Payload::new(&[]),
        }
    }

    /// Leave the current chunk, checking that it's the one we expect.
    pub fn pop_context(&mut self, expected: ChunkType) -> ChunkType {
        match self.current.take() {
            Some(header) => {
                if header.tag != expected.tag() {
                    fatal!("pop_context expected {:?}, but current chunk tag is {}", expected, header.tag);
                }
                self.offset = header.end;
            }
            None => {
                fatal!("pop_context({:?}) outside any chunk", expected);
            }
        }
        expected
    }

    /// Leave the current chunk without decoding the rest of it.
    pub fn skip_current_chunk(&mut self) {
        if let Some(header) = self.current.take() {
            self.offset = header.end;
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Move to `offset`, which must be the start of a chunk.
    pub fn set_offset(&mut self, offset: usize) {
        self.current = None;
        self.offset = offset.min(self.data.len());
    }

    pub fn at_end(&self) -> bool {
        self.current.is_none() && self.offset >= self.data.len()
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Note that everything from the current offset on is the frame itself,
    /// which replay will revisit at random.
    ///
    /// The whole capture is already in memory, so this only records where
    /// that block starts.
    pub fn mark_persistent(&mut self) {
        self.persistent_start = Some(self.offset);
    }

    pub fn persistent_start(&self) -> Option<usize> {
        self.persistent_start
    }
}

/// Append `chunk`, with its framing, to `out`.
pub fn write_framed(out: &mut Vec<u8>, chunk: &Chunk) {
    write_unsigned(out, chunk.ty().tag() as u64);
    write_unsigned(out, chunk.payload().len() as u64);
    out.extend_from_slice(chunk.payload());
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeserializeError {
    #[error("serialized chunk data truncated")]
    UnexpectedEof,

    #[error("serialized chunk data included bad UTF-8")]
    BadUtf8,

    #[error("serialized chunk data included a malformed LEB128 number")]
    BadNumber,

    #[error("value {0} out of range")]
    OutOfRange(u64),

    #[error("unknown {what} value {value}")]
    BadEnum { what: &'static str, value: u64 },

    #[error("chunk at offset {offset} claims {len} payload bytes, past the end of the data")]
    ChunkOverrun { offset: usize, len: usize },

    #[error("run-length data expands past {limit} bytes")]
    RunTooLong { limit: usize },

    #[error("field `{field}`: {source}")]
    InField {
        field: &'static str,
        source: Box<DeserializeError>,
    },
}

impl DeserializeError {
    fn in_field(self, field: &'static str) -> DeserializeError {
        DeserializeError::InField {
            field,
            source: Box::new(self),
        }
    }

    /// Strip any field annotations.
    pub fn root(&self) -> &DeserializeError {
        match self {
            DeserializeError::InField { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<leb128::read::Error> for DeserializeError {
    fn from(err: leb128::read::Error) -> DeserializeError {
        match err {
            leb128::read::Error::IoError(_) => DeserializeError::UnexpectedEof,
            leb128::read::Error::Overflow => DeserializeError::BadNumber,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_read_back_in_order() {
        let chunk = ChunkBuilder::new(ChunkType::Draw)
            .field("count", &300_u32)
            .field("offset", &-5_i32)
            .field("name", "backbuffer")
            .field("color", &[0.25_f32, 0.5, 0.75, 1.0])
            .field("target", &Some(ResourceId::from_raw(77)))
            .field("none", &None::<u32>)
            .buffer("bytes", &[9, 8, 7])
            .finish();

        let mut payload = Payload::new(chunk.payload());
        assert_eq!(payload.field::<u32>("count").unwrap(), 300);
        assert_eq!(payload.field::<i32>("offset").unwrap(), -5);
        assert_eq!(payload.field::<String>("name").unwrap(), "backbuffer");
        assert_eq!(payload.field::<[f32; 4]>("color").unwrap(), [0.25, 0.5, 0.75, 1.0]);
        assert_eq!(
            payload.field::<Option<ResourceId>>("target").unwrap(),
            Some(ResourceId::from_raw(77))
        );
        assert_eq!(payload.field::<Option<u32>>("none").unwrap(), None);
        assert_eq!(payload.buffer("bytes").unwrap(), &[9, 8, 7]);
        assert!(payload.is_empty());
    }

    #[test]
    fn truncated_field_names_the_field() {
        let mut payload = Payload::new(&[0x80]);
        let err = payload.field::<u32>("width").unwrap_err();
        assert_eq!(err.root(), &DeserializeError::UnexpectedEof);
        assert!(err.to_string().contains("width"));

        let mut payload = Payload::new(&[5, 1, 2]);
        assert_eq!(payload.buffer("data").unwrap_err().root(), &DeserializeError::UnexpectedEof);
    }

    #[test]
    fn narrow_integers_are_range_checked() {
        let mut out = vec![];
        70000_u32.serialize(&mut out);
        let mut buf = &out[..];
        assert_eq!(u16::deserialize(&mut buf), Err(DeserializeError::OutOfRange(70000)));
    }

    #[test]
    fn reader_skips_unread_payload() {
        let mut data = vec![];
        write_framed(&mut data, &ChunkBuilder::new(ChunkType::Draw).field("a", &1_u32).field("b", &2_u32).finish());
        write_framed(&mut data, &ChunkBuilder::new(ChunkType::Dispatch).finish());

        let mut reader = ChunkReader::new(data);
        let first = reader.push_context().unwrap();
        assert_eq!(first.chunk_type(), Some(ChunkType::Draw));
        assert_eq!(reader.payload().field::<u32>("a").unwrap(), 1);
        reader.pop_context(ChunkType::Draw);

        let second = reader.push_context().unwrap();
        assert_eq!(second.chunk_type(), Some(ChunkType::Dispatch));
        assert_eq!(second.payload_len(), 0);
        reader.skip_current_chunk();
        assert!(reader.at_end());

        reader.set_offset(first.offset);
        assert_eq!(reader.push_context().unwrap(), first);
    }

    #[test]
    fn reader_rejects_overrun() {
        // Tag 39, claimed length 100, two bytes of payload.
        let mut reader = ChunkReader::new(vec![39, 100, 1, 2]);
        assert_eq!(
            reader.push_context(),
            Err(DeserializeError::ChunkOverrun { offset: 0, len: 100 })
        );
    }
}
