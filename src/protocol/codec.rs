//! Wire primitives shared by every payload type.
//!
//! All multi-byte integers are big-endian with no sign bit. Fixed-width
//! scalars go through `bincode` configured for big-endian fixed-int encoding,
//! which produces exactly the byte layout of the wire format (a `u16` is two
//! bytes, a `u32` four). Variable-length fields carry an explicit length
//! header written by hand, since bincode's own collection prefix is 64 bits.
use std::io::{self, Read, Write};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use thiserror::Error;

/// Largest payload a single packet can carry.
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Largest byte string a 16-bit length prefix can describe.
pub const MAX_PREFIXED_LENGTH: usize = u16::MAX as usize;

/// Largest client identifier, limited by its one-byte length prefix.
pub const MAX_CLIENT_ID_LENGTH: usize = u8::MAX as usize;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode field: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode field: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("codec IO error: {0}")]
    Io(#[from] io::Error),
    #[error("`{field}` is {length} bytes long, limit is {limit}")]
    TooLong {
        field: &'static str,
        length: usize,
        limit: usize,
    },
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte frame limit")]
    PayloadTooLarge(usize),
    #[error("{0} unexpected trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid UTF-8 in `{0}`")]
    InvalidUtf8(&'static str),
    #[error("invalid JSON in `{field}`: {source}")]
    Json {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("unknown {kind} value {value}")]
    UnknownValue { kind: &'static str, value: u8 },
}

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

pub(crate) fn encode<E: Encode, W: Write>(value: E, writer: &mut W) -> Result<usize, CodecError> {
    Ok(encode_into_std_write(value, writer, config())?)
}

pub(crate) fn decode<D: Decode<()>, R: Read>(reader: &mut R) -> Result<D, CodecError> {
    Ok(decode_from_std_read(reader, config())?)
}

pub fn read_u8<R: Read>(reader: &mut R) -> Result<u8, CodecError> {
    decode(reader)
}

pub fn write_u8<W: Write>(writer: &mut W, value: u8) -> Result<usize, CodecError> {
    encode(value, writer)
}

pub fn read_u16<R: Read>(reader: &mut R) -> Result<u16, CodecError> {
    decode(reader)
}

pub fn write_u16<W: Write>(writer: &mut W, value: u16) -> Result<usize, CodecError> {
    encode(value, writer)
}

pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32, CodecError> {
    decode(reader)
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<usize, CodecError> {
    encode(value, writer)
}

/// Reads a 16-bit length header followed by exactly that many bytes.
pub fn read_length_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let length = read_u16(reader)?;
    read_exact_vec(reader, length as usize)
}

/// Writes a 16-bit length header followed by `bytes`.
pub fn write_length_prefixed<W: Write>(
    writer: &mut W,
    field: &'static str,
    bytes: &[u8],
) -> Result<usize, CodecError> {
    let length = u16::try_from(bytes.len()).map_err(|_| CodecError::TooLong {
        field,
        length: bytes.len(),
        limit: MAX_PREFIXED_LENGTH,
    })?;
    let n = write_u16(writer, length)?;
    writer.write_all(bytes)?;
    Ok(n + bytes.len())
}

/// Reads a one-byte length header followed by exactly that many bytes.
pub fn read_short_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let length = read_u8(reader)?;
    read_exact_vec(reader, length as usize)
}

/// Writes a one-byte length header followed by `bytes`.
pub fn write_short_prefixed<W: Write>(
    writer: &mut W,
    field: &'static str,
    bytes: &[u8],
) -> Result<usize, CodecError> {
    let length = u8::try_from(bytes.len()).map_err(|_| CodecError::TooLong {
        field,
        length: bytes.len(),
        limit: MAX_CLIENT_ID_LENGTH,
    })?;
    let n = write_u8(writer, length)?;
    writer.write_all(bytes)?;
    Ok(n + bytes.len())
}

/// Consumes the rest of `reader`. Only valid on a reader already bounded to
/// a single payload.
pub fn read_remaining<R: Read>(reader: &mut R) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out)?;
    Ok(out)
}

fn read_exact_vec<R: Read>(reader: &mut R, length: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = vec![0; length];
    reader.read_exact(&mut out)?;
    Ok(out)
}
