//! Length-prefixed wire encoding for strings and tokens.
//!
//! Strings are a big-endian `u16` byte length followed by UTF-8 bytes.
//! Tokens travel as their canonical string so that nodes never depend on
//! each other's in-memory token layout.

use crate::dht::{Partitioner, Token};
use crate::error::CodecError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

/// Longest string a two-byte length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Encodes values of one type to and from the wire.
pub trait Serializer: Send + Sync {
    /// Type being encoded.
    type Value;

    /// Append `value` to `buf`.
    fn serialize(&self, value: &Self::Value, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Read one value from the front of `buf`.
    ///
    /// Nothing is consumed when the input is truncated.
    fn deserialize(&self, buf: &mut Bytes) -> Result<Self::Value, CodecError>;

    /// Exact number of bytes `serialize` writes for `value`.
    fn serialized_size(&self, value: &Self::Value) -> usize;
}

/// Two-byte length prefix plus UTF-8.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringSerializer;

impl StringSerializer {
    fn write(s: &str, buf: &mut BytesMut) -> Result<(), CodecError> {
        let len = s.len();
        if len > MAX_STRING_LEN {
            return Err(CodecError::TooLong {
                len,
                max: MAX_STRING_LEN,
            });
        }
        buf.reserve(2 + len);
        buf.put_u16(len as u16);
        buf.put_slice(s.as_bytes());
        Ok(())
    }

    fn read(buf: &mut Bytes) -> Result<String, CodecError> {
        if buf.remaining() < 2 {
            return Err(CodecError::Truncated {
                needed: 2,
                available: buf.remaining(),
            });
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if buf.remaining() < 2 + len {
            return Err(CodecError::Truncated {
                needed: 2 + len,
                available: buf.remaining(),
            });
        }

        buf.advance(2);
        let payload = buf.split_to(len);
        String::from_utf8(payload.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

impl Serializer for StringSerializer {
    type Value = String;

    fn serialize(&self, value: &String, buf: &mut BytesMut) -> Result<(), CodecError> {
        Self::write(value, buf)
    }

    fn deserialize(&self, buf: &mut Bytes) -> Result<String, CodecError> {
        Self::read(buf)
    }

    fn serialized_size(&self, value: &String) -> usize {
        2 + value.len()
    }
}

/// Tokens encoded as their canonical string.
#[derive(Debug, Clone)]
pub struct TokenSerializer {
    partitioner: Arc<dyn Partitioner>,
}

impl TokenSerializer {
    /// Create a serializer using `partitioner`'s text format.
    pub fn new(partitioner: Arc<dyn Partitioner>) -> Self {
        Self { partitioner }
    }

    /// Append a token collection: a big-endian `u32` count, then each token.
    pub fn serialize_all(&self, tokens: &[Token], buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.put_u32(tokens.len() as u32);
        for token in tokens {
            self.serialize(token, buf)?;
        }
        Ok(())
    }

    /// Read a token collection written by [`serialize_all`](Self::serialize_all).
    pub fn deserialize_all(&self, buf: &mut Bytes) -> Result<Vec<Token>, CodecError> {
        if buf.remaining() < 4 {
            return Err(CodecError::Truncated {
                needed: 4,
                available: buf.remaining(),
            });
        }
        let count = buf.get_u32() as usize;
        let mut tokens = Vec::with_capacity(count.min(buf.remaining() / 2));
        for _ in 0..count {
            tokens.push(self.deserialize(buf)?);
        }
        Ok(tokens)
    }
}

impl Serializer for TokenSerializer {
    type Value = Token;

    fn serialize(&self, value: &Token, buf: &mut BytesMut) -> Result<(), CodecError> {
        StringSerializer::write(&self.partitioner.token_to_string(value), buf)
    }

    fn deserialize(&self, buf: &mut Bytes) -> Result<Token, CodecError> {
        let s = StringSerializer::read(buf)?;
        Ok(self.partitioner.token_from_string(&s)?)
    }

    fn serialized_size(&self, value: &Token) -> usize {
        2 + self.partitioner.token_to_string(value).len()
    }
}
