//! Little-endian wire codec shared by blocks, undo records and index rows.

use std::fmt;

use blockd_consensus::Hash256;

/// Largest length prefix accepted by [`Decoder::read_varint`].
pub const MAX_COMPACT_SIZE: u64 = 0x0200_0000;

#[derive(Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bitcoin CompactSize: one byte below 0xfd, otherwise a marker byte and
    /// the narrowest little-endian width that holds `value`.
    pub fn write_varint(&mut self, value: u64) {
        if let Ok(small @ 0..=0xfc) = u8::try_from(value) {
            self.write_u8(small);
        } else if let Ok(value) = u16::try_from(value) {
            self.write_u8(0xfd);
            self.write_u16_le(value);
        } else if let Ok(value) = u32::try_from(value) {
            self.write_u8(0xfe);
            self.write_u32_le(value);
        } else {
            self.write_u8(0xff);
            self.write_u64_le(value);
        }
    }

    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }

    pub fn write_hash_le(&mut self, hash: &Hash256) {
        self.write_bytes(hash);
    }
}

/// Little-endian fixed-width integer accessors for [`Encoder`] and [`Decoder`].
macro_rules! fixed_width {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        impl Encoder {
            $(
                pub fn $write(&mut self, value: $ty) {
                    self.buf.extend_from_slice(&value.to_le_bytes());
                }
            )*
        }

        impl Decoder<'_> {
            $(
                pub fn $read(&mut self) -> Result<$ty, DecodeError> {
                    self.read_fixed().map(<$ty>::from_le_bytes)
                }
            )*
        }
    };
}

fixed_width! {
    u16 => write_u16_le, read_u16_le;
    u32 => write_u32_le, read_u32_le;
    i32 => write_i32_le, read_i32_le;
    u64 => write_u64_le, read_u64_le;
    i64 => write_i64_le, read_i64_le;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    NonCanonicalVarInt,
    SizeTooLarge,
    InvalidData(&'static str),
    TrailingBytes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            DecodeError::UnexpectedEof => "record ends early",
            DecodeError::NonCanonicalVarInt => "CompactSize not minimally encoded",
            DecodeError::SizeTooLarge => "CompactSize above the length limit",
            DecodeError::InvalidData(message) => message,
            DecodeError::TrailingBytes => "unread bytes after record",
        };
        f.write_str(message)
    }
}

impl std::error::Error for DecodeError {}

pub struct Decoder<'a> {
    input: &'a [u8],
    cursor: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, cursor: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.input.len().saturating_sub(self.cursor)
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.input.len()
    }

    /// Fails with `TrailingBytes` unless the whole input was consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes)
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.input.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = &self.input[self.cursor..end];
        self.cursor = end;
        Ok(slice)
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.take(N)?
            .try_into()
            .map_err(|_| DecodeError::UnexpectedEof)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let [byte] = self.read_fixed::<1>()?;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(len)?.to_vec())
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let (value, min) = match self.read_u8()? {
            prefix @ 0..=0xfc => return Ok(u64::from(prefix)),
            0xfd => (u64::from(self.read_u16_le()?), 0xfd),
            0xfe => (u64::from(self.read_u32_le()?), 0x1_0000),
            _ => (self.read_u64_le()?, 0x1_0000_0000),
        };
        if value < min {
            return Err(DecodeError::NonCanonicalVarInt);
        }
        if value > MAX_COMPACT_SIZE {
            return Err(DecodeError::SizeTooLarge);
        }
        Ok(value)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_varint()?;
        let len = usize::try_from(len).map_err(|_| DecodeError::SizeTooLarge)?;
        self.read_bytes(len)
    }

    pub fn read_hash_le(&mut self) -> Result<Hash256, DecodeError> {
        self.read_fixed::<32>()
    }
}

pub trait Encodable {
    fn consensus_encode(&self, encoder: &mut Encoder);
}

pub trait Decodable: Sized {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError>;
}

pub fn encode<T: Encodable>(value: &T) -> Vec<u8> {
    let mut encoder = Encoder::new();
    value.consensus_encode(&mut encoder);
    encoder.into_inner()
}

pub fn decode<T: Decodable>(bytes: &[u8]) -> Result<T, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let value = T::consensus_decode(&mut decoder)?;
    decoder.finish()?;
    Ok(value)
}
