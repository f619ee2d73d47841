//! Canonical binary encoding used for hashing, storage and the wire.
//!
//! Every value has exactly one encoding, so two nodes that encode the same
//! block produce the same bytes and therefore the same hash.
//!
//! # Binary Format
//!
//! - Integers: little-endian, fixed-width
//! - `usize`: encoded as `u64`
//! - `bool`: one byte, `0` or `1`
//! - `Vec<T>`, `Box<[T]>`, `Bytes`: `u64` length prefix followed by the elements
//! - `Option<T>`: one tag byte (`0` = None, `1` = Some) followed by the value
//! - `[T; N]`: elements back to back, no prefix
//! - Derived enums: one `u8` tag (variant position) followed by the fields
//!
//! Decoding is strict: truncated input, trailing bytes, out-of-range tags
//! and length prefixes beyond [`MAX_SEQUENCE_LEN`] are all errors.

use crate::types::bytes::Bytes;

/// Upper bound on any decoded sequence length.
pub const MAX_SEQUENCE_LEN: usize = 1 << 24;

/// Destination for encoded bytes.
///
/// Implemented by byte buffers and by the hash builder, so values can be
/// hashed without first being collected into a buffer.
pub trait EncodeSink {
    fn write(&mut self, bytes: &[u8]);
}

impl EncodeSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

/// Sink that only counts bytes.
#[derive(Debug, Default)]
pub struct SizeCounter(usize);

impl SizeCounter {
    pub fn len(&self) -> usize {
        self.0
    }
}

impl EncodeSink for SizeCounter {
    fn write(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

/// Types with a canonical binary encoding.
pub trait Encode {
    /// Writes the canonical encoding of `self` into `out`.
    fn encode<S: EncodeSink>(&self, out: &mut S);

    /// Number of bytes [`Encode::encode`] would write.
    fn encoded_len(&self) -> usize {
        let mut counter = SizeCounter::default();
        self.encode(&mut counter);
        counter.len()
    }

    /// Encodes into a freshly allocated buffer of exact size.
    fn to_bytes(&self) -> Bytes {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode(&mut out);
        Bytes::from(out)
    }
}

/// Errors produced while decoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("length prefix {0} exceeds limit")]
    LengthOverflow(u64),
    #[error("unknown enum tag {0}")]
    UnknownTag(u8),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

/// Types that can be read back from their canonical encoding.
pub trait Decode: Sized {
    /// Reads one value from the front of `input` and advances it.
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a value that must span all of `data`.
    fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut input = data;
        let value = Self::decode(&mut input)?;
        if !input.is_empty() {
            return Err(DecodeError::TrailingBytes(input.len()));
        }
        Ok(value)
    }
}

/// Splits `n` bytes off the front of `input`.
pub fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if input.len() < n {
        return Err(DecodeError::UnexpectedEof);
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

/// Reads a sequence length prefix, enforcing [`MAX_SEQUENCE_LEN`].
pub fn decode_len(input: &mut &[u8]) -> Result<usize, DecodeError> {
    let raw = u64::decode(input)?;
    match usize::try_from(raw) {
        Ok(len) if len <= MAX_SEQUENCE_LEN => Ok(len),
        _ => Err(DecodeError::LengthOverflow(raw)),
    }
}

macro_rules! impl_le_int {
    ($($t:ty),*) => {
        $(
            impl Encode for $t {
                fn encode<S: EncodeSink>(&self, out: &mut S) {
                    out.write(&self.to_le_bytes());
                }
            }

            impl Decode for $t {
                fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    let len = buf.len();
                    buf.copy_from_slice(take(input, len)?);
                    Ok(<$t>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_le_int!(u8, u16, u32, u64, u128, i64);

impl Encode for usize {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (*self as u64).encode(out);
    }
}

impl Decode for usize {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let raw = u64::decode(input)?;
        usize::try_from(raw).map_err(|_| DecodeError::LengthOverflow(raw))
    }
}

impl Encode for bool {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(&[u8::from(*self)]);
    }
}

impl Decode for bool {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue("bool must be 0 or 1")),
        }
    }
}

impl<T: Encode> Encode for [T] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.len().encode(out);
        for item in self {
            item.encode(out);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_slice().encode(out);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = decode_len(input)?;
        // Every element takes at least one byte, so a longer prefix is a lie.
        let mut items = Vec::with_capacity(len.min(input.len()));
        for _ in 0..len {
            items.push(T::decode(input)?);
        }
        Ok(items)
    }
}

impl<T: Encode> Encode for Box<[T]> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_ref().encode(out);
    }
}

impl<T: Decode> Decode for Box<[T]> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Vec::<T>::decode(input).map(Vec::into_boxed_slice)
    }
}

impl<T: Encode> Encode for Option<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        match self {
            None => 0u8.encode(out),
            Some(value) => {
                1u8.encode(out);
                value.encode(out);
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        match u8::decode(input)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(input)?)),
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        out.write(self);
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(take(input, N)?);
        Ok(buf)
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        (**self).encode(out);
    }
}

impl<T: Encode> Encode for std::sync::Arc<T> {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.as_ref().encode(out);
    }
}

impl<T: Decode> Decode for std::sync::Arc<T> {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        T::decode(input).map(std::sync::Arc::new)
    }
}
