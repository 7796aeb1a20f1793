//! Low-level byte reading and writing for cell bodies.
//!
//! These are deliberately minimal: a consuming [`Reader`] over a byte
//! slice, and a [`Writer`] extension trait implemented for `Vec<u8>`.
//! Cell types in [`crate::cells`] are built on top of them.

use thiserror::Error;

/// An error from trying to decode or encode a binary object.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum BytesError {
    /// The message was truncated: we needed more bytes than were present.
    #[error("object truncated (or not fully present)")]
    Truncated,
    /// The message contained more bytes than the object should have.
    #[error("extra bytes at end of object")]
    ExtraneousBytes,
    /// A length field would not fit in its wire representation.
    #[error("object length too large for encoding")]
    BadLengthValue,
    /// The bytes were present, but didn't parse as the expected object.
    #[error("bad object: {0}")]
    InvalidMessage(&'static str),
}

/// A result type for decoding and encoding operations.
pub type Result<T> = std::result::Result<T, BytesError>;

/// A type that can be decoded from a [`Reader`].
pub trait Readable: Sized {
    /// Try to extract an object of this type from `r`.
    fn take_from(r: &mut Reader<'_>) -> Result<Self>;
}

/// A consuming cursor over a byte slice.
pub struct Reader<'a> {
    /// The underlying bytes.
    b: &'a [u8],
    /// Position of the next unconsumed byte.
    off: usize,
}

impl<'a> Reader<'a> {
    /// Construct a new Reader over `b`.
    pub fn from_slice(b: &'a [u8]) -> Self {
        Reader { b, off: 0 }
    }
    /// Return the number of unconsumed bytes.
    pub fn remaining(&self) -> usize {
        self.b.len() - self.off
    }
    /// Consume and return the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(BytesError::Truncated);
        }
        let v = &self.b[self.off..self.off + n];
        self.off += n;
        Ok(v)
    }
    /// Consume and return the next `N` bytes as an array.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let b = self.take(N)?;
        let mut arr = [0_u8; N];
        arr.copy_from_slice(b);
        Ok(arr)
    }
    /// Consume and return a single byte.
    pub fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    /// Consume and return a big-endian u16.
    pub fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }
    /// Consume and return a big-endian u32.
    pub fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }
    /// Consume and return the rest of the input.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let v = &self.b[self.off..];
        self.off = self.b.len();
        v
    }
    /// Decode an object of type `E` from this reader.
    pub fn extract<E: Readable>(&mut self) -> Result<E> {
        E::take_from(self)
    }
    /// Decode `n` objects of type `E` from this reader.
    pub fn extract_n<E: Readable>(&mut self, n: usize) -> Result<Vec<E>> {
        let mut v = Vec::with_capacity(n);
        for _ in 0..n {
            v.push(E::take_from(self)?);
        }
        Ok(v)
    }
    /// Succeed if no bytes remain unconsumed.
    pub fn should_be_exhausted(&self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(BytesError::ExtraneousBytes);
        }
        Ok(())
    }
}

/// A type that can be encoded onto a [`Writer`].
pub trait Writeable {
    /// Encode this object onto `w`.
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()>;
}

/// A growable byte sink.
pub trait Writer {
    /// Append `bytes` to this writer.
    fn write_all(&mut self, bytes: &[u8]);
    /// Append a single byte.
    fn write_u8(&mut self, v: u8) {
        self.write_all(&[v]);
    }
    /// Append a big-endian u16.
    fn write_u16(&mut self, v: u16) {
        self.write_all(&v.to_be_bytes());
    }
    /// Append a big-endian u32.
    fn write_u32(&mut self, v: u32) {
        self.write_all(&v.to_be_bytes());
    }
    /// Append `n` zero bytes.
    fn write_zeros(&mut self, n: usize) {
        self.write_all(&vec![0_u8; n]);
    }
    /// Encode a [`Writeable`] object onto this writer.
    fn write<E: Writeable + ?Sized>(&mut self, e: &E) -> Result<()> {
        e.write_onto(self)
    }
}

impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl Readable for std::net::Ipv4Addr {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(r.take_u32()?.into())
    }
}
impl Writeable for std::net::Ipv4Addr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_u32((*self).into());
        Ok(())
    }
}
impl Readable for std::net::Ipv6Addr {
    fn take_from(r: &mut Reader<'_>) -> Result<Self> {
        Ok(u128::from_be_bytes(r.take_array()?).into())
    }
}
impl Writeable for std::net::Ipv6Addr {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_all(&u128::from(*self).to_be_bytes());
        Ok(())
    }
}
