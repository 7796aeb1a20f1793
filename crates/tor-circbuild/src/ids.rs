//! Identity types shared across the crate.

use crate::bytes::{BytesError, Readable, Reader, Writeable, Writer};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

/// Length of a relay identity key digest, in bytes.
pub const DIGEST_LEN: usize = 20;

/// The digest of a relay's legacy identity key.
///
/// This is the 20-byte SHA-1 digest that relays are looked up by in
/// the directory, in guard records, and in extend cells.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdDigest([u8; DIGEST_LEN]);

impl IdDigest {
    /// Construct an IdDigest from a 20-byte value.
    pub fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        IdDigest(bytes)
    }
    /// Return the bytes of this digest.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
    /// Return true if this digest is all zero.
    ///
    /// The all-zero digest stands for "identity unknown" on unkeyed
    /// first-hop channels, and is never a legitimate extend target.
    pub fn is_zero(&self) -> bool {
        self.ct_eq(&IdDigest([0_u8; DIGEST_LEN])).into()
    }
}

impl ConstantTimeEq for IdDigest {
    fn ct_eq(&self, other: &Self) -> subtle::Choice {
        self.0.ct_eq(&other.0)
    }
}

impl From<[u8; DIGEST_LEN]> for IdDigest {
    fn from(b: [u8; DIGEST_LEN]) -> Self {
        IdDigest(b)
    }
}

impl std::fmt::Display for IdDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", hex::encode(self.0))
    }
}
impl std::fmt::Debug for IdDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdDigest({})", hex::encode(self.0))
    }
}

impl Readable for IdDigest {
    fn take_from(r: &mut Reader<'_>) -> crate::bytes::Result<Self> {
        Ok(IdDigest(r.take_array()?))
    }
}
impl Writeable for IdDigest {
    fn write_onto<W: Writer + ?Sized>(&self, w: &mut W) -> crate::bytes::Result<()> {
        w.write_all(&self.0);
        Ok(())
    }
}

/// A curve25519 onion key, as used for the ntor handshake.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct NtorOnionKey(pub [u8; 32]);

impl NtorOnionKey {
    /// Return the bytes of this key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}
impl std::fmt::Debug for NtorOnionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NtorOnionKey({})", hex::encode(self.0))
    }
}

/// A legacy RSA-1024 onion key, as used for the TAP handshake.
///
/// Stored as its public components (big-endian modulus and exponent),
/// the way the directory layer hands them over.
#[derive(Clone, Eq, PartialEq)]
pub struct RsaOnionKey {
    /// Big-endian public modulus.
    n: Vec<u8>,
    /// Big-endian public exponent.
    e: Vec<u8>,
}

impl RsaOnionKey {
    /// Construct an onion key from its public components.
    pub fn from_components(n: Vec<u8>, e: Vec<u8>) -> Self {
        RsaOnionKey { n, e }
    }
    /// Return the big-endian public modulus.
    pub fn modulus(&self) -> &[u8] {
        &self.n
    }
    /// Return the big-endian public exponent.
    pub fn exponent(&self) -> &[u8] {
        &self.e
    }
}
impl std::fmt::Debug for RsaOnionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RsaOnionKey({} bytes)", self.n.len())
    }
}

/// Process-local identifier for a circuit.
///
/// Unlike a circuit ID, this is never sent on the wire; it identifies
/// a circuit within the registry for the lifetime of the process.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub struct GlobalId(pub u64);

impl std::fmt::Display for GlobalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circ {}", self.0)
    }
}

/// A relay stream identifier, unique within a circuit.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct StreamId(pub u16);

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn digest_zero() {
        assert!(IdDigest::new([0; 20]).is_zero());
        assert!(!IdDigest::new([3; 20]).is_zero());
    }

    #[test]
    fn digest_display() {
        let id = IdDigest::new([0xaa; 20]);
        assert_eq!(
            id.to_string(),
            "$aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        );
    }

    #[test]
    fn digest_roundtrip() {
        let id = IdDigest::new(*b"wait for the created");
        let mut w: Vec<u8> = Vec::new();
        w.write(&id).unwrap();
        let mut r = Reader::from_slice(&w[..]);
        assert_eq!(r.extract::<IdDigest>().unwrap(), id);
    }
}
