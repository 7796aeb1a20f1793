//! Key derivation for circuit handshakes.
//!
//! Two KDFs are in use: the legacy KDF-TOR construction (SHA-1 based,
//! used by the fast and TAP handshakes) and the RFC5869 HKDF used by
//! ntor.

use digest::Digest;
use hkdf::Hkdf;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::{Error, Result};

/// A function for expanding seed material into key material.
pub(crate) trait Kdf {
    /// Expand `seed` into `n_bytes` bytes of key material.
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<Zeroizing<Vec<u8>>>;
}

/// The KDF-TOR construction: K_i = H(seed | INT8(i)).
///
/// The counter starts at `idx`, so that a caller which has already
/// consumed the first block (the KH check bytes) can resume the
/// stream where it left off.
pub(crate) struct LegacyKdf {
    /// Starting block counter.
    idx: u8,
}

impl LegacyKdf {
    /// Construct a KDF-TOR instance whose first block has counter
    /// `idx`.
    pub(crate) fn new(idx: u8) -> Self {
        LegacyKdf { idx }
    }
}

impl Kdf for LegacyKdf {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<Zeroizing<Vec<u8>>> {
        let mut out = Zeroizing::new(Vec::with_capacity(n_bytes + 20));
        let mut i = self.idx;
        while out.len() < n_bytes {
            let mut d = Sha1::new();
            d.update(seed);
            d.update([i]);
            out.extend_from_slice(&d.finalize());
            i = i
                .checked_add(1)
                .ok_or(Error::Internal("KDF-TOR counter exhausted"))?;
        }
        out.truncate(n_bytes);
        Ok(out)
    }
}

/// The ntor KDF: RFC5869 HKDF-SHA256 with a protocol-specific salt
/// and info string.
pub(crate) struct Ntor1Kdf<'a, 'b> {
    /// HKDF salt (`t_key` in the handshake description).
    t_key: &'a [u8],
    /// HKDF info (`m_expand`).
    m_expand: &'b [u8],
}

impl<'a, 'b> Ntor1Kdf<'a, 'b> {
    /// Construct an instance with the given salt and info strings.
    pub(crate) fn new(t_key: &'a [u8], m_expand: &'b [u8]) -> Self {
        Ntor1Kdf { t_key, m_expand }
    }
}

impl<'a, 'b> Kdf for Ntor1Kdf<'a, 'b> {
    fn derive(&self, seed: &[u8], n_bytes: usize) -> Result<Zeroizing<Vec<u8>>> {
        let hkdf = Hkdf::<Sha256>::new(Some(self.t_key), seed);
        let mut result = Zeroizing::new(vec![0_u8; n_bytes]);
        hkdf.expand(self.m_expand, &mut result[..])
            .map_err(|_| Error::Internal("requested too much key material"))?;
        Ok(result)
    }
}
