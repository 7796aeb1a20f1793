//! Relay cell cryptography for one hop.
//!
//! The client shares two directions of state with every relay on a
//! circuit: a "forward" keyed AES-128-CTR cipher plus running SHA-1
//! digest for cells it sends, and a "backward" pair for cells it
//! receives.  A cell "originates" at a hop when that hop's digest
//! recognizes it; intermediate hops only add or strip a layer of
//! cipher-stream.

use cipher::generic_array::GenericArray;
use cipher::{KeyIvInit, StreamCipher};
use digest::Digest;
use sha1::Sha1;

use crate::cells::CELL_PAYLOAD_SIZE;
use crate::crypto::handshake::CPATH_KEY_MATERIAL_LEN;
use crate::ids::DIGEST_LEN;
use crate::{Error, Result};

/// Key length for the relay-cell stream cipher.
pub(crate) const CIPHER_KEY_LEN: usize = 16;

/// AES-128-CTR as instantiated for relay cells.
type RelayCipher = ctr::Ctr128BE<aes::Aes128>;

/// The body of a relay cell, as encrypted and digested.
#[derive(Clone)]
pub(crate) struct RelayCellBody(pub(crate) Box<[u8; CELL_PAYLOAD_SIZE]>);

impl RelayCellBody {
    /// Return a zeroed relay cell body.
    pub(crate) fn zeroed() -> Self {
        RelayCellBody(Box::new([0_u8; CELL_PAYLOAD_SIZE]))
    }
    /// Return the digest field of this cell.
    fn digest_field(&self) -> [u8; 4] {
        let mut d = [0_u8; 4];
        d.copy_from_slice(&self.0[5..9]);
        d
    }
    /// Overwrite the digest field of this cell.
    fn set_digest_field(&mut self, d: &[u8; 4]) {
        self.0[5..9].copy_from_slice(d);
    }
    /// Return the "recognized" field of this cell.
    fn recognized(&self) -> u16 {
        u16::from_be_bytes([self.0[1], self.0[2]])
    }
}
impl AsRef<[u8]> for RelayCellBody {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}
impl AsMut<[u8]> for RelayCellBody {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0[..]
    }
}

/// Advance `digest` over `cell` (with its digest field zeroed) and
/// return the 4 check bytes, along with the advanced state.
fn updated_digest(digest: &Sha1, cell: &RelayCellBody) -> (Sha1, [u8; 4]) {
    let mut d = digest.clone();
    let mut copy = cell.clone();
    copy.set_digest_field(&[0_u8; 4]);
    d.update(&copy.0[..]);
    let snapshot = d.clone().finalize();
    let mut check = [0_u8; 4];
    check.copy_from_slice(&snapshot[..4]);
    (d, check)
}

/// One hop's share of a circuit's cryptographic state, both
/// directions.
pub(crate) struct HopCrypt {
    /// Digest over cells we send toward the far end of the circuit.
    f_digest: Sha1,
    /// Digest over cells the far end sends toward us.
    b_digest: Sha1,
    /// Cipher for the forward direction.
    f_crypto: RelayCipher,
    /// Cipher for the backward direction.
    b_crypto: RelayCipher,
}

impl HopCrypt {
    /// Initialize a hop's state from `CPATH_KEY_MATERIAL_LEN` bytes
    /// of key material, laid out as Df | Db | Kf | Kb.
    ///
    /// If `reverse` is set, the forward and backward states trade
    /// places; the onionskin responder uses the same key material as
    /// the client, mapped the other way around.
    pub(crate) fn initialize(key_data: &[u8], reverse: bool) -> Result<Self> {
        if key_data.len() != CPATH_KEY_MATERIAL_LEN {
            return Err(Error::Internal("wrong key material length for hop"));
        }
        let mut f_digest = Sha1::new();
        f_digest.update(&key_data[0..DIGEST_LEN]);
        let mut b_digest = Sha1::new();
        b_digest.update(&key_data[DIGEST_LEN..2 * DIGEST_LEN]);

        let zero_iv = Default::default();
        let f_key = &key_data[2 * DIGEST_LEN..2 * DIGEST_LEN + CIPHER_KEY_LEN];
        let b_key = &key_data[2 * DIGEST_LEN + CIPHER_KEY_LEN..];
        let f_crypto = RelayCipher::new(GenericArray::from_slice(f_key), &zero_iv);
        let b_crypto = RelayCipher::new(GenericArray::from_slice(b_key), &zero_iv);

        let (f_digest, b_digest, f_crypto, b_crypto) = if reverse {
            (b_digest, f_digest, b_crypto, f_crypto)
        } else {
            (f_digest, b_digest, f_crypto, b_crypto)
        };
        Ok(HopCrypt {
            f_digest,
            b_digest,
            f_crypto,
            b_crypto,
        })
    }

    // Client-side operations.

    /// Prepare `cell` to originate at this hop and encrypt it with
    /// this hop's forward key.  The caller then applies
    /// [`encrypt_outbound`](Self::encrypt_outbound) for each earlier
    /// hop, innermost first.
    pub(crate) fn originate_for(&mut self, cell: &mut RelayCellBody) {
        let (d, check) = updated_digest(&self.f_digest, cell);
        self.f_digest = d;
        cell.set_digest_field(&check);
        self.f_crypto.apply_keystream(cell.as_mut());
    }

    /// Add this hop's layer to an outbound cell.
    pub(crate) fn encrypt_outbound(&mut self, cell: &mut RelayCellBody) {
        self.f_crypto.apply_keystream(cell.as_mut());
    }

    /// Strip this hop's layer from an inbound cell, and check whether
    /// the cell originated here.
    ///
    /// Returns true if this hop was the originator; in that case the
    /// backward digest has been advanced over the cell.
    pub(crate) fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> bool {
        self.b_crypto.apply_keystream(cell.as_mut());
        self.recognize(cell, Direction::Backward)
    }

    // Relay-side operations, used by the responder after key
    // derivation and by tests standing in for the far end.

    /// Strip the client's layer from a cell moving away from the
    /// client, and check whether it is addressed to us.
    pub(crate) fn decrypt_outbound(&mut self, cell: &mut RelayCellBody) -> bool {
        self.f_crypto.apply_keystream(cell.as_mut());
        self.recognize(cell, Direction::Forward)
    }

    /// Prepare `cell` to originate at this relay, moving toward the
    /// client, and add our layer.
    pub(crate) fn originate_toward_client(&mut self, cell: &mut RelayCellBody) {
        let (d, check) = updated_digest(&self.b_digest, cell);
        self.b_digest = d;
        cell.set_digest_field(&check);
        self.b_crypto.apply_keystream(cell.as_mut());
    }

    /// Add our layer to a cell moving toward the client that
    /// originated further out.
    pub(crate) fn encrypt_inbound(&mut self, cell: &mut RelayCellBody) {
        self.b_crypto.apply_keystream(cell.as_mut());
    }

    /// Check the recognized and digest fields of a decrypted cell
    /// against the given direction's running digest, committing the
    /// digest state on success.
    fn recognize(&mut self, cell: &RelayCellBody, dir: Direction) -> bool {
        if cell.recognized() != 0 {
            return false;
        }
        let state = match dir {
            Direction::Forward => &self.f_digest,
            Direction::Backward => &self.b_digest,
        };
        let (d, check) = updated_digest(state, cell);
        if check != cell.digest_field() {
            return false;
        }
        match dir {
            Direction::Forward => self.f_digest = d,
            Direction::Backward => self.b_digest = d,
        }
        true
    }
}

/// Which running digest a recognition check runs against.
enum Direction {
    /// Cells moving away from the client.
    Forward,
    /// Cells moving toward the client.
    Backward,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn keypairs(n: usize) -> (Vec<HopCrypt>, Vec<HopCrypt>) {
        let mut client = Vec::new();
        let mut relays = Vec::new();
        for i in 0..n {
            let mut km = [0_u8; CPATH_KEY_MATERIAL_LEN];
            let mut rng = StdRng::seed_from_u64(1000 + i as u64);
            rng.fill_bytes(&mut km);
            client.push(HopCrypt::initialize(&km, false).unwrap());
            relays.push(HopCrypt::initialize(&km, false).unwrap());
        }
        (client, relays)
    }

    fn cell_with_payload(rng: &mut StdRng) -> RelayCellBody {
        let mut cell = RelayCellBody::zeroed();
        rng.fill_bytes(&mut cell.0[11..]);
        cell.0[0] = 2; // DATA
        cell
    }

    #[test]
    fn outbound_roundtrip_three_hops() {
        let (mut client, mut relays) = keypairs(3);
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..10 {
            let mut cell = cell_with_payload(&mut rng);
            let reference = cell.clone();

            // Originate at hop 2, wrap with hops 1 and 0.
            client[2].originate_for(&mut cell);
            client[1].encrypt_outbound(&mut cell);
            client[0].encrypt_outbound(&mut cell);

            assert!(!relays[0].decrypt_outbound(&mut cell));
            assert!(!relays[1].decrypt_outbound(&mut cell));
            assert!(relays[2].decrypt_outbound(&mut cell));
            assert_eq!(&cell.0[11..], &reference.0[11..]);
        }
    }

    #[test]
    fn inbound_roundtrip_and_origin_detection() {
        let (mut client, mut relays) = keypairs(3);
        let mut rng = StdRng::seed_from_u64(2);

        // A cell originated by the middle hop is recognized there and
        // nowhere else.
        let mut cell = cell_with_payload(&mut rng);
        let reference = cell.clone();
        relays[1].originate_toward_client(&mut cell);
        relays[0].encrypt_inbound(&mut cell);

        assert!(!client[0].decrypt_inbound(&mut cell));
        assert!(client[1].decrypt_inbound(&mut cell));
        assert_eq!(&cell.0[11..], &reference.0[11..]);
    }

    #[test]
    fn reverse_swaps_directions() {
        let mut km = [0_u8; CPATH_KEY_MATERIAL_LEN];
        let mut rng = StdRng::seed_from_u64(3);
        rng.fill_bytes(&mut km);
        let mut client = HopCrypt::initialize(&km, false).unwrap();
        let mut responder = HopCrypt::initialize(&km, true).unwrap();

        // With the responder reversed, the client's forward stream is
        // the responder's backward stream: a cell the client
        // originates is recognized by the responder's *inbound* path.
        let mut cell = cell_with_payload(&mut rng);
        client.originate_for(&mut cell);
        assert!(responder.decrypt_inbound(&mut cell));
    }

    #[test]
    fn corrupted_cell_not_recognized() {
        let (mut client, mut relays) = keypairs(1);
        let mut rng = StdRng::seed_from_u64(4);
        let mut cell = cell_with_payload(&mut rng);
        client[0].originate_for(&mut cell);
        cell.0[100] ^= 1;
        assert!(!relays[0].decrypt_outbound(&mut cell));
    }
}
