//! Circuit extension handshakes.
//!
//! All of the handshakes here implement a one-way-authenticated key
//! exchange: the client sends a "client onionskin" in a create or
//! extend cell, and the relay answers with a "relay onionskin".  When
//! the handshake succeeds, both sides share fresh key material for
//! the hop.
//!
//! Three variants exist: the keyless CREATE_FAST exchange (safe only
//! on an authenticated first-hop link), the legacy TAP handshake
//! (RSA-1024 + DH), and ntor (curve25519).

pub(crate) mod fast;
pub(crate) mod ntor;
pub(crate) mod tap;

use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::cells::HandshakeType;
use crate::crypto::kdf::{Kdf, LegacyKdf};
use crate::extendinfo::ExtendInfo;
use crate::ids::DIGEST_LEN;
use crate::{Error, Result};

/// Length of the key material carried per hop: two digest seeds and
/// two cipher keys.
pub(crate) const CPATH_KEY_MATERIAL_LEN: usize = 2 * DIGEST_LEN + 2 * 16;

/// Key material derived for one hop, plus the handshake-bound nonce.
pub(crate) struct HopKeyMaterial {
    /// Df | Db | Kf | Kb, in that order.
    pub(crate) keys: Zeroizing<[u8; CPATH_KEY_MATERIAL_LEN]>,
    /// A handshake-derived value bound to this hop.
    pub(crate) rend_circ_nonce: [u8; DIGEST_LEN],
}

/// A ClientHandshake is used to generate a client onionskin and
/// handle a relay onionskin.
pub(crate) trait ClientHandshake {
    /// The type for the relay's onion key.
    type KeyType;
    /// The state the client holds while waiting for a reply.
    type StateType;
    /// The key generator returned on success.
    type KeyGen;

    /// Generate a new client onionskin for a relay with onion key
    /// `key`.  On success, return a state object and the message to
    /// send.
    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)>;

    /// Handle an onionskin from a relay, and produce a key generator
    /// along with the handshake-bound check bytes.
    ///
    /// The state object must match the one used to make the client
    /// onionskin the relay is answering.
    fn client2<T: AsRef<[u8]>>(
        state: Self::StateType,
        msg: T,
    ) -> Result<(Self::KeyGen, [u8; DIGEST_LEN])>;
}

/// A ServerHandshake is used to handle a client onionskin and
/// generate a relay onionskin.
pub(crate) trait ServerHandshake {
    /// The type for the relay's onion key.  This is a private key
    /// type.
    type KeyType;
    /// The key generator returned on success.
    type KeyGen;

    /// Perform the relay side of the handshake.  On success, return a
    /// key generator, the reply to send, and the check bytes.
    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &Self::KeyType,
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>, [u8; DIGEST_LEN])>;
}

/// A KeyGenerator is returned by a handshake and used to derive the
/// hop's key material.  It can only be used once.
pub(crate) trait KeyGenerator {
    /// Consume the generator, producing `keylen` bytes.
    fn expand(self, keylen: usize) -> Result<Zeroizing<Vec<u8>>>;
}

/// Generates keys with the KDF-TOR construction, starting after the
/// KH block (the fast and TAP handshakes consume KH separately).
pub(crate) struct TapKeyGenerator {
    /// Seed for the KDF.
    seed: Zeroizing<Vec<u8>>,
}

impl TapKeyGenerator {
    /// Create a key generator from shared seed material.
    pub(crate) fn new(seed: Zeroizing<Vec<u8>>) -> Self {
        TapKeyGenerator { seed }
    }
    /// Derive the KH check bytes for this seed (the first KDF block).
    pub(crate) fn check_bytes(&self) -> Result<[u8; DIGEST_LEN]> {
        let b = LegacyKdf::new(0).derive(&self.seed, DIGEST_LEN)?;
        let mut out = [0_u8; DIGEST_LEN];
        out.copy_from_slice(&b);
        Ok(out)
    }
}

impl KeyGenerator for TapKeyGenerator {
    fn expand(self, keylen: usize) -> Result<Zeroizing<Vec<u8>>> {
        LegacyKdf::new(1).derive(&self.seed, keylen)
    }
}

/// The in-progress state of one hop's handshake, tagged by variant.
pub(crate) enum HandshakeState {
    /// A pending CREATE_FAST exchange.
    Fast(fast::CreateFastClientState),
    /// A pending ntor exchange.
    Ntor(ntor::NtorHandshakeState),
    /// A pending TAP exchange.
    Tap(tap::TapClientState),
}

impl HandshakeState {
    /// Return the handshake type this state belongs to.
    pub(crate) fn handshake_type(&self) -> HandshakeType {
        match self {
            HandshakeState::Fast(_) => HandshakeType::FAST,
            HandshakeState::Ntor(_) => HandshakeType::NTOR,
            HandshakeState::Tap(_) => HandshakeType::TAP,
        }
    }
}

/// Build a client onionskin of type `htype` for the relay described
/// by `info`.
///
/// On success, return the in-progress handshake state (to be stored
/// in the hop) and the onionskin bytes.
pub(crate) fn onion_skin_create<R: RngCore + CryptoRng>(
    rng: &mut R,
    htype: HandshakeType,
    info: &ExtendInfo,
) -> Result<(HandshakeState, Vec<u8>)> {
    match htype {
        HandshakeType::FAST => {
            let (state, skin) = fast::CreateFastClient::client1(rng, &())?;
            Ok((HandshakeState::Fast(state), skin))
        }
        HandshakeType::NTOR => {
            let pk = ntor::NtorPublicKey {
                id: *info.identity(),
                pk: *info
                    .ntor_onion_key()
                    .ok_or(Error::Internal("ntor handshake without curve25519 key"))?,
            };
            let (state, skin) = ntor::NtorClient::client1(rng, &pk)?;
            Ok((HandshakeState::Ntor(state), skin))
        }
        HandshakeType::TAP => {
            let key = info
                .onion_key()
                .ok_or(Error::Internal("TAP handshake without onion key"))?;
            let (state, skin) = tap::TapClient::client1(rng, key)?;
            Ok((HandshakeState::Tap(state), skin))
        }
        _ => Err(Error::Internal("unknown handshake type requested")),
    }
}

/// Complete a client handshake with the relay's reply, producing the
/// hop's key material.
pub(crate) fn onion_skin_client_handshake(
    state: HandshakeState,
    reply: &[u8],
) -> Result<HopKeyMaterial> {
    match state {
        HandshakeState::Fast(state) => {
            let (kg, kh) = fast::CreateFastClient::client2(state, reply)?;
            keys_from_tap_style(kg, kh)
        }
        HandshakeState::Tap(state) => {
            let (kg, kh) = tap::TapClient::client2(state, reply)?;
            keys_from_tap_style(kg, kh)
        }
        HandshakeState::Ntor(state) => {
            let (kg, _auth) = ntor::NtorClient::client2(state, reply)?;
            keys_from_ntor_style(kg)
        }
    }
}

/// Split KDF-TOR style key material: KH was already consumed by the
/// handshake; the nonce is KH itself.
fn keys_from_tap_style(
    kg: TapKeyGenerator,
    kh: [u8; DIGEST_LEN],
) -> Result<HopKeyMaterial> {
    let expanded = kg.expand(CPATH_KEY_MATERIAL_LEN)?;
    let mut keys = Zeroizing::new([0_u8; CPATH_KEY_MATERIAL_LEN]);
    keys.copy_from_slice(&expanded);
    Ok(HopKeyMaterial {
        keys,
        rend_circ_nonce: kh,
    })
}

/// Split ntor style key material: the nonce is the tail of the same
/// KDF stream as the keys.
pub(crate) fn keys_from_ntor_style<K: KeyGenerator>(kg: K) -> Result<HopKeyMaterial> {
    let expanded = kg.expand(CPATH_KEY_MATERIAL_LEN + DIGEST_LEN)?;
    let mut keys = Zeroizing::new([0_u8; CPATH_KEY_MATERIAL_LEN]);
    keys.copy_from_slice(&expanded[..CPATH_KEY_MATERIAL_LEN]);
    let mut rend_circ_nonce = [0_u8; DIGEST_LEN];
    rend_circ_nonce.copy_from_slice(&expanded[CPATH_KEY_MATERIAL_LEN..]);
    Ok(HopKeyMaterial {
        keys,
        rend_circ_nonce,
    })
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn create_fast_end_to_end() {
        let mut rng = StdRng::seed_from_u64(99);
        let info = ExtendInfo::builder()
            .identity(crate::ids::IdDigest::new([1; 20]))
            .addr("192.0.2.1:9001".parse().unwrap())
            .build()
            .unwrap();
        let (state, skin) = onion_skin_create(&mut rng, HandshakeType::FAST, &info).unwrap();
        assert_eq!(skin.len(), crate::cells::FAST_C_HANDSHAKE_LEN);

        let (s_kg, reply, s_kh) =
            fast::CreateFastServer::server(&mut rng, &(), &skin).unwrap();
        let km = onion_skin_client_handshake(state, &reply).unwrap();
        assert_eq!(km.rend_circ_nonce, s_kh);
        let s_keys = s_kg.expand(CPATH_KEY_MATERIAL_LEN).unwrap();
        assert_eq!(&km.keys[..], &s_keys[..]);
    }

    #[test]
    fn ntor_needs_curve_key() {
        let mut rng = StdRng::seed_from_u64(3);
        let info = ExtendInfo::builder()
            .identity(crate::ids::IdDigest::new([1; 20]))
            .addr("192.0.2.1:9001".parse().unwrap())
            .build()
            .unwrap();
        assert!(onion_skin_create(&mut rng, HandshakeType::NTOR, &info).is_err());
    }
}
