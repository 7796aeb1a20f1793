//! Implementation of the (deprecated) CREATE_FAST handshake.
//!
//! This handshake performs no public-key operations at all: the
//! client and relay each contribute 20 random bytes, and key material
//! is derived from the concatenation.  It is safe only for the first
//! hop of a circuit, where the TLS link already authenticates the
//! relay.

use rand::{CryptoRng, RngCore};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{ClientHandshake, ServerHandshake, TapKeyGenerator};
use crate::cells::{FAST_C_HANDSHAKE_LEN, FAST_S_HANDSHAKE_LEN};
use crate::ids::DIGEST_LEN;
use crate::{Error, Result};

/// How many bytes of seed material feed the KDF.
const SECRET_INPUT_LEN: usize = FAST_C_HANDSHAKE_LEN + DIGEST_LEN;

/// State for a CREATE_FAST client handshake.
pub(crate) struct CreateFastClientState([u8; FAST_C_HANDSHAKE_LEN]);

/// Client side of CREATE_FAST.
pub(crate) struct CreateFastClient;

impl ClientHandshake for CreateFastClient {
    type KeyType = ();
    type StateType = CreateFastClientState;
    type KeyGen = TapKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        _key: &(),
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let mut state = [0_u8; FAST_C_HANDSHAKE_LEN];
        rng.fill_bytes(&mut state);
        Ok((CreateFastClientState(state), state.into()))
    }

    fn client2<T: AsRef<[u8]>>(
        state: Self::StateType,
        msg: T,
    ) -> Result<(Self::KeyGen, [u8; DIGEST_LEN])> {
        let msg = msg.as_ref();
        if msg.len() != FAST_S_HANDSHAKE_LEN {
            return Err(Error::Handshake("wrong length CREATED_FAST reply"));
        }
        let mut inp = Zeroizing::new(Vec::with_capacity(SECRET_INPUT_LEN));
        inp.extend_from_slice(&state.0[..]);
        inp.extend_from_slice(&msg[0..DIGEST_LEN]);

        let keygen = TapKeyGenerator::new(inp);
        let kh_expect = keygen.check_bytes()?;

        if !bool::from(kh_expect[..].ct_eq(&msg[DIGEST_LEN..])) {
            return Err(Error::Handshake("bad KH in CREATED_FAST"));
        }

        Ok((keygen, kh_expect))
    }
}

/// Relay side of CREATE_FAST.
pub(crate) struct CreateFastServer;

impl ServerHandshake for CreateFastServer {
    type KeyType = ();
    type KeyGen = TapKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        _key: &(),
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>, [u8; DIGEST_LEN])> {
        let msg = msg.as_ref();
        if msg.len() != FAST_C_HANDSHAKE_LEN {
            return Err(Error::Handshake("wrong length CREATE_FAST onionskin"));
        }
        let mut reply = vec![0_u8; FAST_S_HANDSHAKE_LEN];
        rng.fill_bytes(&mut reply[0..DIGEST_LEN]);

        let mut inp = Zeroizing::new(Vec::with_capacity(SECRET_INPUT_LEN));
        inp.extend_from_slice(msg);
        inp.extend_from_slice(&reply[0..DIGEST_LEN]);
        let keygen = TapKeyGenerator::new(inp);
        let kh = keygen.check_bytes()?;
        reply[DIGEST_LEN..].copy_from_slice(&kh);

        Ok((keygen, reply, kh))
    }
}
