//! Implementation of the ntor handshake.
//!
//! This is the curve25519-based circuit extension handshake from
//! proposal 216, as deployed.  The client proves nothing about
//! itself; the relay proves possession of its ntor onion key `b`.

use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use sha2::Sha256;
use subtle::{Choice, ConstantTimeEq};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

use super::{ClientHandshake, KeyGenerator, ServerHandshake};
use crate::bytes::{Reader, Writer};
use crate::cells::{NTOR_C_HANDSHAKE_LEN, NTOR_S_HANDSHAKE_LEN};
use crate::crypto::kdf::{Kdf, Ntor1Kdf};
use crate::ids::{IdDigest, NtorOnionKey, DIGEST_LEN};
use crate::{Error, Result};

/// Protocol identity string, mixed into every hash.
const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
/// Tweak for the final authentication MAC.
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
/// Tweak (HKDF salt) for key extraction.
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
/// Tweak for the verification value.
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
/// HKDF info string for key expansion.
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";
/// Role string mixed into the auth computation.
const SERVER_STR: &[u8] = b"Server";

/// A relay's public onion-key information, as needed to start the
/// handshake.
#[derive(Clone, Debug)]
pub(crate) struct NtorPublicKey {
    /// The relay's identity digest.
    pub(crate) id: IdDigest,
    /// The relay's ntor onion key ("B").
    pub(crate) pk: NtorOnionKey,
}

/// A relay's secret onion-key information.
pub(crate) struct NtorSecretKey {
    /// The public side of this keypair, plus the relay identity.
    pub(crate) pk: NtorPublicKey,
    /// The secret key ("b").
    pub(crate) sk: StaticSecret,
}

impl NtorSecretKey {
    /// Construct a secret key from 32 secret bytes and an identity.
    pub(crate) fn new(sk_bytes: [u8; 32], id: IdDigest) -> Self {
        let sk = StaticSecret::from(sk_bytes);
        let pk = NtorPublicKey {
            id,
            pk: NtorOnionKey(*PublicKey::from(&sk).as_bytes()),
        };
        NtorSecretKey { pk, sk }
    }
}

/// State held by the client while waiting for the relay's reply.
pub(crate) struct NtorHandshakeState {
    /// The relay's public key information.
    relay_public: NtorPublicKey,
    /// Our ephemeral secret ("x").
    my_sk: StaticSecret,
    /// Our ephemeral public key ("X").
    my_public: PublicKey,
}

/// Key generator for the ntor handshake.
pub(crate) struct NtorHkdfKeyGenerator {
    /// The `secret_input` from the handshake.
    seed: Zeroizing<Vec<u8>>,
}

impl KeyGenerator for NtorHkdfKeyGenerator {
    fn expand(self, keylen: usize) -> Result<Zeroizing<Vec<u8>>> {
        Ntor1Kdf::new(T_KEY, M_EXPAND).derive(&self.seed, keylen)
    }
}

/// Compute a tweaked MAC: HMAC-SHA256 keyed with `tweak` over `msg`.
fn h(tweak: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(tweak).expect("HMAC can take a key of any size");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Generate an ephemeral x25519 keypair from `rng`.
fn ephemeral_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> (StaticSecret, PublicKey) {
    let mut sk_bytes = [0_u8; 32];
    rng.fill_bytes(&mut sk_bytes);
    let sk = StaticSecret::from(sk_bytes);
    let pk = PublicKey::from(&sk);
    (sk, pk)
}

/// Compute `secret_input`, `auth`, and the key seed shared by both
/// sides of the handshake.
///
/// `xy` is the shared secret from the two ephemeral keys, and `xb`
/// the one involving the relay's onion key.
fn compute_shared(
    xy: &SharedSecret,
    xb: &SharedSecret,
    relay_public: &NtorPublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> (NtorHkdfKeyGenerator, [u8; 32], Choice) {
    let mut secret_input = Zeroizing::new(Vec::new());
    secret_input.extend_from_slice(xy.as_bytes());
    secret_input.extend_from_slice(xb.as_bytes());
    secret_input.extend_from_slice(relay_public.id.as_bytes());
    secret_input.extend_from_slice(relay_public.pk.as_bytes());
    secret_input.extend_from_slice(x.as_bytes());
    secret_input.extend_from_slice(y.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let verify = h(T_VERIFY, &secret_input);

    let mut auth_input: Vec<u8> = Vec::new();
    auth_input.write_all(&verify);
    auth_input.write_all(relay_public.id.as_bytes());
    auth_input.write_all(relay_public.pk.as_bytes());
    auth_input.write_all(y.as_bytes());
    auth_input.write_all(x.as_bytes());
    auth_input.write_all(PROTOID);
    auth_input.write_all(SERVER_STR);
    let auth = h(T_MAC, &auth_input);

    let okay = Choice::from(u8::from(xy.was_contributory()))
        & Choice::from(u8::from(xb.was_contributory()));

    (NtorHkdfKeyGenerator { seed: secret_input }, auth, okay)
}

/// Client side of the ntor handshake.
pub(crate) struct NtorClient;

impl ClientHandshake for NtorClient {
    type KeyType = NtorPublicKey;
    type StateType = NtorHandshakeState;
    type KeyGen = NtorHkdfKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let (my_sk, my_public) = ephemeral_keypair(rng);
        let mut v: Vec<u8> = Vec::with_capacity(NTOR_C_HANDSHAKE_LEN);
        v.write_all(key.id.as_bytes());
        v.write_all(key.pk.as_bytes());
        v.write_all(my_public.as_bytes());
        debug_assert_eq!(v.len(), NTOR_C_HANDSHAKE_LEN);
        Ok((
            NtorHandshakeState {
                relay_public: key.clone(),
                my_sk,
                my_public,
            },
            v,
        ))
    }

    fn client2<T: AsRef<[u8]>>(
        state: Self::StateType,
        msg: T,
    ) -> Result<(Self::KeyGen, [u8; DIGEST_LEN])> {
        let msg = msg.as_ref();
        if msg.len() != NTOR_S_HANDSHAKE_LEN {
            return Err(Error::Handshake("wrong length ntor reply"));
        }
        let mut r = Reader::from_slice(msg);
        let y_bytes: [u8; 32] = r.take_array().map_err(|_| Error::Handshake("short reply"))?;
        let auth: [u8; 32] = r.take_array().map_err(|_| Error::Handshake("short reply"))?;
        let their_pk = PublicKey::from(y_bytes);

        let xy = state.my_sk.diffie_hellman(&their_pk);
        let xb = state
            .my_sk
            .diffie_hellman(&PublicKey::from(*state.relay_public.pk.as_bytes()));

        let (keygen, expected_auth, okay) = compute_shared(
            &xy,
            &xb,
            &state.relay_public,
            &state.my_public,
            &their_pk,
        );

        let authenticated = expected_auth[..].ct_eq(&auth[..]) & okay;
        if !bool::from(authenticated) {
            return Err(Error::Handshake("ntor authentication failed"));
        }

        // The nonce bytes for ntor come out of the same KDF stream as
        // the hop keys, so client2 doesn't produce them here; give
        // back the tail of the auth value for callers that want a
        // handshake transcript check.
        let mut transcript = [0_u8; DIGEST_LEN];
        transcript.copy_from_slice(&expected_auth[..DIGEST_LEN]);
        Ok((keygen, transcript))
    }
}

/// Relay side of the ntor handshake.
pub(crate) struct NtorServer;

impl ServerHandshake for NtorServer {
    type KeyType = NtorSecretKey;
    type KeyGen = NtorHkdfKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &Self::KeyType,
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>, [u8; DIGEST_LEN])> {
        let msg = msg.as_ref();
        if msg.len() != NTOR_C_HANDSHAKE_LEN {
            return Err(Error::Handshake("wrong length ntor onionskin"));
        }
        let mut r = Reader::from_slice(msg);
        let their_id: IdDigest = r
            .extract()
            .map_err(|_| Error::Handshake("short onionskin"))?;
        let their_b: [u8; 32] = r
            .take_array()
            .map_err(|_| Error::Handshake("short onionskin"))?;
        let their_x: [u8; 32] = r
            .take_array()
            .map_err(|_| Error::Handshake("short onionskin"))?;

        // The client must be talking to the onion key we actually
        // hold; else we can't (and mustn't) answer.
        if their_id != key.pk.id || their_b != *key.pk.pk.as_bytes() {
            return Err(Error::Handshake("ntor onionskin not for this relay"));
        }

        let client_pk = PublicKey::from(their_x);
        let (my_sk, my_public) = ephemeral_keypair(rng);

        let xy = my_sk.diffie_hellman(&client_pk);
        let xb = key.sk.diffie_hellman(&client_pk);
        let (keygen, auth, okay) =
            compute_shared(&xy, &xb, &key.pk, &client_pk, &my_public);
        if !bool::from(okay) {
            return Err(Error::Handshake("degenerate ntor onionskin"));
        }

        let mut reply: Vec<u8> = Vec::with_capacity(NTOR_S_HANDSHAKE_LEN);
        reply.write_all(my_public.as_bytes());
        reply.write_all(&auth);

        let mut transcript = [0_u8; DIGEST_LEN];
        transcript.copy_from_slice(&auth[..DIGEST_LEN]);
        Ok((keygen, reply, transcript))
    }
}
