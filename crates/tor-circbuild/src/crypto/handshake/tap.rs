//! Implementation of the legacy TAP handshake.
//!
//! TAP is a Diffie-Hellman exchange over the 1024-bit Oakley group 2,
//! with the client's `g^x` hybrid-encrypted to the relay's RSA-1024
//! onion key.  Modern relays negotiate ntor instead; we keep TAP for
//! relays whose descriptors carry no curve25519 key, and for legacy
//! EXTEND cells.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{KeyIvInit, StreamCipher};
use once_cell::sync::Lazy;
use rand::{CryptoRng, RngCore};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{ClientHandshake, ServerHandshake, TapKeyGenerator};
use crate::cells::{TAP_C_HANDSHAKE_LEN, TAP_S_HANDSHAKE_LEN};
use crate::ids::{RsaOnionKey, DIGEST_LEN};
use crate::{Error, Result};

/// Length of a DH group element (and of an RSA-1024 ciphertext).
const DH_LEN: usize = 128;
/// Length of a DH private exponent, in bytes.
const DH_SEC_LEN: usize = 40;
/// Bytes of OAEP-SHA1 overhead in an RSA-1024 encryption.
const PK_PAD_LEN: usize = 42;
/// Symmetric key length used by the hybrid encryption.
const SYM_KEY_LEN: usize = 16;
/// How much plaintext fits in the RSA-encrypted part of a hybrid
/// encryption, after the symmetric key.
const HYBRID_RSA_PORTION: usize = DH_LEN - PK_PAD_LEN - SYM_KEY_LEN;

/// AES-128-CTR with a zero IV, as used by the hybrid scheme.
type HybridCipher = ctr::Ctr128BE<Aes128>;

/// The 1024-bit Oakley group 2 prime (RFC 2409), used by every TAP
/// handshake.
static DH_PRIME: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E08\
          8A67CC74020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B\
          302B0A6DF25F14374FE1356D6D51C245E485B576625E7EC6F44C42E9\
          A637ED6B0BFF5CB6F406B7EDEE386BFB5A899FA5AE9F24117C4B1FE6\
          49286651ECE65381FFFFFFFFFFFFFFFF",
        16,
    )
    .expect("hardwired prime didn't parse")
});
/// Generator for the Oakley group.
static DH_GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2_u32));

/// Encode a group element as a fixed-width big-endian value.
fn dh_encode(v: &BigUint) -> [u8; DH_LEN] {
    let bytes = v.to_bytes_be();
    let mut out = [0_u8; DH_LEN];
    // A group element is always at most DH_LEN bytes.
    out[DH_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Generate a DH keypair: a random private exponent and `g^x`.
fn dh_keypair<R: RngCore + CryptoRng>(rng: &mut R) -> (BigUint, [u8; DH_LEN]) {
    let mut secret = Zeroizing::new([0_u8; DH_SEC_LEN]);
    rng.fill_bytes(&mut secret[..]);
    let x = BigUint::from_bytes_be(&secret[..]);
    let gx = DH_GENERATOR.modpow(&x, &DH_PRIME);
    (x, dh_encode(&gx))
}

/// Compute the shared DH secret from a peer element and our private
/// exponent.
fn dh_shared(peer: &[u8; DH_LEN], x: &BigUint) -> Zeroizing<Vec<u8>> {
    let peer = BigUint::from_bytes_be(&peer[..]);
    let k = peer.modpow(x, &DH_PRIME);
    Zeroizing::new(dh_encode(&k).to_vec())
}

/// Adapter presenting a modern RNG with the rand_core 0.6 interface
/// that the `rsa` crate expects.
struct RngCompat<'a, R>(&'a mut R);

impl<'a, R: RngCore> rand_core_06::RngCore for RngCompat<'a, R> {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand_core_06::Error> {
        self.0.fill_bytes(dest);
        Ok(())
    }
}
impl<'a, R: RngCore + CryptoRng> rand_core_06::CryptoRng for RngCompat<'a, R> {}

/// Hybrid-encrypt `m` to the RSA key `pk`: OAEP for a fresh symmetric
/// key plus the head of the message, AES-CTR for the rest.
fn hybrid_encrypt<R: RngCore + CryptoRng>(
    rng: &mut R,
    pk: &RsaPublicKey,
    m: &[u8],
) -> Result<Vec<u8>> {
    debug_assert!(m.len() > HYBRID_RSA_PORTION + SYM_KEY_LEN);
    let mut sym_key = Zeroizing::new([0_u8; SYM_KEY_LEN]);
    rng.fill_bytes(&mut sym_key[..]);

    let mut rsa_plaintext = Zeroizing::new(Vec::with_capacity(SYM_KEY_LEN + HYBRID_RSA_PORTION));
    rsa_plaintext.extend_from_slice(&sym_key[..]);
    rsa_plaintext.extend_from_slice(&m[..HYBRID_RSA_PORTION]);
    let mut out = pk
        .encrypt(
            &mut RngCompat(rng),
            Oaep::new::<Sha1>(),
            &rsa_plaintext[..],
        )
        .map_err(|_| Error::Handshake("RSA encryption failed"))?;

    let mut rest = m[HYBRID_RSA_PORTION..].to_vec();
    let zero_iv = Default::default();
    let mut cipher = HybridCipher::new(GenericArray::from_slice(&sym_key[..]), &zero_iv);
    cipher.apply_keystream(&mut rest);
    out.extend_from_slice(&rest);
    Ok(out)
}

/// Invert [`hybrid_encrypt`], given the RSA private key.
fn hybrid_decrypt(sk: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.len() <= DH_LEN {
        return Err(Error::Handshake("hybrid ciphertext too short"));
    }
    let rsa_plaintext = Zeroizing::new(
        sk.decrypt(Oaep::new::<Sha1>(), &ciphertext[..DH_LEN])
            .map_err(|_| Error::Handshake("RSA decryption failed"))?,
    );
    if rsa_plaintext.len() != SYM_KEY_LEN + HYBRID_RSA_PORTION {
        return Err(Error::Handshake("bad hybrid plaintext length"));
    }
    let mut m = Zeroizing::new(Vec::with_capacity(ciphertext.len() - PK_PAD_LEN - SYM_KEY_LEN));
    m.extend_from_slice(&rsa_plaintext[SYM_KEY_LEN..]);
    let mut rest = ciphertext[DH_LEN..].to_vec();
    let zero_iv = Default::default();
    let mut cipher = HybridCipher::new(
        GenericArray::from_slice(&rsa_plaintext[..SYM_KEY_LEN]),
        &zero_iv,
    );
    cipher.apply_keystream(&mut rest);
    m.extend_from_slice(&rest);
    Ok(m)
}

/// State held by the client while waiting for the relay's reply.
pub(crate) struct TapClientState {
    /// Our DH private exponent.  (`BigUint` has no zeroize support;
    /// the exponent lives only until the reply arrives.)
    dh_x: BigUint,
}

/// Client side of the TAP handshake.
pub(crate) struct TapClient;

impl ClientHandshake for TapClient {
    type KeyType = RsaOnionKey;
    type StateType = TapClientState;
    type KeyGen = TapKeyGenerator;

    fn client1<R: RngCore + CryptoRng>(
        rng: &mut R,
        key: &Self::KeyType,
    ) -> Result<(Self::StateType, Vec<u8>)> {
        let pk = RsaPublicKey::new(
            BigUint::from_bytes_be(key.modulus()),
            BigUint::from_bytes_be(key.exponent()),
        )
        .map_err(|_| Error::Handshake("unusable RSA onion key"))?;

        let (dh_x, gx) = dh_keypair(rng);
        let onionskin = hybrid_encrypt(rng, &pk, &gx)?;
        debug_assert_eq!(onionskin.len(), TAP_C_HANDSHAKE_LEN);
        Ok((TapClientState { dh_x }, onionskin))
    }

    fn client2<T: AsRef<[u8]>>(
        state: Self::StateType,
        msg: T,
    ) -> Result<(Self::KeyGen, [u8; DIGEST_LEN])> {
        let msg = msg.as_ref();
        if msg.len() != TAP_S_HANDSHAKE_LEN {
            return Err(Error::Handshake("wrong length CREATED reply"));
        }
        let mut gy = [0_u8; DH_LEN];
        gy.copy_from_slice(&msg[..DH_LEN]);
        let shared = dh_shared(&gy, &state.dh_x);

        let keygen = TapKeyGenerator::new(shared);
        let kh_expect = keygen.check_bytes()?;
        if !bool::from(kh_expect[..].ct_eq(&msg[DH_LEN..])) {
            return Err(Error::Handshake("bad KH in CREATED"));
        }
        Ok((keygen, kh_expect))
    }
}

/// A relay's TAP onion key (the private side).
pub(crate) struct TapSecretKey {
    /// The RSA private key.
    sk: RsaPrivateKey,
}

impl TapSecretKey {
    /// Construct from an RSA private key.
    pub(crate) fn new(sk: RsaPrivateKey) -> Self {
        TapSecretKey { sk }
    }
    /// Return the public components, as carried in a descriptor.
    pub(crate) fn onion_key(&self) -> RsaOnionKey {
        use rsa::traits::PublicKeyParts;
        RsaOnionKey::from_components(self.sk.n().to_bytes_be(), self.sk.e().to_bytes_be())
    }
}

/// Relay side of the TAP handshake.
pub(crate) struct TapServer;

impl ServerHandshake for TapServer {
    type KeyType = TapSecretKey;
    type KeyGen = TapKeyGenerator;

    fn server<R: RngCore + CryptoRng, T: AsRef<[u8]>>(
        rng: &mut R,
        key: &Self::KeyType,
        msg: T,
    ) -> Result<(Self::KeyGen, Vec<u8>, [u8; DIGEST_LEN])> {
        let msg = msg.as_ref();
        if msg.len() != TAP_C_HANDSHAKE_LEN {
            return Err(Error::Handshake("wrong length TAP onionskin"));
        }
        let gx_bytes = hybrid_decrypt(&key.sk, msg)?;
        if gx_bytes.len() != DH_LEN {
            return Err(Error::Handshake("bad TAP onionskin plaintext"));
        }
        let mut gx = [0_u8; DH_LEN];
        gx.copy_from_slice(&gx_bytes);

        let (y, gy) = dh_keypair(rng);
        let shared = dh_shared(&gx, &y);
        let keygen = TapKeyGenerator::new(shared);
        let kh = keygen.check_bytes()?;

        let mut reply = Vec::with_capacity(TAP_S_HANDSHAKE_LEN);
        reply.extend_from_slice(&gy);
        reply.extend_from_slice(&kh);
        Ok((keygen, reply, kh))
    }
}
