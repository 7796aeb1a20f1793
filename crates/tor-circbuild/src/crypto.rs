//! Cryptographic operations for circuit construction: the extension
//! handshakes, key derivation, and per-hop relay cell crypto.
//!
//! Low-level primitives (digests, stream ciphers, curve25519, RSA)
//! come from the usual RustCrypto crates; nothing here implements its
//! own primitives.

pub(crate) mod cellcrypt;
pub(crate) mod handshake;
pub(crate) mod kdf;
