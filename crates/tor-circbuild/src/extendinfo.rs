//! Owned descriptions of the relays we extend circuits to.

use std::net::SocketAddr;

use crate::ids::{IdDigest, NtorOnionKey, RsaOnionKey};
use crate::netdir::Relay;

/// An owned summary of everything we need to know to extend a circuit
/// to one relay.
///
/// An `ExtendInfo` is a value type: every hop of every circuit holds
/// its own copy, so that the directory can replace or drop the
/// underlying relay entry without invalidating in-flight circuits.
#[derive(Debug, Clone, derive_builder::Builder)]
#[builder(derive(Debug))]
pub struct ExtendInfo {
    /// Digest of the relay's identity key.
    identity: IdDigest,
    /// Human-readable nickname, when the directory knows one.
    #[builder(default, setter(strip_option, into))]
    nickname: Option<String>,
    /// The relay's legacy (TAP) onion key, if we know it.
    ///
    /// A first hop without a legacy onion key forces the fast
    /// handshake; an extend target without one must support ntor.
    #[builder(default, setter(strip_option))]
    onion_key: Option<RsaOnionKey>,
    /// The relay's curve25519 onion key, if it has one.
    #[builder(default, setter(strip_option))]
    ntor_onion_key: Option<NtorOnionKey>,
    /// The OR port address we should use to reach the relay.
    addr: SocketAddr,
}

impl ExtendInfo {
    /// Return a new builder for constructing an ExtendInfo.
    pub fn builder() -> ExtendInfoBuilder {
        ExtendInfoBuilder::default()
    }

    /// Construct an ExtendInfo describing `relay`.
    ///
    /// If `for_direct_connect` is true, use the relay's preferred OR
    /// port (a client talking to its first hop may use IPv6); else use
    /// the primary (IPv4) OR port.
    pub fn from_relay(relay: &Relay, for_direct_connect: bool) -> Self {
        let addr = if for_direct_connect {
            relay.pref_orport()
        } else {
            relay.prim_orport()
        };
        ExtendInfo {
            identity: *relay.id(),
            nickname: relay.nickname().map(str::to_owned),
            onion_key: relay.onion_key().cloned(),
            ntor_onion_key: relay.ntor_onion_key().copied(),
            addr,
        }
    }

    /// Return the identity digest of this relay.
    pub fn identity(&self) -> &IdDigest {
        &self.identity
    }
    /// Return the nickname of this relay, if known.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }
    /// Return the legacy onion key, if known.
    pub fn onion_key(&self) -> Option<&RsaOnionKey> {
        self.onion_key.as_ref()
    }
    /// Return the curve25519 onion key, if known.
    pub fn ntor_onion_key(&self) -> Option<&NtorOnionKey> {
        self.ntor_onion_key.as_ref()
    }
    /// Return the OR port address for this relay.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
    /// Return the port for this relay.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Return a string describing this relay for log messages.
    pub fn describe(&self) -> String {
        match &self.nickname {
            Some(nick) => format!("{}~{}", self.identity, nick),
            None => self.identity.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::ids::IdDigest;

    fn ei() -> ExtendInfo {
        ExtendInfo::builder()
            .identity(IdDigest::new([7; 20]))
            .nickname("relayon")
            .ntor_onion_key(NtorOnionKey([0x33; 32]))
            .addr("192.0.2.7:9001".parse().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn builder() {
        let info = ei();
        assert_eq!(info.identity(), &IdDigest::new([7; 20]));
        assert_eq!(info.nickname(), Some("relayon"));
        assert!(info.onion_key().is_none());
        assert_eq!(info.port(), 9001);
    }

    #[test]
    fn builder_missing_identity() {
        let r = ExtendInfo::builder()
            .addr("192.0.2.7:9001".parse().unwrap())
            .build();
        assert!(r.is_err());
    }

    #[test]
    fn duplicated_by_value() {
        let info = ei();
        let copy = info.clone();
        assert_eq!(copy.identity(), info.identity());
        assert_eq!(copy.addr(), info.addr());
    }

    #[test]
    fn describe() {
        assert!(ei().describe().ends_with("~relayon"));
    }
}
