//! The client's view of a circuit: an ordered ring of per-hop
//! cryptographic state.

use crate::crypto::cellcrypt::{HopCrypt, RelayCellBody};
use crate::crypto::handshake::{HandshakeState, HopKeyMaterial};
use crate::extendinfo::ExtendInfo;
use crate::ids::DIGEST_LEN;
use crate::{Error, Result};

/// Default initial value for a hop's flow-control windows, used when
/// the consensus doesn't say otherwise.
pub(crate) const CIRCWINDOW_START: i32 = 1000;

/// Type to store hop indices on a circuit.
///
/// Hop indices are zero-based: "0" denotes the entry hop.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Ord, PartialOrd)]
pub struct HopNum(u8);

impl From<HopNum> for u8 {
    fn from(hop: HopNum) -> u8 {
        hop.0
    }
}
impl From<u8> for HopNum {
    fn from(v: u8) -> HopNum {
        HopNum(v)
    }
}
impl From<HopNum> for usize {
    fn from(hop: HopNum) -> usize {
        hop.0 as usize
    }
}
impl std::fmt::Display for HopNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0 + 1)
    }
}

/// The lifecycle of one hop of a circuit.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[non_exhaustive]
pub enum HopState {
    /// We have not started a handshake with this hop.
    Closed,
    /// Our onionskin is out; we are waiting for the created or
    /// extended reply.
    AwaitingKeys,
    /// Key material is derived; the hop is usable.
    Open,
}

/// One node of the circuit's crypt path.
pub(crate) struct Hop {
    /// The relay this hop runs through.
    extend_info: ExtendInfo,
    /// Where this hop is in its lifecycle.
    state: HopState,
    /// In-progress handshake, present only in `AwaitingKeys`.
    handshake_state: Option<HandshakeState>,
    /// Cipher and digest state, present only once `Open`.
    crypt: Option<HopCrypt>,
    /// Handshake-derived value bound to this hop.
    rend_circ_nonce: Option<[u8; DIGEST_LEN]>,
    /// Flow control: cells we may still package toward this hop.
    package_window: i32,
    /// Flow control: cells this hop may still deliver to us.
    deliver_window: i32,
}

impl Hop {
    /// Return the relay this hop runs through.
    pub(crate) fn extend_info(&self) -> &ExtendInfo {
        &self.extend_info
    }
    /// Return this hop's lifecycle state.
    pub(crate) fn state(&self) -> HopState {
        self.state
    }
    /// Record that our onionskin for this hop is in flight.
    pub(crate) fn set_awaiting_keys(&mut self, hs: HandshakeState) {
        debug_assert_eq!(self.state, HopState::Closed);
        self.handshake_state = Some(hs);
        self.state = HopState::AwaitingKeys;
    }
    /// Take the pending handshake state, if any.
    pub(crate) fn take_handshake_state(&mut self) -> Option<HandshakeState> {
        self.handshake_state.take()
    }
    /// Initialize this hop's ciphers and digests from handshake key
    /// material, and mark it open.
    pub(crate) fn initialize_crypto(&mut self, km: &HopKeyMaterial, reverse: bool) -> Result<()> {
        if self.crypt.is_some() {
            return Err(Error::Internal("hop crypto initialized twice"));
        }
        self.crypt = Some(HopCrypt::initialize(&km.keys[..], reverse)?);
        self.rend_circ_nonce = Some(km.rend_circ_nonce);
        self.handshake_state = None;
        self.state = HopState::Open;
        Ok(())
    }
    /// Return the handshake-bound nonce, once open.
    pub(crate) fn rend_circ_nonce(&self) -> Option<&[u8; DIGEST_LEN]> {
        self.rend_circ_nonce.as_ref()
    }
    /// Return this hop's remaining package window.
    pub(crate) fn package_window(&self) -> i32 {
        self.package_window
    }
    /// Return this hop's remaining deliver window.
    pub(crate) fn deliver_window(&self) -> i32 {
        self.deliver_window
    }
}

/// The ordered list of hops in an origin circuit.
///
/// Conceptually this is a ring: iteration starts over at the entry
/// once it passes the last hop.  We represent it as a vector indexed
/// by [`HopNum`], which preserves the operations the ring exists for:
/// O(1) append, O(1) access to the last hop, and iteration that
/// terminates at the head.
#[derive(Default)]
pub(crate) struct CryptPath {
    /// The hops, entry first.
    hops: Vec<Hop>,
}

impl CryptPath {
    /// Return a new, empty crypt path.
    pub(crate) fn new() -> Self {
        CryptPath::default()
    }

    /// Append a hop for `info` at the end of the path, in state
    /// `Closed`.
    pub(crate) fn append_hop(&mut self, info: ExtendInfo, window_start: i32) {
        debug_assert!(self.hops.len() < u8::MAX as usize);
        self.hops.push(Hop {
            extend_info: info,
            state: HopState::Closed,
            handshake_state: None,
            crypt: None,
            rend_circ_nonce: None,
            package_window: window_start,
            deliver_window: window_start,
        });
        self.debug_assert_ring_invariant();
    }

    /// Return the number of hops in the path.
    pub(crate) fn len(&self) -> usize {
        self.hops.len()
    }
    /// Return true if the path has no hops.
    pub(crate) fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Return the hop at `n`, if it exists.
    pub(crate) fn hop(&self, n: HopNum) -> Option<&Hop> {
        self.hops.get(usize::from(n))
    }
    /// Return the hop at `n` mutably, if it exists.
    pub(crate) fn hop_mut(&mut self, n: HopNum) -> Option<&mut Hop> {
        self.hops.get_mut(usize::from(n))
    }
    /// Return the index of the last hop, if any.
    pub(crate) fn last_hop_num(&self) -> Option<HopNum> {
        if self.hops.is_empty() {
            None
        } else {
            Some(HopNum::from((self.hops.len() - 1) as u8))
        }
    }
    /// Return the index of the first hop that is not open, if any.
    ///
    /// Circuits open from the client outward, so this is the hop we
    /// are currently building (or about to build).
    pub(crate) fn first_non_open(&self) -> Option<HopNum> {
        self.hops
            .iter()
            .position(|h| h.state() != HopState::Open)
            .map(|i| HopNum::from(i as u8))
    }
    /// Return true if every hop in a non-empty path is open.
    pub(crate) fn all_open(&self) -> bool {
        !self.hops.is_empty() && self.first_non_open().is_none()
    }

    /// Iterate over the hops, entry first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Hop> {
        self.hops.iter()
    }

    /// Prepare a relay cell to originate at hop `origin` and apply
    /// every layer of onion encryption up to the entry.
    pub(crate) fn encrypt_from(&mut self, origin: HopNum, cell: &mut RelayCellBody) -> Result<()> {
        let origin = usize::from(origin);
        if origin >= self.hops.len() {
            return Err(Error::Internal("no such hop to originate from"));
        }
        {
            let crypt = self.hops[origin]
                .crypt
                .as_mut()
                .ok_or(Error::Internal("originating hop has no keys"))?;
            crypt.originate_for(cell);
        }
        for hop in self.hops[..origin].iter_mut().rev() {
            let crypt = hop
                .crypt
                .as_mut()
                .ok_or(Error::Internal("intermediate hop has no keys"))?;
            crypt.encrypt_outbound(cell);
        }
        Ok(())
    }

    /// Strip layers from an inbound relay cell and return the hop it
    /// originated at.
    pub(crate) fn decrypt_inbound(&mut self, cell: &mut RelayCellBody) -> Result<HopNum> {
        for (i, hop) in self.hops.iter_mut().enumerate() {
            let crypt = hop
                .crypt
                .as_mut()
                .ok_or(Error::Protocol("inbound cell passed an unbuilt hop"))?;
            if crypt.decrypt_inbound(cell) {
                return Ok(HopNum::from(i as u8));
            }
        }
        Err(Error::Protocol("inbound cell unrecognized at every hop"))
    }

    /// Check the ring invariant: hop states are monotonically
    /// non-increasing from the entry outward.
    fn debug_assert_ring_invariant(&self) {
        debug_assert!(
            self.hops.windows(2).all(|w| w[0].state() >= w[1].state()),
            "hop states out of order"
        );
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::ids::IdDigest;

    fn info(id: u8) -> ExtendInfo {
        ExtendInfo::builder()
            .identity(IdDigest::new([id; 20]))
            .addr(format!("192.0.2.{}:9001", id).parse().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn append_and_index() {
        let mut cp = CryptPath::new();
        assert!(cp.is_empty());
        assert!(cp.last_hop_num().is_none());
        cp.append_hop(info(1), CIRCWINDOW_START);
        cp.append_hop(info(2), CIRCWINDOW_START);
        cp.append_hop(info(3), CIRCWINDOW_START);
        assert_eq!(cp.len(), 3);
        assert_eq!(cp.last_hop_num(), Some(HopNum::from(2)));
        assert_eq!(
            cp.hop(HopNum::from(1)).unwrap().extend_info().identity(),
            &IdDigest::new([2; 20])
        );
        assert_eq!(cp.hop(HopNum::from(0)).unwrap().package_window(), 1000);
        assert_eq!(cp.hop(HopNum::from(0)).unwrap().deliver_window(), 1000);
        assert!(cp.hop(HopNum::from(3)).is_none());
    }

    #[test]
    fn first_non_open_walks_outward() {
        let mut cp = CryptPath::new();
        cp.append_hop(info(1), CIRCWINDOW_START);
        cp.append_hop(info(2), CIRCWINDOW_START);
        assert_eq!(cp.first_non_open(), Some(HopNum::from(0)));
        assert!(!cp.all_open());

        let km = crate::crypto::handshake::HopKeyMaterial {
            keys: zeroize::Zeroizing::new([7; 72]),
            rend_circ_nonce: [1; 20],
        };
        cp.hop_mut(HopNum::from(0))
            .unwrap()
            .initialize_crypto(&km, false)
            .unwrap();
        assert_eq!(cp.first_non_open(), Some(HopNum::from(1)));
        cp.hop_mut(HopNum::from(1))
            .unwrap()
            .initialize_crypto(&km, false)
            .unwrap();
        assert!(cp.all_open());
        assert_eq!(cp.first_non_open(), None);
        assert_eq!(
            cp.hop(HopNum::from(1)).unwrap().rend_circ_nonce(),
            Some(&[1; 20])
        );
    }

    #[test]
    fn double_init_is_refused() {
        let mut cp = CryptPath::new();
        cp.append_hop(info(1), CIRCWINDOW_START);
        let km = crate::crypto::handshake::HopKeyMaterial {
            keys: zeroize::Zeroizing::new([7; 72]),
            rend_circ_nonce: [1; 20],
        };
        let hop = cp.hop_mut(HopNum::from(0)).unwrap();
        hop.initialize_crypto(&km, false).unwrap();
        assert!(hop.initialize_crypto(&km, false).is_err());
    }

    #[test]
    fn hopnum_display_is_one_indexed() {
        assert_eq!(HopNum::from(0).to_string(), "#1");
        assert_eq!(HopNum::from(2).to_string(), "#3");
    }
}
