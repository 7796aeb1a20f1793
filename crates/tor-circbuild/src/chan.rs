//! The core's view of channels, and circuit-ID allocation on them.
//!
//! Channels themselves (TLS, framing, flow control) are the channel
//! layer's business; the core sees a [`Channel`] record carrying the
//! peer's identity, the channel's capabilities, and the map from
//! circuit IDs to circuits which [`Channel::alloc_circ_id`] keeps
//! collision-free.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::rc::Rc;

use tracing::warn;

use crate::cells::{CreateCell, CreatedCell};
use crate::extendinfo::ExtendInfo;
use crate::ids::{GlobalId, IdDigest};
use crate::{Error, Result};

/// A circuit identifier, unique per channel.  Zero is not a valid
/// circuit ID.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct CircId(NonZeroU32);

impl CircId {
    /// Construct a CircId from a wire value; `None` for zero.
    pub fn new(v: u32) -> Option<Self> {
        NonZeroU32::new(v).map(CircId)
    }
}
impl From<CircId> for u32 {
    fn from(id: CircId) -> u32 {
        id.0.get()
    }
}
impl std::fmt::Display for CircId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Which group of circuit IDs we may allocate on a channel.
///
/// The "side" bit belongs to whichever end of the channel has the
/// higher identity key digest.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum CircIdRange {
    /// We own the IDs with the side bit set.
    Higher,
    /// We own the IDs with the side bit cleared.
    Lower,
    /// The peer never authenticated; we may not allocate at all.
    Neither,
}

/// Why a channel was closed, as far as the core can tell.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ChannelCloseReason {
    /// We asked for the close.
    Requested,
    /// The channel died for some other reason.
    Errored,
}

/// The lifecycle of a channel, as the core sees it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ChannelState {
    /// The transport is still connecting.
    Opening,
    /// The channel is usable for cells.
    Open,
    /// The channel is gone.
    Closed,
}

/// A cell handed to the channel layer for transmission, or received
/// from it.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum ChanMsg {
    /// An outbound creation handshake.
    Create(CreateCell),
    /// An inbound (or forwarded) creation reply.
    Created(CreatedCell),
    /// A fully onion-encrypted relay cell.
    Relay {
        /// The encrypted relay cell body.
        body: Box<[u8; crate::cells::CELL_PAYLOAD_SIZE]>,
        /// Send as RELAY_EARLY.
        early: bool,
    },
    /// Tear down a circuit.
    Destroy(u8),
}

/// The core's record of one channel.
#[derive(Debug)]
pub struct Channel {
    /// Identity of the relay at the far end; all-zero when the link
    /// is unkeyed.
    peer_id: IdDigest,
    /// Address we connected to.
    addr: SocketAddr,
    /// Lifecycle state.
    state: ChannelState,
    /// True if the channel negotiated 4-byte circuit IDs.
    wide_circ_ids: bool,
    /// Which ID range we own.
    id_range: CircIdRange,
    /// Cursor for the next allocation probe.
    next_circ_id: u32,
    /// Circuits currently mapped on this channel.
    circs: HashMap<CircId, GlobalId>,
    /// Why the channel closed, once it has.
    reason_for_closing: Option<ChannelCloseReason>,
}

/// A shared handle to a [`Channel`].
///
/// The core runs entirely on one event-loop thread, so channel records
/// are shared by `Rc` and borrowed at use sites; no locking exists or
/// is needed.
pub type ChannelHandle = Rc<RefCell<Channel>>;

impl Channel {
    /// Create a record for a channel to `peer_id` at `addr`.
    pub fn new(
        peer_id: IdDigest,
        addr: SocketAddr,
        wide_circ_ids: bool,
        id_range: CircIdRange,
    ) -> Self {
        Channel {
            peer_id,
            addr,
            state: ChannelState::Opening,
            wide_circ_ids,
            id_range,
            next_circ_id: 1,
            circs: HashMap::new(),
            reason_for_closing: None,
        }
    }

    /// Return the peer's identity digest.
    pub fn peer_id(&self) -> &IdDigest {
        &self.peer_id
    }
    /// Return the address this channel goes to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
    /// Return the channel's state.
    pub fn state(&self) -> ChannelState {
        self.state
    }
    /// Mark this channel open.
    pub fn mark_open(&mut self) {
        self.state = ChannelState::Open;
    }
    /// Mark this channel closed.
    pub fn mark_closed(&mut self, reason: ChannelCloseReason) {
        self.state = ChannelState::Closed;
        self.reason_for_closing = Some(reason);
    }
    /// Return why the channel closed, if it has.
    pub fn reason_for_closing(&self) -> Option<ChannelCloseReason> {
        self.reason_for_closing
    }

    /// Return true if this channel plausibly goes where `info`
    /// points.
    ///
    /// For unkeyed channels this is an address comparison; a keyed
    /// channel matches only on identity.
    pub fn matches_extend_info(&self, info: &ExtendInfo) -> bool {
        if self.peer_id.is_zero() {
            self.addr == info.addr()
        } else {
            &self.peer_id == info.identity()
        }
    }

    /// Allocate an unused circuit ID on this channel, binding it to
    /// `circ` before returning.
    ///
    /// The binding happens inside this call: a second caller probing
    /// the map can never observe the returned slot as free.
    pub fn alloc_circ_id(&mut self, circ: GlobalId) -> Result<CircId> {
        let max_range: u32 = if self.wide_circ_ids { 1 << 31 } else { 1 << 15 };
        let high_bit = match self.id_range {
            CircIdRange::Higher => max_range,
            CircIdRange::Lower => 0,
            CircIdRange::Neither => {
                warn!("tried to pick a circuit ID on a channel with no identity");
                return Err(Error::ResourceLimit("no circuit ID range on channel"));
            }
        };
        let mut attempts: u32 = 0;
        loop {
            let mut test = self.next_circ_id;
            self.next_circ_id = self.next_circ_id.wrapping_add(1);
            if test == 0 || test >= max_range {
                test = 1;
                self.next_circ_id = 2;
            }
            attempts += 1;
            if attempts > max_range {
                // Every slot is taken; without this cap a full
                // channel would loop forever.
                warn!("no unused circuit IDs on channel; failing");
                return Err(Error::ResourceLimit("no unused circuit IDs on channel"));
            }
            let id = CircId::new(test | high_bit).expect("picked a zero circuit ID");
            if let std::collections::hash_map::Entry::Vacant(e) = self.circs.entry(id) {
                e.insert(circ);
                return Ok(id);
            }
        }
    }

    /// Release the binding for `id`, if present.
    pub fn release_circ_id(&mut self, id: CircId) {
        self.circs.remove(&id);
    }
    /// Return the circuit bound to `id`, if any.
    pub fn circuit_for_id(&self, id: CircId) -> Option<GlobalId> {
        self.circs.get(&id).copied()
    }
    /// Return the number of circuits mapped on this channel.
    pub fn n_circuits(&self) -> usize {
        self.circs.len()
    }
}

/// The channel layer, as consumed by the circuit core.
///
/// All methods are synchronous registrations; completions arrive
/// later as `channel_ready` events on the core.
pub trait ChanProvider {
    /// Start connecting to `id` at `addr`.  Returns the pending
    /// channel record, or `None` if the connection attempt could not
    /// even be launched.
    fn channel_connect(&mut self, addr: SocketAddr, id: &IdDigest) -> Option<ChannelHandle>;

    /// Return a usable open channel to `id` at `addr` if one exists.
    ///
    /// Otherwise return `None`, a human-readable explanation, and
    /// whether the caller should launch a new connection itself.
    fn channel_get_for_extend(
        &mut self,
        id: &IdDigest,
        addr: &SocketAddr,
    ) -> (Option<ChannelHandle>, &'static str, bool);

    /// Queue `msg` for transmission on `chan` with circuit ID
    /// `circ_id`.
    fn send_cell(&mut self, chan: &ChannelHandle, circ_id: CircId, msg: ChanMsg);
}
