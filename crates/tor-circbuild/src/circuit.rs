//! The origin circuit type and its associated state.

use std::time::Instant;

use crate::chan::{ChannelHandle, CircId};
use crate::cpath::CryptPath;
use crate::extendinfo::ExtendInfo;
use crate::ids::{GlobalId, IdDigest, StreamId};

/// What a circuit is for.
///
/// Purposes matter to the core in three places: route length, the
/// path-bias should-count decision, and the probe purpose change.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum Purpose {
    /// A circuit built to test our own reachability.
    Testing,
    /// A circuit built at the controller's request.
    Controller,
    /// An ordinary client circuit.
    General,
    /// A circuit launched only to measure build timeouts.
    MeasureTimeout,
    /// Client side: establishing a rendezvous point.
    EstablishRend,
    /// Client side: connecting to an introduction point.
    Introducing,
    /// Client side: sent the introduction, waiting for the ack.
    IntroduceAckWait,
    /// Client side: the introduction was acknowledged.
    IntroduceAcked,
    /// Service side: establishing an introduction point.
    SEstablishIntro,
    /// Service side: connecting to a rendezvous point.
    SConnectRend,
    /// Service side: joined to a rendezvous point.
    SRendJoined,
    /// A closing circuit carrying an end-of-life path-bias probe.
    PathBiasTesting,
}

impl Purpose {
    /// True for the client-side introduction-point purposes, whose
    /// endpoints can be chosen adversarially.
    pub(crate) fn is_client_intro(self) -> bool {
        matches!(
            self,
            Purpose::Introducing | Purpose::IntroduceAckWait | Purpose::IntroduceAcked
        )
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Coarse lifecycle state of a circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum CircState {
    /// Waiting for the channel to the first hop.
    ChanWait,
    /// One or more hops are still being negotiated.
    Building,
    /// Every hop is open.
    Open,
    /// The circuit is condemned; no further operations apply.
    MarkedForClose,
}

/// Lifecycle of a circuit for path-bias accounting.
///
/// Transitions move left to right, except that `UseSucceeded` may
/// roll back to `UseAttempted` when a stream detaches retriably, and
/// `AlreadyCounted` is absorbing.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[non_exhaustive]
pub enum PathState {
    /// Not yet counted for anything.
    NewCirc,
    /// Counted as a build attempt.
    BuildAttempted,
    /// Counted as a build success.
    BuildSucceeded,
    /// A stream has been attached.
    UseAttempted,
    /// A stream has succeeded end to end.
    UseSucceeded,
    /// We know the circuit could not carry streams.
    UseFailed,
    /// Close accounting has run; nothing more to count.
    AlreadyCounted,
}

impl std::fmt::Display for PathState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PathState::NewCirc => "new",
            PathState::BuildAttempted => "build attempted",
            PathState::BuildSucceeded => "build succeeded",
            PathState::UseAttempted => "use attempted",
            PathState::UseSucceeded => "use succeeded",
            PathState::UseFailed => "use failed",
            PathState::AlreadyCounted => "already counted",
        };
        write!(f, "{}", s)
    }
}

/// Cached result of the should-count decision for a circuit.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum ShouldCount {
    /// Not decided yet.
    Unknown,
    /// This circuit participates in path-bias accounting.
    Counted,
    /// This circuit is ignored by path-bias accounting.
    Ignored,
}

/// Launch flags for a new circuit.
#[derive(Copy, Clone, Debug, Default)]
#[non_exhaustive]
pub struct CircuitFlags {
    /// Build a one-hop tunnel (directory fetches).
    pub onehop_tunnel: bool,
    /// Require high-uptime relays.
    pub need_uptime: bool,
    /// Require high-capacity relays.
    pub need_capacity: bool,
    /// The circuit will not carry exit traffic.
    pub is_internal: bool,
}

/// Per-circuit path construction state.
#[derive(Debug)]
pub(crate) struct BuildState {
    /// How many hops the finished circuit should have.
    pub(crate) desired_path_len: usize,
    /// See [`CircuitFlags::onehop_tunnel`].
    pub(crate) onehop_tunnel: bool,
    /// See [`CircuitFlags::need_uptime`].
    pub(crate) need_uptime: bool,
    /// See [`CircuitFlags::need_capacity`].
    pub(crate) need_capacity: bool,
    /// See [`CircuitFlags::is_internal`].
    pub(crate) is_internal: bool,
    /// The exit we settled on, if we have.
    pub(crate) chosen_exit: Option<ExtendInfo>,
}

impl BuildState {
    /// Create a build state from launch flags.
    fn from_flags(flags: &CircuitFlags) -> Self {
        BuildState {
            desired_path_len: 0,
            onehop_tunnel: flags.onehop_tunnel,
            need_uptime: flags.need_uptime,
            need_capacity: flags.need_capacity,
            is_internal: flags.is_internal,
            chosen_exit: None,
        }
    }
}

/// A circuit that originates at this host.
pub struct OriginCircuit {
    /// Process-local identifier.
    pub(crate) global_id: GlobalId,
    /// What the circuit is for.
    pub(crate) purpose: Purpose,
    /// Coarse lifecycle state.
    pub(crate) state: CircState,
    /// Path construction state.
    pub(crate) build_state: BuildState,
    /// The per-hop key state.
    pub(crate) cpath: CryptPath,

    /// The channel toward the first hop, once attached.
    pub(crate) n_chan: Option<ChannelHandle>,
    /// Our circuit ID on that channel, once allocated.
    pub(crate) n_circ_id: Option<CircId>,
    /// Where we are connecting, while waiting for a channel.
    pub(crate) n_hop: Option<ExtendInfo>,

    /// When the current build (or probe) began.
    pub(crate) timestamp_began: Option<Instant>,
    /// When the circuit last carried application traffic.
    pub(crate) timestamp_dirty: Option<Instant>,
    /// True once the circuit has completed (used to detect
    /// cannibalized circuits being extended again).
    pub(crate) has_opened: bool,
    /// Set after a clock jump: don't hand this circuit to new
    /// streams.
    pub(crate) unusable_for_new_conns: bool,

    /// Path-bias lifecycle state.
    pub(crate) path_state: PathState,
    /// Cached should-count decision.
    pub(crate) pathbias_shouldcount: ShouldCount,
    /// Nonce for the outstanding probe, if any.
    pub(crate) pathbias_probe_nonce: Option<u32>,
    /// Stream ID used by the outstanding probe, if any.
    pub(crate) pathbias_probe_id: Option<StreamId>,

    /// Allocation cursor for stream IDs on this circuit.
    pub(crate) next_stream_id: u16,
}

impl OriginCircuit {
    /// Create a circuit in `ChanWait` with an empty cpath.
    pub(crate) fn new(global_id: GlobalId, purpose: Purpose, flags: &CircuitFlags) -> Self {
        OriginCircuit {
            global_id,
            purpose,
            state: CircState::ChanWait,
            build_state: BuildState::from_flags(flags),
            cpath: CryptPath::new(),
            n_chan: None,
            n_circ_id: None,
            n_hop: None,
            timestamp_began: None,
            timestamp_dirty: None,
            has_opened: false,
            unusable_for_new_conns: false,
            path_state: PathState::NewCirc,
            pathbias_shouldcount: ShouldCount::Unknown,
            pathbias_probe_nonce: None,
            pathbias_probe_id: None,
            next_stream_id: 0,
        }
    }

    /// Return this circuit's process-local identifier.
    pub fn global_id(&self) -> GlobalId {
        self.global_id
    }
    /// Return this circuit's purpose.
    pub fn purpose(&self) -> Purpose {
        self.purpose
    }
    /// Return this circuit's coarse state.
    pub fn state(&self) -> CircState {
        self.state
    }
    /// Return this circuit's path-bias lifecycle state.
    pub fn path_state(&self) -> PathState {
        self.path_state
    }
    /// Return the number of hops currently in the cpath.
    pub fn n_hops(&self) -> usize {
        self.cpath.len()
    }
    /// Return true if every desired hop is open.
    pub fn is_fully_open(&self) -> bool {
        self.state == CircState::Open
    }
    /// Return true if the circuit has carried application traffic.
    pub fn is_dirty(&self) -> bool {
        self.timestamp_dirty.is_some()
    }
    /// Return true if new streams may be attached to this circuit.
    pub fn usable_for_new_streams(&self) -> bool {
        self.state == CircState::Open && !self.unusable_for_new_conns
    }

    /// Return the identity of the guard (first hop) this circuit is
    /// accounted against, if we can still tell.
    pub(crate) fn guard_identity(&self) -> Option<IdDigest> {
        if let Some(hop) = self.cpath.hop(0.into()) {
            return Some(*hop.extend_info().identity());
        }
        self.n_chan
            .as_ref()
            .map(|chan| *chan.borrow().peer_id())
    }

    /// Allocate a fresh nonzero stream ID on this circuit.
    pub(crate) fn alloc_stream_id(&mut self) -> Option<StreamId> {
        // Wrap-around means re-use; real streams are not tracked
        // here, so a u16 cursor with a skip at zero is sufficient for
        // the probe's needs.
        for _ in 0..u16::MAX {
            self.next_stream_id = self.next_stream_id.wrapping_add(1);
            if self.next_stream_id != 0 {
                return Some(StreamId(self.next_stream_id));
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn new_circuit_initial_state() {
        let c = OriginCircuit::new(
            GlobalId(1),
            Purpose::General,
            &CircuitFlags {
                need_capacity: true,
                ..Default::default()
            },
        );
        assert_eq!(c.state(), CircState::ChanWait);
        assert_eq!(c.path_state(), PathState::NewCirc);
        assert!(!c.has_opened);
        assert!(c.build_state.need_capacity);
        assert!(!c.build_state.onehop_tunnel);
        assert_eq!(c.n_hops(), 0);
        assert!(c.guard_identity().is_none());
    }

    #[test]
    fn stream_ids_are_nonzero_and_fresh() {
        let mut c = OriginCircuit::new(GlobalId(2), Purpose::General, &CircuitFlags::default());
        let a = c.alloc_stream_id().unwrap();
        let b = c.alloc_stream_id().unwrap();
        assert_ne!(a.0, 0);
        assert_ne!(a, b);
        c.next_stream_id = u16::MAX;
        let d = c.alloc_stream_id().unwrap();
        assert_ne!(d.0, 0);
    }

    #[test]
    fn path_state_ordering_matches_lifecycle() {
        assert!(PathState::NewCirc < PathState::BuildAttempted);
        assert!(PathState::BuildAttempted < PathState::BuildSucceeded);
        assert!(PathState::BuildSucceeded < PathState::UseAttempted);
        assert!(PathState::UseAttempted < PathState::UseSucceeded);
        assert!(PathState::UseSucceeded < PathState::UseFailed);
        assert!(PathState::UseFailed < PathState::AlreadyCounted);
    }

    #[test]
    fn client_intro_purposes() {
        assert!(Purpose::Introducing.is_client_intro());
        assert!(Purpose::IntroduceAcked.is_client_intro());
        assert!(!Purpose::General.is_client_intro());
        assert!(!Purpose::SConnectRend.is_client_intro());
    }
}
