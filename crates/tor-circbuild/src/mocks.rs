//! Mock collaborators for testing the core without a network.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use rand::RngCore;

use crate::chan::{
    ChanMsg, ChanProvider, Channel, ChannelHandle, CircId, CircIdRange,
};
use crate::mgr::{BuildTimeEstimator, Clock};
use crate::crypto::handshake::ntor::NtorSecretKey;
use crate::guards::{GuardRecord, GuardStore};
use crate::ids::{IdDigest, NtorOnionKey};
use crate::netdir::{
    choose_by_bandwidth, NodeDirectory, NodeSelectionFlags, PortPolicy, Relay, RelayDetails,
    RelayFlags, RelaySet,
};
use crate::path::StreamDemand;

/// The ntor secret key the mock relay with index `i` holds.
pub(crate) fn relay_ntor_secret(i: u8) -> NtorSecretKey {
    NtorSecretKey::new([i; 32], IdDigest::new([i; 20]))
}

/// A fixed directory of relays.
#[derive(Clone, Default)]
pub(crate) struct MockDir {
    /// The relays in the "consensus".
    relays: Vec<Relay>,
    /// Our own identity, when pretending to be a relay.
    me: Option<IdDigest>,
}

impl MockDir {
    /// A directory of `n` well-behaved relays, with identities
    /// `[i; 20]`, equal weights, accept-all exit policies, and ntor
    /// keys matching [`relay_ntor_secret`].
    pub(crate) fn with_relays(n: u8) -> Self {
        let relays = (0..n)
            .map(|i| {
                RelayDetails {
                    id: IdDigest::new([i; 20]),
                    nickname: Some(format!("mock{}", i)),
                    flags: RelayFlags {
                        running: true,
                        valid: true,
                        fast: true,
                        stable: true,
                        guard: true,
                        bad_exit: false,
                        allows_single_hop_exits: false,
                        general_purpose: true,
                    },
                    has_descriptor: true,
                    onion_key: None,
                    ntor_onion_key: Some(NtorOnionKey(*relay_ntor_secret(i).pk.pk.as_bytes())),
                    version_supports_extend2: true,
                    prim_orport: format!("192.0.2.{}:9001", i).parse().expect("bad addr"),
                    pref_orport: None,
                    weight: 1000,
                    family: vec![],
                    exit_policy: PortPolicy::accept_all(),
                }
                .into()
            })
            .collect();
        MockDir { relays, me: None }
    }

    /// Mutable access to the relay list, for test setup.
    pub(crate) fn relays_mut(&mut self) -> &mut Vec<Relay> {
        &mut self.relays
    }
}

impl NodeDirectory for MockDir {
    fn by_id(&self, id: &IdDigest) -> Option<&Relay> {
        self.relays.iter().find(|r| r.id() == id)
    }
    fn relays(&self) -> &[Relay] {
        &self.relays
    }
    fn self_id(&self) -> Option<&IdDigest> {
        self.me.as_ref()
    }
    fn firewall_permits(&self, _relay: &Relay) -> bool {
        true
    }
    fn choose_random_node<'a>(
        &'a self,
        excluded: &RelaySet,
        flags: NodeSelectionFlags,
        rng: &mut dyn RngCore,
    ) -> Option<&'a Relay> {
        let candidates: Vec<&Relay> = self
            .relays
            .iter()
            .filter(|r| {
                !excluded.contains(r.id())
                    && r.flags().running
                    && (r.flags().valid || flags.allow_invalid)
                    && (!flags.need_desc || r.has_descriptor())
                    && (!flags.need_guard || r.flags().guard)
                    && (!flags.need_uptime || r.flags().stable)
                    && (!flags.need_capacity || r.flags().fast)
                    && self.me.as_ref() != Some(r.id())
            })
            .collect();
        choose_by_bandwidth(&candidates, rng)
    }
}

/// A guard store with a fixed guard list.
#[derive(Default)]
pub(crate) struct MockGuards {
    /// Our guards and their records.
    guards: Vec<GuardRecord>,
    /// How many times `guards_changed` fired.
    changed: usize,
}

impl MockGuards {
    /// A store holding exactly one guard.
    pub(crate) fn with_guard(id: IdDigest) -> Self {
        MockGuards {
            guards: vec![GuardRecord::new(id, None)],
            changed: 0,
        }
    }

    /// Read a guard's record, by copy.
    pub(crate) fn record(&self, id: &IdDigest) -> GuardRecord {
        self.guards
            .iter()
            .find(|g| &g.identity == id)
            .expect("no such guard")
            .clone()
    }
    /// Mutate a guard's record directly, for test setup.
    pub(crate) fn record_mut_test(&mut self, id: &IdDigest) -> &mut GuardRecord {
        self.guards
            .iter_mut()
            .find(|g| &g.identity == id)
            .expect("no such guard")
    }
    /// How many times the change signal fired.
    pub(crate) fn changed_count(&self) -> usize {
        self.changed
    }
}

impl GuardStore for MockGuards {
    fn choose_entry(&mut self, exclude: &RelaySet) -> Option<IdDigest> {
        self.guards
            .iter()
            .find(|g| !g.path_bias_disabled && !exclude.contains(&g.identity))
            .map(|g| g.identity)
    }
    fn guard_ids(&self) -> Vec<IdDigest> {
        self.guards.iter().map(|g| g.identity).collect()
    }
    fn record_mut(&mut self, id: &IdDigest) -> Option<&mut GuardRecord> {
        self.guards.iter_mut().find(|g| &g.identity == id)
    }
    fn guards_changed(&mut self) {
        self.changed += 1;
    }
}

/// A cell the mock channel layer was asked to transmit.
#[derive(Clone)]
pub(crate) struct SentCell {
    /// Identity of the channel's peer.
    pub(crate) chan_peer: IdDigest,
    /// The circuit ID on the cell.
    pub(crate) circ_id: CircId,
    /// The cell itself.
    pub(crate) msg: ChanMsg,
}

/// Shared state behind a [`MockChans`].
#[derive(Default)]
struct ChansInner {
    /// Channels known to the mock.
    channels: Vec<ChannelHandle>,
    /// Addresses we were asked to connect to.
    connects: Vec<(SocketAddr, IdDigest)>,
    /// Cells queued for transmission.
    sent: Vec<SentCell>,
    /// When set, `channel_connect` fails outright.
    connect_fails: bool,
}

/// A channel layer that records everything and connects nowhere.
#[derive(Clone, Default)]
pub(crate) struct MockChans {
    /// The shared state; tests keep a clone to inspect it.
    inner: Rc<RefCell<ChansInner>>,
}

impl MockChans {
    /// A mock with no channels.
    pub(crate) fn new() -> Self {
        MockChans::default()
    }

    /// Add an already-open channel to `peer` at `addr`.
    pub(crate) fn add_open_channel(
        &mut self,
        peer: IdDigest,
        addr: SocketAddr,
        range: CircIdRange,
    ) -> ChannelHandle {
        let mut chan = Channel::new(peer, addr, true, range);
        chan.mark_open();
        let handle: ChannelHandle = Rc::new(RefCell::new(chan));
        self.inner.borrow_mut().channels.push(handle.clone());
        handle
    }

    /// Make future `channel_connect` calls fail.
    pub(crate) fn set_connect_fails(&mut self, fails: bool) {
        self.inner.borrow_mut().connect_fails = fails;
    }

    /// The channels the mock knows about.
    pub(crate) fn channels(&self) -> Vec<ChannelHandle> {
        self.inner.borrow().channels.clone()
    }
    /// Every connect attempt so far.
    pub(crate) fn connects(&self) -> Vec<(SocketAddr, IdDigest)> {
        self.inner.borrow().connects.clone()
    }
    /// Every cell sent so far.
    pub(crate) fn sent(&self) -> Vec<SentCell> {
        self.inner.borrow().sent.clone()
    }
    /// Collect (and clear) the cells sent so far.
    pub(crate) fn take_sent(&mut self) -> Vec<SentCell> {
        std::mem::take(&mut self.inner.borrow_mut().sent)
    }
}

impl ChanProvider for MockChans {
    fn channel_connect(&mut self, addr: SocketAddr, id: &IdDigest) -> Option<ChannelHandle> {
        let mut inner = self.inner.borrow_mut();
        if inner.connect_fails {
            return None;
        }
        inner.connects.push((addr, *id));
        let chan = Channel::new(*id, addr, true, CircIdRange::Higher);
        let handle: ChannelHandle = Rc::new(RefCell::new(chan));
        inner.channels.push(handle.clone());
        Some(handle)
    }

    fn channel_get_for_extend(
        &mut self,
        id: &IdDigest,
        _addr: &SocketAddr,
    ) -> (Option<ChannelHandle>, &'static str, bool) {
        let inner = self.inner.borrow();
        let found = inner.channels.iter().find(|c| {
            let c = c.borrow();
            c.state() == crate::chan::ChannelState::Open && c.peer_id() == id
        });
        match found {
            Some(chan) => (Some(chan.clone()), "Connection is fine; using it.", false),
            None => (None, "no usable channel; launching one", true),
        }
    }

    fn send_cell(&mut self, chan: &ChannelHandle, circ_id: CircId, msg: ChanMsg) {
        let chan_peer = *chan.borrow().peer_id();
        self.inner.borrow_mut().sent.push(SentCell {
            chan_peer,
            circ_id,
            msg,
        });
    }
}

/// A fixed view of stream demand.
#[derive(Clone, Default)]
pub(crate) struct MockDemand {
    /// Ports of streams currently pending.
    pending: Vec<u16>,
    /// Predicted ports.
    predicted: Vec<u16>,
}

impl MockDemand {
    /// A demand snapshot with the given pending and predicted ports.
    pub(crate) fn new(pending: Vec<u16>, predicted: Vec<u16>) -> Self {
        MockDemand { pending, predicted }
    }
}

impl StreamDemand for MockDemand {
    fn pending_stream_ports(&self) -> Vec<u16> {
        self.pending.clone()
    }
    fn predicted_ports(&self) -> Vec<u16> {
        self.predicted.clone()
    }
}

/// A controllable clock.
#[derive(Clone)]
pub(crate) struct MockClock {
    /// The current monotonic instant.
    now: Rc<Cell<Instant>>,
    /// The current wall-clock time.
    wall: Rc<Cell<SystemTime>>,
}

impl MockClock {
    /// A clock starting at the real current time.
    pub(crate) fn new() -> Self {
        MockClock {
            now: Rc::new(Cell::new(Instant::now())),
            wall: Rc::new(Cell::new(SystemTime::now())),
        }
    }
    /// Advance the clock by `d`.
    pub(crate) fn advance(&self, d: Duration) {
        self.now.set(self.now.get() + d);
        self.wall.set(self.wall.get() + d);
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
    fn wallclock(&self) -> SystemTime {
        self.wall.get()
    }
}

/// Shared state behind a [`MockTimes`].
struct TimesInner {
    /// The current timeout cutoff.
    close_ms: u64,
    /// Build times recorded so far.
    added: Vec<u64>,
}

/// A build-time estimator that records inputs and never learns.
#[derive(Clone)]
pub(crate) struct MockTimes {
    /// The shared state; tests keep a clone to inspect it.
    inner: Rc<RefCell<TimesInner>>,
}

impl MockTimes {
    /// An estimator with a fixed cutoff.
    pub(crate) fn with_close_ms(close_ms: u64) -> Self {
        MockTimes {
            inner: Rc::new(RefCell::new(TimesInner {
                close_ms,
                added: Vec::new(),
            })),
        }
    }
    /// The build times recorded so far.
    pub(crate) fn added(&self) -> Vec<u64> {
        self.inner.borrow().added.clone()
    }
}

impl BuildTimeEstimator for MockTimes {
    fn close_ms(&self) -> u64 {
        self.inner.borrow().close_ms
    }
    fn add_time(&mut self, ms: u64) {
        self.inner.borrow_mut().added.push(ms);
    }
}

/// Compile-time check that the mock types satisfy the traits the
/// core boxes them behind.
#[allow(dead_code)]
fn assert_traits() {
    fn is_dir<T: NodeDirectory>() {}
    fn is_guards<T: GuardStore>() {}
    fn is_chans<T: ChanProvider>() {}
    fn is_demand<T: StreamDemand>() {}
    fn is_clock<T: Clock>() {}
    fn is_times<T: BuildTimeEstimator>() {}
    is_dir::<MockDir>();
    is_guards::<MockGuards>();
    is_chans::<MockChans>();
    is_demand::<MockDemand>();
    is_clock::<MockClock>();
    is_times::<MockTimes>();
}
