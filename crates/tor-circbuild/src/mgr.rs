//! The circuit construction core: one state machine per origin
//! circuit, driven by events from the channel layer.
//!
//! [`CircuitCore`] owns the table of live origin circuits and borrows
//! every external collaborator (directory, guard store, channel
//! layer, build-time estimator, clock).  All operations run on one
//! event-loop thread; the embedding application calls back in when a
//! channel finishes connecting, when a created/extended cell arrives,
//! and when timers fire.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::cells::{
    CreateCell, CreateVariant, CreatedCell, CreatedVariant, ExtendMsg, ExtendedMsg, HandshakeType,
    LinkSpec, RelayCmd, RelayHeader, CELL_PAYLOAD_SIZE, RELAY_HEADER_SIZE, RELAY_PAYLOAD_SIZE,
};
use crate::chan::{ChanMsg, ChanProvider, ChannelCloseReason, ChannelHandle, ChannelState};
use crate::circuit::{CircState, CircuitFlags, OriginCircuit, Purpose};
use crate::config::{CircuitConfig, NetParams};
use crate::cpath::{HopNum, HopState};
use crate::crypto::cellcrypt::RelayCellBody;
use crate::crypto::handshake::onion_skin_create;
use crate::crypto::handshake::onion_skin_client_handshake;
use crate::err::{CloseKind, CloseReason};
use crate::extendinfo::ExtendInfo;
use crate::guards::GuardStore;
use crate::ids::{GlobalId, StreamId};
use crate::netdir::{NodeDirectory, Relay};
use crate::path::{self, StreamDemand, DEFAULT_ROUTE_LEN};
use crate::pathbias::{self, CloseDecision, PathBiasCtx};
use crate::{Error, Result};

/// A source of time for the core.
///
/// Kept abstract so tests can drive timeouts and build-time
/// measurement deterministically.
pub trait Clock {
    /// The current monotonic time.
    fn now(&self) -> Instant;
    /// The current wall-clock time.
    fn wallclock(&self) -> SystemTime;
}

/// The system clock.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
    fn wallclock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// The build-time histogram, which turns completed build times into
/// future timeout cutoffs.
///
/// The estimator itself (Pareto modeling, persistence) lives outside
/// the core.
pub trait BuildTimeEstimator {
    /// The current cutoff after which a build counts as timed out.
    fn close_ms(&self) -> u64;
    /// Record a completed build time.
    fn add_time(&mut self, ms: u64);
}

/// Decide whether to start a first hop with CREATE_FAST.
///
/// If we don't know the relay's legacy onion key our hand is forced.
/// Otherwise we use it only when configured to, and never as a public
/// relay (relays blend their own circuits in with the ones they
/// carry).
fn should_use_create_fast(info: &ExtendInfo, config: &CircuitConfig) -> bool {
    if info.onion_key().is_none() {
        return true;
    }
    if !config.fast_first_hop_pk {
        return false;
    }
    if config.server_mode {
        return false;
    }
    true
}

/// Return true if the ntor handshake is enabled by configuration, or
/// set to auto and enabled in the consensus.
fn circuits_can_use_ntor(config: &CircuitConfig, params: &NetParams) -> bool {
    match config.use_ntor_handshake {
        Some(v) => v,
        None => params.get("UseNTorHandshake", 0, 0, 1) == 1,
    }
}

/// Decide which handshake to use for connecting to `info` directly.
fn pick_create_handshake(
    info: &ExtendInfo,
    config: &CircuitConfig,
    params: &NetParams,
) -> (CreateVariant, HandshakeType) {
    if info.ntor_onion_key().is_some() && circuits_can_use_ntor(config, params) {
        (CreateVariant::Create2, HandshakeType::NTOR)
    } else {
        (CreateVariant::Create, HandshakeType::TAP)
    }
}

/// Decide which handshake to use for extending to `info` through
/// `prev_node`, and whether to carry it in an EXTEND2 or a legacy
/// EXTEND cell.
///
/// A previous hop that can't handle EXTEND2 forces the legacy cell,
/// which can only carry TAP; in that case we drop back to TAP when
/// the target has a legacy onion key at all.
fn pick_extend_handshake(
    prev_node: Option<&Relay>,
    info: &ExtendInfo,
    config: &CircuitConfig,
    params: &NetParams,
) -> (bool, CreateVariant, HandshakeType) {
    let (_, htype) = pick_create_handshake(info, config, params);
    let prev_supports_extend2 = prev_node.map(Relay::supports_extend2).unwrap_or(false);
    if htype != HandshakeType::TAP && prev_supports_extend2 {
        (true, CreateVariant::Create2, htype)
    } else if info.onion_key().is_some() {
        (false, CreateVariant::Create, HandshakeType::TAP)
    } else {
        (true, CreateVariant::Create2, htype)
    }
}

/// Map a close reason onto the reason byte of a DESTROY cell.
fn destroy_reason_byte(reason: CloseReason) -> u8 {
    match reason.kind() {
        CloseKind::Protocol => 1,
        CloseKind::Internal => 2,
        CloseKind::ResourceLimit => 5,
        CloseKind::ConnectFailed => 6,
        CloseKind::ChannelClosed => 8,
        CloseKind::Finished => 9,
        CloseKind::Timeout => 10,
        CloseKind::NoPath => 12,
    }
}

/// Map a TRUNCATED cell's reason byte onto a close kind.
fn truncated_reason_kind(byte: u8) -> CloseKind {
    match byte {
        6 => CloseKind::ConnectFailed,
        8 => CloseKind::ChannelClosed,
        10 => CloseKind::Timeout,
        _ => CloseKind::Protocol,
    }
}

/// The circuit construction core.
///
/// One instance exists per process; it aggregates the context every
/// entry point needs, instead of reading global state.
pub struct CircuitCore {
    /// Operator configuration.
    config: CircuitConfig,
    /// Consensus parameters.
    params: NetParams,
    /// The relay directory.
    dir: Box<dyn NodeDirectory>,
    /// The entry-guard store.
    guards: Box<dyn GuardStore>,
    /// The channel layer.
    chans: Box<dyn ChanProvider>,
    /// Pending and predicted stream demand (exit scoring).
    demand: Box<dyn StreamDemand>,
    /// The build-time histogram.
    timeouts: Box<dyn BuildTimeEstimator>,
    /// Time source.
    clock: Box<dyn Clock>,
    /// Randomness for handshakes, path choice, and probe nonces.
    rng: StdRng,
    /// Every live origin circuit, by global identifier.
    circuits: HashMap<GlobalId, OriginCircuit>,
    /// Allocation cursor for global identifiers.
    next_global_id: u64,
    /// Recently closed circuits and why, until the embedder collects
    /// them (the control surface for close notifications).
    closed: Vec<(GlobalId, CloseReason)>,
}

impl CircuitCore {
    /// Construct a core around the given collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CircuitConfig,
        params: NetParams,
        dir: Box<dyn NodeDirectory>,
        guards: Box<dyn GuardStore>,
        chans: Box<dyn ChanProvider>,
        demand: Box<dyn StreamDemand>,
        timeouts: Box<dyn BuildTimeEstimator>,
        clock: Box<dyn Clock>,
    ) -> Self {
        CircuitCore {
            config,
            params,
            dir,
            guards,
            chans,
            demand,
            timeouts,
            clock,
            rng: StdRng::from_os_rng(),
            circuits: HashMap::new(),
            next_global_id: 1,
            closed: Vec::new(),
        }
    }

    /// Replace the RNG with a seeded one, for reproducible tests.
    #[cfg(test)]
    pub(crate) fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Testing only: read a guard's accounting record by copy.
    #[cfg(test)]
    pub(crate) fn guard_record(&mut self, id: &crate::ids::IdDigest) -> crate::guards::GuardRecord {
        self.guards
            .record_mut(id)
            .expect("no such guard")
            .clone()
    }

    /// Return the circuit with identifier `id`, if it is still alive.
    pub fn circuit(&self, id: GlobalId) -> Option<&OriginCircuit> {
        self.circuits.get(&id)
    }
    /// Return the number of live circuits.
    pub fn n_circuits(&self) -> usize {
        self.circuits.len()
    }
    /// Collect the (circuit, reason) pairs closed since the last
    /// call.
    pub fn take_closed(&mut self) -> Vec<(GlobalId, CloseReason)> {
        std::mem::take(&mut self.closed)
    }

    /// Remove `id` from the table, hand it (plus an accounting
    /// context) to `f`, and put it back.
    fn with_removed_circ<T>(
        &mut self,
        id: GlobalId,
        f: impl FnOnce(&mut OriginCircuit, &mut PathBiasCtx<'_>) -> T,
    ) -> Option<T> {
        let mut circ = self.circuits.remove(&id)?;
        let now = self.clock.now();
        let wallclock = self.clock.wallclock();
        let close_ms = self.timeouts.close_ms();
        let out = {
            let mut ctx = PathBiasCtx {
                config: &self.config,
                params: &self.params,
                guards: &mut *self.guards,
                circuits: &mut self.circuits,
                chans: &mut *self.chans,
                rng: &mut self.rng,
                now,
                wallclock,
                close_ms,
            };
            f(&mut circ, &mut ctx)
        };
        self.circuits.insert(id, circ);
        Some(out)
    }

    /// Build a new circuit for `purpose`.  If `exit` is given, use it
    /// as the last hop; otherwise choose a suitable exit.
    ///
    /// Also starts the connection to the first relay in the path, if
    /// one isn't open already.
    pub fn establish_circuit(
        &mut self,
        purpose: Purpose,
        exit: Option<ExtendInfo>,
        flags: CircuitFlags,
    ) -> Result<GlobalId> {
        let id = GlobalId(self.next_global_id);
        self.next_global_id += 1;
        let mut circ = OriginCircuit::new(id, purpose, &flags);

        let picked = path::onion_pick_cpath_exit(
            &mut circ,
            exit,
            &*self.dir,
            &*self.demand,
            &self.config,
            &mut self.rng,
        )
        .and_then(|_| {
            path::onion_populate_cpath(
                &mut circ,
                &*self.dir,
                &mut *self.guards,
                &self.config,
                &self.params,
                &mut self.rng,
            )
        });
        if let Err(e) = picked {
            info!("Generating cpath hop failed; discarding circuit.");
            self.closed.push((id, CloseReason::local(CloseKind::NoPath)));
            return Err(e);
        }

        circ.timestamp_began = Some(self.clock.now());
        self.circuits.insert(id, circ);

        if let Err(reason) = self.circuit_handle_first_hop(id) {
            self.mark_for_close(id, reason);
            return Err(reason.into());
        }
        Ok(id)
    }

    /// Start establishing the first hop: reuse an open channel if one
    /// exists, or register for (and maybe launch) a connection.
    fn circuit_handle_first_hop(&mut self, id: GlobalId) -> std::result::Result<(), CloseReason> {
        let circ = self
            .circuits
            .get_mut(&id)
            .ok_or(CloseReason::local(CloseKind::Internal))?;
        let firsthop = circ
            .cpath
            .hop(0.into())
            .ok_or(CloseReason::local(CloseKind::Internal))?
            .extend_info()
            .clone();
        debug!("Looking for firsthop '{}'", firsthop.addr());

        let addr = firsthop.addr();
        let (chan, msg, should_launch) = self
            .chans
            .channel_get_for_extend(firsthop.identity(), &addr);
        match chan {
            None => {
                // Not currently connected in a useful way.
                info!("Next router is {}: {}", firsthop.describe(), msg);
                circ.n_hop = Some(firsthop.clone());
                if should_launch
                    && self
                        .chans
                        .channel_connect(addr, firsthop.identity())
                        .is_none()
                {
                    info!("connect to firsthop failed. Closing.");
                    return Err(CloseReason::local(CloseKind::ConnectFailed));
                }
                // The create cell goes out when channel_ready fires.
                debug!("connecting in progress (or finished). Good.");
                Ok(())
            }
            Some(chan) => {
                debug_assert!(circ.n_hop.is_none());
                circ.n_chan = Some(chan);
                debug!("Conn open. Delivering first onion skin.");
                self.circuit_send_next_onion_skin(id)
            }
        }
    }

    /// A channel finished connecting (or failed).  Give every circuit
    /// that was waiting on it a chance to proceed.
    pub fn channel_ready(&mut self, chan: &ChannelHandle, ok: bool) {
        {
            let mut c = chan.borrow_mut();
            if ok {
                c.mark_open();
            } else if c.state() != ChannelState::Closed {
                c.mark_closed(ChannelCloseReason::Errored);
            }
        }
        let peer = *chan.borrow().peer_id();
        debug!("chan to {} ready, ok={}", peer, ok);

        let waiting: Vec<GlobalId> = self
            .circuits
            .values()
            .filter(|c| {
                c.state == CircState::ChanWait
                    && c.n_chan.is_none()
                    && c.n_hop.as_ref().map_or(false, |hop| {
                        if hop.identity().is_zero() {
                            // Unkeyed connection: match on address.
                            chan.borrow().matches_extend_info(hop)
                        } else {
                            hop.identity() == &peer
                        }
                    })
            })
            .map(|c| c.global_id)
            .collect();

        for id in waiting {
            if !ok {
                info!("Channel failed; closing circ.");
                self.mark_for_close(id, CloseReason::local(CloseKind::ChannelClosed));
                continue;
            }
            if let Some(circ) = self.circuits.get_mut(&id) {
                circ.n_chan = Some(chan.clone());
                circ.n_hop = None;
            }
            debug!("Found circ, sending create cell.");
            if let Err(reason) = self.circuit_send_next_onion_skin(id) {
                info!("send_next_onion_skin failed; circuit marked for closing.");
                self.mark_for_close(id, reason);
            }
        }
    }

    /// Allocate a circuit ID on the circuit's channel and send the
    /// create cell.
    fn circuit_deliver_create_cell(
        &mut self,
        id: GlobalId,
        cell: CreateCell,
    ) -> std::result::Result<(), CloseReason> {
        let circ = self
            .circuits
            .get_mut(&id)
            .ok_or(CloseReason::local(CloseKind::Internal))?;
        let chan = circ
            .n_chan
            .clone()
            .ok_or(CloseReason::local(CloseKind::Internal))?;
        let circ_id = chan.borrow_mut().alloc_circ_id(id).map_err(|_| {
            warn!("failed to get unique circID.");
            CloseReason::local(CloseKind::ResourceLimit)
        })?;
        debug!("Chosen circID {}.", circ_id);
        circ.n_circ_id = Some(circ_id);

        // Update the began timestamp for circuits starting their
        // first hop.
        if circ
            .cpath
            .hop(0.into())
            .map(|h| h.state() == HopState::Closed)
            .unwrap_or(false)
        {
            if chan.borrow().state() != ChannelState::Open {
                warn!("Got first hop for a circuit without an opened channel.");
            }
            circ.timestamp_began = Some(self.clock.now());
        }

        self.chans.send_cell(&chan, circ_id, ChanMsg::Create(cell));
        Ok(())
    }

    /// The backbone of circuit building.
    ///
    /// If the first hop is still closed, format and send its create
    /// cell.  Otherwise, either send the extend cell for the next
    /// unbuilt hop, or conclude the build.
    fn circuit_send_next_onion_skin(
        &mut self,
        id: GlobalId,
    ) -> std::result::Result<(), CloseReason> {
        let first_hop_closed = {
            let circ = self
                .circuits
                .get(&id)
                .ok_or(CloseReason::local(CloseKind::Internal))?;
            circ.cpath
                .hop(0.into())
                .map(|h| h.state() == HopState::Closed)
                .unwrap_or(false)
        };
        if first_hop_closed {
            self.circuit_send_first_onion_skin(id)
        } else {
            let next = {
                let circ = self
                    .circuits
                    .get(&id)
                    .ok_or(CloseReason::local(CloseKind::Internal))?;
                circ.cpath.first_non_open()
            };
            match next {
                None => self.circuit_build_completed(id),
                Some(hop) => self.circuit_send_intermediate_onion_skin(id, hop),
            }
        }
    }

    /// Format and deliver the create cell for the first hop.
    fn circuit_send_first_onion_skin(
        &mut self,
        id: GlobalId,
    ) -> std::result::Result<(), CloseReason> {
        debug!("First skin; sending create cell.");
        let (cell, hs_state, fast) = {
            let circ = self
                .circuits
                .get_mut(&id)
                .ok_or(CloseReason::local(CloseKind::Internal))?;
            let info = circ
                .cpath
                .hop(0.into())
                .ok_or(CloseReason::local(CloseKind::Internal))?
                .extend_info()
                .clone();
            let fast = should_use_create_fast(&info, &self.config);
            let (variant, htype) = if fast {
                // We're not an OR (or don't know the onion key):
                // CREATE_FAST saves the public-key operation.
                (CreateVariant::CreateFast, HandshakeType::FAST)
            } else {
                pick_create_handshake(&info, &self.config, &self.params)
            };
            let (hs_state, skin) =
                onion_skin_create(&mut self.rng, htype, &info).map_err(|_| {
                    warn!("onion_skin_create (first hop) failed.");
                    CloseReason::local(CloseKind::Internal)
                })?;
            (CreateCell::new(variant, htype, skin), hs_state, fast)
        };
        self.circuit_deliver_create_cell(id, cell)?;

        let circ = self
            .circuits
            .get_mut(&id)
            .ok_or(CloseReason::local(CloseKind::Internal))?;
        circ.cpath
            .hop_mut(0.into())
            .ok_or(CloseReason::local(CloseKind::Internal))?
            .set_awaiting_keys(hs_state);
        circ.state = CircState::Building;
        info!(
            "First hop: finished sending {} cell.",
            if fast { "CREATE_FAST" } else { "CREATE" }
        );
        Ok(())
    }

    /// Format, encrypt, and send the extend cell for `hop`, as a
    /// relay cell originating at the previous hop.
    fn circuit_send_intermediate_onion_skin(
        &mut self,
        id: GlobalId,
        hop: HopNum,
    ) -> std::result::Result<(), CloseReason> {
        debug!("starting to send subsequent skin.");
        let (chan, circ_id, body) = {
            let circ = self
                .circuits
                .get_mut(&id)
                .ok_or(CloseReason::local(CloseKind::Internal))?;
            let info = circ
                .cpath
                .hop(hop)
                .ok_or(CloseReason::local(CloseKind::Internal))?
                .extend_info()
                .clone();

            let SocketAddr::V4(target) = info.addr() else {
                // The extend cell format has an IPv6 field, but the
                // deployed network does not extend over IPv6; refuse
                // to match wire behavior.
                warn!("Trying to extend to a non-IPv4 address.");
                return Err(CloseReason::local(CloseKind::Internal));
            };

            let prev = HopNum::from(
                u8::from(hop)
                    .checked_sub(1)
                    .ok_or(CloseReason::local(CloseKind::Internal))?,
            );
            let prev_id = *circ
                .cpath
                .hop(prev)
                .ok_or(CloseReason::local(CloseKind::Internal))?
                .extend_info()
                .identity();
            let prev_node = self.dir.by_id(&prev_id);
            let (use_extend2, _create_variant, htype) =
                pick_extend_handshake(prev_node, &info, &self.config, &self.params);

            let (hs_state, skin) = onion_skin_create(&mut self.rng, htype, &info)
                .map_err(|_| {
                    warn!("onion_skin_create failed.");
                    CloseReason::local(CloseKind::Internal)
                })?;

            let msg = if use_extend2 {
                ExtendMsg::Extend2 {
                    linkspec: vec![
                        LinkSpec::OrPort4(*target.ip(), target.port()),
                        LinkSpec::RsaId(*info.identity()),
                    ],
                    handshake_type: htype,
                    onionskin: skin,
                }
            } else {
                ExtendMsg::Extend {
                    addr: *target.ip(),
                    port: target.port(),
                    onionskin: skin,
                    rsaid: *info.identity(),
                }
            };
            let mut payload = Vec::new();
            use crate::cells::Body;
            msg.encode_onto(&mut payload).map_err(|_| {
                warn!("Couldn't format extend cell");
                CloseReason::local(CloseKind::ResourceLimit)
            })?;
            if payload.len() > RELAY_PAYLOAD_SIZE {
                warn!("Couldn't format extend cell");
                return Err(CloseReason::local(CloseKind::ResourceLimit));
            }

            let mut body = RelayCellBody::zeroed();
            RelayHeader {
                cmd: msg.cmd(),
                recognized: 0,
                stream_id: StreamId(0),
                digest: [0; 4],
                length: payload.len() as u16,
            }
            .encode_into(&mut body.0[..]);
            body.0[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + payload.len()]
                .copy_from_slice(&payload);
            // The previous hop wraps the extend in its own layer, so
            // encrypt as if it originated there.
            circ.cpath
                .encrypt_from(prev, &mut body)
                .map_err(|_| CloseReason::local(CloseKind::Internal))?;

            circ.cpath
                .hop_mut(hop)
                .ok_or(CloseReason::local(CloseKind::Internal))?
                .set_awaiting_keys(hs_state);

            let chan = circ
                .n_chan
                .clone()
                .ok_or(CloseReason::local(CloseKind::Internal))?;
            let circ_id = circ
                .n_circ_id
                .ok_or(CloseReason::local(CloseKind::Internal))?;
            (chan, circ_id, body)
        };
        info!("Sending extend relay cell.");
        self.chans.send_cell(
            &chan,
            circ_id,
            ChanMsg::Relay {
                body: body.0,
                early: true,
            },
        );

        // The second hop just entered AwaitingKeys: from here on an
        // adversary could end-to-end tag the circuit, so this is the
        // attempt-counting point.
        if u8::from(hop) == 1 {
            if let Some(Err(reason)) =
                self.with_removed_circ(id, |circ, ctx| pathbias::count_build_attempt(circ, ctx))
            {
                return Err(reason);
            }
        }
        Ok(())
    }

    /// The last created/extended reply has been processed: the
    /// circuit is open.
    fn circuit_build_completed(&mut self, id: GlobalId) -> std::result::Result<(), CloseReason> {
        let now = self.clock.now();
        let purpose = {
            let circ = self
                .circuits
                .get_mut(&id)
                .ok_or(CloseReason::local(CloseKind::Internal))?;
            circ.state = CircState::Open;

            // Only count build times from full-length, fresh builds;
            // cannibalized circuits would skew the histogram.
            if !circ.has_opened && circ.build_state.desired_path_len == DEFAULT_ROUTE_LEN {
                if let Some(began) = circ.timestamp_began {
                    let timediff = now.saturating_duration_since(began).as_millis() as u64;
                    let close_ms = self.timeouts.close_ms();
                    if timediff > 2 * close_ms + 1000 {
                        // A suspend event along this codepath would
                        // poison the histogram.
                        info!(
                            "Strange value for circuit build time: {}msec. Assuming clock jump.",
                            timediff
                        );
                    } else {
                        self.timeouts.add_time(timediff);
                    }
                }
            }
            circ.purpose
        };
        info!("circuit built!");

        self.with_removed_circ(id, |circ, ctx| {
            pathbias::count_build_success(circ, ctx);
            circ.has_opened = true;
        });

        // We're done with measurement circuits here; just close them.
        if purpose == Purpose::MeasureTimeout {
            self.mark_for_close(id, CloseReason::local(CloseKind::Finished));
        }
        Ok(())
    }

    /// A created or extended reply arrived for `id`: derive the hop's
    /// keys, open it, and keep building.
    pub fn finish_handshake(&mut self, id: GlobalId, reply: CreatedCell) -> Result<()> {
        let result: Result<()> = {
            let circ = self.circuits.get_mut(&id).ok_or(Error::NoSuchCircuit)?;
            (|| {
                let head_awaiting = circ
                    .cpath
                    .hop(0.into())
                    .map(|h| h.state() == HopState::AwaitingKeys)
                    .unwrap_or(false);
                let hopnum = if head_awaiting {
                    HopNum::from(0)
                } else {
                    circ.cpath.first_non_open().ok_or_else(|| {
                        warn!("got extended when circ already built? Closing.");
                        Error::Protocol("got extended when circuit already built")
                    })?
                };
                let hop = circ
                    .cpath
                    .hop_mut(hopnum)
                    .ok_or(Error::Internal("cpath shorter than expected"))?;
                // A created cell for a hop that isn't waiting is a
                // protocol violation, not a race.
                if hop.state() != HopState::AwaitingKeys {
                    return Err(Error::Protocol("created cell for hop not awaiting keys"));
                }
                let hs = hop
                    .take_handshake_state()
                    .ok_or(Error::Internal("awaiting hop has no handshake state"))?;
                let compatible = matches!(
                    (reply.variant(), hs.handshake_type()),
                    (CreatedVariant::CreatedFast, HandshakeType::FAST)
                        | (CreatedVariant::Created, HandshakeType::TAP)
                        | (CreatedVariant::Created2, HandshakeType::NTOR)
                );
                if !compatible {
                    return Err(Error::Protocol("created cell type does not match handshake"));
                }
                let km = onion_skin_client_handshake(hs, reply.reply()).map_err(|_| {
                    warn!("onion_skin_client_handshake failed.");
                    Error::Protocol("circuit handshake failed")
                })?;
                hop.initialize_crypto(&km, false)
                    .map_err(|_| Error::Protocol("cipher initialization failed"))?;
                info!("Finished building circuit hop {}:", hopnum);
                Ok(())
            })()
        };
        if let Err(e) = result {
            self.mark_for_close(id, CloseReason::local(CloseKind::Protocol));
            return Err(e);
        }
        if let Err(reason) = self.circuit_send_next_onion_skin(id) {
            self.mark_for_close(id, reason);
            return Err(reason.into());
        }
        Ok(())
    }

    /// A relay cell arrived for circuit `id` during construction or
    /// probing: decrypt it and dispatch.
    pub fn handle_relay_cell(&mut self, id: GlobalId, body: &[u8]) -> Result<()> {
        let is_probe = {
            let circ = self.circuits.get(&id).ok_or(Error::NoSuchCircuit)?;
            circ.purpose == Purpose::PathBiasTesting
        };
        if is_probe {
            return self.pathbias_check_probe_response(id, body);
        }

        let (cell, header) = self.decrypt_relay_cell(id, body)?;
        match header.cmd {
            RelayCmd::EXTENDED | RelayCmd::EXTENDED2 => {
                let payload =
                    &cell.0[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + header.length as usize];
                let msg = ExtendedMsg::decode(header.cmd, payload)
                    .map_err(Error::CellFormat)
                    .inspect_err(|_| {
                        self.mark_for_close(id, CloseReason::local(CloseKind::Protocol));
                    })?;
                self.finish_handshake(id, msg.into_created_cell())
            }
            RelayCmd::TRUNCATED => {
                let reason = if header.length > 0 {
                    cell.0[RELAY_HEADER_SIZE]
                } else {
                    0
                };
                self.truncated(id, truncated_reason_kind(reason));
                Ok(())
            }
            _ => {
                self.mark_for_close(id, CloseReason::local(CloseKind::Protocol));
                Err(Error::Protocol("unexpected relay cell during construction"))
            }
        }
    }

    /// Strip the onion layers from an inbound relay cell, closing the
    /// circuit if no hop recognizes it.
    fn decrypt_relay_cell(
        &mut self,
        id: GlobalId,
        body: &[u8],
    ) -> Result<(RelayCellBody, RelayHeader)> {
        if body.len() != CELL_PAYLOAD_SIZE {
            return Err(Error::Protocol("bad relay cell length"));
        }
        let circ = self.circuits.get_mut(&id).ok_or(Error::NoSuchCircuit)?;
        let mut cell = RelayCellBody::zeroed();
        cell.0.copy_from_slice(body);
        match circ.cpath.decrypt_inbound(&mut cell) {
            Ok(_origin) => {}
            Err(e) => {
                self.mark_for_close(id, CloseReason::local(CloseKind::Protocol));
                return Err(e);
            }
        }
        let header = RelayHeader::decode(&cell.0[..]).map_err(Error::CellFormat)?;
        Ok((cell, header))
    }

    /// We received a relay truncated cell: a connection broke or an
    /// extend failed somewhere down the path.  We don't recover
    /// partial circuits; just give up.
    pub fn truncated(&mut self, id: GlobalId, reason: CloseKind) {
        self.mark_for_close(id, CloseReason::remote(reason));
    }

    /// Take an open circuit and extend it one more hop, to serve a
    /// different purpose than it was built for.
    pub fn extend_to_new_exit(&mut self, id: GlobalId, exit: ExtendInfo) -> Result<()> {
        if self.config.excludes_as_exit(exit.identity()) {
            warn!(
                "Using requested exit '{}' which is listed in ExcludeNodes or ExcludeExitNodes.",
                exit.describe()
            );
        }
        let circwindow = self.params.circwindow();
        let now = self.clock.now();
        {
            let circ = self.circuits.get_mut(&id).ok_or(Error::NoSuchCircuit)?;
            circ.timestamp_began = Some(now);
            circ.build_state.chosen_exit = Some(exit.clone());
            circ.build_state.desired_path_len += 1;
            circ.cpath.append_hop(exit, circwindow);
            circ.state = CircState::Building;
        }
        if let Err(reason) = self.circuit_send_next_onion_skin(id) {
            warn!("Couldn't extend circuit to new point.");
            self.mark_for_close(id, reason);
            return Err(reason.into());
        }
        Ok(())
    }

    /// Condemn a circuit.
    ///
    /// Idempotent: closing a circuit that is already gone does
    /// nothing.  When the accountant decides to probe instead, the
    /// close is deferred and the circuit lives on (as
    /// `PathBiasTesting`) until the probe resolves or times out.
    pub fn mark_for_close(&mut self, id: GlobalId, reason: CloseReason) {
        let Some(mut circ) = self.circuits.remove(&id) else {
            return;
        };
        let now = self.clock.now();
        let wallclock = self.clock.wallclock();
        let close_ms = self.timeouts.close_ms();
        let decision = {
            let mut ctx = PathBiasCtx {
                config: &self.config,
                params: &self.params,
                guards: &mut *self.guards,
                circuits: &mut self.circuits,
                chans: &mut *self.chans,
                rng: &mut self.rng,
                now,
                wallclock,
                close_ms,
            };
            pathbias::check_close(&mut circ, reason, &mut ctx)
        };
        match decision {
            CloseDecision::DeferForProbe => {
                debug!("Deferring close of {} for pathbias probe", id);
                self.circuits.insert(id, circ);
            }
            CloseDecision::Done => {
                circ.state = CircState::MarkedForClose;
                if let (Some(chan), Some(circ_id)) = (circ.n_chan.clone(), circ.n_circ_id) {
                    chan.borrow_mut().release_circ_id(circ_id);
                    if chan.borrow().state() == ChannelState::Open {
                        self.chans
                            .send_cell(&chan, circ_id, ChanMsg::Destroy(destroy_reason_byte(reason)));
                    }
                }
                debug!("Circuit {} closed: {}", id, reason);
                self.closed.push((id, reason));
            }
        }
    }

    /// Record that a consumer attached a stream to this circuit.
    pub fn pathbias_count_use_attempt(&mut self, id: GlobalId) {
        let now = self.clock.now();
        self.with_removed_circ(id, |circ, ctx| {
            pathbias::count_use_attempt(circ, ctx);
            circ.timestamp_dirty = Some(now);
        });
    }

    /// Record that a stream succeeded end-to-end on this circuit.
    pub fn pathbias_mark_use_success(&mut self, id: GlobalId) {
        self.with_removed_circ(id, |circ, ctx| pathbias::mark_use_success(circ, ctx));
    }

    /// A stream detached retriably; forget the use-success.
    pub fn pathbias_mark_use_rollback(&mut self, id: GlobalId) {
        if let Some(circ) = self.circuits.get_mut(&id) {
            pathbias::mark_use_rollback(circ);
        }
    }

    /// Evaluate a cell that arrived on an end-of-life probe circuit.
    ///
    /// A matching response counts the circuit as a use success and
    /// closes it cleanly; anything else condemns the circuit (and the
    /// close path records it as unusable).
    pub fn pathbias_check_probe_response(&mut self, id: GlobalId, body: &[u8]) -> Result<()> {
        {
            let circ = self.circuits.get(&id).ok_or(Error::NoSuchCircuit)?;
            if circ.purpose != Purpose::PathBiasTesting {
                return Err(Error::Internal("probe response on non-probe circuit"));
            }
        }
        let (cell, _header) = self.decrypt_relay_cell(id, body)?;
        let matches = {
            let circ = self.circuits.get(&id).ok_or(Error::NoSuchCircuit)?;
            pathbias::probe_response_matches(circ, &cell.0)
        };
        if matches {
            info!("Got valid path bias probe back for circ {}.", id);
            self.with_removed_circ(id, |circ, ctx| pathbias::mark_use_success(circ, ctx));
            self.mark_for_close(id, CloseReason::local(CloseKind::Finished));
            Ok(())
        } else {
            self.mark_for_close(id, CloseReason::local(CloseKind::Protocol));
            Err(Error::Protocol("not the probe response we expected"))
        }
    }

    /// Timer sweep: close every circuit that has been building (or
    /// probing) longer than the timeout cutoff.
    pub fn expire_building(&mut self) {
        let now = self.clock.now();
        let cutoff = Duration::from_millis(self.timeouts.close_ms());
        let overdue: Vec<GlobalId> = self
            .circuits
            .values()
            .filter(|c| {
                let in_build = matches!(c.state, CircState::ChanWait | CircState::Building)
                    || c.purpose == Purpose::PathBiasTesting;
                in_build
                    && c.timestamp_began
                        .map(|t| now.saturating_duration_since(t) > cutoff)
                        .unwrap_or(false)
            })
            .map(|c| c.global_id)
            .collect();
        for id in overdue {
            self.with_removed_circ(id, |circ, ctx| pathbias::count_timeout(circ, ctx));
            self.mark_for_close(id, CloseReason::local(CloseKind::Timeout));
        }
    }

    /// Timer sweep: stop handing out circuits that have been dirty
    /// for longer than the configured window.
    ///
    /// Expired circuits are not closed; they keep serving the streams
    /// they already carry.
    pub fn expire_old_circuits(&mut self) {
        let now = self.clock.now();
        let cutoff = Duration::from_secs(self.config.max_circuit_dirtiness_secs);
        for circ in self.circuits.values_mut() {
            if !circ.unusable_for_new_conns
                && circ
                    .timestamp_dirty
                    .map(|t| now.saturating_duration_since(t) > cutoff)
                    .unwrap_or(false)
            {
                debug!(
                    "Circuit {} is too dirty; not handing it to new streams.",
                    circ.global_id
                );
                circ.unusable_for_new_conns = true;
            }
        }
    }

    /// Our clock just jumped.  Assume something has also gone wrong
    /// with the network: abandon all not-yet-used circuits, and stop
    /// handing out the dirty ones.
    pub fn note_clock_jumped(&mut self, seconds_elapsed: i64) {
        let direction = if seconds_elapsed >= 0 {
            "forward"
        } else {
            "backward"
        };
        if self.config.server_mode {
            warn!(
                "Your system clock just jumped {} seconds {}; assuming established circuits no longer work.",
                seconds_elapsed.abs(),
                direction
            );
        } else {
            info!(
                "Your system clock just jumped {} seconds {}; assuming established circuits no longer work.",
                seconds_elapsed.abs(),
                direction
            );
        }
        let (unused, dirty): (Vec<GlobalId>, Vec<GlobalId>) = {
            let mut unused = Vec::new();
            let mut dirty = Vec::new();
            for c in self.circuits.values() {
                if c.is_dirty() {
                    dirty.push(c.global_id);
                } else {
                    unused.push(c.global_id);
                }
            }
            (unused, dirty)
        };
        for id in unused {
            self.mark_for_close(id, CloseReason::local(CloseKind::Finished));
        }
        for id in dirty {
            if let Some(circ) = self.circuits.get_mut(&id) {
                circ.unusable_for_new_conns = true;
            }
        }
    }
}
