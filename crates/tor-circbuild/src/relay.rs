//! The relay-side extend responder.
//!
//! When we run as a relay, a client can ask us to extend one of its
//! circuits: we parse the extend request, sanity-check the target,
//! open (or reuse) a channel to it, and re-emit the inner handshake
//! as a create cell.  Everything after the created reply comes back
//! is the relay cell-switching path, which lives outside this crate.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use tracing::{debug, info, warn};

use crate::cells::{CreateCell, CreateVariant, ExtendMsg, LinkSpec};
use crate::chan::{ChanMsg, ChanProvider, ChannelHandle, ChannelState};
use crate::config::CircuitConfig;
use crate::err::{CloseKind, CloseReason};
use crate::extendinfo::ExtendInfo;
use crate::ids::{GlobalId, IdDigest};

/// Return true for addresses in private (RFC1918 and similar) space.
fn addr_is_internal(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// An extend request, normalized out of either wire encoding.
#[derive(Clone, Debug)]
#[allow(clippy::exhaustive_structs)]
pub struct ExtendRequest {
    /// Where to connect.
    pub addr: SocketAddr,
    /// The identity the next relay must prove.
    pub node_id: IdDigest,
    /// The create cell to deliver there.
    pub create: CreateCell,
}

impl ExtendRequest {
    /// Normalize a parsed extend message.
    ///
    /// For EXTEND2, takes the first IPv4 and first legacy-identity
    /// link specifiers; anything unrecognized is ignored, per the
    /// cell specification.
    pub fn from_msg(msg: &ExtendMsg) -> Result<Self, CloseReason> {
        match msg {
            ExtendMsg::Extend {
                addr,
                port,
                onionskin,
                rsaid,
            } => Ok(ExtendRequest {
                addr: SocketAddr::new(IpAddr::V4(*addr), *port),
                node_id: *rsaid,
                create: CreateCell::new(
                    CreateVariant::Create,
                    crate::cells::HandshakeType::TAP,
                    onionskin.clone(),
                ),
            }),
            ExtendMsg::Extend2 {
                linkspec,
                handshake_type,
                onionskin,
            } => {
                let mut addr = None;
                let mut node_id = None;
                for ls in linkspec {
                    match ls {
                        LinkSpec::OrPort4(a, p) if addr.is_none() => {
                            addr = Some(SocketAddr::new(IpAddr::V4(*a), *p));
                        }
                        LinkSpec::RsaId(id) if node_id.is_none() => {
                            node_id = Some(*id);
                        }
                        _ => {}
                    }
                }
                let (Some(addr), Some(node_id)) = (addr, node_id) else {
                    warn!("Missing IPv4 or identity in extend2 cell. Closing.");
                    return Err(CloseReason::local(CloseKind::Protocol));
                };
                Ok(ExtendRequest {
                    addr,
                    node_id,
                    create: CreateCell::new(
                        CreateVariant::Create2,
                        *handshake_type,
                        onionskin.clone(),
                    ),
                })
            }
        }
    }
}

/// One inbound circuit we may be asked to extend.
pub struct RelayCircuit {
    /// Process-local identifier.
    pub(crate) global_id: GlobalId,
    /// Identity of the previous hop (the client-side channel peer).
    pub(crate) p_chan_peer: IdDigest,
    /// The outbound channel, once attached.
    pub(crate) n_chan: Option<ChannelHandle>,
    /// Our circuit ID on the outbound channel, once allocated.
    pub(crate) n_circ_id: Option<crate::chan::CircId>,
    /// Where we are connecting, while waiting for a channel.
    pub(crate) n_hop: Option<ExtendInfo>,
    /// The create cell to forward once the channel opens.
    pub(crate) pending_create: Option<CreateCell>,
}

impl RelayCircuit {
    /// Create a record for an inbound circuit from `p_chan_peer`.
    pub fn new(global_id: GlobalId, p_chan_peer: IdDigest) -> Self {
        RelayCircuit {
            global_id,
            p_chan_peer,
            n_chan: None,
            n_circ_id: None,
            n_hop: None,
            pending_create: None,
        }
    }
    /// Return this circuit's process-local identifier.
    pub fn global_id(&self) -> GlobalId {
        self.global_id
    }
    /// Return true once an outbound hop exists or is being set up.
    pub fn has_next_hop(&self) -> bool {
        self.n_chan.is_some() || self.n_hop.is_some()
    }
}

/// Driver for the relay side of circuit extension.
pub struct ExtendResponder {
    /// Inbound circuits we know about.
    circuits: HashMap<GlobalId, RelayCircuit>,
}

impl Default for ExtendResponder {
    fn default() -> Self {
        ExtendResponder::new()
    }
}

impl ExtendResponder {
    /// Create an empty responder.
    pub fn new() -> Self {
        ExtendResponder {
            circuits: HashMap::new(),
        }
    }

    /// Register an inbound circuit.
    pub fn add_circuit(&mut self, circ: RelayCircuit) {
        self.circuits.insert(circ.global_id, circ);
    }
    /// Return the circuit with identifier `id`, if any.
    pub fn circuit(&self, id: GlobalId) -> Option<&RelayCircuit> {
        self.circuits.get(&id)
    }
    /// Drop the circuit with identifier `id`.
    pub fn remove_circuit(&mut self, id: GlobalId) -> Option<RelayCircuit> {
        self.circuits.remove(&id)
    }

    /// Handle an extend request arriving on inbound circuit `id`.
    ///
    /// On error the caller must close the inbound circuit with the
    /// returned reason.
    pub fn handle_extend(
        &mut self,
        id: GlobalId,
        msg: &ExtendMsg,
        config: &CircuitConfig,
        chans: &mut dyn ChanProvider,
    ) -> Result<(), CloseReason> {
        let circ = self
            .circuits
            .get_mut(&id)
            .ok_or(CloseReason::local(CloseKind::Internal))?;

        if circ.n_chan.is_some() {
            warn!("n_chan already set. Bug/attack. Closing.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }
        if circ.n_hop.is_some() {
            warn!("conn to next hop already launched. Bug/attack. Closing.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }
        if !config.server_mode {
            warn!("Got an extend cell, but running as a client. Closing.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }

        let req = ExtendRequest::from_msg(msg)?;

        if req.addr.port() == 0 || req.addr.ip().is_unspecified() {
            warn!("Client asked me to extend to zero destination port or addr.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }
        if addr_is_internal(&req.addr.ip()) && !config.extend_allow_private_addresses {
            warn!("Client asked me to extend to a private address.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }
        // An all-zero fingerprint would let the client MITM itself,
        // and would let an attacker force us to open a fresh TLS
        // connection for every extend.
        if req.node_id.is_zero() {
            warn!("Client asked me to extend without specifying an id_digest.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }
        // Extending back to the hop this cell came from assists
        // circular-path attacks; there's no honest reason for it.
        if req.node_id == circ.p_chan_peer {
            warn!("Client asked me to extend back to the previous hop.");
            return Err(CloseReason::local(CloseKind::Protocol));
        }

        let (chan, msg_str, should_launch) = chans.channel_get_for_extend(&req.node_id, &req.addr);
        match chan {
            None => {
                debug!("Next router ({}): {}", req.addr, msg_str);
                circ.n_hop = Some(
                    ExtendInfo::builder()
                        .identity(req.node_id)
                        .addr(req.addr)
                        .build()
                        .map_err(|_| CloseReason::local(CloseKind::Internal))?,
                );
                circ.pending_create = Some(req.create);
                if should_launch {
                    if chans.channel_connect(req.addr, &req.node_id).is_none() {
                        info!("Launching n_chan failed. Closing circuit.");
                        return Err(CloseReason::local(CloseKind::ConnectFailed));
                    }
                    debug!("connecting in progress (or finished). Good.");
                }
                Ok(())
            }
            Some(chan) => {
                debug_assert!(circ.n_hop.is_none());
                circ.n_chan = Some(chan.clone());
                Self::deliver_pending_create(circ, &chan, req.create, chans)
            }
        }
    }

    /// A channel finished connecting (or failed): forward the pending
    /// create cells of every circuit waiting on it.
    ///
    /// Returns the circuits that should be closed, with reasons.
    pub fn channel_ready(
        &mut self,
        chan: &ChannelHandle,
        ok: bool,
        chans: &mut dyn ChanProvider,
    ) -> Vec<(GlobalId, CloseReason)> {
        if ok {
            chan.borrow_mut().mark_open();
        }
        let peer = *chan.borrow().peer_id();
        let mut failed = Vec::new();
        let waiting: Vec<GlobalId> = self
            .circuits
            .values()
            .filter(|c| {
                c.n_chan.is_none()
                    && c.n_hop
                        .as_ref()
                        .map_or(false, |hop| hop.identity() == &peer)
            })
            .map(|c| c.global_id)
            .collect();
        for id in waiting {
            let Some(circ) = self.circuits.get_mut(&id) else {
                continue;
            };
            if !ok {
                failed.push((id, CloseReason::local(CloseKind::ChannelClosed)));
                continue;
            }
            circ.n_chan = Some(chan.clone());
            circ.n_hop = None;
            let Some(create) = circ.pending_create.take() else {
                failed.push((id, CloseReason::local(CloseKind::Internal)));
                continue;
            };
            if let Err(reason) = Self::deliver_pending_create(circ, chan, create, chans) {
                failed.push((id, reason));
            }
        }
        failed
    }

    /// Allocate an outbound circuit ID and forward `create`.
    fn deliver_pending_create(
        circ: &mut RelayCircuit,
        chan: &ChannelHandle,
        create: CreateCell,
        chans: &mut dyn ChanProvider,
    ) -> Result<(), CloseReason> {
        if chan.borrow().state() != ChannelState::Open {
            return Err(CloseReason::local(CloseKind::ChannelClosed));
        }
        let circ_id = chan
            .borrow_mut()
            .alloc_circ_id(circ.global_id)
            .map_err(|_| CloseReason::local(CloseKind::ResourceLimit))?;
        circ.n_circ_id = Some(circ_id);
        debug!(
            "Forwarding create for inbound circuit {} on circID {}.",
            circ.global_id, circ_id
        );
        chans.send_cell(chan, circ_id, ChanMsg::Create(create));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::cells::HandshakeType;
    use crate::chan::CircIdRange;
    use crate::mocks::MockChans;

    fn relay_config() -> CircuitConfig {
        let mut cfg = CircuitConfig::default();
        cfg.server_mode = true;
        cfg
    }

    fn extend2_to(addr: &str, port: u16, id: [u8; 20]) -> ExtendMsg {
        ExtendMsg::Extend2 {
            linkspec: vec![
                LinkSpec::OrPort4(addr.parse().unwrap(), port),
                LinkSpec::RsaId(IdDigest::new(id)),
            ],
            handshake_type: HandshakeType::NTOR,
            onionskin: vec![9; crate::cells::NTOR_C_HANDSHAKE_LEN],
        }
    }

    fn responder_with_circ(prev: [u8; 20]) -> (ExtendResponder, GlobalId) {
        let mut r = ExtendResponder::new();
        let id = GlobalId(900);
        r.add_circuit(RelayCircuit::new(id, IdDigest::new(prev)));
        (r, id)
    }

    #[test]
    fn private_address_rejected() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let msg = extend2_to("10.0.0.1", 9001, [2; 20]);
        let e = r
            .handle_extend(id, &msg, &relay_config(), &mut chans)
            .unwrap_err();
        assert_eq!(e.kind(), CloseKind::Protocol);
        assert!(chans.connects().is_empty());
        assert!(chans.sent().is_empty());
    }

    #[test]
    fn private_address_allowed_when_configured() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let mut cfg = relay_config();
        cfg.extend_allow_private_addresses = true;
        let msg = extend2_to("10.0.0.1", 9001, [2; 20]);
        assert!(r.handle_extend(id, &msg, &cfg, &mut chans).is_ok());
        assert_eq!(chans.connects().len(), 1);
    }

    #[test]
    fn circular_extend_rejected() {
        let (mut r, id) = responder_with_circ([7; 20]);
        let mut chans = MockChans::new();
        // node_id equals the previous hop's identity.
        let msg = extend2_to("192.0.2.5", 9001, [7; 20]);
        let e = r
            .handle_extend(id, &msg, &relay_config(), &mut chans)
            .unwrap_err();
        assert_eq!(e.kind(), CloseKind::Protocol);
        assert!(chans.connects().is_empty());
    }

    #[test]
    fn zero_identity_and_port_rejected() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let msg = extend2_to("192.0.2.5", 9001, [0; 20]);
        assert!(r.handle_extend(id, &msg, &relay_config(), &mut chans).is_err());

        let msg = extend2_to("192.0.2.5", 0, [2; 20]);
        assert!(r.handle_extend(id, &msg, &relay_config(), &mut chans).is_err());
    }

    #[test]
    fn client_mode_rejects_extends() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let msg = extend2_to("192.0.2.5", 9001, [2; 20]);
        let cfg = CircuitConfig::default();
        assert!(r.handle_extend(id, &msg, &cfg, &mut chans).is_err());
    }

    #[test]
    fn reuses_open_channel_and_forwards_create() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let target = IdDigest::new([2; 20]);
        chans.add_open_channel(target, "192.0.2.5:9001".parse().unwrap(), CircIdRange::Higher);

        let msg = extend2_to("192.0.2.5", 9001, [2; 20]);
        r.handle_extend(id, &msg, &relay_config(), &mut chans).unwrap();

        let sent = chans.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].msg, ChanMsg::Create(_)));
        assert!(r.circuit(id).unwrap().n_circ_id.is_some());
    }

    #[test]
    fn launches_channel_then_forwards_on_ready() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let msg = extend2_to("192.0.2.5", 9001, [2; 20]);
        r.handle_extend(id, &msg, &relay_config(), &mut chans).unwrap();
        assert_eq!(chans.connects().len(), 1);
        assert!(chans.sent().is_empty());

        let chan = chans.channels().pop().unwrap();
        let failed = r.channel_ready(&chan, true, &mut chans);
        assert!(failed.is_empty());
        let sent = chans.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].msg, ChanMsg::Create(_)));
    }

    #[test]
    fn channel_failure_reports_waiters() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let msg = extend2_to("192.0.2.5", 9001, [2; 20]);
        r.handle_extend(id, &msg, &relay_config(), &mut chans).unwrap();
        let chan = chans.channels().pop().unwrap();
        let failed = r.channel_ready(&chan, false, &mut chans);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, id);
        assert_eq!(failed[0].1.kind(), CloseKind::ChannelClosed);
    }

    #[test]
    fn double_extend_rejected() {
        let (mut r, id) = responder_with_circ([1; 20]);
        let mut chans = MockChans::new();
        let msg = extend2_to("192.0.2.5", 9001, [2; 20]);
        r.handle_extend(id, &msg, &relay_config(), &mut chans).unwrap();
        // Second extend on the same circuit: bug or attack.
        let e = r
            .handle_extend(id, &msg, &relay_config(), &mut chans)
            .unwrap_err();
        assert_eq!(e.kind(), CloseKind::Protocol);
    }
}
