//! Interfaces onto the relay directory.
//!
//! The consensus and its parsing live elsewhere; the path selector
//! only needs a snapshot view of each relay (flags, keys, addresses,
//! weight, family) plus a bandwidth-weighted `choose_random_node`
//! capability, which this module expresses as the [`NodeDirectory`]
//! trait.

use std::collections::HashSet;
use std::net::SocketAddr;

use rand::RngCore;

use crate::ids::{IdDigest, NtorOnionKey, RsaOnionKey};

/// Consensus flags and local judgments about one relay.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct RelayFlags {
    /// The relay is believed to be up.
    pub running: bool,
    /// The relay is listed as valid.
    pub valid: bool,
    /// The relay has the Fast flag.
    pub fast: bool,
    /// The relay has the Stable flag.
    pub stable: bool,
    /// The relay is suitable as an entry guard.
    pub guard: bool,
    /// The relay has been flagged as a bad exit.
    pub bad_exit: bool,
    /// The relay allows single-hop exit streams.
    pub allows_single_hop_exits: bool,
    /// The relay is a general-purpose router (not a bridge or
    /// controller-injected descriptor).
    pub general_purpose: bool,
}

/// The exit policy of a relay, reduced to the port predicate the exit
/// scorer needs.
#[derive(Debug, Clone, Default)]
pub struct PortPolicy {
    /// Inclusive port ranges this relay will exit to.
    allowed: Vec<(u16, u16)>,
}

impl PortPolicy {
    /// Build a policy from a list of inclusive port ranges.
    pub fn new(allowed: Vec<(u16, u16)>) -> Self {
        PortPolicy { allowed }
    }
    /// A policy that rejects every port.
    pub fn reject_all() -> Self {
        PortPolicy { allowed: vec![] }
    }
    /// A policy that accepts every port.
    pub fn accept_all() -> Self {
        PortPolicy {
            allowed: vec![(1, 65535)],
        }
    }
    /// Return true if this policy allows exiting to `port`.
    pub fn allows_port(&self, port: u16) -> bool {
        self.allowed.iter().any(|(lo, hi)| *lo <= port && port <= *hi)
    }
    /// Return true if this policy rejects every port.
    pub fn rejects_all(&self) -> bool {
        self.allowed.is_empty()
    }
}

/// A snapshot of one relay, as provided by the directory layer.
#[derive(Debug, Clone)]
pub struct Relay {
    /// Identity key digest.
    id: IdDigest,
    /// Nickname, if the descriptor carries one.
    nickname: Option<String>,
    /// Consensus flags.
    flags: RelayFlags,
    /// True if we hold a usable descriptor for this relay.
    has_descriptor: bool,
    /// Legacy (TAP) onion key, if known.
    onion_key: Option<RsaOnionKey>,
    /// curve25519 onion key, if the relay has one.
    ntor_onion_key: Option<NtorOnionKey>,
    /// True if the relay's version advertises extend2 support.
    ///
    /// Relays with a curve25519 key are assumed to support extend2
    /// regardless of this flag.
    version_supports_extend2: bool,
    /// The primary (IPv4) OR port.
    prim_orport: SocketAddr,
    /// The preferred OR port for direct connections (may be IPv6).
    pref_orport: SocketAddr,
    /// Consensus bandwidth weight.
    weight: u32,
    /// Identities of the relay's declared family members.
    family: Vec<IdDigest>,
    /// Exit policy, reduced to ports.
    exit_policy: PortPolicy,
}

/// Builder-style constructor arguments for [`Relay`].
///
/// The directory layer owns the real descriptor plumbing; this is the
/// hand-over shape.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct RelayDetails {
    /// See [`Relay::id`].
    pub id: IdDigest,
    /// See [`Relay::nickname`].
    pub nickname: Option<String>,
    /// See [`Relay::flags`].
    pub flags: RelayFlags,
    /// See [`Relay::has_descriptor`].
    pub has_descriptor: bool,
    /// See [`Relay::onion_key`].
    pub onion_key: Option<RsaOnionKey>,
    /// See [`Relay::ntor_onion_key`].
    pub ntor_onion_key: Option<NtorOnionKey>,
    /// See [`Relay::version_supports_extend2`].
    pub version_supports_extend2: bool,
    /// See [`Relay::prim_orport`].
    pub prim_orport: SocketAddr,
    /// See [`Relay::pref_orport`].
    pub pref_orport: Option<SocketAddr>,
    /// See [`Relay::weight`].
    pub weight: u32,
    /// See [`Relay::family`].
    pub family: Vec<IdDigest>,
    /// See [`Relay::exit_policy`].
    pub exit_policy: PortPolicy,
}

impl From<RelayDetails> for Relay {
    fn from(d: RelayDetails) -> Relay {
        Relay {
            id: d.id,
            nickname: d.nickname,
            flags: d.flags,
            has_descriptor: d.has_descriptor,
            onion_key: d.onion_key,
            ntor_onion_key: d.ntor_onion_key,
            version_supports_extend2: d.version_supports_extend2,
            prim_orport: d.prim_orport,
            pref_orport: d.pref_orport.unwrap_or(d.prim_orport),
            weight: d.weight,
            family: d.family,
            exit_policy: d.exit_policy,
        }
    }
}

impl Relay {
    /// Return this relay's identity digest.
    pub fn id(&self) -> &IdDigest {
        &self.id
    }
    /// Return this relay's nickname, if known.
    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }
    /// Return this relay's consensus flags.
    pub fn flags(&self) -> &RelayFlags {
        &self.flags
    }
    /// Return true if we hold a descriptor for this relay.
    pub fn has_descriptor(&self) -> bool {
        self.has_descriptor
    }
    /// Return this relay's legacy onion key, if known.
    pub fn onion_key(&self) -> Option<&RsaOnionKey> {
        self.onion_key.as_ref()
    }
    /// Return this relay's curve25519 onion key, if it has one.
    pub fn ntor_onion_key(&self) -> Option<&NtorOnionKey> {
        self.ntor_onion_key.as_ref()
    }
    /// Return true if we can send this relay an extend2 cell.
    pub fn supports_extend2(&self) -> bool {
        self.ntor_onion_key.is_some() || self.version_supports_extend2
    }
    /// Return the primary (IPv4) OR port.
    pub fn prim_orport(&self) -> SocketAddr {
        self.prim_orport
    }
    /// Return the preferred OR port for direct connections.
    pub fn pref_orport(&self) -> SocketAddr {
        self.pref_orport
    }
    /// Return the consensus bandwidth weight.
    pub fn weight(&self) -> u32 {
        self.weight
    }
    /// Return the declared family of this relay.
    pub fn family(&self) -> &[IdDigest] {
        &self.family
    }
    /// Return this relay's exit policy.
    pub fn exit_policy(&self) -> &PortPolicy {
        &self.exit_policy
    }
    /// Return true if this relay's exit policy rejects every port.
    pub fn exit_policy_rejects_all(&self) -> bool {
        self.exit_policy.rejects_all()
    }
    /// Return true if the relay fails an uptime or capacity
    /// requirement.
    pub fn is_unreliable(&self, need_uptime: bool, need_capacity: bool) -> bool {
        (need_uptime && !self.flags.stable) || (need_capacity && !self.flags.fast)
    }
}

#[cfg(test)]
impl Relay {
    /// Testing only: flip the Running flag.
    pub(crate) fn test_set_running(&mut self, v: bool) {
        self.flags.running = v;
    }
    /// Testing only: flip the Stable flag.
    pub(crate) fn test_set_stable(&mut self, v: bool) {
        self.flags.stable = v;
    }
    /// Testing only: flip the BadExit flag.
    pub(crate) fn test_set_bad_exit(&mut self, v: bool) {
        self.flags.bad_exit = v;
    }
    /// Testing only: replace the exit policy.
    pub(crate) fn test_set_exit_policy(&mut self, p: PortPolicy) {
        self.exit_policy = p;
    }
    /// Testing only: replace the declared family.
    pub(crate) fn test_set_family(&mut self, family: Vec<IdDigest>) {
        self.family = family;
    }
}

/// Requirements passed to [`NodeDirectory::choose_random_node`].
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct NodeSelectionFlags {
    /// Require the Stable flag.
    pub need_uptime: bool,
    /// Require the Fast flag.
    pub need_capacity: bool,
    /// Require suitability as an entry guard.
    pub need_guard: bool,
    /// Require a descriptor to be present.
    pub need_desc: bool,
    /// Permit relays without the Valid flag.
    pub allow_invalid: bool,
}

/// A set of excluded relays, closed over family membership.
#[derive(Debug, Clone, Default)]
pub struct RelaySet {
    /// The identities in the set.
    ids: HashSet<IdDigest>,
}

impl RelaySet {
    /// Return a new empty set.
    pub fn new() -> Self {
        RelaySet::default()
    }
    /// Add a single identity.
    pub fn add_id(&mut self, id: IdDigest) {
        self.ids.insert(id);
    }
    /// Add `relay` and everything in its declared family.
    pub fn add_node_and_family(&mut self, relay: &Relay) {
        self.ids.insert(*relay.id());
        for member in relay.family() {
            self.ids.insert(*member);
        }
    }
    /// Return true if `id` is in the set.
    pub fn contains(&self, id: &IdDigest) -> bool {
        self.ids.contains(id)
    }
    /// Return the number of identities in the set.
    pub fn len(&self) -> usize {
        self.ids.len()
    }
    /// Return true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A view onto the relay directory.
///
/// Implemented by the directory subsystem; the core never parses
/// consensus documents itself.
pub trait NodeDirectory {
    /// Look a relay up by identity digest.
    fn by_id(&self, id: &IdDigest) -> Option<&Relay>;
    /// Return every relay in the current consensus.
    fn relays(&self) -> &[Relay];
    /// Return our own identity, if we are a relay.
    fn self_id(&self) -> Option<&IdDigest>;
    /// Return true if the local firewall lets us reach `relay`.
    fn firewall_permits(&self, relay: &Relay) -> bool;
    /// Choose a random relay, weighted by bandwidth, satisfying
    /// `flags` and not in `excluded`.
    ///
    /// Weighted selection policy (and its interaction with consensus
    /// weight fractions) is the directory's concern, not ours.
    fn choose_random_node<'a>(
        &'a self,
        excluded: &RelaySet,
        flags: NodeSelectionFlags,
        rng: &mut dyn RngCore,
    ) -> Option<&'a Relay>;
}

/// Choose one relay from `candidates`, weighted by bandwidth.
///
/// Used by the exit scorer to break ties among maximum-scoring
/// candidates; general weighted node choice goes through
/// [`NodeDirectory::choose_random_node`] instead.
pub(crate) fn choose_by_bandwidth<'a>(
    candidates: &[&'a Relay],
    rng: &mut dyn RngCore,
) -> Option<&'a Relay> {
    let total: u64 = candidates.iter().map(|r| u64::from(r.weight())).sum();
    if candidates.is_empty() {
        return None;
    }
    if total == 0 {
        // All weights zero: fall back to uniform choice.
        let idx = (rng.next_u64() % candidates.len() as u64) as usize;
        return Some(candidates[idx]);
    }
    let mut x = rng.next_u64() % total;
    for r in candidates {
        let w = u64::from(r.weight());
        if x < w {
            return Some(r);
        }
        x -= w;
    }
    candidates.last().copied()
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    pub(crate) fn basic_relay(id: u8, weight: u32) -> Relay {
        RelayDetails {
            id: IdDigest::new([id; 20]),
            nickname: Some(format!("relay{}", id)),
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
            ntor_onion_key: Some(NtorOnionKey([id; 32])),
            version_supports_extend2: false,
            prim_orport: format!("10.1.{}.1:9001", id).parse().unwrap(),
            pref_orport: None,
            weight,
            family: vec![],
            exit_policy: PortPolicy::accept_all(),
        }
        .into()
    }

    #[test]
    fn policy_ports() {
        let p = PortPolicy::new(vec![(80, 80), (440, 450)]);
        assert!(p.allows_port(80));
        assert!(p.allows_port(443));
        assert!(!p.allows_port(25));
        assert!(!p.rejects_all());
        assert!(PortPolicy::reject_all().rejects_all());
    }

    #[test]
    fn family_exclusion_is_transitive_over_declaration() {
        let mut r = basic_relay(1, 100);
        r.family = vec![IdDigest::new([2; 20]), IdDigest::new([3; 20])];
        let mut set = RelaySet::new();
        set.add_node_and_family(&r);
        assert!(set.contains(&IdDigest::new([1; 20])));
        assert!(set.contains(&IdDigest::new([2; 20])));
        assert!(set.contains(&IdDigest::new([3; 20])));
        assert!(!set.contains(&IdDigest::new([4; 20])));
    }

    #[test]
    fn bandwidth_choice_prefers_heavy_relays() {
        let heavy = basic_relay(1, 1_000_000);
        let light = basic_relay(2, 1);
        let candidates = [&heavy, &light];
        let mut rng = StdRng::seed_from_u64(17);
        let mut heavy_count = 0;
        for _ in 0..100 {
            if choose_by_bandwidth(&candidates[..], &mut rng).unwrap().id() == heavy.id() {
                heavy_count += 1;
            }
        }
        assert!(heavy_count > 95);
    }

    #[test]
    fn bandwidth_choice_zero_weights() {
        let a = basic_relay(1, 0);
        let b = basic_relay(2, 0);
        let mut rng = StdRng::seed_from_u64(5);
        assert!(choose_by_bandwidth(&[&a, &b], &mut rng).is_some());
        assert!(choose_by_bandwidth(&[], &mut rng).is_none());
    }
}
