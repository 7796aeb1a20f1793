//! Choosing the relays that make up a circuit.
//!
//! Route length, exit scoring against pending stream demand, entry
//! selection through the guard store, and middle selection under
//! family exclusion all live here.  Weighted random node choice is
//! the directory's capability; this module decides who is eligible.

use rand::RngCore;
use tracing::{debug, info, warn};

use crate::circuit::{OriginCircuit, Purpose};
use crate::config::{CircuitConfig, NetParams};
use crate::extendinfo::ExtendInfo;
use crate::guards::GuardStore;
use crate::netdir::{choose_by_bandwidth, NodeDirectory, NodeSelectionFlags, Relay, RelaySet};
use crate::{Error, Result};

/// Base number of hops in a circuit.
pub const DEFAULT_ROUTE_LEN: usize = 3;

/// Current client demand for exit capability, as known by the stream
/// layer.
///
/// Exit scoring depends on the set of streams pending *right now*;
/// the selector queries this at selection time, never caching it.
pub trait StreamDemand {
    /// Ports of application streams currently waiting for a circuit.
    fn pending_stream_ports(&self) -> Vec<u16>;
    /// Ports we predict we will need soon, based on recent usage.
    fn predicted_ports(&self) -> Vec<u16>;
}

/// Count the relays that are usable for circuit building at all:
/// running, valid, and with a descriptor we hold.
pub(crate) fn count_acceptable_nodes(dir: &dyn NodeDirectory) -> usize {
    dir.relays()
        .iter()
        .filter(|r| r.flags().running && r.flags().valid && r.has_descriptor())
        .count()
}

/// Decide how long a new path should be.
///
/// Three hops, plus one when a pre-specified exit would otherwise
/// reveal something about the destination.  Clamps to the number of
/// acceptable relays; refuses entirely below two.
pub(crate) fn new_route_len(
    purpose: Purpose,
    exit_specified: bool,
    dir: &dyn NodeDirectory,
) -> Option<usize> {
    let mut routelen = DEFAULT_ROUTE_LEN;
    if exit_specified && purpose != Purpose::Testing && purpose != Purpose::SEstablishIntro {
        routelen += 1;
    }
    let num_acceptable = count_acceptable_nodes(dir);
    debug!(
        "Chosen route length {} ({}/{} routers suitable).",
        routelen,
        num_acceptable,
        dir.relays().len()
    );
    if num_acceptable < 2 {
        info!(
            "Not enough acceptable routers ({}). Discarding this circuit.",
            num_acceptable
        );
        return None;
    }
    if num_acceptable < routelen {
        info!(
            "Not enough routers: cutting routelen from {} to {}.",
            routelen, num_acceptable
        );
        routelen = num_acceptable;
    }
    Some(routelen)
}

/// Return the exit-position score for `relay`, or `None` if the relay
/// may not be an exit at all.
///
/// The score is the number of pending streams the relay's declared
/// exit policy could serve.
fn exit_support(
    relay: &Relay,
    pending_ports: &[u16],
    need_uptime: bool,
    need_capacity: bool,
    dir: &dyn NodeDirectory,
    config: &CircuitConfig,
) -> Option<usize> {
    if Some(relay.id()) == dir.self_id() {
        return None;
    }
    if !relay.has_descriptor() {
        return None;
    }
    if !relay.flags().running || relay.flags().bad_exit {
        return None;
    }
    if !relay.flags().general_purpose {
        return None;
    }
    if config.excludes_as_exit(relay.id()) {
        return None;
    }
    if config.outside_exit_restriction(relay.id()) {
        return None;
    }
    if relay.is_unreliable(need_uptime, need_capacity) {
        return None;
    }
    if !(relay.flags().valid || config.allow_invalid.exit) {
        return None;
    }
    if config.exclude_single_hop_relays && relay.flags().allows_single_hop_exits {
        return None;
    }
    if relay.exit_policy_rejects_all() {
        return None;
    }
    Some(
        pending_ports
            .iter()
            .filter(|port| relay.exit_policy().allows_port(**port))
            .count(),
    )
}

/// Return true if `relay` could serve at least one of `ports`.
fn node_handles_some_port(relay: &Relay, ports: &[u16]) -> bool {
    ports.iter().any(|p| relay.exit_policy().allows_port(*p))
}

/// Choose an exit for a general-purpose circuit.
///
/// Scores every candidate by how many currently-pending streams it
/// could serve; among the best-scoring candidates, picks one weighted
/// by bandwidth.  With no positive scores, falls back first to relays
/// that satisfy a predicted port, then to any relay that can exit at
/// all.  If nothing qualifies under uptime/capacity requirements,
/// retries once with those relaxed.
pub(crate) fn choose_good_exit_general<'a>(
    need_uptime: bool,
    need_capacity: bool,
    dir: &'a dyn NodeDirectory,
    demand: &dyn StreamDemand,
    config: &CircuitConfig,
    rng: &mut dyn RngCore,
) -> Option<&'a Relay> {
    let pending = demand.pending_stream_ports();
    let relays = dir.relays();

    let supported: Vec<Option<usize>> = relays
        .iter()
        .map(|r| exit_support(r, &pending, need_uptime, need_capacity, dir, config))
        .collect();

    // `best_support` stays None until some relay could serve a
    // pending stream (or, with no pending streams, until any relay is
    // eligible at all).
    let mut best_support: Option<usize> = None;
    for score in supported.iter().flatten() {
        if !pending.is_empty() && *score == 0 {
            continue;
        }
        best_support = Some(best_support.map_or(*score, |b| b.max(*score)));
    }
    info!(
        "Found exit servers that might support {:?}/{} pending connections.",
        best_support,
        pending.len()
    );

    if let Some(best) = best_support.filter(|b| *b > 0) {
        let candidates: Vec<&Relay> = relays
            .iter()
            .zip(supported.iter())
            .filter(|(_, s)| **s == Some(best))
            .map(|(r, _)| r)
            .collect();
        return choose_by_bandwidth(&candidates, rng);
    }

    if best_support.is_none() {
        if need_uptime || need_capacity {
            info!(
                "We couldn't find any live{}{} routers; falling back to list of all routers.",
                if need_capacity { ", fast" } else { "" },
                if need_uptime { ", stable" } else { "" },
            );
            return choose_good_exit_general(false, false, dir, demand, config, rng);
        }
        warn!("All routers are down or won't exit -- choosing a doomed exit at random.");
    }

    // No relay serves a pending stream.  Try relays that satisfy at
    // least one predicted port; failing that, any eligible relay.
    let needed_ports = demand.predicted_ports();
    for attempt in 0..2 {
        let candidates: Vec<&Relay> = relays
            .iter()
            .zip(supported.iter())
            .filter(|(r, s)| s.is_some() && (attempt == 1 || node_handles_some_port(r, &needed_ports)))
            .map(|(r, _)| r)
            .collect();
        if let Some(choice) = choose_by_bandwidth(&candidates, rng) {
            return Some(choice);
        }
    }
    None
}

/// Merge the configured ExcludeNodes set into `excluded`.
fn add_config_exclusions(excluded: &mut RelaySet, config: &CircuitConfig) {
    for id in &config.exclude_nodes {
        excluded.add_id(*id);
    }
}

/// Choose an exit relay for a circuit of purpose `purpose`.
pub(crate) fn choose_good_exit<'a>(
    purpose: Purpose,
    need_uptime: bool,
    need_capacity: bool,
    is_internal: bool,
    dir: &'a dyn NodeDirectory,
    demand: &dyn StreamDemand,
    config: &CircuitConfig,
    rng: &mut dyn RngCore,
) -> Option<&'a Relay> {
    let mut flags = NodeSelectionFlags {
        need_desc: true,
        need_uptime,
        need_capacity,
        ..Default::default()
    };
    match purpose {
        Purpose::General => {
            if is_internal {
                // No exit traffic will flow; pick it like a middle.
                flags.allow_invalid = config.allow_invalid.middle;
                let mut excluded = RelaySet::new();
                add_config_exclusions(&mut excluded, config);
                dir.choose_random_node(&excluded, flags, rng)
            } else {
                choose_good_exit_general(need_uptime, need_capacity, dir, demand, config, rng)
            }
        }
        Purpose::EstablishRend => {
            flags.allow_invalid = config.allow_invalid.rendezvous;
            let mut excluded = RelaySet::new();
            add_config_exclusions(&mut excluded, config);
            dir.choose_random_node(&excluded, flags, rng)
        }
        _ => {
            warn!("Unhandled purpose {} when picking an exit", purpose);
            None
        }
    }
}

/// Choose an entry relay.
///
/// When entry guards are in use (and the circuit isn't a pure test
/// circuit), the guard store decides; otherwise pick a random node
/// avoiding the exit, current guards, their families, and anything
/// the firewall blocks.
pub(crate) fn choose_good_entry(
    purpose: Purpose,
    state: Option<&crate::circuit::BuildState>,
    dir: &dyn NodeDirectory,
    guards: &mut dyn GuardStore,
    config: &CircuitConfig,
    rng: &mut dyn RngCore,
) -> Option<ExtendInfo> {
    if state.is_some()
        && config.use_entry_guards
        && (purpose != Purpose::Testing || config.bridge_relay)
    {
        let mut exclude = RelaySet::new();
        if let Some(exit) = state.and_then(|s| s.chosen_exit.as_ref()) {
            match dir.by_id(exit.identity()) {
                Some(relay) => exclude.add_node_and_family(relay),
                None => exclude.add_id(*exit.identity()),
            }
        }
        let id = guards.choose_entry(&exclude)?;
        let relay = dir.by_id(&id)?;
        return Some(ExtendInfo::from_relay(relay, !config.server_mode));
    }

    let mut excluded = RelaySet::new();
    add_config_exclusions(&mut excluded, config);
    if let Some(id) = dir.self_id() {
        excluded.add_id(*id);
    }
    if let Some(exit) = state.and_then(|s| s.chosen_exit.as_ref()) {
        match dir.by_id(exit.identity()) {
            Some(relay) => excluded.add_node_and_family(relay),
            None => excluded.add_id(*exit.identity()),
        }
    }
    for relay in dir.relays() {
        if !dir.firewall_permits(relay) {
            excluded.add_id(*relay.id());
        }
    }
    if config.use_entry_guards {
        for id in guards.guard_ids() {
            match dir.by_id(&id) {
                Some(relay) => excluded.add_node_and_family(relay),
                None => excluded.add_id(id),
            }
        }
    }

    let flags = NodeSelectionFlags {
        need_guard: true,
        need_desc: true,
        need_uptime: state.map_or(false, |s| s.need_uptime),
        need_capacity: state.map_or(false, |s| s.need_capacity),
        allow_invalid: config.allow_invalid.entry,
    };
    let relay = dir.choose_random_node(&excluded, flags, rng)?;
    Some(ExtendInfo::from_relay(relay, !config.server_mode))
}

/// Choose a middle relay, excluding the exit, everything already in
/// the cpath, and all their families.
pub(crate) fn choose_good_middle<'a>(
    state: &crate::circuit::BuildState,
    cpath: &crate::cpath::CryptPath,
    dir: &'a dyn NodeDirectory,
    config: &CircuitConfig,
    rng: &mut dyn RngCore,
) -> Option<&'a Relay> {
    debug!("Contemplating intermediate hop: random choice.");
    let mut excluded = RelaySet::new();
    add_config_exclusions(&mut excluded, config);
    if let Some(exit) = state.chosen_exit.as_ref() {
        match dir.by_id(exit.identity()) {
            Some(relay) => excluded.add_node_and_family(relay),
            None => excluded.add_id(*exit.identity()),
        }
    }
    for hop in cpath.iter() {
        match dir.by_id(hop.extend_info().identity()) {
            Some(relay) => excluded.add_node_and_family(relay),
            None => excluded.add_id(*hop.extend_info().identity()),
        }
    }
    let flags = NodeSelectionFlags {
        need_desc: true,
        need_uptime: state.need_uptime,
        need_capacity: state.need_capacity,
        allow_invalid: config.allow_invalid.middle,
        ..Default::default()
    };
    dir.choose_random_node(&excluded, flags, rng)
}

/// Decide the path length for `circ` and settle on an exit, either
/// the one the caller requested or one we choose.
pub(crate) fn onion_pick_cpath_exit(
    circ: &mut OriginCircuit,
    exit: Option<ExtendInfo>,
    dir: &dyn NodeDirectory,
    demand: &dyn StreamDemand,
    config: &CircuitConfig,
    rng: &mut dyn RngCore,
) -> Result<()> {
    if circ.build_state.onehop_tunnel {
        debug!("Launching a one-hop circuit for dir tunnel.");
        circ.build_state.desired_path_len = 1;
    } else {
        let len = new_route_len(circ.purpose, exit.is_some(), dir)
            .ok_or(Error::NoPath("not enough acceptable relays"))?;
        circ.build_state.desired_path_len = len;
    }

    let chosen = match exit {
        Some(exit) => {
            warn_if_exit_excluded(config, &exit);
            info!("Using requested exit node '{}'", exit.describe());
            exit
        }
        None => {
            let relay = choose_good_exit(
                circ.purpose,
                circ.build_state.need_uptime,
                circ.build_state.need_capacity,
                circ.build_state.is_internal,
                dir,
                demand,
                config,
                rng,
            )
            .ok_or(Error::NoPath("failed to choose an exit server"))?;
            ExtendInfo::from_relay(relay, false)
        }
    };
    circ.build_state.chosen_exit = Some(chosen);
    Ok(())
}

/// Warn when the caller hands us an exit the configuration excludes.
/// We honor the request anyway; refusal is the caller's decision.
fn warn_if_exit_excluded(config: &CircuitConfig, exit: &ExtendInfo) {
    if config.excludes_as_exit(exit.identity()) {
        warn!(
            "Using requested exit '{}' which is listed in ExcludeNodes or ExcludeExitNodes, \
             because no better options were available.",
            exit.describe()
        );
    }
}

/// Choose and append the next hop of `circ`'s cpath.
///
/// Returns `Ok(true)` when the path is complete.
pub(crate) fn onion_extend_cpath(
    circ: &mut OriginCircuit,
    dir: &dyn NodeDirectory,
    guards: &mut dyn GuardStore,
    config: &CircuitConfig,
    params: &NetParams,
    rng: &mut dyn RngCore,
) -> Result<bool> {
    let cur_len = circ.cpath.len();
    let desired = circ.build_state.desired_path_len;
    if cur_len >= desired {
        debug!("Path is complete: {} steps long", desired);
        return Ok(true);
    }
    debug!("Path is {} long; we want {}", cur_len, desired);

    let info = if cur_len == desired - 1 {
        circ.build_state.chosen_exit.clone()
    } else if cur_len == 0 {
        choose_good_entry(
            circ.purpose,
            Some(&circ.build_state),
            dir,
            guards,
            config,
            rng,
        )
    } else {
        choose_good_middle(&circ.build_state, &circ.cpath, dir, config, rng)
            .map(|r| ExtendInfo::from_relay(r, false))
    };

    let info = info.ok_or_else(|| {
        warn!(
            "Failed to find node for hop {} of our path. Discarding this circuit.",
            cur_len
        );
        Error::NoPath("no suitable relay for hop")
    })?;
    debug!("Chose router {} for hop {}", info.describe(), cur_len + 1);
    circ.cpath.append_hop(info, params.circwindow());
    Ok(false)
}

/// Fill in the whole cpath for `circ`.
pub(crate) fn onion_populate_cpath(
    circ: &mut OriginCircuit,
    dir: &dyn NodeDirectory,
    guards: &mut dyn GuardStore,
    config: &CircuitConfig,
    params: &NetParams,
    rng: &mut dyn RngCore,
) -> Result<()> {
    loop {
        if onion_extend_cpath(circ, dir, guards, config, params, rng)? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::circuit::{CircuitFlags, OriginCircuit};
    use crate::ids::{GlobalId, IdDigest};
    use crate::mocks::{MockDemand, MockDir, MockGuards};
    use crate::netdir::PortPolicy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(2718)
    }

    #[test]
    fn route_len_rules() {
        let dir = MockDir::with_relays(10);
        assert_eq!(new_route_len(Purpose::General, false, &dir), Some(3));
        assert_eq!(new_route_len(Purpose::General, true, &dir), Some(4));
        // Purposes that don't add a hop for a specified exit.
        assert_eq!(new_route_len(Purpose::Testing, true, &dir), Some(3));
        assert_eq!(new_route_len(Purpose::SEstablishIntro, true, &dir), Some(3));

        // Clamp to the acceptable count.
        let dir = MockDir::with_relays(3);
        assert_eq!(new_route_len(Purpose::General, true, &dir), Some(3));
        let dir = MockDir::with_relays(2);
        assert_eq!(new_route_len(Purpose::General, false, &dir), Some(2));
        // Refuse below two.
        let dir = MockDir::with_relays(1);
        assert_eq!(new_route_len(Purpose::General, false, &dir), None);
    }

    #[test]
    fn route_len_counts_only_acceptable() {
        let mut dir = MockDir::with_relays(5);
        for r in dir.relays_mut().iter_mut().take(4) {
            r.test_set_running(false);
        }
        assert_eq!(new_route_len(Purpose::General, false, &dir), None);
    }

    #[test]
    fn exit_scoring_prefers_stream_support() {
        let mut dir = MockDir::with_relays(6);
        // Only relay 3 serves port 443.
        for (i, r) in dir.relays_mut().iter_mut().enumerate() {
            r.test_set_exit_policy(if i == 3 {
                PortPolicy::new(vec![(443, 443)])
            } else {
                PortPolicy::new(vec![(80, 80)])
            });
        }
        let demand = MockDemand::new(vec![443], vec![]);
        let cfg = CircuitConfig::default();
        let mut r = rng();
        for _ in 0..8 {
            let exit =
                choose_good_exit_general(false, false, &dir, &demand, &cfg, &mut r).unwrap();
            assert_eq!(exit.id(), &IdDigest::new([3; 20]));
        }
    }

    #[test]
    fn exit_falls_back_to_predicted_ports() {
        let mut dir = MockDir::with_relays(4);
        for (i, r) in dir.relays_mut().iter_mut().enumerate() {
            r.test_set_exit_policy(if i == 2 {
                PortPolicy::new(vec![(6667, 6667)])
            } else {
                PortPolicy::new(vec![(80, 80)])
            });
        }
        // No streams pending; 6667 predicted.
        let demand = MockDemand::new(vec![], vec![6667]);
        let cfg = CircuitConfig::default();
        let mut r = rng();
        for _ in 0..8 {
            let exit =
                choose_good_exit_general(false, false, &dir, &demand, &cfg, &mut r).unwrap();
            assert_eq!(exit.id(), &IdDigest::new([2; 20]));
        }
    }

    #[test]
    fn exit_relaxes_uptime_and_capacity_once() {
        let mut dir = MockDir::with_relays(3);
        for r in dir.relays_mut() {
            r.test_set_stable(false);
        }
        let demand = MockDemand::new(vec![80], vec![]);
        let cfg = CircuitConfig::default();
        let mut r = rng();
        // All relays fail the stability requirement; the retry with
        // relaxed flags must still find one.
        let exit = choose_good_exit_general(true, false, &dir, &demand, &cfg, &mut r);
        assert!(exit.is_some());
    }

    #[test]
    fn exit_honors_exclusions() {
        let mut dir = MockDir::with_relays(4);
        dir.relays_mut()[1].test_set_bad_exit(true);
        let mut cfg = CircuitConfig::default();
        cfg.exclude_exit_nodes.insert(IdDigest::new([2; 20]));
        cfg.exclude_nodes.insert(IdDigest::new([3; 20]));
        let demand = MockDemand::new(vec![80], vec![]);
        let mut r = rng();
        for _ in 0..16 {
            let exit = choose_good_exit_general(false, false, &dir, &demand, &cfg, &mut r).unwrap();
            // Relay 0 is the only one neither flagged nor excluded.
            assert_eq!(exit.id(), &IdDigest::new([0; 20]));
        }
    }

    #[test]
    fn exit_nodes_restriction() {
        let dir = MockDir::with_relays(5);
        let mut cfg = CircuitConfig::default();
        cfg.exit_nodes = Some([IdDigest::new([4; 20])].into_iter().collect());
        let demand = MockDemand::new(vec![80], vec![]);
        let mut r = rng();
        let exit = choose_good_exit_general(false, false, &dir, &demand, &cfg, &mut r).unwrap();
        assert_eq!(exit.id(), &IdDigest::new([4; 20]));
    }

    #[test]
    fn entry_comes_from_guard_store() {
        let dir = MockDir::with_relays(5);
        let mut guards = MockGuards::with_guard(IdDigest::new([2; 20]));
        let cfg = CircuitConfig::default();
        let mut r = rng();
        let circ = OriginCircuit::new(GlobalId(1), Purpose::General, &CircuitFlags::default());
        let entry = choose_good_entry(
            Purpose::General,
            Some(&circ.build_state),
            &dir,
            &mut guards,
            &cfg,
            &mut r,
        )
        .unwrap();
        assert_eq!(entry.identity(), &IdDigest::new([2; 20]));
    }

    #[test]
    fn entry_without_guards_avoids_exit_family_and_guards() {
        let mut dir = MockDir::with_relays(6);
        // Relay 1 declares relay 0 as family.
        let fam = vec![IdDigest::new([0; 20])];
        dir.relays_mut()[1].test_set_family(fam);
        let mut guards = MockGuards::with_guard(IdDigest::new([5; 20]));
        let mut cfg = CircuitConfig::default();
        cfg.use_entry_guards = false;
        let mut r = rng();
        let mut circ = OriginCircuit::new(GlobalId(1), Purpose::General, &CircuitFlags::default());
        circ.build_state.chosen_exit = Some(ExtendInfo::from_relay(&dir.relays()[1], false));
        for _ in 0..32 {
            let entry = choose_good_entry(
                Purpose::General,
                Some(&circ.build_state),
                &dir,
                &mut guards,
                &cfg,
                &mut r,
            )
            .unwrap();
            // Not the exit (1), not its family (0).
            assert_ne!(entry.identity(), &IdDigest::new([1; 20]));
            assert_ne!(entry.identity(), &IdDigest::new([0; 20]));
        }
    }

    #[test]
    fn middle_avoids_exit_and_cpath() {
        let dir = MockDir::with_relays(5);
        let cfg = CircuitConfig::default();
        let mut r = rng();
        let mut circ = OriginCircuit::new(GlobalId(1), Purpose::General, &CircuitFlags::default());
        circ.build_state.desired_path_len = 3;
        circ.build_state.chosen_exit = Some(ExtendInfo::from_relay(&dir.relays()[4], false));
        circ.cpath.append_hop(
            ExtendInfo::from_relay(&dir.relays()[0], true),
            crate::cpath::CIRCWINDOW_START,
        );
        for _ in 0..32 {
            let mid = choose_good_middle(&circ.build_state, &circ.cpath, &dir, &cfg, &mut r)
                .unwrap();
            assert_ne!(mid.id(), &IdDigest::new([4; 20]));
            assert_ne!(mid.id(), &IdDigest::new([0; 20]));
        }
    }

    #[test]
    fn populate_cpath_builds_distinct_three_hops() {
        let mut dir = MockDir::with_relays(10);
        // Keep the one configured guard out of the exit position.
        dir.relays_mut()[7].test_set_exit_policy(PortPolicy::reject_all());
        let mut guards = MockGuards::with_guard(IdDigest::new([7; 20]));
        let cfg = CircuitConfig::default();
        let params = NetParams::new();
        let demand = MockDemand::new(vec![80], vec![]);
        let mut r = rng();
        let mut circ = OriginCircuit::new(GlobalId(1), Purpose::General, &CircuitFlags::default());
        onion_pick_cpath_exit(&mut circ, None, &dir, &demand, &cfg, &mut r).unwrap();
        onion_populate_cpath(&mut circ, &dir, &mut guards, &cfg, &params, &mut r).unwrap();
        assert_eq!(circ.cpath.len(), 3);
        let ids: Vec<_> = circ
            .cpath
            .iter()
            .map(|h| *h.extend_info().identity())
            .collect();
        assert_eq!(ids[0], IdDigest::new([7; 20]));
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn onehop_tunnel_path_is_one_hop() {
        let dir = MockDir::with_relays(5);
        let demand = MockDemand::new(vec![], vec![]);
        let cfg = CircuitConfig::default();
        let mut r = rng();
        let mut circ = OriginCircuit::new(
            GlobalId(1),
            Purpose::General,
            &CircuitFlags {
                onehop_tunnel: true,
                ..Default::default()
            },
        );
        let exit = ExtendInfo::from_relay(&dir.relays()[1], true);
        onion_pick_cpath_exit(&mut circ, Some(exit), &dir, &demand, &cfg, &mut r).unwrap();
        assert_eq!(circ.build_state.desired_path_len, 1);
    }
}
