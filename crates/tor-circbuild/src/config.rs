//! Configuration for the circuit construction core.
//!
//! [`CircuitConfig`] carries the operator-settable options the core
//! reads; [`NetParams`] carries the consensus parameters, with their
//! documented defaults and clamps.  Both are handed to
//! [`CircuitCore`](crate::mgr::CircuitCore) by the embedding
//! application, which owns option loading and reloading.

use std::collections::{HashMap, HashSet};

use derive_builder::Builder;
use serde::Deserialize;

use crate::ids::IdDigest;

/// Which kinds of position may use relays without the Valid flag.
#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct AllowInvalid {
    /// Permit invalid relays in the entry position.
    pub entry: bool,
    /// Permit invalid relays in the middle position.
    pub middle: bool,
    /// Permit invalid relays in the exit position.
    pub exit: bool,
    /// Permit invalid relays as rendezvous points.
    pub rendezvous: bool,
}

/// Operator overrides for the path-bias thresholds.
///
/// Each `None` means "use the consensus parameter, or its default".
/// Rates are percentages.
#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct PathBiasOverrides {
    /// Minimum circuit attempts before close-rate checks run.
    pub circ_threshold: Option<i32>,
    /// Close-success notice rate, in percent.
    pub notice_rate: Option<i32>,
    /// Close-success warn rate, in percent.
    pub warn_rate: Option<i32>,
    /// Close-success extreme rate, in percent.
    pub extreme_rate: Option<i32>,
    /// Scale the close counters past this many attempts.
    pub scale_threshold: Option<i32>,
    /// Disable guards whose rates go extreme.
    pub drop_guards: Option<bool>,
    /// Minimum use attempts before use-rate checks run.
    pub use_threshold: Option<i32>,
    /// Use-success notice rate, in percent.
    pub notice_use_rate: Option<i32>,
    /// Use-success extreme rate, in percent.
    pub extreme_use_rate: Option<i32>,
    /// Scale the use counters past this many attempts.
    pub scale_use_threshold: Option<i32>,
}

/// Default set of long-lived ports: streams to these prefer
/// high-uptime circuits.
fn long_lived_ports_default() -> Vec<u16> {
    vec![21, 22, 706, 1863, 5050, 5190, 5222, 5223, 6523, 6667, 6697, 8300]
}

/// Configuration read by the circuit construction core.
///
/// This type is immutable once constructed; build one with
/// [`CircuitConfigBuilder`] or deserialize it.
#[derive(Debug, Clone, Builder, Deserialize, Eq, PartialEq)]
#[builder(derive(Debug))]
#[serde(default)]
#[allow(clippy::exhaustive_structs)]
pub struct CircuitConfig {
    /// Use persistent entry guards for the first hop.  Without them
    /// the path-bias accountant has nothing to account against.
    #[builder(default = "true")]
    pub use_entry_guards: bool,

    /// Prefer CREATE_FAST for the first hop of a circuit even when
    /// we know the relay's onion key.
    #[builder(default = "true")]
    pub fast_first_hop_pk: bool,

    /// Use the ntor handshake: `Some(true)`/`Some(false)` to force,
    /// `None` to follow the consensus parameter.
    #[builder(default)]
    pub use_ntor_handshake: Option<bool>,

    /// As a relay: honor extend cells pointing at RFC1918 space.
    /// Only test networks want this.
    #[builder(default = "false")]
    pub extend_allow_private_addresses: bool,

    /// Refuse to use relays that allow single-hop exits.
    #[builder(default = "true")]
    pub exclude_single_hop_relays: bool,

    /// True if we are running as a public relay.
    #[builder(default = "false")]
    pub server_mode: bool,

    /// True if we are running as a bridge.
    #[builder(default = "false")]
    pub bridge_relay: bool,

    /// Never use these relays anywhere in a circuit.
    #[builder(default)]
    pub exclude_nodes: HashSet<IdDigest>,

    /// Never use these relays in the exit position.  (Applied in
    /// union with `exclude_nodes`.)
    #[builder(default)]
    pub exclude_exit_nodes: HashSet<IdDigest>,

    /// When set, only these relays may be used as exits.
    #[builder(default)]
    pub exit_nodes: Option<HashSet<IdDigest>>,

    /// Which positions may use not-Valid relays.
    #[builder(default)]
    pub allow_invalid: AllowInvalid,

    /// Ports whose streams want high-uptime circuits.
    #[builder(default = "long_lived_ports_default()")]
    pub long_lived_ports: Vec<u16>,

    /// How long a circuit that has carried traffic may keep accepting
    /// new streams, in seconds.
    #[builder(default = "600")]
    pub max_circuit_dirtiness_secs: u64,

    /// Operator overrides for the path-bias accountant.
    #[builder(default)]
    pub path_bias: PathBiasOverrides,
}

impl CircuitConfig {
    /// Return a new [`CircuitConfigBuilder`].
    pub fn builder() -> CircuitConfigBuilder {
        CircuitConfigBuilder::default()
    }

    /// Return true if `id` is excluded from the exit position.
    pub(crate) fn excludes_as_exit(&self, id: &IdDigest) -> bool {
        self.exclude_nodes.contains(id) || self.exclude_exit_nodes.contains(id)
    }

    /// Return true if `id` is outside a configured ExitNodes
    /// restriction.
    pub(crate) fn outside_exit_restriction(&self, id: &IdDigest) -> bool {
        match &self.exit_nodes {
            Some(set) => !set.contains(id),
            None => false,
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfigBuilder::default()
            .build()
            .expect("unusable hardwired defaults")
    }
}

/// Consensus parameters, as delivered by the directory layer.
///
/// Unknown parameters fall back to their documented defaults; every
/// lookup clamps to the legal range the way the consensus code does.
#[derive(Debug, Clone, Default)]
pub struct NetParams {
    /// The raw parameter assignments.
    params: HashMap<String, i32>,
}

impl NetParams {
    /// Construct an empty parameter set (all defaults).
    pub fn new() -> Self {
        NetParams::default()
    }
    /// Set one parameter.
    pub fn set(&mut self, name: &str, value: i32) -> &mut Self {
        self.params.insert(name.to_owned(), value);
        self
    }
    /// Look up `name`, with a default and clamping range.
    pub fn get(&self, name: &str, default: i32, min: i32, max: i32) -> i32 {
        debug_assert!(min <= max);
        match self.params.get(name) {
            Some(v) => (*v).clamp(min, max),
            None => default,
        }
    }
    /// The initial circuit flow-control window.
    pub fn circwindow(&self) -> i32 {
        self.get("circwindow", crate::cpath::CIRCWINDOW_START, 100, 1000)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let cfg = CircuitConfig::default();
        assert!(cfg.use_entry_guards);
        assert!(cfg.fast_first_hop_pk);
        assert_eq!(cfg.use_ntor_handshake, None);
        assert!(!cfg.extend_allow_private_addresses);
        assert!(cfg.exclude_nodes.is_empty());
        assert!(cfg.exit_nodes.is_none());
        assert!(cfg.long_lived_ports.contains(&6667));
    }

    #[test]
    fn exit_restrictions() {
        let mut cfg = CircuitConfig::default();
        let a = IdDigest::new([1; 20]);
        let b = IdDigest::new([2; 20]);
        cfg.exclude_exit_nodes.insert(a);
        assert!(cfg.excludes_as_exit(&a));
        assert!(!cfg.excludes_as_exit(&b));
        assert!(!cfg.outside_exit_restriction(&b));
        cfg.exit_nodes = Some([b].into_iter().collect());
        assert!(cfg.outside_exit_restriction(&a));
        assert!(!cfg.outside_exit_restriction(&b));
    }

    #[test]
    fn netparams_clamp_and_default() {
        let mut np = NetParams::new();
        assert_eq!(np.get("pb_mincircs", 150, 5, i32::MAX), 150);
        np.set("pb_mincircs", 2);
        assert_eq!(np.get("pb_mincircs", 150, 5, i32::MAX), 5);
        np.set("pb_mincircs", 500);
        assert_eq!(np.get("pb_mincircs", 150, 5, i32::MAX), 500);
        assert_eq!(np.circwindow(), 1000);
        np.set("circwindow", 5000);
        assert_eq!(np.circwindow(), 1000);
        np.set("circwindow", 500);
        assert_eq!(np.circwindow(), 500);
    }

    #[test]
    fn deserialize_partial() {
        let cfg: CircuitConfig = serde_json::from_str(
            r#"{ "use_entry_guards": false, "path_bias": { "drop_guards": true } }"#,
        )
        .unwrap();
        assert!(!cfg.use_entry_guards);
        assert_eq!(cfg.path_bias.drop_guards, Some(true));
        assert!(cfg.fast_first_hop_pk);
    }
}
