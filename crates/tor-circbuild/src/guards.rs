//! The entry-guard store, as consumed by the core.
//!
//! Guard selection, rotation, and persistence live outside this
//! crate.  The core needs three things from the store: a guard to put
//! in the entry position, the accounting record for a guard it can
//! mutate, and a change signal so mutations get persisted.

use std::time::SystemTime;

use crate::ids::IdDigest;

/// Path-bias accounting state for one entry guard.
///
/// The counters are floating point so that scaling (multiplicative
/// decay) doesn't truncate small values to zero.  Only the path-bias
/// accountant mutates these fields; everyone else reads.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct GuardRecord {
    /// Identity of the guard.
    pub identity: IdDigest,
    /// Nickname, for log messages.
    pub nickname: Option<String>,

    /// Circuits that reached the attempt-counting point.
    pub circ_attempts: f64,
    /// Circuits that finished building.
    pub circ_successes: f64,
    /// Built circuits that closed cleanly.
    pub successful_circuits_closed: f64,
    /// Built circuits that were closed from the far side before use.
    pub collapsed_circuits: f64,
    /// Circuits we tried to use but could not.
    pub unusable_circuits: f64,
    /// Circuits that hit the build timeout.
    pub timeouts: f64,
    /// Circuits a stream was attached to.
    pub use_attempts: f64,
    /// Circuits that carried at least one successful stream.
    pub use_successes: f64,

    /// Latch: close-success rate fell below the notice threshold.
    pub path_bias_noticed: bool,
    /// Latch: close-success rate fell below the warn threshold.
    pub path_bias_warned: bool,
    /// Latch: close-success rate fell below the extreme threshold.
    pub path_bias_extreme: bool,
    /// Latch: use-success rate fell below the notice threshold.
    pub path_bias_use_noticed: bool,
    /// Latch: use-success rate fell below the extreme threshold.
    pub path_bias_use_extreme: bool,
    /// Latch: the guard has been disabled for extreme bias.
    pub path_bias_disabled: bool,

    /// When the guard was disabled, if it has been.
    pub bad_since: Option<SystemTime>,
}

impl GuardRecord {
    /// Return a fresh record for `identity`.
    pub fn new(identity: IdDigest, nickname: Option<String>) -> Self {
        GuardRecord {
            identity,
            nickname,
            circ_attempts: 0.0,
            circ_successes: 0.0,
            successful_circuits_closed: 0.0,
            collapsed_circuits: 0.0,
            unusable_circuits: 0.0,
            timeouts: 0.0,
            use_attempts: 0.0,
            use_successes: 0.0,
            path_bias_noticed: false,
            path_bias_warned: false,
            path_bias_extreme: false,
            path_bias_use_noticed: false,
            path_bias_use_extreme: false,
            path_bias_disabled: false,
            bad_since: None,
        }
    }

    /// Return a short description of this guard for log messages.
    pub fn describe(&self) -> String {
        match &self.nickname {
            Some(nick) => format!("{} ({})", nick, self.identity),
            None => self.identity.to_string(),
        }
    }
}

/// The entry-guard store.
pub trait GuardStore {
    /// Choose a guard for the entry position of a new circuit,
    /// avoiding everything in `exclude` (the chosen exit and its
    /// family).
    ///
    /// Returns its identity; the caller resolves contact information
    /// through the directory.  Guards disabled by the accountant must
    /// not be returned.
    fn choose_entry(&mut self, exclude: &crate::netdir::RelaySet) -> Option<IdDigest>;

    /// Return the identities of every guard in the store, for
    /// exclusion when picking non-entry positions.
    fn guard_ids(&self) -> Vec<IdDigest>;

    /// Return the accounting record for `id`, if `id` is one of our
    /// guards.
    fn record_mut(&mut self, id: &IdDigest) -> Option<&mut GuardRecord>;

    /// Note that guard records changed and should be persisted.
    fn guards_changed(&mut self);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fresh_record_is_zeroed() {
        let g = GuardRecord::new(IdDigest::new([5; 20]), Some("ferrule".into()));
        assert_eq!(g.circ_attempts, 0.0);
        assert_eq!(g.use_successes, 0.0);
        assert!(!g.path_bias_disabled);
        assert!(g.bad_since.is_none());
        assert!(g.describe().starts_with("ferrule"));
    }
}
