//! The path-bias accountant.
//!
//! An adversarial entry guard can try to shepherd a client onto paths
//! it controls by failing every circuit whose later hops it dislikes.
//! The accountant keeps per-guard histories of circuit attempts,
//! successes, uses, and closes, and raises (latched) alerts when a
//! guard's success rates fall below the configured thresholds.
//!
//! Counting points are deliberate: a circuit becomes an "attempt"
//! only once its second hop is waiting for keys (the earliest moment
//! an adversary could end-to-end tag it), and use successes are not
//! credited until close, so that a stream failure can still roll the
//! circuit back into the probed-at-close pool.

use std::collections::HashMap;
use std::time::{Instant, SystemTime};

use rand::rngs::StdRng;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::cells::{
    BeginMsg, Body, EndReason, RelayCmd, RelayHeader, CELL_PAYLOAD_SIZE, RELAY_HEADER_SIZE,
};
use crate::chan::{ChanMsg, ChanProvider, ChannelCloseReason, ChannelState};
use crate::circuit::{CircState, OriginCircuit, PathState, Purpose, ShouldCount};
use crate::config::{CircuitConfig, NetParams};
use crate::cpath::HopState;
use crate::crypto::cellcrypt::RelayCellBody;
use crate::err::{CloseKind, CloseReason};
use crate::guards::{GuardRecord, GuardStore};
use crate::ids::{GlobalId, IdDigest};

/// Everything the accountant needs from the rest of the core.
///
/// The circuit being operated on is never inside `circuits`; the
/// caller removes it from the table first.
pub(crate) struct PathBiasCtx<'a> {
    /// The operator configuration.
    pub(crate) config: &'a CircuitConfig,
    /// The consensus parameters.
    pub(crate) params: &'a NetParams,
    /// The guard store whose records we mutate.
    pub(crate) guards: &'a mut dyn GuardStore,
    /// Every *other* live circuit, for benefit-of-the-doubt counts.
    pub(crate) circuits: &'a mut HashMap<GlobalId, OriginCircuit>,
    /// The channel layer, for sending probes.
    pub(crate) chans: &'a mut dyn ChanProvider,
    /// Randomness for probe nonces.
    pub(crate) rng: &'a mut StdRng,
    /// The current monotonic time.
    pub(crate) now: Instant,
    /// The current wall-clock time (guard `bad_since` stamps).
    pub(crate) wallclock: SystemTime,
    /// The current build-timeout cutoff, for log messages.
    pub(crate) close_ms: u64,
}

/// The path-bias thresholds, resolved from operator overrides and
/// consensus parameters.
///
/// All rates are fractions in `[0, 1]`; comparisons against them are
/// strict, so that a zero threshold disables the check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PathBiasParams {
    /// Minimum circuit attempts before close-rate checks run.
    pub(crate) min_circs: f64,
    /// Close-success rate below which we log a notice.
    pub(crate) notice_rate: f64,
    /// Close-success rate below which we log a warning.
    pub(crate) warn_rate: f64,
    /// Close-success rate below which the bias is extreme.
    pub(crate) extreme_rate: f64,
    /// Scale close counters past this many attempts.
    pub(crate) scale_threshold: f64,
    /// Disable guards whose rates go extreme.
    pub(crate) drop_guards: bool,
    /// Minimum use attempts before use-rate checks run.
    pub(crate) min_use: f64,
    /// Use-success rate below which we log a notice.
    pub(crate) notice_use_rate: f64,
    /// Use-success rate below which the bias is extreme.
    pub(crate) extreme_use_rate: f64,
    /// Scale use counters past this many attempts.
    pub(crate) scale_use_threshold: f64,
    /// Multiplicative decay applied when scaling; in `(0, 1]`.
    pub(crate) scale_ratio: f64,
}

impl PathBiasParams {
    /// Resolve thresholds: an operator override wins when set (with
    /// the same sanity clamps the consensus values get), otherwise
    /// the consensus parameter, otherwise its default.
    pub(crate) fn resolve(config: &CircuitConfig, np: &NetParams) -> Self {
        let ov = &config.path_bias;
        let int = |ov: Option<i32>, name: &str, default: i32, min: i32| -> f64 {
            let v = match ov {
                Some(v) => v.max(min),
                None => np.get(name, default, min, i32::MAX),
            };
            f64::from(v)
        };
        let rate = |ov: Option<i32>, name: &str, default: i32| -> f64 {
            let v = match ov {
                Some(v) => v.clamp(0, 100),
                None => np.get(name, default, 0, 100),
            };
            f64::from(v) / 100.0
        };
        let scale_factor = np.get("pb_scalefactor", 2, 1, i32::MAX);
        let mult_factor = np.get("pb_multfactor", 1, 1, scale_factor);
        let scale_ratio = f64::from(mult_factor) / f64::from(scale_factor);
        debug_assert!(scale_ratio > 0.0 && scale_ratio <= 1.0);
        PathBiasParams {
            min_circs: int(ov.circ_threshold, "pb_mincircs", 150, 5),
            notice_rate: rate(ov.notice_rate, "pb_noticepct", 70),
            warn_rate: rate(ov.warn_rate, "pb_warnpct", 50),
            extreme_rate: rate(ov.extreme_rate, "pb_extremepct", 30),
            scale_threshold: int(ov.scale_threshold, "pb_scalecircs", 300, 10),
            drop_guards: ov
                .drop_guards
                .unwrap_or_else(|| np.get("pb_dropguards", 0, 0, 1) == 1),
            min_use: int(ov.use_threshold, "pb_minuse", 20, 3),
            notice_use_rate: rate(ov.notice_use_rate, "pb_noticeusepct", 80),
            extreme_use_rate: rate(ov.extreme_use_rate, "pb_extremeusepct", 60),
            scale_use_threshold: int(ov.scale_use_threshold, "pb_scaleuse", 100, 10),
            scale_ratio,
        }
    }
}

/// What the close path should do next.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum CloseDecision {
    /// Accounting is done; tear the circuit down.
    Done,
    /// An end-of-life probe went out; defer the close until the
    /// probe resolves or times out.
    DeferForProbe,
}

/// Decide whether `circ` participates in path-bias accounting,
/// caching the decision on the circuit.
///
/// A cached decision that would flip is a bug indicator (it means a
/// purpose change moved the circuit across the counting boundary),
/// so we log it.
pub(crate) fn should_count(circ: &mut OriginCircuit, config: &CircuitConfig) -> bool {
    let ignored_purpose = matches!(
        circ.purpose,
        Purpose::Testing | Purpose::Controller | Purpose::SConnectRend | Purpose::SRendJoined
    ) || circ.purpose.is_client_intro();

    if !config.use_entry_guards || ignored_purpose {
        if circ.pathbias_shouldcount == ShouldCount::Counted
            && circ.path_state != PathState::AlreadyCounted
        {
            info!(
                "Bug: {} is now being ignored despite being counted in the past. \
                 Purpose is {}, path state is {}",
                circ.global_id, circ.purpose, circ.path_state
            );
        }
        circ.pathbias_shouldcount = ShouldCount::Ignored;
        return false;
    }

    if circ.build_state.onehop_tunnel || circ.build_state.desired_path_len == 1 {
        if !(circ.build_state.desired_path_len == 1 && circ.build_state.onehop_tunnel) {
            info!(
                "Bug: one-hop circuit has length {}. Path state is {}.",
                circ.build_state.desired_path_len, circ.path_state
            );
        }
        if circ.pathbias_shouldcount == ShouldCount::Counted {
            info!(
                "Bug: one-hop circuit {} is now being ignored despite being counted \
                 in the past. Purpose is {}, path state is {}",
                circ.global_id, circ.purpose, circ.path_state
            );
        }
        circ.pathbias_shouldcount = ShouldCount::Ignored;
        return false;
    }

    if circ.pathbias_shouldcount == ShouldCount::Ignored {
        info!(
            "Bug: {} is now being counted despite being ignored in the past. \
             Purpose is {}, path state is {}",
            circ.global_id, circ.purpose, circ.path_state
        );
    }
    circ.pathbias_shouldcount = ShouldCount::Counted;
    true
}

/// Count the live circuits through `guard` whose path state lies in
/// `[from, to]` (inclusive).  Open circuits get the benefit of the
/// doubt in success-rate computations.
fn count_circs_in_states(
    circuits: &mut HashMap<GlobalId, OriginCircuit>,
    config: &CircuitConfig,
    guard: &IdDigest,
    from: PathState,
    to: PathState,
) -> usize {
    let mut open_circuits = 0;
    for circ in circuits.values_mut() {
        if circ.state == CircState::MarkedForClose {
            continue;
        }
        let Some(hop) = circ.cpath.hop(0.into()) else {
            continue;
        };
        let hop_id = *hop.extend_info().identity();
        if circ.path_state >= from
            && circ.path_state <= to
            && should_count(circ, config)
            && hop_id == *guard
        {
            debug!(
                "Found opened circuit {} in path_state {}",
                circ.global_id, circ.path_state
            );
            open_circuits += 1;
        }
    }
    open_circuits
}

/// The guard's close-success count, including currently-open built
/// circuits.
fn close_success_count(guard: &GuardRecord, open_built: f64) -> f64 {
    guard.successful_circuits_closed + open_built
}

/// The guard's use-success count, including circuits currently being
/// used.
fn use_success_count(guard: &GuardRecord, open_in_use: f64) -> f64 {
    guard.use_successes + open_in_use
}

/// Counts of in-flight circuits through one guard, taken before a
/// counter mutation so that rate checks and scaling can give them the
/// benefit of the doubt.
struct OpenCounts {
    /// Circuits in `BuildAttempted`.
    attempted: f64,
    /// Circuits in `[BuildSucceeded, UseFailed]`.
    built: f64,
    /// Circuits in `[BuildSucceeded, UseSucceeded]`.
    closeable: f64,
    /// Circuits in `[UseAttempted, UseSucceeded]`.
    in_use: f64,
}

/// Take a snapshot of the open-circuit counts for `guard`.
fn open_counts(ctx: &mut PathBiasCtx<'_>, guard: &IdDigest) -> OpenCounts {
    let attempted = count_circs_in_states(
        ctx.circuits,
        ctx.config,
        guard,
        PathState::BuildAttempted,
        PathState::BuildAttempted,
    ) as f64;
    let built = count_circs_in_states(
        ctx.circuits,
        ctx.config,
        guard,
        PathState::BuildSucceeded,
        PathState::UseFailed,
    ) as f64;
    let closeable = count_circs_in_states(
        ctx.circuits,
        ctx.config,
        guard,
        PathState::BuildSucceeded,
        PathState::UseSucceeded,
    ) as f64;
    let in_use = count_circs_in_states(
        ctx.circuits,
        ctx.config,
        guard,
        PathState::UseAttempted,
        PathState::UseSucceeded,
    ) as f64;
    OpenCounts {
        attempted,
        built,
        closeable,
        in_use,
    }
}

/// Format the standard set of guard counters for alert messages.
fn rate_summary(guard: &GuardRecord, open: &OpenCounts, close_ms: u64) -> String {
    format!(
        "Use counts are {:.0}/{:.0}. Success counts are {:.0}/{:.0}. \
         {:.0} circuits completed, {:.0} were unusable, {:.0} collapsed, \
         and {:.0} timed out. For reference, your timeout cutoff is {} seconds.",
        use_success_count(guard, open.in_use).round(),
        guard.use_attempts.round(),
        close_success_count(guard, open.closeable).round(),
        guard.circ_attempts.round(),
        guard.circ_successes.round(),
        guard.unusable_circuits.round(),
        guard.collapsed_circuits.round(),
        guard.timeouts.round(),
        close_ms / 1000,
    )
}

/// Check a guard's close-success rate against the thresholds,
/// latching alerts (and optionally disabling the guard).
fn measure_close_rate(
    guard: &mut GuardRecord,
    open: &OpenCounts,
    p: &PathBiasParams,
    wallclock: SystemTime,
    close_ms: u64,
) -> bool {
    if guard.circ_attempts <= p.min_circs {
        return false;
    }
    // Strict '<' so that a zero rate disables the check entirely.
    let rate = close_success_count(guard, open.closeable) / guard.circ_attempts;
    if rate < p.extreme_rate {
        if p.drop_guards {
            if !guard.path_bias_disabled {
                warn!(
                    "Your Guard {} is failing an extremely large amount of circuits. \
                     To avoid potential route manipulation attacks, use of this guard \
                     has been disabled. {}",
                    guard.describe(),
                    rate_summary(guard, open, close_ms),
                );
                guard.path_bias_disabled = true;
                guard.bad_since = Some(wallclock);
                return true;
            }
        } else if !guard.path_bias_extreme {
            guard.path_bias_extreme = true;
            warn!(
                "Your Guard {} is failing an extremely large amount of circuits. \
                 This could indicate a route manipulation attack, extreme network \
                 overload, or a bug. {}",
                guard.describe(),
                rate_summary(guard, open, close_ms),
            );
        }
    } else if rate < p.warn_rate {
        if !guard.path_bias_warned {
            guard.path_bias_warned = true;
            warn!(
                "Your Guard {} is failing a very large amount of circuits. \
                 Most likely this means the network is overloaded, but it could \
                 also mean an attack against you or potentially the guard itself. {}",
                guard.describe(),
                rate_summary(guard, open, close_ms),
            );
        }
    } else if rate < p.notice_rate && !guard.path_bias_noticed {
        guard.path_bias_noticed = true;
        info!(
            "Your Guard {} is failing more circuits than usual. \
             Most likely this means the network is overloaded. {}",
            guard.describe(),
            rate_summary(guard, open, close_ms),
        );
    }
    false
}

/// Check a guard's use-success rate against the thresholds, latching
/// alerts (and optionally disabling the guard).
fn measure_use_rate(
    guard: &mut GuardRecord,
    open: &OpenCounts,
    p: &PathBiasParams,
    wallclock: SystemTime,
    close_ms: u64,
) -> bool {
    if guard.use_attempts <= p.min_use {
        return false;
    }
    // Strict '<', as above.
    let rate = use_success_count(guard, open.in_use) / guard.use_attempts;
    if rate < p.extreme_use_rate {
        if p.drop_guards {
            if !guard.path_bias_disabled {
                warn!(
                    "Your Guard {} is failing to carry an extremely large amount of \
                     streams on its circuits. To avoid potential route manipulation \
                     attacks, use of this guard has been disabled. {}",
                    guard.describe(),
                    rate_summary(guard, open, close_ms),
                );
                guard.path_bias_disabled = true;
                guard.bad_since = Some(wallclock);
                return true;
            }
        } else if !guard.path_bias_use_extreme {
            guard.path_bias_use_extreme = true;
            warn!(
                "Your Guard {} is failing to carry an extremely large amount of \
                 streams on its circuits. This could indicate a route manipulation \
                 attack, network overload, bad local network connectivity, or a bug. {}",
                guard.describe(),
                rate_summary(guard, open, close_ms),
            );
        }
    } else if rate < p.notice_use_rate && !guard.path_bias_use_noticed {
        guard.path_bias_use_noticed = true;
        info!(
            "Your Guard {} is failing to carry more streams on its circuits than \
             usual. Most likely this means the network is overloaded or your \
             network connection is poor. {}",
            guard.describe(),
            rate_summary(guard, open, close_ms),
        );
    }
    false
}

/// Multiplicatively decay a guard's close counters once enough
/// attempts accumulate, leaving in-flight circuits undecayed.
fn scale_close_rates(guard: &mut GuardRecord, open: &OpenCounts, p: &PathBiasParams) -> bool {
    if guard.circ_attempts <= p.scale_threshold {
        return false;
    }
    let opened_attempts = open.attempted;
    let opened_built = open.built;
    let counts_are_sane = guard.circ_attempts >= guard.circ_successes;

    // Decay only closed history: take the open circuits out, scale,
    // and put them back.
    guard.circ_attempts -= opened_attempts + opened_built;
    guard.circ_successes -= opened_built;

    guard.circ_attempts *= p.scale_ratio;
    guard.circ_successes *= p.scale_ratio;
    guard.timeouts *= p.scale_ratio;
    guard.successful_circuits_closed *= p.scale_ratio;
    guard.collapsed_circuits *= p.scale_ratio;
    guard.unusable_circuits *= p.scale_ratio;

    guard.circ_attempts += opened_attempts + opened_built;
    guard.circ_successes += opened_built;

    info!(
        "Scaled pathbias counts to ({:.1},{:.1})/{:.1} ({:.0}/{:.0} open) for guard {}",
        guard.circ_successes,
        guard.successful_circuits_closed,
        guard.circ_attempts,
        opened_built,
        opened_attempts,
        guard.describe(),
    );

    if counts_are_sane && guard.circ_attempts < guard.circ_successes {
        info!(
            "Bug: scaling has mangled pathbias counts to {:.1}/{:.1} for guard {}",
            guard.circ_successes,
            guard.circ_attempts,
            guard.describe(),
        );
    }
    true
}

/// Multiplicatively decay a guard's use counters once enough use
/// attempts accumulate.
fn scale_use_rates(guard: &mut GuardRecord, open: &OpenCounts, p: &PathBiasParams) -> bool {
    if guard.use_attempts <= p.scale_use_threshold {
        return false;
    }
    let opened_attempts = open.in_use;
    let counts_are_sane = guard.use_attempts >= guard.use_successes;

    guard.use_attempts -= opened_attempts;
    guard.use_attempts *= p.scale_ratio;
    guard.use_successes *= p.scale_ratio;
    guard.use_attempts += opened_attempts;

    info!(
        "Scaled pathbias use counts to {:.1}/{:.1} ({:.0} open) for guard {}",
        guard.use_successes,
        guard.use_attempts,
        opened_attempts,
        guard.describe(),
    );

    if counts_are_sane && guard.use_attempts < guard.use_successes {
        info!(
            "Bug: scaling has mangled pathbias usage counts to {:.1}/{:.1} for guard {}",
            guard.use_successes,
            guard.use_attempts,
            guard.describe(),
        );
    }
    true
}

/// Count a circuit attempt against its guard.
///
/// Called when the circuit's second hop enters `AwaitingKeys`: from
/// here on an adversarial guard could end-to-end tag the circuit, so
/// this is the first moment failure becomes meaningful.  Runs the
/// close-rate checks and scaling before incrementing.
///
/// Returns a close reason if the guard has been disabled and the
/// circuit should not proceed.
pub(crate) fn count_build_attempt(
    circ: &mut OriginCircuit,
    ctx: &mut PathBiasCtx<'_>,
) -> Result<(), CloseReason> {
    if !should_count(circ, ctx.config) {
        return Ok(());
    }
    if circ.has_opened && circ.path_state != PathState::BuildAttempted {
        info!(
            "Bug: opened circuit {} is in strange path state {}",
            circ.global_id, circ.path_state
        );
    }
    // Don't re-count cannibalized circuits: they were counted when
    // first built, and contribute to use accounting only.
    if circ.has_opened {
        return Ok(());
    }
    let Some(guard_id) = circ.guard_identity() else {
        info!(
            "Unopened circuit {} has no known guard; not counting an attempt.",
            circ.global_id
        );
        return Ok(());
    };
    if circ.path_state != PathState::NewCirc {
        info!(
            "Bug: unopened circuit {} has strange path state {}",
            circ.global_id, circ.path_state
        );
        return Ok(());
    }

    let open = open_counts(ctx, &guard_id);
    let p = PathBiasParams::resolve(ctx.config, ctx.params);
    let (wallclock, close_ms) = (ctx.wallclock, ctx.close_ms);
    let Some(guard) = ctx.guards.record_mut(&guard_id) else {
        info!(
            "Unopened circuit {} has no known guard record.",
            circ.global_id
        );
        return Ok(());
    };

    circ.path_state = PathState::BuildAttempted;

    measure_close_rate(guard, &open, &p, wallclock, close_ms);
    if guard.path_bias_disabled {
        ctx.guards.guards_changed();
        return Err(CloseReason::local(CloseKind::Protocol));
    }
    scale_close_rates(guard, &open, &p);
    guard.circ_attempts += 1.0;
    info!(
        "Got success count {:.1}/{:.1} for guard {}",
        guard.circ_successes,
        guard.circ_attempts,
        guard.describe()
    );
    ctx.guards.guards_changed();
    Ok(())
}

/// Count a completed build against its guard.
///
/// Cannibalized circuits don't contribute: their success will be
/// counted under use accounting instead.
pub(crate) fn count_build_success(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    if !should_count(circ, ctx.config) {
        return;
    }
    if circ.has_opened {
        if circ.path_state < PathState::BuildSucceeded {
            info!(
                "Bug: opened circuit {} is in strange path state {}",
                circ.global_id, circ.path_state
            );
        }
        return;
    }
    let guard_id = circ
        .cpath
        .hop(0.into())
        .map(|h| *h.extend_info().identity());
    let Some(guard_id) = guard_id else {
        if circ.purpose != Purpose::MeasureTimeout {
            info!(
                "Completed circuit {} has no known guard.",
                circ.global_id
            );
        }
        return;
    };
    let Some(guard) = ctx.guards.record_mut(&guard_id) else {
        if circ.purpose != Purpose::MeasureTimeout {
            info!(
                "Completed circuit {} has no known guard record.",
                circ.global_id
            );
        }
        return;
    };
    if circ.path_state == PathState::BuildAttempted {
        circ.path_state = PathState::BuildSucceeded;
        guard.circ_successes += 1.0;
        info!(
            "Got success count {:.1}/{:.1} for guard {}",
            guard.circ_successes,
            guard.circ_attempts,
            guard.describe()
        );
        if guard.circ_attempts < guard.circ_successes {
            info!(
                "Bug: unexpectedly high success counts ({:.1}/{:.1}) for guard {}",
                guard.circ_successes,
                guard.circ_attempts,
                guard.describe()
            );
        }
        ctx.guards.guards_changed();
    } else {
        info!(
            "Bug: succeeded circuit {} is in strange path state {}",
            circ.global_id, circ.path_state
        );
    }
}

/// Record an attempt to use a circuit for streams.
pub(crate) fn count_use_attempt(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    if !should_count(circ, ctx.config) {
        return;
    }
    if circ.path_state < PathState::BuildSucceeded {
        info!(
            "Bug: used circuit {} is in strange path state {}",
            circ.global_id, circ.path_state
        );
    } else if circ.path_state < PathState::UseAttempted {
        if let Some(guard_id) = circ.guard_identity() {
            let open = open_counts(ctx, &guard_id);
            let p = PathBiasParams::resolve(ctx.config, ctx.params);
            let (wallclock, close_ms) = (ctx.wallclock, ctx.close_ms);
            if let Some(guard) = ctx.guards.record_mut(&guard_id) {
                measure_use_rate(guard, &open, &p, wallclock, close_ms);
                scale_use_rates(guard, &open, &p);
                guard.use_attempts += 1.0;
                debug!(
                    "Marked circuit {} ({:.1}/{:.1}) as used for guard {}",
                    circ.global_id,
                    guard.use_successes,
                    guard.use_attempts,
                    guard.describe()
                );
                ctx.guards.guards_changed();
            }
        }
        circ.path_state = PathState::UseAttempted;
    } else {
        // Harmless, but worth knowing about.
        info!(
            "Used circuit {} is already in path state {}",
            circ.global_id, circ.path_state
        );
    }
}

/// Note that a stream succeeded end-to-end on this circuit.
///
/// The guard's counter is not incremented until close, because a
/// later stream failure can still roll the circuit back to
/// `UseAttempted` (and into the probed-at-close pool).
pub(crate) fn mark_use_success(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    if !should_count(circ, ctx.config) {
        return;
    }
    if circ.path_state < PathState::UseAttempted {
        info!(
            "Bug: used circuit {} is in strange path state {}",
            circ.global_id, circ.path_state
        );
        count_use_attempt(circ, ctx);
    }
    circ.path_state = PathState::UseSucceeded;
}

/// A stream detached from this circuit in a retriable way: forget the
/// use-success so the close path probes the circuit.
pub(crate) fn mark_use_rollback(circ: &mut OriginCircuit) {
    if circ.path_state == PathState::UseSucceeded {
        info!(
            "Rolling back pathbias use state to 'attempted' for detached circuit {}",
            circ.global_id
        );
        circ.path_state = PathState::UseAttempted;
    }
}

/// Actually credit a use success at close time.
fn count_use_success(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    if !should_count(circ, ctx.config) {
        return;
    }
    if circ.path_state != PathState::UseSucceeded {
        info!(
            "Bug: successfully used circuit {} is in strange path state {}",
            circ.global_id, circ.path_state
        );
        return;
    }
    if let Some(guard_id) = circ.guard_identity() {
        if let Some(guard) = ctx.guards.record_mut(&guard_id) {
            guard.use_successes += 1.0;
            if guard.use_attempts < guard.use_successes {
                info!(
                    "Bug: unexpectedly high use success counts ({:.1}/{:.1}) for guard {}",
                    guard.use_successes,
                    guard.use_attempts,
                    guard.describe()
                );
            }
            debug!(
                "Marked circuit {} ({:.1}/{:.1}) as used successfully for guard {}",
                circ.global_id,
                guard.use_successes,
                guard.use_attempts,
                guard.describe()
            );
            ctx.guards.guards_changed();
        }
    }
}

/// Bump one of the close-outcome counters on the circuit's guard.
fn bump_guard_counter(
    circ: &mut OriginCircuit,
    ctx: &mut PathBiasCtx<'_>,
    what: &'static str,
    bump: fn(&mut GuardRecord),
) {
    if !should_count(circ, ctx.config) {
        return;
    }
    let guard_id = circ
        .cpath
        .hop(0.into())
        .map(|h| *h.extend_info().identity());
    match guard_id.and_then(|id| ctx.guards.record_mut(&id)) {
        Some(guard) => {
            bump(guard);
            ctx.guards.guards_changed();
        }
        None => {
            if circ.purpose != Purpose::MeasureTimeout {
                info!("{} circuit {} has no known guard.", what, circ.global_id);
            }
        }
    }
}

/// Count a circuit that closed cleanly after building.
fn count_successful_close(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    // In the long run: circ_successes ~= successful_circuits_closed +
    // collapsed + unusable.
    bump_guard_counter(circ, ctx, "Successfully closed", |g| {
        g.successful_circuits_closed += 1.0;
    });
}

/// Count a circuit that was destroyed after building but before any
/// use.
fn count_collapse(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    bump_guard_counter(circ, ctx, "Destroyed", |g| {
        g.collapsed_circuits += 1.0;
    });
}

/// Count a circuit we know could not carry streams.
fn count_use_failed(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    bump_guard_counter(circ, ctx, "Stream-failing", |g| {
        g.unusable_circuits += 1.0;
    });
}

/// Count a build timeout.  Purely informational.
pub(crate) fn count_timeout(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) {
    if !should_count(circ, ctx.config) {
        return;
    }
    // Onion-service circuits can be used successfully and then time
    // out later, when the other side declines to use them.
    if circ.path_state == PathState::UseSucceeded {
        return;
    }
    bump_guard_counter(circ, ctx, "Timed-out", |g| {
        g.timeouts += 1.0;
    });
}

/// Send the end-of-life probe down `circ`.
///
/// The probe is a `RELAY_BEGIN` for a random `0.a.b.c:25` target,
/// which the exit must refuse with an `EXIT_POLICY` end cell echoing
/// the address.  An exit (or tagging adversary) that has been
/// dropping our cells can't produce that echo.
///
/// Returns true if the probe went out.
fn send_usable_probe(circ: &mut OriginCircuit, ctx: &mut PathBiasCtx<'_>) -> bool {
    let Some(last) = circ.cpath.last_hop_num() else {
        return false;
    };
    if circ
        .cpath
        .hop(last)
        .map(|h| h.state() != HopState::Open)
        .unwrap_or(true)
    {
        // Cannibalized circuits can be closed before their new last
        // hop ever opens.
        info!(
            "Got pathbias probe request for unopened circuit {}. Opened {}, len {}",
            circ.global_id,
            circ.has_opened,
            circ.build_state.desired_path_len
        );
        return false;
    }
    if circ.purpose == Purpose::PathBiasTesting && circ.pathbias_probe_id.is_some() {
        info!(
            "Got pathbias probe request for circuit {} with outstanding probe",
            circ.global_id
        );
        return false;
    }
    let Some(chan) = circ.n_chan.clone() else {
        info!(
            "Skipping pathbias probe for circuit {}: no channel.",
            circ.global_id
        );
        return false;
    };
    if chan.borrow().state() != ChannelState::Open {
        info!(
            "Skipping pathbias probe for circuit {}: channel is not open.",
            circ.global_id
        );
        return false;
    }
    let Some(circ_id) = circ.n_circ_id else {
        return false;
    };

    circ.purpose = Purpose::PathBiasTesting;
    // Restart the build clock so circuit_expire_building gives the
    // probe its own window.
    circ.timestamp_began = Some(ctx.now);

    let nonce = ctx.rng.next_u32() & 0x00ff_ffff;
    circ.pathbias_probe_nonce = Some(nonce);
    let probe_addr = std::net::Ipv4Addr::from(nonce);

    let Some(stream_id) = circ.alloc_stream_id() else {
        warn!(
            "Ran out of stream IDs on circuit {} during pathbias probe attempt.",
            circ.global_id
        );
        return false;
    };

    let begin = BeginMsg {
        addr_port: format!("{}:25", probe_addr),
        flags: 0,
    };
    let mut payload = Vec::new();
    if begin.encode_onto(&mut payload).is_err() {
        return false;
    }
    let mut body = RelayCellBody::zeroed();
    let header = RelayHeader {
        cmd: RelayCmd::BEGIN,
        recognized: 0,
        stream_id,
        digest: [0; 4],
        length: payload.len() as u16,
    };
    header.encode_into(&mut body.0[..]);
    body.0[RELAY_HEADER_SIZE..RELAY_HEADER_SIZE + payload.len()].copy_from_slice(&payload);
    if circ.cpath.encrypt_from(last, &mut body).is_err() {
        info!(
            "Failed to encrypt pathbias probe cell on circuit {}.",
            circ.global_id
        );
        return false;
    }

    info!(
        "Sending pathbias testing cell to {}:25 on stream {} for circ {}.",
        probe_addr, stream_id.0, circ.global_id
    );
    ctx.chans.send_cell(
        &chan,
        circ_id,
        ChanMsg::Relay {
            body: body.0,
            early: false,
        },
    );
    circ.pathbias_probe_id = Some(stream_id);

    // Freshly dirty, so the circuit isn't expired out from under the
    // probe.
    circ.timestamp_dirty = Some(ctx.now);
    true
}

/// Run close-time accounting for `circ`.
///
/// Returns [`CloseDecision::DeferForProbe`] when an end-of-life probe
/// went out and the close must wait for its result.
pub(crate) fn check_close(
    circ: &mut OriginCircuit,
    reason: CloseReason,
    ctx: &mut PathBiasCtx<'_>,
) -> CloseDecision {
    if !should_count(circ, ctx.config) {
        circ.path_state = PathState::AlreadyCounted;
        return CloseDecision::Done;
    }
    match circ.path_state {
        // Closed after building but before use: was it us or them?
        PathState::BuildSucceeded => {
            if reason.is_remote() {
                // Remote close reasons on an unused circuit all could
                // be bias.
                info!(
                    "Circuit {} remote-closed without successful use for reason {}. Len {}.",
                    circ.global_id, reason, circ.build_state.desired_path_len
                );
                count_collapse(circ, ctx);
            } else if reason.kind() == CloseKind::ChannelClosed
                && circ
                    .n_chan
                    .as_ref()
                    .map(|c| c.borrow().reason_for_closing() != Some(ChannelCloseReason::Requested))
                    .unwrap_or(false)
            {
                // We didn't close the channel ourselves; it could be
                // bias.
                info!(
                    "Circuit {}'s channel closed without successful use for reason {}. Len {}.",
                    circ.global_id, reason, circ.build_state.desired_path_len
                );
                count_collapse(circ, ctx);
            } else {
                count_successful_close(circ, ctx);
            }
        }

        // We tried to use it and failed: probe before concluding
        // anything.
        PathState::UseAttempted => {
            if send_usable_probe(circ, ctx) {
                return CloseDecision::DeferForProbe;
            }
            count_use_failed(circ, ctx);
            info!(
                "Circuit {} closed without successful use for reason {}. Len {}.",
                circ.global_id, reason, circ.build_state.desired_path_len
            );
        }

        PathState::UseSucceeded => {
            count_successful_close(circ, ctx);
            count_use_success(circ, ctx);
        }

        PathState::UseFailed => {
            count_use_failed(circ, ctx);
        }

        // Other states are uninteresting; nothing to count.
        PathState::NewCirc | PathState::BuildAttempted | PathState::AlreadyCounted => {}
    }
    circ.path_state = PathState::AlreadyCounted;
    CloseDecision::Done
}

/// Evaluate a decrypted cell that arrived on a probe circuit.
///
/// Returns true if it is the expected probe response: a `RELAY_END`
/// on the probe stream, with reason `EXIT_POLICY`, echoing our nonce.
pub(crate) fn probe_response_matches(
    circ: &OriginCircuit,
    body: &[u8; CELL_PAYLOAD_SIZE],
) -> bool {
    let Ok(header) = RelayHeader::decode(&body[..]) else {
        return false;
    };
    let reason = if header.length > 0 {
        EndReason::from(body[RELAY_HEADER_SIZE])
    } else {
        EndReason::MISC
    };
    if header.cmd != RelayCmd::END
        || reason != EndReason::EXITPOLICY
        || Some(header.stream_id) != circ.pathbias_probe_id
    {
        info!(
            "Got another cell back on pathbias probe circuit {}: command {:?}, \
             reason {:?}, stream id {}",
            circ.global_id, header.cmd, reason, header.stream_id.0
        );
        return false;
    }
    // reason + ipv4 + dns_ttl
    if header.length < 9 {
        info!(
            "Short path bias probe response length field ({}).",
            header.length
        );
        return false;
    }
    let mut addr = [0_u8; 4];
    addr.copy_from_slice(&body[RELAY_HEADER_SIZE + 1..RELAY_HEADER_SIZE + 5]);
    let echoed = u32::from_be_bytes(addr);
    if Some(echoed) != circ.pathbias_probe_nonce {
        info!(
            "Got strange probe value 0x{:x} vs 0x{:x} back for circ {}, stream {}",
            echoed,
            circ.pathbias_probe_nonce.unwrap_or(0),
            circ.global_id,
            header.stream_id.0
        );
        return false;
    }
    true
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::circuit::CircuitFlags;
    use crate::config::CircuitConfig;
    use crate::mocks::MockChans;
    use rand::SeedableRng;

    fn params() -> NetParams {
        NetParams::new()
    }

    fn counted_circ(id: u64) -> OriginCircuit {
        let mut c = OriginCircuit::new(GlobalId(id), Purpose::General, &CircuitFlags::default());
        c.build_state.desired_path_len = 3;
        c
    }

    struct TestBed {
        config: CircuitConfig,
        params: NetParams,
        guards: crate::mocks::MockGuards,
        circuits: HashMap<GlobalId, OriginCircuit>,
        chans: MockChans,
        rng: StdRng,
    }

    impl TestBed {
        fn new(guard: IdDigest) -> Self {
            TestBed {
                config: CircuitConfig::default(),
                params: params(),
                guards: crate::mocks::MockGuards::with_guard(guard),
                circuits: HashMap::new(),
                chans: MockChans::new(),
                rng: StdRng::seed_from_u64(77),
            }
        }
        fn ctx(&mut self) -> PathBiasCtx<'_> {
            PathBiasCtx {
                config: &self.config,
                params: &self.params,
                guards: &mut self.guards,
                circuits: &mut self.circuits,
                chans: &mut self.chans,
                rng: &mut self.rng,
                now: Instant::now(),
                wallclock: SystemTime::now(),
                close_ms: 60_000,
            }
        }
    }

    fn guard_id() -> IdDigest {
        IdDigest::new([0x61; 20])
    }

    fn circ_through_guard(id: u64, guard: IdDigest) -> OriginCircuit {
        let mut c = counted_circ(id);
        let info = crate::extendinfo::ExtendInfo::builder()
            .identity(guard)
            .addr("192.0.2.1:9001".parse().unwrap())
            .build()
            .unwrap();
        c.cpath.append_hop(info, crate::cpath::CIRCWINDOW_START);
        c
    }

    #[test]
    fn should_count_rules() {
        let config = CircuitConfig::default();
        let mut c = counted_circ(1);
        assert!(should_count(&mut c, &config));

        let mut c = counted_circ(2);
        c.purpose = Purpose::Testing;
        assert!(!should_count(&mut c, &config));

        let mut c = counted_circ(3);
        c.purpose = Purpose::Introducing;
        assert!(!should_count(&mut c, &config));

        let mut c = counted_circ(4);
        c.build_state.onehop_tunnel = true;
        c.build_state.desired_path_len = 1;
        assert!(!should_count(&mut c, &config));

        let mut no_guards = CircuitConfig::default();
        no_guards.use_entry_guards = false;
        let mut c = counted_circ(5);
        assert!(!should_count(&mut c, &no_guards));

        // The probe purpose still counts.
        let mut c = counted_circ(6);
        c.purpose = Purpose::PathBiasTesting;
        assert!(should_count(&mut c, &config));
    }

    #[test]
    fn attempt_and_success_counting() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(1, gid);

        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();
        assert_eq!(circ.path_state, PathState::BuildAttempted);
        assert_eq!(bed.guards.record(&gid).circ_attempts, 1.0);

        count_build_success(&mut circ, &mut bed.ctx());
        assert_eq!(circ.path_state, PathState::BuildSucceeded);
        assert_eq!(bed.guards.record(&gid).circ_successes, 1.0);
        assert!(bed.guards.changed_count() >= 2);

        // Counting an attempt twice does nothing (state moved on).
        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();
        assert_eq!(bed.guards.record(&gid).circ_attempts, 1.0);
    }

    #[test]
    fn cannibalized_circuits_skip_build_counts() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(1, gid);
        circ.has_opened = true;
        circ.path_state = PathState::BuildAttempted;

        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();
        assert_eq!(bed.guards.record(&gid).circ_attempts, 0.0);
        count_build_success(&mut circ, &mut bed.ctx());
        assert_eq!(bed.guards.record(&gid).circ_successes, 0.0);
    }

    #[test]
    fn use_attempt_success_and_rollback() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(1, gid);
        circ.path_state = PathState::BuildSucceeded;

        count_use_attempt(&mut circ, &mut bed.ctx());
        assert_eq!(circ.path_state, PathState::UseAttempted);
        assert_eq!(bed.guards.record(&gid).use_attempts, 1.0);

        mark_use_success(&mut circ, &mut bed.ctx());
        assert_eq!(circ.path_state, PathState::UseSucceeded);
        // Not credited until close.
        assert_eq!(bed.guards.record(&gid).use_successes, 0.0);

        mark_use_rollback(&mut circ);
        assert_eq!(circ.path_state, PathState::UseAttempted);

        mark_use_success(&mut circ, &mut bed.ctx());
        // Attempt counter unchanged by the re-mark.
        assert_eq!(bed.guards.record(&gid).use_attempts, 1.0);
    }

    #[test]
    fn close_accounting_outcomes() {
        let gid = guard_id();

        // Built, closed locally and cleanly: successful close.
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(1, gid);
        circ.path_state = PathState::BuildSucceeded;
        let d = check_close(
            &mut circ,
            CloseReason::local(CloseKind::Finished),
            &mut bed.ctx(),
        );
        assert_eq!(d, CloseDecision::Done);
        assert_eq!(circ.path_state, PathState::AlreadyCounted);
        assert_eq!(bed.guards.record(&gid).successful_circuits_closed, 1.0);
        assert_eq!(bed.guards.record(&gid).collapsed_circuits, 0.0);

        // Built, remote-closed: collapse.
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(2, gid);
        circ.path_state = PathState::BuildSucceeded;
        check_close(
            &mut circ,
            CloseReason::remote(CloseKind::Finished),
            &mut bed.ctx(),
        );
        assert_eq!(bed.guards.record(&gid).collapsed_circuits, 1.0);

        // Used successfully: both counters.
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(3, gid);
        circ.path_state = PathState::UseSucceeded;
        check_close(
            &mut circ,
            CloseReason::local(CloseKind::Finished),
            &mut bed.ctx(),
        );
        assert_eq!(bed.guards.record(&gid).successful_circuits_closed, 1.0);
        assert_eq!(bed.guards.record(&gid).use_successes, 1.0);

        // Known-failed use: unusable.
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(4, gid);
        circ.path_state = PathState::UseFailed;
        check_close(
            &mut circ,
            CloseReason::local(CloseKind::Timeout),
            &mut bed.ctx(),
        );
        assert_eq!(bed.guards.record(&gid).unusable_circuits, 1.0);

        // Use attempted with no usable probe path (no last hop open):
        // counted unusable immediately.
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(5, gid);
        circ.path_state = PathState::UseAttempted;
        let d = check_close(
            &mut circ,
            CloseReason::local(CloseKind::Timeout),
            &mut bed.ctx(),
        );
        assert_eq!(d, CloseDecision::Done);
        assert_eq!(bed.guards.record(&gid).unusable_circuits, 1.0);
    }

    #[test]
    fn close_accounting_is_idempotent() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        let mut circ = circ_through_guard(1, gid);
        circ.path_state = PathState::BuildSucceeded;
        check_close(
            &mut circ,
            CloseReason::local(CloseKind::Finished),
            &mut bed.ctx(),
        );
        check_close(
            &mut circ,
            CloseReason::local(CloseKind::Finished),
            &mut bed.ctx(),
        );
        assert_eq!(bed.guards.record(&gid).successful_circuits_closed, 1.0);
    }

    #[test]
    fn guard_scaling_at_threshold() {
        // 301 attempts, 250 successes, 240 closed: one more attempt
        // crosses the scale threshold, halving everything first.
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        {
            let g = bed.guards.record_mut_test(&gid);
            g.circ_attempts = 301.0;
            g.circ_successes = 250.0;
            g.successful_circuits_closed = 240.0;
        }
        let mut circ = circ_through_guard(1, gid);
        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();

        let g = bed.guards.record(&gid);
        assert_eq!(g.circ_attempts, 151.5);
        assert_eq!(g.circ_successes, 125.0);
        assert_eq!(g.successful_circuits_closed, 120.0);
    }

    #[test]
    fn scaling_spares_open_circuits() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        {
            let g = bed.guards.record_mut_test(&gid);
            g.circ_attempts = 301.0;
            g.circ_successes = 150.0;
        }
        // One other circuit is mid-build through this guard.
        let mut other = circ_through_guard(9, gid);
        other.path_state = PathState::BuildAttempted;
        bed.circuits.insert(GlobalId(9), other);

        let mut circ = circ_through_guard(1, gid);
        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();

        let g = bed.guards.record(&gid);
        // (301 - 1 open) * 0.5 + 1 open + 1 new attempt
        assert_eq!(g.circ_attempts, 152.0);
        assert!(g.circ_attempts >= g.circ_successes);
    }

    #[test]
    fn close_rate_alerts_latch_once() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        {
            let g = bed.guards.record_mut_test(&gid);
            g.circ_attempts = 200.0;
            g.successful_circuits_closed = 80.0; // 40%: below warn (50), above extreme (30)
        }
        let mut circ = circ_through_guard(1, gid);
        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();
        let g = bed.guards.record(&gid);
        assert!(g.path_bias_warned);
        assert!(!g.path_bias_extreme);
        assert!(!g.path_bias_disabled);

        // A second traversal stays silent but the latch stays set.
        let mut circ2 = circ_through_guard(2, gid);
        count_build_attempt(&mut circ2, &mut bed.ctx()).unwrap();
        assert!(bed.guards.record(&gid).path_bias_warned);
    }

    #[test]
    fn extreme_rate_drops_guard_when_configured() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        bed.config.path_bias.drop_guards = Some(true);
        {
            let g = bed.guards.record_mut_test(&gid);
            g.circ_attempts = 200.0;
            g.successful_circuits_closed = 20.0; // 10%: extreme
        }
        let mut circ = circ_through_guard(1, gid);
        let r = count_build_attempt(&mut circ, &mut bed.ctx());
        assert!(r.is_err());
        let g = bed.guards.record(&gid);
        assert!(g.path_bias_disabled);
        assert!(g.bad_since.is_some());
        // The attempt that tripped the check is not recorded.
        assert_eq!(g.circ_attempts, 200.0);
    }

    #[test]
    fn zero_threshold_disables_checks() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        bed.config.path_bias.extreme_rate = Some(0);
        bed.config.path_bias.warn_rate = Some(0);
        bed.config.path_bias.notice_rate = Some(0);
        {
            let g = bed.guards.record_mut_test(&gid);
            g.circ_attempts = 500.0;
            g.successful_circuits_closed = 0.0;
        }
        let mut circ = circ_through_guard(1, gid);
        count_build_attempt(&mut circ, &mut bed.ctx()).unwrap();
        let g = bed.guards.record(&gid);
        assert!(!g.path_bias_noticed);
        assert!(!g.path_bias_warned);
        assert!(!g.path_bias_extreme);
    }

    #[test]
    fn attempts_never_fall_below_successes() {
        let gid = guard_id();
        let mut bed = TestBed::new(gid);
        let mut circs: Vec<OriginCircuit> = Vec::new();
        for i in 0..400 {
            let mut c = circ_through_guard(100 + i, gid);
            count_build_attempt(&mut c, &mut bed.ctx()).unwrap();
            count_build_success(&mut c, &mut bed.ctx());
            check_close(
                &mut c,
                CloseReason::local(CloseKind::Finished),
                &mut bed.ctx(),
            );
            circs.push(c);
            let g = bed.guards.record(&gid);
            assert!(g.circ_attempts >= g.circ_successes);
            assert!(g.use_attempts >= g.use_successes);
        }
    }
}
