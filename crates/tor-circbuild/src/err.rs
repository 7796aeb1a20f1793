//! Declare an error type for tor-circbuild.

use thiserror::Error;

/// An error returned while building or driving a circuit.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Path selection could not assemble enough suitable hops.
    #[error("no usable relays for circuit: {0}")]
    NoPath(&'static str),

    /// A channel to the next hop could not be established.
    #[error("couldn't get channel for circuit")]
    ChanFailed,

    /// We ran out of circuit IDs on a channel, or couldn't format a cell.
    #[error("resource exhausted: {0}")]
    ResourceLimit(&'static str),

    /// The peer sent a malformed or unexpected cell.
    #[error("circuit protocol violation: {0}")]
    Protocol(&'static str),

    /// A cell body didn't parse or encode.
    #[error("problem decoding or encoding a cell: {0}")]
    CellFormat(#[from] crate::bytes::BytesError),

    /// A cryptographic handshake failed.
    #[error("circuit handshake failed: {0}")]
    Handshake(&'static str),

    /// A circuit build took too long to finish.
    #[error("circuit took too long to build")]
    CircTimeout,

    /// Tried to operate on a circuit that is not in the table.
    #[error("no such circuit")]
    NoSuchCircuit,

    /// An error caused by a programming issue, or a failure in another
    /// library that we can't work around.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// A result type returned by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The reason a circuit was (or should be) closed.
///
/// These correspond to the close reasons a circuit propagates to the
/// process-wide registry; the accountant inspects them when deciding
/// how a close should count against the entry guard.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CloseReason {
    /// What went wrong (or finished).
    kind: CloseKind,
    /// True if the close was triggered by the far side of the circuit.
    remote: bool,
}

/// The kind of event that closed a circuit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CloseKind {
    /// Path selection could not assemble enough hops.
    NoPath,
    /// The channel to the next hop could not be established.
    ConnectFailed,
    /// The underlying channel died mid-build.
    ChannelClosed,
    /// No free circuit ID, or a cell could not be formatted.
    ResourceLimit,
    /// A peer sent a malformed or unexpected cell.
    Protocol,
    /// Our own bug: non-IPv4 extend, cipher initialization failure.
    Internal,
    /// The build exceeded the timeout cutoff.
    Timeout,
    /// Clean close after use, or after a successful probe.
    Finished,
}

impl CloseReason {
    /// Create a close reason originating on our side.
    pub fn local(kind: CloseKind) -> Self {
        CloseReason {
            kind,
            remote: false,
        }
    }
    /// Create a close reason that came from the far side of the circuit.
    pub fn remote(kind: CloseKind) -> Self {
        CloseReason { kind, remote: true }
    }
    /// Return the kind of this close reason.
    pub fn kind(&self) -> CloseKind {
        self.kind
    }
    /// Return true if this reason came from the far side.
    pub fn is_remote(&self) -> bool {
        self.remote
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.remote {
            write!(f, "{:?} (remote)", self.kind)
        } else {
            write!(f, "{:?}", self.kind)
        }
    }
}

impl From<CloseReason> for Error {
    fn from(r: CloseReason) -> Error {
        match r.kind() {
            CloseKind::NoPath => Error::NoPath("circuit closed"),
            CloseKind::ConnectFailed | CloseKind::ChannelClosed => Error::ChanFailed,
            CloseKind::ResourceLimit => Error::ResourceLimit("circuit closed"),
            CloseKind::Protocol => Error::Protocol("circuit closed"),
            CloseKind::Timeout => Error::CircTimeout,
            CloseKind::Finished => Error::Internal("closed a finished circuit"),
            CloseKind::Internal => Error::Internal("circuit closed"),
        }
    }
}
