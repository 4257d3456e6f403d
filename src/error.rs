//! Error taxonomy for the exchange core.
//!
//! Unlike the teacher crate (where every error is terminal to a CLI run), errors
//! here are routed back to callers who branch on them, so they get a typed enum
//! instead of `anyhow::Error`. `anyhow` is still used at the `Session`/`Channel`
//! trait boundary and folded in here via `From`.

use std::fmt;

/// Reason an exchange or operation ended the way it did.
#[derive(thiserror::Error, Debug)]
pub enum ExchangeError {
    /// Operation attempted on an exchange (or its session) that is already closed.
    #[error("exchange is closed")]
    Closed,

    /// Caller-supplied cancellation fired.
    #[error("aborted: {0}")]
    Aborted(AbortReason),

    /// A deadline elapsed with no retry path available.
    #[error("timed out")]
    Timeout,

    /// All MRP retransmissions, plus the post-transmission grace period, elapsed
    /// without an ack.
    #[error("peer unresponsive")]
    PeerUnresponsive,

    /// The owning session's keys were revoked or the session was torn down.
    #[error("session closed")]
    SessionClosed,

    /// The channel rejected a datagram (transient; see `close(cause)` rules in §7).
    #[error("network error: {0}")]
    Network(#[source] anyhow::Error),

    /// A protocol invariant was violated by the peer or the caller.
    #[error("protocol violation: {0}")]
    MatterFlow(String),

    /// `expectAckOnly` was set but a data message arrived.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Payload exceeds the channel's advertised budget minus protocol overhead.
    #[error("payload of {len} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Cause threaded through a fired [`crate::abort::AbortToken`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// Caller explicitly cancelled the operation.
    CallerRequested,
    /// The token was fired to model a deadline.
    Timeout,
    /// The token was fired because the peer was declared unresponsive.
    PeerUnresponsive,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::CallerRequested => write!(f, "caller requested"),
            AbortReason::Timeout => write!(f, "timeout"),
            AbortReason::PeerUnresponsive => write!(f, "peer unresponsive"),
        }
    }
}

impl From<anyhow::Error> for ExchangeError {
    fn from(e: anyhow::Error) -> Self {
        ExchangeError::Network(e)
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
