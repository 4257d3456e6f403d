//! Composable cancellation, built the way the teacher uses
//! `tokio_util::sync::CancellationToken` in `transport.rs` (`stop_receive_token`).
//!
//! A plain `CancellationToken` has no notion of *why* it fired. `send`/`nextMessage`
//! need the reason (aborted vs. timed out vs. peer-declared-lost) to pick the right
//! [`crate::error::ExchangeError`] variant, so this wraps one with a latched reason.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::AbortReason;

/// A cancellation token that remembers why it was fired.
#[derive(Clone)]
pub struct AbortToken {
    inner: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
}

impl AbortToken {
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// A token derived from this one: firing the parent fires the child too,
    /// and the child inherits the parent's reason once it propagates.
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
            reason: self.reason.clone(),
        }
    }

    /// Fire the token with `reason`. Idempotent: the first reason wins.
    pub fn abort(&self, reason: AbortReason) {
        let mut slot = self.reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.inner.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// The reason the token fired, if it has.
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().unwrap().clone()
    }

    /// Resolves once the token fires; one alternative in an N-way `tokio::select!`.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}

impl Default for AbortToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn child_inherits_parent_reason() {
        let parent = AbortToken::new();
        let child = parent.child();
        assert!(!child.is_aborted());
        parent.abort(AbortReason::Timeout);
        child.cancelled().await;
        assert_eq!(child.reason(), Some(AbortReason::Timeout));
    }

    #[test]
    fn first_reason_wins() {
        let token = AbortToken::new();
        token.abort(AbortReason::CallerRequested);
        token.abort(AbortReason::Timeout);
        assert_eq!(token.reason(), Some(AbortReason::CallerRequested));
    }
}
