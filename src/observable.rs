//! Single-shot, latched observable values (`Exchange.closed`, `Exchange.closing`).
//!
//! Modeled as a `tokio::sync::watch` channel the way the teacher uses `oneshot`
//! channels in `active_connection.rs` for "resolve this once and let readers see
//! it" signaling, generalized to the "latched" semantics §9 requires: a
//! subscriber attaching *after* the value fired must still observe it, which a
//! plain `oneshot` can't do for more than one subscriber.

use tokio::sync::watch;

/// A value that starts `false` and is set to `true` exactly once.
#[derive(Clone)]
pub struct Latch {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Emit the latch. Idempotent: emitting twice has no further effect.
    pub fn emit(&self) {
        let _ = self.tx.send_if_modified(|v| {
            if *v {
                false
            } else {
                *v = true;
                true
            }
        });
    }

    pub fn is_emitted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves immediately if already emitted, otherwise waits for `emit`.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn late_subscriber_observes_latched_value() {
        let latch = Latch::new();
        latch.emit();
        latch.wait().await; // must not hang
        assert!(latch.is_emitted());
    }

    #[tokio::test]
    async fn emit_is_idempotent() {
        let latch = Latch::new();
        latch.emit();
        latch.emit();
        assert!(latch.is_emitted());
    }

    #[tokio::test]
    async fn waiter_wakes_on_emit() {
        let latch = Latch::new();
        let waiter = latch.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::task::yield_now().await;
        latch.emit();
        handle.await.unwrap();
    }
}
