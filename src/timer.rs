//! One-shot timer primitive the exchange arms for retransmission, standalone-ack,
//! close-grace and timed-interaction deadlines.
//!
//! Built on `tokio::time`, the way the teacher schedules background work in
//! `transport.rs` (`tokio::select!` over a receive future and a cancellation
//! token). A deadline-keyed timer with a cancel handle is exactly what §9 asks
//! for ("a central scheduler keyed by absolute monotonic deadline; each armed
//! timer carries a cancel handle"); `tokio::time::pause`/`advance` gives tests
//! the substitutable virtual clock the same section requires, without needing
//! a bespoke clock abstraction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// A deadline far enough out that, practically, nothing is scheduled; used
/// to park a [`Timer`] between real deadlines without tearing down whatever
/// is waiting on it (see [`Timer::park`]).
pub const PARK: Duration = Duration::from_secs(365 * 24 * 3600);

/// An armed, cancellable, re-armable deadline.
pub struct Timer {
    deadline: Mutex<Instant>,
    kick: Notify,
    cancelled: AtomicBool,
}

impl Timer {
    /// Arm a new timer to fire after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + delay),
            kick: Notify::new(),
            cancelled: AtomicBool::new(false),
        }
    }

    /// A timer parked at [`PARK`], for callers that want a long-lived
    /// background waiter with nothing armed yet.
    pub fn parked() -> Self {
        Self::new(PARK)
    }

    /// Re-arm to fire after `delay` from now, waking any current waiter so it
    /// picks up the new deadline.
    pub fn rearm(&self, delay: Duration) {
        *self.deadline.lock().unwrap() = Instant::now() + delay;
        self.kick.notify_one();
    }

    /// Push the deadline out to [`PARK`] without cancelling the timer: unlike
    /// [`Timer::cancel`], a waiter already blocked in [`Timer::wait`] keeps
    /// waiting (now for the parked deadline) instead of being told to give
    /// up. Use this for "nothing pending right now" — a later `rearm` still
    /// wakes the same waiter. Use `cancel` only to shut the waiter down for
    /// good.
    pub fn park(&self) {
        self.rearm(PARK);
    }

    /// Force the timer to fire on the next `wait()` poll, regardless of its
    /// armed deadline. Used by `Exchange::kick()`.
    pub fn fire_now(&self) {
        *self.deadline.lock().unwrap() = Instant::now();
        self.kick.notify_one();
    }

    /// Stop the timer; any in-progress `wait()` resolves to `false`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.kick.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Waits for the deadline (or `fire_now`) to elapse. Returns `true` if the
    /// timer fired, `false` if it was cancelled first.
    pub async fn wait(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            let deadline = *self.deadline.lock().unwrap();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if self.is_cancelled() {
                        return false;
                    }
                    return true;
                }
                _ = self.kick.notified() => {
                    // deadline or cancellation changed underneath us; re-check
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay() {
        let timer = Timer::new(Duration::from_millis(100));
        let handle = tokio::spawn(async move { timer.wait().await });
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_immediately() {
        let timer = std::sync::Arc::new(Timer::new(Duration::from_secs(10)));
        let waiter = timer.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        timer.cancel();
        assert!(!handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn park_does_not_resolve_an_in_flight_wait() {
        let timer = std::sync::Arc::new(Timer::new(Duration::from_millis(50)));
        let waiter = timer.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;

        timer.park();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        // a later rearm still reaches the same waiter.
        timer.rearm(Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn fire_now_short_circuits_deadline() {
        let timer = std::sync::Arc::new(Timer::new(Duration::from_secs(10)));
        let waiter = timer.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        timer.fire_now();
        assert!(handle.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_extends_deadline() {
        let timer = std::sync::Arc::new(Timer::new(Duration::from_millis(50)));
        let waiter = timer.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        timer.rearm(Duration::from_millis(200));
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(handle.await.unwrap());
    }
}
