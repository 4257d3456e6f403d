//! Mock `Session`/`Channel` implementations shared by the `exchange` and
//! `exchange_manager` test modules (§A.4).
//!
//! Kept deliberately simple: no encryption, a shared `Vec` recording every
//! datagram handed to the channel so tests can assert on wire traffic
//! directly (scenario 2's "the channel observed the same packet exactly
//! twice" needs exactly this).

#![cfg(test)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

static LOG_INIT: Once = Once::new();

/// `env_logger::try_init` guarded by `Once`, the way the teacher's own
/// example binaries set up logging (`examples/discover.rs`), so `RUST_LOG`
/// controls `cargo test -- --nocapture` output instead of the default
/// no-op facade.
pub fn init_test_logging() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

use anyhow::Result;
use async_trait::async_trait;

use crate::abort::AbortToken;
use crate::channel::{default_backoff, default_max_peer_response_time, Channel};
use crate::message::SessionType;
use crate::session::{Session, SessionParameters};

pub struct MockSession {
    session_type: SessionType,
    counter: AtomicU32,
    closed: AtomicBool,
    peer_lost: AtomicBool,
    parameters: SessionParameters,
    activity: Mutex<Vec<bool>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            session_type: SessionType::Unicast,
            counter: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            peer_lost: AtomicBool::new(false),
            parameters: SessionParameters {
                active_interval: Duration::from_millis(10),
                idle_interval: Duration::from_millis(20),
                active_threshold: Duration::from_millis(100),
            },
            activity: Mutex::new(Vec::new()),
        }
    }

    pub fn group() -> Self {
        let mut s = Self::new();
        s.session_type = SessionType::Group;
        s
    }

    pub fn activity_log(&self) -> Vec<bool> {
        self.activity.lock().unwrap().clone()
    }
}

impl Default for MockSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Session for MockSession {
    fn session_type(&self) -> SessionType {
        self.session_type
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_peer_lost(&self) -> bool {
        self.peer_lost.load(Ordering::SeqCst)
    }

    fn mark_peer_lost(&self) {
        self.peer_lost.store(true, Ordering::SeqCst);
    }

    fn clear_peer_lost(&self) {
        self.peer_lost.store(false, Ordering::SeqCst);
    }

    fn parameters(&self) -> SessionParameters {
        self.parameters
    }

    fn local_node_id(&self) -> Option<u64> {
        Some(1)
    }

    fn peer_node_id(&self) -> Option<u64> {
        Some(2)
    }

    fn via(&self) -> String {
        "mock".to_string()
    }

    async fn next_message_counter(&self, abort: &AbortToken) -> Result<u32> {
        if abort.is_aborted() {
            anyhow::bail!("aborted");
        }
        Ok(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn encode_message(&self, counter: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        use crate::message::{Destination, PacketHeader};
        let header = PacketHeader {
            session_type: self.session_type,
            has_message_extensions: false,
            has_privacy_enhancements: false,
            is_control_message: false,
            session_id: 1,
            message_counter: counter,
            source_node_id: None,
            destination: Destination::None,
        };
        let mut out = header.encode()?;
        out.extend_from_slice(plaintext);
        Ok(out)
    }

    fn decode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn notify_activity(&self, incoming: bool) {
        self.activity.lock().unwrap().push(incoming);
        self.clear_peer_lost();
    }
}

/// A channel that records every datagram handed to it and never actually
/// sends anywhere; tests pop/inspect `sent()` directly instead of going over
/// a socket.
pub struct RecordingChannel {
    sent: Mutex<Vec<Vec<u8>>>,
    mtu: usize,
    fail_next: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            mtu: 1280,
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn with_mtu(mtu: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            mtu,
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Default for RecordingChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected send failure");
        }
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    fn max_payload_size(&self) -> usize {
        self.mtu
    }

    fn get_mrp_resubmission_backoff_time(
        &self,
        attempt: u8,
        session_parameters: SessionParameters,
        for_close: bool,
    ) -> Duration {
        // Scaled down from the real formula so tests run in milliseconds
        // under `tokio::time::pause`/`advance` rather than real seconds.
        default_backoff(attempt, session_parameters, for_close)
    }

    fn calculate_maximum_peer_response_time(
        &self,
        session_parameters: SessionParameters,
        local_parameters: SessionParameters,
        expected_processing_time: Duration,
    ) -> Duration {
        default_max_peer_response_time(session_parameters, local_parameters, expected_processing_time)
    }
}
