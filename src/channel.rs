//! §4.3 `Channel` contract, plus the UDP implementation this crate ships as a
//! reference adapter.
//!
//! The socket-multiplexing-by-remote-address design is carried straight from
//! the teacher's `transport.rs` (`Transport`/`Connection`, reader task fanning
//! datagrams out to per-peer mpsc channels). What changes is the shape of the
//! contract a `Connection` exposes: `Channel` here is the exchange's view
//! (send one datagram, report budget, compute backoff), not a
//! request/response RPC helper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::constants::{MRP_BACKOFF_BASE, MRP_BACKOFF_JITTER, MRP_BACKOFF_MARGIN, MRP_BACKOFF_THRESHOLD};
use crate::session::SessionParameters;

/// Default UDP MTU budget this reference channel advertises.
pub const DEFAULT_MTU: usize = 1280;

/// §4.3: the narrow interface the exchange depends on for sending datagrams
/// and shaping its own retry/deadline timing. Deliberately excludes anything
/// about how the bytes reach a peer.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, bytes: &[u8]) -> Result<()>;

    /// Advertised MTU minus on-wire framing the channel itself adds (if any);
    /// the exchange further subtracts `MATTER_MESSAGE_OVERHEAD`.
    fn max_payload_size(&self) -> usize;

    /// §9 "the channel computes it": exponential backoff with jitter over the
    /// session's active/idle intervals. `for_close` requests the grace-period
    /// variant used while summing the close timer (§4.1 `close()`).
    fn get_mrp_resubmission_backoff_time(
        &self,
        attempt: u8,
        session_parameters: SessionParameters,
        for_close: bool,
    ) -> Duration;

    /// §4.1 final-wait sizing: how long to additionally wait for a response
    /// once retransmissions are exhausted, given how slow the peer says it
    /// may be (`expected_processing_time`).
    fn calculate_maximum_peer_response_time(
        &self,
        session_parameters: SessionParameters,
        local_parameters: SessionParameters,
        expected_processing_time: Duration,
    ) -> Duration;
}

fn jittered(base: Duration, for_close: bool) -> Duration {
    // A tiny xorshift keeps this deterministic-enough without pulling a
    // dependency just for one coin flip; exact distribution does not matter,
    // only that repeated calls are not byte-identical (I4 "in expectation").
    let nanos = base.as_nanos() as u64;
    let mixed = nanos ^ (nanos.rotate_left(17)).wrapping_add(0x9E3779B97F4A7C15);
    let frac = (mixed % 1000) as f64 / 1000.0;
    let jitter = 1.0 + (frac - 0.5) * MRP_BACKOFF_JITTER;
    let margin = if for_close { MRP_BACKOFF_MARGIN } else { 1.0 };
    base.mul_f64(jitter * margin)
}

/// Reference `Channel::get_mrp_resubmission_backoff_time` implementation:
/// exponential growth off the session's active/idle interval, scaled past
/// `MRP_BACKOFF_THRESHOLD` attempts, with uniform jitter.
pub fn default_backoff(attempt: u8, session_parameters: SessionParameters, for_close: bool) -> Duration {
    let base = if session_parameters.active_interval < session_parameters.idle_interval {
        session_parameters.active_interval
    } else {
        session_parameters.idle_interval
    };
    let scaled_attempts = attempt.saturating_sub(MRP_BACKOFF_THRESHOLD) as i32;
    let scale = MRP_BACKOFF_BASE.powi(scaled_attempts.max(0));
    jittered(base.mul_f64(scale), for_close)
}

/// Reference `Channel::calculate_maximum_peer_response_time` implementation.
pub fn default_max_peer_response_time(
    session_parameters: SessionParameters,
    local_parameters: SessionParameters,
    expected_processing_time: Duration,
) -> Duration {
    let round_trip = session_parameters.active_interval.max(local_parameters.active_interval) * 2;
    round_trip + expected_processing_time
}

#[derive(Debug, Clone)]
struct ConnectionInfo {
    sender: mpsc::Sender<Vec<u8>>,
}

/// Shared UDP transport: one socket, a reader task fanning inbound datagrams
/// out by remote address, and a cleanup task that forgets dropped peers.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    connections: Mutex<HashMap<String, ConnectionInfo>>,
    remove_tx: mpsc::UnboundedSender<String>,
    stop: CancellationToken,
}

/// A [`Channel`] bound to one remote UDP address.
pub struct UdpChannel {
    transport: Arc<UdpTransport>,
    remote_address: String,
    receiver: Mutex<mpsc::Receiver<Vec<u8>>>,
    mtu: usize,
}

impl UdpTransport {
    pub async fn bind(local: &str) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        let (remove_tx, remove_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let this = Arc::new(Self {
            socket: Arc::new(socket),
            connections: Mutex::new(HashMap::new()),
            remove_tx,
            stop,
        });

        let reader_socket = this.socket.clone();
        let reader_stop = this.stop.child_token();
        let reader_self = Arc::downgrade(&this);
        tokio::spawn(async move {
            if let Err(e) = Self::read_loop(reader_socket, reader_stop, reader_self).await {
                log::debug!("udp transport read loop stopped: {:?}", e);
            }
        });

        let cleanup_self = Arc::downgrade(&this);
        tokio::spawn(async move {
            Self::cleanup_loop(remove_rx, cleanup_self).await;
        });

        Ok(this)
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        stop: CancellationToken,
        self_weak: std::sync::Weak<UdpTransport>,
    ) -> Result<()> {
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, addr) = tokio::select! {
                r = socket.recv_from(&mut buf) => r?,
                _ = stop.cancelled() => return Ok(()),
            };
            let Some(this) = self_weak.upgrade() else {
                return Ok(());
            };
            let connections = this.connections.lock().await;
            if let Some(conn) = connections.get(&addr.to_string()) {
                let _ = conn.sender.send(buf[..n].to_vec()).await;
            } else {
                log::trace!("dropping {} bytes from unknown peer {}", n, addr);
            }
        }
    }

    async fn cleanup_loop(mut remove_rx: mpsc::UnboundedReceiver<String>, self_weak: std::sync::Weak<UdpTransport>) {
        while let Some(addr) = remove_rx.recv().await {
            let Some(this) = self_weak.upgrade() else { return };
            this.connections.lock().await.remove(&addr);
        }
    }

    /// Bind a logical channel to `remote`, replacing any existing binding.
    pub async fn channel(self: &Arc<Self>, remote: &str, mtu: usize) -> Arc<UdpChannel> {
        let (sender, receiver) = mpsc::channel(32);
        self.connections
            .lock()
            .await
            .insert(remote.to_owned(), ConnectionInfo { sender });
        Arc::new(UdpChannel {
            transport: self.clone(),
            remote_address: remote.to_owned(),
            receiver: Mutex::new(receiver),
            mtu,
        })
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl UdpChannel {
    /// Pull the next datagram addressed to this peer; used by whatever feeds
    /// `ExchangeManager::on_packet`, not by the exchange itself.
    pub async fn receive(&self) -> Option<Vec<u8>> {
        self.receiver.lock().await.recv().await
    }
}

#[async_trait]
impl Channel for UdpChannel {
    async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.transport
            .socket
            .send_to(bytes, &self.remote_address)
            .await
            .context("udp send failed")?;
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

impl Drop for UdpChannel {
    fn drop(&mut self) {
        let _ = self.transport.remove_tx.send(self.remote_address.clone());
    }
}
