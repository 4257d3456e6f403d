//! §4.4 `Session` contract, plus the symmetric-AEAD implementation this crate
//! ships as a reference adapter.
//!
//! PASE/CASE establishment is out of scope (§1): callers hand a [`Session`]
//! implementation already holding live encrypt/decrypt keys to the
//! [`crate::exchange_manager::ExchangeManager`]. [`MatterSession`] is that
//! adapter, carried over from the teacher's `session.rs` (AES-128-CCM via
//! `util::cryptoutil`) — it already does exactly the post-establishment job
//! the trait describes.
//!
//! Per §9's arena-not-cycles guidance, the per-session *exchange set* lives in
//! [`crate::exchange_manager::ExchangeManager`], not on this trait: `Session`
//! models the opaque cryptographic collaborator, the exchange bookkeeping is
//! core-side state keyed by a session identity the manager owns.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use aes::cipher::crypto_common;
use anyhow::{Context, Result};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};

use crate::abort::AbortToken;
use crate::message::SessionType;
use crate::util::cryptoutil::{self, Aes128Ccm};

/// §4.4 "parameters { activeInterval, idleInterval, activeThreshold }".
#[derive(Debug, Clone, Copy)]
pub struct SessionParameters {
    pub active_interval: Duration,
    pub idle_interval: Duration,
    pub active_threshold: Duration,
}

impl Default for SessionParameters {
    fn default() -> Self {
        // Matter defaults: active window while the device is awake, idle
        // window otherwise, threshold to decide which applies.
        Self {
            active_interval: Duration::from_millis(500),
            idle_interval: Duration::from_secs(5),
            active_threshold: Duration::from_secs(4),
        }
    }
}

/// Opaque cryptographic session, exposed exactly as far as the exchange core
/// needs: counter allocation, encode/decode, and the bits that shape MRP
/// decisions (type, usesMrp, peer-lost, parameters, peer identity).
#[async_trait]
pub trait Session: Send + Sync {
    fn session_type(&self) -> SessionType;

    /// Group sessions never use MRP (§4.4).
    fn uses_mrp(&self) -> bool {
        self.session_type() == SessionType::Unicast
    }

    fn is_closed(&self) -> bool;

    /// §7 "Rules": a transient peer-communication failure marks the session
    /// peer-lost without closing it.
    fn is_peer_lost(&self) -> bool;
    fn mark_peer_lost(&self);
    fn clear_peer_lost(&self);

    fn parameters(&self) -> SessionParameters;

    fn local_node_id(&self) -> Option<u64>;
    fn peer_node_id(&self) -> Option<u64>;

    /// Opaque diagnostic handle (§4.4 "via").
    fn via(&self) -> String;

    /// Allocates the next outbound message counter. May suspend if counter
    /// persistence is required; supports abort.
    async fn next_message_counter(&self, abort: &AbortToken) -> Result<u32>;

    /// Encodes a packet carrying `counter` as its message counter and
    /// `plaintext` (payload header + payload) as its secured content.
    fn encode_message(&self, counter: u32, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decodes one inbound wire datagram back to packet-header-bytes followed
    /// by the decrypted payload-header + payload.
    fn decode_message(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// §4.4 `notifyActivity(incoming: bool)`.
    fn notify_activity(&self, incoming: bool);
}

/// Reference `Session` implementation: AES-128-CCM over a fixed pair of keys,
/// the way the teacher's `session.rs` does it once PASE/CASE has produced them.
pub struct MatterSession {
    session_id: u16,
    session_type: SessionType,
    counter: AtomicU32,
    local_node: Option<u64>,
    remote_node: Option<u64>,
    group_id: Option<u16>,
    encrypt_key: Option<crypto_common::Key<Aes128Ccm>>,
    decrypt_key: Option<crypto_common::Key<Aes128Ccm>>,
    closed: AtomicBool,
    peer_lost: AtomicBool,
    parameters: SessionParameters,
}

impl MatterSession {
    pub fn new(session_id: u16, local_node: Option<u64>, remote_node: Option<u64>) -> Self {
        Self {
            session_id,
            session_type: SessionType::Unicast,
            counter: AtomicU32::new(rand::random()),
            local_node,
            remote_node,
            group_id: None,
            encrypt_key: None,
            decrypt_key: None,
            closed: AtomicBool::new(false),
            peer_lost: AtomicBool::new(false),
            parameters: SessionParameters::default(),
        }
    }

    /// Builds a group (multicast) session addressed to `group_id` instead of
    /// a single node (§3.1 "group session" destination form). Implies
    /// `with_session_type(SessionType::Group)`.
    pub fn new_group(session_id: u16, local_node: Option<u64>, group_id: u16) -> Self {
        Self::new(session_id, local_node, None)
            .with_session_type(SessionType::Group)
            .with_group_id(group_id)
    }

    pub fn with_keys(mut self, encrypt_key: &[u8], decrypt_key: &[u8]) -> Self {
        self.encrypt_key = Some(*crypto_common::Key::<Aes128Ccm>::from_slice(encrypt_key));
        self.decrypt_key = Some(*crypto_common::Key::<Aes128Ccm>::from_slice(decrypt_key));
        self
    }

    pub fn with_session_type(mut self, session_type: SessionType) -> Self {
        self.session_type = session_type;
        self
    }

    pub fn with_group_id(mut self, group_id: u16) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_parameters(mut self, parameters: SessionParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn nonce(counter: u32, node: Option<u64>) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(13);
        out.write_u8(0)?;
        out.write_u32::<LittleEndian>(counter)?;
        out.write_u64::<LittleEndian>(node.unwrap_or(0))?;
        Ok(out)
    }
}

#[async_trait]
impl Session for MatterSession {
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
        self.local_node
    }

    fn peer_node_id(&self) -> Option<u64> {
        self.remote_node
    }

    fn via(&self) -> String {
        format!("session:{}", self.session_id)
    }

    async fn next_message_counter(&self, abort: &AbortToken) -> Result<u32> {
        if abort.is_aborted() {
            anyhow::bail!("counter allocation aborted");
        }
        Ok(self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn encode_message(&self, counter: u32, plaintext: &[u8]) -> Result<Vec<u8>> {
        use crate::message::{Destination, PacketHeader};

        // §3.1: group sessions address a group id, never a single node.
        let destination = match self.session_type {
            SessionType::Group => self.group_id.map(Destination::Group).unwrap_or(Destination::None),
            SessionType::Unicast => self.remote_node.map(Destination::Node).unwrap_or(Destination::None),
        };

        let header = PacketHeader {
            session_type: self.session_type,
            has_message_extensions: false,
            has_privacy_enhancements: false,
            is_control_message: false,
            session_id: self.session_id,
            message_counter: counter,
            source_node_id: self.local_node,
            destination,
        };
        let mut out = header.encode()?;
        match &self.encrypt_key {
            Some(key) => {
                let nonce = Self::nonce(counter, self.local_node)?;
                let enc = cryptoutil::aes128_ccm_encrypt(key, &nonce, &out, plaintext)?;
                out.extend_from_slice(&enc);
            }
            None => out.extend_from_slice(plaintext),
        }
        Ok(out)
    }

    fn decode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        use crate::message::PacketHeader;

        let (header, rest) = PacketHeader::decode(data).context("decode packet header")?;
        let aad_len = data.len() - rest.len();
        let aad = &data[..aad_len];
        let mut out = aad.to_vec();
        match &self.decrypt_key {
            Some(key) => {
                let nonce = Self::nonce(header.message_counter, self.remote_node)?;
                let plaintext = cryptoutil::aes128_ccm_decrypt(key, &nonce, aad, rest)?;
                out.extend_from_slice(&plaintext);
            }
            None => out.extend_from_slice(rest),
        }
        Ok(out)
    }

    fn notify_activity(&self, _incoming: bool) {
        self.clear_peer_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, PayloadHeader};

    fn key() -> [u8; 16] {
        [7u8; 16]
    }

    #[tokio::test]
    async fn plaintext_round_trips_without_keys() {
        let session = MatterSession::new(1, Some(10), Some(20));
        let payload_header = PayloadHeader {
            initiator_message: true,
            requires_ack: true,
            has_secured_extension: false,
            is_vendor_specific: false,
            opcode: 1,
            exchange_id: 5,
            protocol_id: 1,
            vendor_id: None,
            acked_message_counter: None,
        };
        let plaintext = Message::encode_payload(&payload_header, b"hi").unwrap();
        let abort = AbortToken::new();
        let counter = session.next_message_counter(&abort).await.unwrap();
        let wire = session.encode_message(counter, &plaintext).unwrap();

        let decoded = session.decode_message(&wire).unwrap();
        let message = Message::decode(&decoded).unwrap();
        assert_eq!(message.payload, b"hi");
        assert_eq!(message.payload_header.exchange_id, 5);
    }

    #[tokio::test]
    async fn encrypted_round_trip() {
        let alice = MatterSession::new(2, Some(1), Some(2)).with_keys(&key(), &key());
        let bob = MatterSession::new(2, Some(2), Some(1)).with_keys(&key(), &key());

        let payload_header = PayloadHeader {
            initiator_message: true,
            requires_ack: false,
            has_secured_extension: false,
            is_vendor_specific: false,
            opcode: 2,
            exchange_id: 9,
            protocol_id: 1,
            vendor_id: None,
            acked_message_counter: None,
        };
        let plaintext = Message::encode_payload(&payload_header, b"secret").unwrap();
        let abort = AbortToken::new();
        let counter = alice.next_message_counter(&abort).await.unwrap();
        let wire = alice.encode_message(counter, &plaintext).unwrap();

        let decoded = bob.decode_message(&wire).unwrap();
        let message = Message::decode(&decoded).unwrap();
        assert_eq!(message.payload, b"secret");
    }

    #[tokio::test]
    async fn group_session_encodes_group_destination() {
        let session = MatterSession::new_group(4, Some(1), 0x42);
        let payload_header = PayloadHeader {
            initiator_message: true,
            requires_ack: false,
            has_secured_extension: false,
            is_vendor_specific: false,
            opcode: 3,
            exchange_id: 7,
            protocol_id: 1,
            vendor_id: None,
            acked_message_counter: None,
        };
        let plaintext = Message::encode_payload(&payload_header, b"hi").unwrap();
        let abort = AbortToken::new();
        let counter = session.next_message_counter(&abort).await.unwrap();
        let wire = session.encode_message(counter, &plaintext).unwrap();

        let (header, _) = crate::message::PacketHeader::decode(&wire).unwrap();
        assert_eq!(header.destination, crate::message::Destination::Group(0x42));
        assert_eq!(header.session_type, SessionType::Group);
        assert!(!session.uses_mrp());
    }

    #[test]
    fn peer_lost_clears_on_activity() {
        let session = MatterSession::new(3, None, None);
        session.mark_peer_lost();
        assert!(session.is_peer_lost());
        session.notify_activity(true);
        assert!(!session.is_peer_lost());
    }
}
