//! Protocol constants that must stay bit-exact across implementations.

use std::time::Duration;

/// Initial transmission plus four retransmissions.
pub const MRP_MAX_TRANSMISSIONS: u8 = 5;

/// Maximum time an exchange may hold a received message without piggybacking
/// or emitting a standalone ack.
pub const STANDALONE_ACK_TIMEOUT: Duration = Duration::from_millis(200);

/// Default extension applied to the final wait after exhausting retransmissions.
pub const DEFAULT_EXPECTED_PROCESSING_TIME: Duration = Duration::from_secs(2);

/// Packet header (26) + payload header (12) + AEAD MIC (16), reserved out of
/// every payload budget handed to an exchange.
pub const MATTER_MESSAGE_OVERHEAD: usize = 26 + 12 + 16;

/// `protocolId` used for secure-channel control traffic, standalone acks among them.
pub const SECURE_CHANNEL_PROTOCOL_ID: u16 = 0x0000;

/// Opcode of a standalone ack within [`SECURE_CHANNEL_PROTOCOL_ID`].
pub const STANDALONE_ACK_OPCODE: u8 = 0x10;

/// Exponential base for `Channel::get_mrp_resubmission_backoff_time` (§4.1,
/// §9 "the channel computes it"): attempt `i` multiplies the base interval by
/// `MRP_BACKOFF_BASE^max(0, i - MRP_BACKOFF_THRESHOLD)`.
pub const MRP_BACKOFF_BASE: f64 = 1.6;

/// Attempts below this number use the unscaled base interval.
pub const MRP_BACKOFF_THRESHOLD: u8 = 1;

/// Uniform jitter fraction applied on top of the scaled interval.
pub const MRP_BACKOFF_JITTER: f64 = 0.25;

/// Extra margin applied when the base interval comes from the idle window.
pub const MRP_BACKOFF_MARGIN: f64 = 1.1;
