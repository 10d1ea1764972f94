//! Session configuration
//!
//! Every tunable that governs block selection, peer timing and the optional
//! encrypted stream lives here. A `SessionConfig` is built by the embedder and
//! passed into the components that need it; nothing reads global state.

use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Whether the encrypted-stream upgrade is attempted after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionPolicy {
    /// Never advertise or negotiate encryption.
    #[default]
    Disabled,
    /// Upgrade when the peer advertises support, plaintext otherwise.
    Enabled,
    /// Refuse peers that cannot upgrade.
    Required,
}

impl EncryptionPolicy {
    pub fn advertises(&self) -> bool {
        !matches!(self, EncryptionPolicy::Disabled)
    }
}

/// Configuration shared by the piece tracker and peer sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Size of requested blocks in bytes.
    pub block_size: u32,

    /// How long a piece stays reserved after its blocks were handed out.
    #[serde(with = "duration_ms")]
    pub piece_lock_timeout: Duration,

    /// Peer idle timeout; a keep-alive is sent after half of it.
    #[serde(with = "duration_ms")]
    pub keep_alive_timeout: Duration,

    /// Maximum wait for inbound data per loop iteration.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,

    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,

    pub send_buffer_size: u32,
    pub recv_buffer_size: u32,

    /// Largest inbound frame accepted before the connection is dropped.
    pub max_message_size: usize,

    /// Requests for longer blocks are ignored.
    pub max_request_length: u32,

    /// Block requests kept in flight per peer.
    pub max_outstanding_requests: usize,

    /// Inbound requests buffered per peer.
    pub max_queued_requests: usize,

    pub encryption: EncryptionPolicy,

    /// RSA modulus size used for the key exchange.
    pub rsa_bits: u32,

    /// Advertise DHT support and accept Port messages.
    pub enable_dht: bool,

    /// Unchoke every peer once its handshake completes.
    pub unchoke_on_connect: bool,

    /// Peer sessions a torrent runs at once; further peers are refused.
    pub max_peers: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            piece_lock_timeout: PIECE_LOCK_TIMEOUT,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            send_buffer_size: SOCKET_BUFFER_SIZE,
            recv_buffer_size: SOCKET_BUFFER_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            max_request_length: MAX_REQUEST_LENGTH,
            max_outstanding_requests: MAX_OUTSTANDING_REQUESTS,
            max_queued_requests: MAX_QUEUED_PEER_REQUESTS,
            encryption: EncryptionPolicy::Disabled,
            rsa_bits: DEFAULT_RSA_BITS,
            enable_dht: false,
            unchoke_on_connect: true,
            max_peers: MAX_PEERS,
        }
    }
}

impl SessionConfig {
    /// Interval after which an idle session sends a keep-alive.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_timeout / 2
    }

    /// Reserved handshake bytes advertising our capabilities.
    pub fn reserved_bytes(&self) -> [u8; 8] {
        let mut reserved = [0u8; 8];
        if self.encryption.advertises() {
            reserved[ENCRYPTION_RESERVED_BYTE] |= ENCRYPTION_RESERVED_MASK;
        }
        if self.enable_dht {
            reserved[DHT_RESERVED_BYTE] |= DHT_RESERVED_MASK;
        }
        reserved
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
