//! Protocol constants and default tuning parameters.
//!
//! Wire-format values are fixed by the protocol. Timing and sizing values are
//! only defaults: every one of them can be overridden through
//! [`SessionConfig`](crate::SessionConfig).

use std::time::Duration;

// ============================================================================
// Client identification
// ============================================================================

/// Client ID prefix for peer ID generation (Azureus-style)
pub const CLIENT_PREFIX: &[u8; 8] = b"-RP0001-";

// ============================================================================
// Handshake
// ============================================================================

/// Protocol name sent in the handshake preamble.
pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/// Length of the full handshake preamble.
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved byte and mask advertising the encrypted-stream upgrade.
pub const ENCRYPTION_RESERVED_BYTE: usize = 0;
pub const ENCRYPTION_RESERVED_MASK: u8 = 0x01;

/// Reserved byte and mask advertising DHT support.
pub const DHT_RESERVED_BYTE: usize = 7;
pub const DHT_RESERVED_MASK: u8 = 0x01;

// ============================================================================
// Pieces and blocks
// ============================================================================

/// Length of a SHA-1 piece digest.
pub const DIGEST_LEN: usize = 20;

/// Standard block size for requests (16 KiB).
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Largest block we agree to serve to a peer (128 KiB).
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Time after which an unanswered piece lock may be handed out again.
pub const PIECE_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of pieces verified concurrently during a full recheck.
pub const RECHECK_BATCH_SIZE: usize = 32;

// ============================================================================
// Peer connections
// ============================================================================

/// Idle period after which a peer may drop us; a keep-alive goes out after half.
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(120);

/// Upper bound on a single wait for inbound data in the session loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for handshakes and blocking receives.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Write timeout for a single framed message.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket send/receive buffer size (256 KiB).
pub const SOCKET_BUFFER_SIZE: u32 = 256 * 1024;

/// Largest frame accepted from a peer (2 MiB).
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Outstanding block requests kept in flight per peer.
pub const MAX_OUTSTANDING_REQUESTS: usize = 16;

/// Concurrent peer sessions per torrent, inbound and outbound together.
pub const MAX_PEERS: usize = 25;

/// Queued inbound requests per peer before new ones are dropped.
pub const MAX_QUEUED_PEER_REQUESTS: usize = 256;

// ============================================================================
// Encryption
// ============================================================================

/// Default RSA modulus size for the key exchange.
pub const DEFAULT_RSA_BITS: u32 = 1024;

/// Length of the symmetric stream key.
pub const SYMMETRIC_KEY_LEN: usize = 16;

/// Keystream bytes discarded after RC4 key scheduling.
pub const RC4_DISCARD: usize = 1024;
