use crate::storage::StorageError;
use thiserror::Error;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// A single message whose payload does not fit its tag.
    #[error("malformed message (id {id}): {reason}")]
    MalformedMessage { id: u8, reason: &'static str },

    /// A frame larger than the configured limit.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Local policy requires encryption but the peer cannot do it.
    #[error("peer does not support the required encrypted stream")]
    EncryptionRequired,

    /// The key exchange failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// The remote peer id is our own.
    #[error("connected to ourselves")]
    SelfConnection,

    /// Reading or storing block data failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl PeerError {
    /// True if the error ends the session.
    ///
    /// Individual malformed messages are skipped; everything else closes the
    /// connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PeerError::MalformedMessage { .. })
    }
}
