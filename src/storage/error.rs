use thiserror::Error;

/// Errors raised by the block store and the piece tracker.
///
/// All of these are fatal for the torrent they concern; integrity failures
/// are not errors and never show up here.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block at offset {offset} with length {length} is outside of torrent data ({total} bytes)")]
    OutOfRange { offset: u64, length: u64, total: u64 },

    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    #[error("piece length must be greater than zero")]
    ZeroPieceLength,

    #[error("digest array holds {actual} bytes, expected {expected}")]
    DigestLength { expected: usize, actual: usize },

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
