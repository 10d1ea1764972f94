//! rpiece - piece storage and peer sessions for a BitTorrent client
//!
//! This library moves a torrent's bytes: it lays pieces over the files on
//! disk, tracks which byte ranges have been written, hands out non-overlapping
//! block requests to concurrent peers and speaks the peer wire protocol,
//! including an optional RSA/RC4 encrypted stream.
//!
//! # Modules
//!
//! - [`storage`] - Block-addressable I/O across a torrent's files
//! - [`piece`] - Written-range allocator, piece locks, digest checks and block selection
//! - [`peer`] - Wire codec, handshake, encryption and per-peer sessions
//! - [`torrent`] - A torrent opened for transfer and its peer sources
//! - [`bitfield`] - Piece availability bitmaps
//! - [`config`] - Tunables shared by all of the above
//!
//! # Examples
//!
//! ```no_run
//! use rpiece::peer::PeerId;
//! use rpiece::{SessionConfig, StaticPeers, Torrent, TorrentLayout};
//! use std::path::{Path, PathBuf};
//! use std::sync::Arc;
//!
//! # async fn example(digests: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::default();
//! let layout = TorrentLayout {
//!     info_hash: [0u8; 20],
//!     piece_length: 262_144,
//!     digests,
//!     files: vec![(PathBuf::from("ubuntu.iso"), 3_000_000)],
//! };
//!
//! let torrent = Arc::new(Torrent::open(layout, Path::new("downloads"), &config).await?);
//! torrent.recheck().await?;
//!
//! let peers = StaticPeers::new(vec!["192.168.1.100:6881".parse()?]);
//! for task in torrent.connect_peers(&peers, PeerId::generate(), &config).await {
//!     let _ = task.await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod config;
pub mod constants;
pub mod logging;
pub mod peer;
pub mod piece;
pub mod storage;
pub mod torrent;

pub use bitfield::Bitfield;
pub use config::{EncryptionPolicy, SessionConfig};
pub use logging::init_tracing;
pub use peer::{Handshake, Message, PeerError, PeerId, PeerSession, SessionCloser, SessionState};
pub use piece::{
    BlockRequest, ByteRangeAllocator, IntervalSet, PieceStatus, PieceTracker, PutBlock,
};
pub use storage::{BlockStore, StorageError};
pub use torrent::{PeerSource, StaticPeers, Torrent, TorrentLayout, TransferStats};
