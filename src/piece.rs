//! Piece bookkeeping: written byte ranges, block selection and verification.
//!
//! - [`ByteRangeAllocator`] - thread-safe set of written byte intervals
//! - [`PieceTracker`] - per-torrent download state shared by all sessions
//! - [`PieceLocks`] - self-expiring reservations on requested pieces
//! - [`PieceDigest`] - piece hash used for verification (SHA-1)
//!
//! A piece moves from missing to partially filled as blocks arrive, is
//! verified once every byte is present, and either becomes complete or is
//! released for download again when its digest does not match.
//!
//! # Examples
//!
//! ```no_run
//! use rpiece::piece::{PieceTracker, PutBlock};
//! use rpiece::storage::BlockStore;
//! use rpiece::{Bitfield, SessionConfig};
//! use std::path::PathBuf;
//!
//! # async fn example(digests: Vec<u8>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = BlockStore::open(vec![(PathBuf::from("file.bin"), 77)], 16).await?;
//! let tracker = PieceTracker::new(store, digests, &SessionConfig::default())?;
//!
//! let remote = Bitfield::full(5);
//! for block in tracker.get_free_blocks(&remote, 4) {
//!     println!("request {:?}", block);
//! }
//!
//! if let PutBlock::Stored(status) = tracker.put_block(0, 0, &[0u8; 16]).await? {
//!     println!("piece 0 is now {:?}", status);
//! }
//! # Ok(())
//! # }
//! ```

mod allocator;
mod block;
mod clock;
mod digest;
mod lock;
mod tracker;

pub use allocator::{AllocatorGuard, ByteRangeAllocator, IntervalSet};
pub use block::BlockRequest;
pub use clock::{Clock, ManualClock, SystemClock};
pub use digest::{sha1, NoDigest, PieceDigest, Sha1Digest};
pub use lock::PieceLocks;
pub use tracker::{PieceStatus, PieceTracker, PutBlock};
