//! Block-addressable disk storage.
//!
//! A torrent's data is one virtual byte space laid over an ordered list of
//! files. [`BlockStore`] translates `(piece, offset, length)` addresses into
//! file regions and performs the scatter/gather I/O, including blocks that
//! straddle file boundaries and lists containing empty files.
//!
//! # Examples
//!
//! ```no_run
//! use rpiece::storage::BlockStore;
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = BlockStore::open(
//!     vec![
//!         (PathBuf::from("downloads/a.bin"), 1000),
//!         (PathBuf::from("downloads/b.bin"), 500),
//!     ],
//!     512,
//! )
//! .await?;
//!
//! assert_eq!(store.piece_count(), 3);
//! store.write_block(1, 400, &[7u8; 200]).await?; // crosses into b.bin
//! let block = store.read_block(1, 400, 200).await?;
//! assert_eq!(block.len(), 200);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! [`BlockStore::open_in`] validates file paths to prevent directory
//! traversal. Paths containing `..` or absolute paths are rejected.

mod block_store;
mod error;
mod file;

pub use block_store::BlockStore;
pub use error::StorageError;
pub use file::{FileEntry, FileSpan};

#[cfg(test)]
mod tests;
