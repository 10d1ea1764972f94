use super::allocator::ByteRangeAllocator;
use super::block::BlockRequest;
use super::clock::{Clock, SystemClock};
use super::digest::{PieceDigest, Sha1Digest};
use super::lock::PieceLocks;
use crate::bitfield::Bitfield;
use crate::config::SessionConfig;
use crate::constants::{DIGEST_LEN, RECHECK_BATCH_SIZE};
use crate::storage::{BlockStore, StorageError};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

/// Result of checking a piece against its expected digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceStatus {
    /// Some bytes of the piece are still missing.
    Incomplete,
    /// The digest matched; the completion bit is set.
    Verified,
    /// No digest could be computed; the piece was accepted without a check.
    Unverified,
    /// The digest did not match; the piece's bytes were released.
    Corrupt,
}

impl PieceStatus {
    /// True when the completion bit is set.
    pub fn is_complete(&self) -> bool {
        matches!(self, PieceStatus::Verified | PieceStatus::Unverified)
    }
}

/// Outcome of [`PieceTracker::put_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutBlock {
    /// Every byte of the block was already present; nothing was written.
    Duplicate,
    /// The block was written; carries the resulting state of its piece.
    Stored(PieceStatus),
}

/// Shared download state of one torrent.
///
/// Owns the block store, the allocator of written byte ranges, the
/// completion bitfield and the piece locks. All methods take `&self` and may
/// be called from many peer sessions at once.
#[derive(Debug)]
pub struct PieceTracker {
    store: BlockStore,
    allocator: ByteRangeAllocator,
    completed: RwLock<Bitfield>,
    /// Complete pieces that were accepted without a digest check.
    unverified: RwLock<Bitfield>,
    digests: Vec<u8>,
    digest: Arc<dyn PieceDigest>,
    locks: PieceLocks,
    selection: Mutex<()>,
    verifying: Vec<TokioMutex<()>>,
    block_size: u32,
}

impl PieceTracker {
    /// Creates a tracker verifying with SHA-1 against `digests`.
    ///
    /// `digests` is the flat concatenation of the 20-byte digest of every
    /// piece, in piece order.
    pub fn new(
        store: BlockStore,
        digests: Vec<u8>,
        config: &SessionConfig,
    ) -> Result<Self, StorageError> {
        Self::with_parts(
            store,
            digests,
            Arc::new(Sha1Digest),
            Arc::new(SystemClock),
            config,
        )
    }

    pub fn with_parts(
        store: BlockStore,
        digests: Vec<u8>,
        digest: Arc<dyn PieceDigest>,
        clock: Arc<dyn Clock>,
        config: &SessionConfig,
    ) -> Result<Self, StorageError> {
        let piece_count = store.piece_count() as usize;
        let expected = piece_count * DIGEST_LEN;
        if digests.len() != expected {
            return Err(StorageError::DigestLength {
                expected,
                actual: digests.len(),
            });
        }

        Ok(Self {
            store,
            allocator: ByteRangeAllocator::new(),
            completed: RwLock::new(Bitfield::new(piece_count)),
            unverified: RwLock::new(Bitfield::new(piece_count)),
            digests,
            digest,
            locks: PieceLocks::new(config.piece_lock_timeout, clock),
            selection: Mutex::new(()),
            verifying: (0..piece_count).map(|_| TokioMutex::new(())).collect(),
            block_size: config.block_size.max(1),
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.store.piece_count()
    }

    pub fn piece_length(&self) -> u64 {
        self.store.piece_length()
    }

    pub fn total_size(&self) -> u64 {
        self.store.total_size()
    }

    /// True length of `piece`.
    pub fn piece_size(&self, piece: u32) -> Result<u64, StorageError> {
        self.store.piece_size(piece)
    }

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn allocator(&self) -> &ByteRangeAllocator {
        &self.allocator
    }

    pub fn locks(&self) -> &PieceLocks {
        &self.locks
    }

    /// Copy of the completion bitfield.
    pub fn bitfield(&self) -> Bitfield {
        self.completed.read().clone()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.completed.read().has(piece as usize)
    }

    pub fn pieces_downloaded(&self) -> usize {
        self.completed.read().count()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.read().is_complete()
    }

    /// Bytes still missing from complete pieces, as reported to trackers.
    pub fn bytes_left(&self) -> u64 {
        let completed = self.completed.read();
        let done: u64 = completed
            .iter_set()
            .filter_map(|piece| self.store.piece_size(piece as u32).ok())
            .sum();
        self.store.total_size() - done
    }

    /// True if `[offset, offset + length)` lies inside `piece`.
    pub fn is_valid_block(&self, piece: u32, offset: u32, length: u32) -> bool {
        match self.store.piece_size(piece) {
            Ok(size) => length > 0 && offset as u64 + length as u64 <= size,
            Err(_) => false,
        }
    }

    fn piece_begin(&self, piece: u32) -> u64 {
        piece as u64 * self.store.piece_length()
    }

    /// Picks up to `max_count` unfilled blocks from pieces the remote has.
    ///
    /// Pieces that are complete or locked are skipped. Blocks never cross the
    /// end of their piece. Every piece a block was drawn from is locked.
    pub fn get_free_blocks(&self, remote: &Bitfield, max_count: usize) -> Vec<BlockRequest> {
        let mut blocks = Vec::new();
        if max_count == 0 {
            return blocks;
        }

        let _selection = self.selection.lock();
        let completed = self.completed.read();
        let allocator = self.allocator.lock();

        for piece in remote.iter_set() {
            if blocks.len() >= max_count {
                break;
            }
            let piece = piece as u32;
            if completed.has(piece as usize) || self.locks.is_locked(piece) {
                continue;
            }
            let Ok(size) = self.store.piece_size(piece) else {
                continue;
            };

            let begin = self.piece_begin(piece);
            let end = begin + size;
            let mut offset = allocator.next_free_point(begin);
            let mut drawn = false;

            while offset < end && blocks.len() < max_count {
                let length = (end - offset).min(self.block_size as u64);
                blocks.push(BlockRequest::new(piece, (offset - begin) as u32, length as u32));
                drawn = true;
                offset = allocator.next_free_point(offset + length);
            }

            if drawn {
                self.locks.stamp(piece);
                tracing::trace!(piece, "locked piece for requests");
            }
        }

        blocks
    }

    /// Stores a received block and checks its piece.
    ///
    /// A block whose bytes are all present already is dropped, which makes
    /// repeated delivery harmless.
    pub async fn put_block(
        &self,
        piece: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<PutBlock, StorageError> {
        let size = self.store.piece_size(piece)?;
        let begin = self.piece_begin(piece) + offset as u64;
        let length = data.len() as u64;
        if offset as u64 + length > size {
            return Err(StorageError::OutOfRange {
                offset: begin,
                length,
                total: self.store.total_size(),
            });
        }

        if self.allocator.contains_interval(begin, length) {
            tracing::debug!(piece, offset, len = length, "already got block");
            return Ok(PutBlock::Duplicate);
        }

        self.store.write_block(piece, offset, data).await?;
        self.allocator.add_interval(begin, length);

        let status = self.check_piece(piece).await?;
        Ok(PutBlock::Stored(status))
    }

    /// Verifies `piece` once all of its bytes are present.
    ///
    /// On a digest mismatch the piece's intervals are removed so it can be
    /// downloaded again. Checks of the same piece are serialized; a piece
    /// already complete is not re-read and keeps the status it was accepted
    /// with.
    pub async fn check_piece(&self, piece: u32) -> Result<PieceStatus, StorageError> {
        let size = self.store.piece_size(piece)?;
        let begin = self.piece_begin(piece);

        let _verifying = self.verifying[piece as usize].lock().await;

        if self.completed.read().has(piece as usize) {
            if self.unverified.read().has(piece as usize) {
                return Ok(PieceStatus::Unverified);
            }
            return Ok(PieceStatus::Verified);
        }
        if !self.allocator.contains_interval(begin, size) {
            return Ok(PieceStatus::Incomplete);
        }

        let data = self.store.read_piece(piece).await?;
        let status = match self.compute_digest(data).await? {
            None => {
                tracing::warn!(
                    piece,
                    algorithm = self.digest.name(),
                    "piece could not be checked and may be invalid"
                );
                PieceStatus::Unverified
            }
            Some(actual) if actual.as_slice() == self.expected_digest(piece) => {
                tracing::info!(piece, "valid piece");
                PieceStatus::Verified
            }
            Some(_) => {
                self.allocator.remove_intervals(begin, size);
                tracing::warn!(piece, "invalid piece, releasing its bytes");
                PieceStatus::Corrupt
            }
        };

        if status == PieceStatus::Unverified {
            self.unverified.write().set(piece as usize);
        }
        if status.is_complete() {
            self.completed.write().set(piece as usize);
        }
        self.locks.release(piece);
        Ok(status)
    }

    /// Returns the block if every byte of it is present.
    pub async fn get_read_block(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Option<Bytes>, StorageError> {
        let begin = self.piece_begin(piece) + offset as u64;
        if !self.allocator.contains_interval(begin, length as u64) {
            return Ok(None);
        }
        self.store.read_block(piece, offset, length).await.map(Some)
    }

    /// Releases the lock on `piece`, e.g. when a peer holding requests leaves.
    pub fn release_lock(&self, piece: u32) {
        self.locks.release(piece);
    }

    /// Hashes every piece already on disk and adopts the ones that match.
    ///
    /// Used when resuming a torrent whose files already exist. Returns the
    /// number of pieces found valid.
    pub async fn recheck_all(&self) -> Result<usize, StorageError> {
        let piece_count = self.piece_count();
        let mut valid = 0usize;

        for batch_start in (0..piece_count).step_by(RECHECK_BATCH_SIZE) {
            let batch_end = (batch_start + RECHECK_BATCH_SIZE as u32).min(piece_count);
            let checks = (batch_start..batch_end).map(|piece| self.recheck_piece(piece));

            for result in futures::future::join_all(checks).await {
                if result? {
                    valid += 1;
                }
            }
        }

        tracing::debug!(valid, piece_count, "recheck complete");
        Ok(valid)
    }

    async fn recheck_piece(&self, piece: u32) -> Result<bool, StorageError> {
        let size = self.store.piece_size(piece)?;
        let _verifying = self.verifying[piece as usize].lock().await;

        if self.completed.read().has(piece as usize) {
            return Ok(true);
        }

        let data = self.store.read_piece(piece).await?;
        match self.compute_digest(data).await? {
            Some(actual) if actual.as_slice() == self.expected_digest(piece) => {
                self.allocator.add_interval(self.piece_begin(piece), size);
                self.completed.write().set(piece as usize);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn expected_digest(&self, piece: u32) -> &[u8] {
        let start = piece as usize * DIGEST_LEN;
        &self.digests[start..start + DIGEST_LEN]
    }

    async fn compute_digest(
        &self,
        data: Bytes,
    ) -> Result<Option<[u8; DIGEST_LEN]>, StorageError> {
        let digest = Arc::clone(&self.digest);
        tokio::task::spawn_blocking(move || digest.digest(&data))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))
    }
}
