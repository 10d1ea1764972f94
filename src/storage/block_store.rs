use super::error::StorageError;
use super::file::{spans_for_range, validate_relative_path, FileEntry, FileSpan};
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex as TokioMutex;

/// Block-addressable storage over one or more backing files.
///
/// Pieces are laid over the concatenation of all files, so a block may
/// straddle file boundaries; reads gather and writes scatter across them.
/// The store does no range locking of its own: callers keep concurrent
/// writes disjoint.
#[derive(Debug)]
pub struct BlockStore {
    files: Vec<FileEntry>,
    handles: Vec<TokioMutex<File>>,
    piece_length: u64,
    piece_count: u32,
    total_size: u64,
}

impl BlockStore {
    /// Creates or opens every file and resizes it to its declared size.
    pub async fn open(
        spans: Vec<(PathBuf, u64)>,
        piece_length: u64,
    ) -> Result<Self, StorageError> {
        if piece_length == 0 {
            return Err(StorageError::ZeroPieceLength);
        }

        let files = FileEntry::layout(spans);
        let mut handles = Vec::with_capacity(files.len());
        for entry in &files {
            handles.push(TokioMutex::new(open_sized(&entry.path, entry.length).await?));
        }

        let total_size = files.last().map(FileEntry::end).unwrap_or(0);
        let piece_count = total_size.div_ceil(piece_length) as u32;

        tracing::debug!(
            files = files.len(),
            total_size,
            piece_length,
            piece_count,
            "opened block store"
        );

        Ok(Self {
            files,
            handles,
            piece_length,
            piece_count,
            total_size,
        })
    }

    /// Like [`BlockStore::open`] with paths relative to `base`.
    ///
    /// Paths that would leave `base` are rejected.
    pub async fn open_in(
        base: &Path,
        spans: Vec<(PathBuf, u64)>,
        piece_length: u64,
    ) -> Result<Self, StorageError> {
        let mut rooted = Vec::with_capacity(spans.len());
        for (path, size) in spans {
            validate_relative_path(&path)?;
            rooted.push((base.join(path), size));
        }
        Self::open(rooted, piece_length).await
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// True length of a piece: nominal, except for the last piece.
    pub fn piece_size(&self, piece_index: u32) -> Result<u64, StorageError> {
        if piece_index >= self.piece_count {
            return Err(StorageError::InvalidPieceIndex(piece_index));
        }
        let start = piece_index as u64 * self.piece_length;
        Ok(self.piece_length.min(self.total_size - start))
    }

    fn block_spans(
        &self,
        piece_index: u32,
        offset: u32,
        length: u64,
    ) -> Result<Vec<FileSpan>, StorageError> {
        let start = piece_index as u64 * self.piece_length + offset as u64;
        if start + length > self.total_size {
            return Err(StorageError::OutOfRange {
                offset: start,
                length,
                total: self.total_size,
            });
        }
        Ok(spans_for_range(&self.files, start, length))
    }

    pub async fn read_block(
        &self,
        piece_index: u32,
        offset: u32,
        length: u32,
    ) -> Result<Bytes, StorageError> {
        let spans = self.block_spans(piece_index, offset, length as u64)?;
        let mut data = BytesMut::with_capacity(length as usize);

        for span in spans {
            let mut file = self.handles[span.file_index].lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let filled = data.len();
            data.resize(filled + span.length as usize, 0);
            file.read_exact(&mut data[filled..]).await?;
        }

        Ok(data.freeze())
    }

    pub async fn write_block(
        &self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let spans = self.block_spans(piece_index, offset, data.len() as u64)?;
        let mut data_offset = 0usize;

        for span in spans {
            let mut file = self.handles[span.file_index].lock().await;
            file.seek(SeekFrom::Start(span.file_offset)).await?;

            let chunk = &data[data_offset..data_offset + span.length as usize];
            file.write_all(chunk).await?;
            file.flush().await?;

            data_offset += span.length as usize;
        }

        Ok(())
    }

    pub async fn read_piece(&self, piece_index: u32) -> Result<Bytes, StorageError> {
        let size = self.piece_size(piece_index)?;
        self.read_block(piece_index, 0, size as u32).await
    }

    /// Flushes file contents to disk.
    pub async fn sync(&self) -> Result<(), StorageError> {
        for handle in &self.handles {
            handle.lock().await.sync_data().await?;
        }
        Ok(())
    }
}

async fn open_sized(path: &Path, size: u64) -> Result<File, StorageError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;

    if file.metadata().await?.len() != size {
        file.set_len(size).await?;
    }
    Ok(file)
}
