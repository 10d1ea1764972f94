use super::error::StorageError;
use std::path::{Component, Path, PathBuf};

/// A backing file and its place in the torrent's virtual byte space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    /// Lays `(path, size)` pairs end to end, starting at offset 0.
    pub fn layout<I>(spans: I) -> Vec<FileEntry>
    where
        I: IntoIterator<Item = (PathBuf, u64)>,
    {
        let mut offset = 0u64;
        spans
            .into_iter()
            .map(|(path, length)| {
                let entry = FileEntry::new(path, length, offset);
                offset += length;
                entry
            })
            .collect()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// The part of one file covered by a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Rejects relative paths that would escape their base directory.
pub(crate) fn validate_relative_path(file_path: &Path) -> Result<(), StorageError> {
    for component in file_path.components() {
        match component {
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::PathTraversal(file_path.display().to_string()));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Maps `[start, start + length)` onto file regions, skipping empty files.
pub(crate) fn spans_for_range(files: &[FileEntry], start: u64, length: u64) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    if length == 0 {
        return spans;
    }

    let first = files.partition_point(|file| file.end() <= start);
    let mut current = start;
    let mut remaining = length;

    for (file_index, file) in files.iter().enumerate().skip(first) {
        if remaining == 0 {
            break;
        }
        if !file.contains_offset(current) {
            continue;
        }

        let take = remaining.min(file.end() - current);
        spans.push(FileSpan {
            file_index,
            file_offset: current - file.offset,
            length: take,
        });
        current += take;
        remaining -= take;
    }

    spans
}
