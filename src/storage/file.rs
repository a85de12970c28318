use std::ops::Range;
use std::path::{Component, Path, PathBuf};

use super::error::StorageError;

/// Download priority of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    /// Deselected: nothing is downloaded or written.
    DoNotDownload,
    /// Data may be exchanged but is never persisted.
    DoNotWriteToDisk,
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
    Immediate,
}

impl Priority {
    /// Whether writes for this file reach the disk.
    pub fn writes_to_disk(self) -> bool {
        !matches!(self, Priority::DoNotDownload | Priority::DoNotWriteToDisk)
    }
}

/// Requested access to a cached file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    ReadWrite,
}

impl FileAccess {
    pub fn can_write(self) -> bool {
        matches!(self, FileAccess::ReadWrite)
    }
}

/// A file within a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Full path on disk.
    pub path: PathBuf,
    /// Declared length in bytes.
    pub length: u64,
    /// Offset of the first byte within the torrent.
    pub offset: u64,
    pub priority: Priority,
}

/// The part of one file covered by a torrent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

impl TorrentFile {
    pub fn new(path: impl Into<PathBuf>, length: u64, offset: u64) -> Self {
        Self {
            path: path.into(),
            length,
            offset,
            priority: Priority::default(),
        }
    }

    /// Joins a torrent-relative path onto `base`, rejecting paths that
    /// escape it.
    pub fn resolve(
        base: &Path,
        relative: &Path,
        length: u64,
        offset: u64,
    ) -> Result<Self, StorageError> {
        validate_file_path(relative)?;
        Ok(Self::new(base.join(relative), length, offset))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }

    pub fn contains_offset(&self, offset: u64) -> bool {
        self.byte_range().contains(&offset)
    }
}

fn validate_file_path(file_path: &Path) -> Result<(), StorageError> {
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

/// Maps `length` bytes at torrent `offset` onto the ordered file list.
pub fn file_spans(
    files: &[TorrentFile],
    offset: u64,
    length: u64,
) -> Vec<FileSpan> {
    let mut spans = Vec::new();
    let mut remaining = length;
    let mut current = offset;

    for (file_index, file) in files.iter().enumerate() {
        if remaining == 0 {
            break;
        }

        let file_end = file.offset + file.length;
        if current >= file.offset && current < file_end {
            let take = remaining.min(file_end - current);
            spans.push(FileSpan {
                file_index,
                file_offset: current - file.offset,
                length: take,
            });
            current += take;
            remaining -= take;
        }
    }

    spans
}
