use std::collections::HashSet;
use std::path::{Path, PathBuf};

use lru::LruCache;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::error::StorageError;
use super::file::{FileAccess, Priority, TorrentFile};

/// An open handle on a torrent file.
#[derive(Debug)]
pub struct TorrentFileStream {
    path: PathBuf,
    file: File,
    access: FileAccess,
    priority: Priority,
    length: u64,
}

impl TorrentFileStream {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn access(&self) -> FileAccess {
        self.access
    }

    pub fn can_write(&self) -> bool {
        self.access.can_write()
    }

    /// Declared length of the file.
    pub fn declared_length(&self) -> u64 {
        self.length
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    async fn close(mut self) {
        if self.can_write() {
            if let Err(e) = self.file.flush().await {
                debug!(path = %self.path.display(), error = %e, "flush on close failed");
            }
        }
    }
}

/// Bounded cache of open file handles, least recently used first out.
///
/// A capacity of zero disables eviction.
#[derive(Debug)]
pub struct FileStreamCache {
    streams: LruCache<PathBuf, TorrentFileStream>,
    capacity: usize,
    known_dirs: HashSet<PathBuf>,
}

impl FileStreamCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            streams: LruCache::unbounded(),
            capacity,
            known_dirs: HashSet::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Paths from least to most recently used.
    pub fn lru_order(&self) -> Vec<PathBuf> {
        self.streams.iter().rev().map(|(path, _)| path.clone()).collect()
    }

    /// Returns a handle for `file` with at least `access`, opening it if
    /// needed, and marks it most recently used.
    pub async fn get_stream(
        &mut self,
        file: &TorrentFile,
        access: FileAccess,
    ) -> Result<&mut TorrentFileStream, StorageError> {
        let path = file.path.as_path();

        let reopen = matches!(
            self.streams.peek(path),
            Some(stream) if access.can_write() && !stream.can_write()
        );
        if reopen {
            debug!(path = %path.display(), "reopening read-only handle for write");
            self.close_stream(path).await;
        }

        if !self.streams.contains(path) {
            let stream = self.open(file, access).await?;
            if self.capacity != 0 {
                while self.streams.len() >= self.capacity {
                    self.evict_lru().await;
                }
            }
            self.streams.put(file.path.clone(), stream);
        }

        self.streams
            .get_mut(path)
            .ok_or_else(|| StorageError::FileNotFound(path.display().to_string()))
    }

    /// Looks up an open handle without touching the LRU order.
    pub fn find_stream(&self, path: &Path) -> Option<&TorrentFileStream> {
        self.streams.peek(path)
    }

    pub(crate) fn find_stream_mut(&mut self, path: &Path) -> Option<&mut TorrentFileStream> {
        self.streams.peek_mut(path)
    }

    /// Closes the handle for `path`. Returns whether one was open.
    pub async fn close_stream(&mut self, path: &Path) -> bool {
        match self.streams.pop(path) {
            Some(stream) => {
                stream.close().await;
                true
            }
            None => false,
        }
    }

    /// Closes every handle and forgets every known directory.
    pub async fn dispose(&mut self) {
        while let Some((_, stream)) = self.streams.pop_lru() {
            stream.close().await;
        }
        self.known_dirs.clear();
    }

    #[cfg(test)]
    pub(crate) fn knows_dir(&self, dir: &Path) -> bool {
        self.known_dirs.contains(dir)
    }

    async fn evict_lru(&mut self) {
        if let Some((path, stream)) = self.streams.pop_lru() {
            debug!(path = %path.display(), "evicting least recently used file handle");
            if !stream.priority.writes_to_disk() {
                if let Some(parent) = path.parent() {
                    self.known_dirs.remove(parent);
                }
            }
            stream.close().await;
        }
    }

    async fn ensure_parent_dir(&mut self, path: &Path) -> Result<(), StorageError> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => return Ok(()),
        };
        if self.known_dirs.contains(parent) {
            return Ok(());
        }
        fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            })?;
        self.known_dirs.insert(parent.to_path_buf());
        Ok(())
    }

    async fn open(
        &mut self,
        file: &TorrentFile,
        access: FileAccess,
    ) -> Result<TorrentFileStream, StorageError> {
        let path = file.path.as_path();
        self.ensure_parent_dir(path).await?;

        if !fs::try_exists(path).await? {
            trace!(path = %path.display(), length = file.length, "creating sparse file");
            let created = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(path)
                .await
                .map_err(|source| StorageError::CreateFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            created
                .set_len(file.length)
                .await
                .map_err(|source| StorageError::CreateFile {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        let mut access = access;
        let mut handle = open_with(path, access).await?;

        let actual = handle.metadata().await?.len();
        if actual > file.length {
            if !access.can_write() {
                access = FileAccess::ReadWrite;
                handle = open_with(path, access).await?;
            }
            debug!(path = %path.display(), actual, declared = file.length, "truncating oversized file");
            handle.set_len(file.length).await?;
        }

        Ok(TorrentFileStream {
            path: file.path.clone(),
            file: handle,
            access,
            priority: file.priority,
            length: file.length,
        })
    }
}

async fn open_with(path: &Path, access: FileAccess) -> Result<File, StorageError> {
    let mut options = OpenOptions::new();
    options.read(true);
    if access.can_write() {
        options.write(true);
    }
    Ok(options.open(path).await?)
}
