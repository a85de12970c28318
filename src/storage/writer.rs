use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::error::StorageError;
use super::file::{FileAccess, TorrentFile};
use super::stream_cache::FileStreamCache;
use crate::constants::{DEFAULT_MAX_OPEN_FILES, MOVE_RETRY_ATTEMPTS, MOVE_RETRY_INTERVAL};
use crate::retry::retry;

/// Serialized file I/O on top of a [`FileStreamCache`].
///
/// Every operation holds the cache lock for its whole duration, so two
/// operations never touch the same handle concurrently.
#[derive(Debug)]
pub struct DiskWriter {
    cache: Mutex<FileStreamCache>,
}

impl Default for DiskWriter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_OPEN_FILES)
    }
}

impl DiskWriter {
    pub fn new(max_open_files: usize) -> Self {
        Self {
            cache: Mutex::new(FileStreamCache::new(max_open_files)),
        }
    }

    /// Reads into `buf` from `offset` within `file`.
    ///
    /// Returns 0 when the file on disk is shorter than the requested range.
    pub async fn read(
        &self,
        file: &TorrentFile,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        check_range(file, offset, buf.len())?;

        let mut cache = self.cache.lock().await;
        let stream = cache.get_stream(file, FileAccess::Read).await?;
        let handle = stream.file_mut();

        let on_disk = handle.metadata().await?.len();
        if on_disk < offset + buf.len() as u64 {
            trace!(path = %file.path.display(), offset, on_disk, "read past end of file");
            return Ok(0);
        }

        handle.seek(SeekFrom::Start(offset)).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = handle.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Writes `data` at `offset` within `file`.
    ///
    /// Files that must not be persisted are skipped silently.
    pub async fn write(
        &self,
        file: &TorrentFile,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        if !file.priority.writes_to_disk() {
            trace!(path = %file.path.display(), "skipping write to unpersisted file");
            return Ok(());
        }
        check_range(file, offset, data.len())?;

        let mut cache = self.cache.lock().await;
        let stream = cache.get_stream(file, FileAccess::ReadWrite).await?;
        let handle = stream.file_mut();
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(data).await?;
        handle.flush().await?;
        Ok(())
    }

    /// Flushes `file` to disk if it is open.
    pub async fn flush(&self, file: &TorrentFile) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        if let Some(stream) = cache.find_stream_mut(&file.path) {
            if stream.can_write() {
                let handle = stream.file_mut();
                handle.flush().await?;
                handle.sync_data().await?;
            }
        }
        Ok(())
    }

    /// Closes the handle for `file`. Returns whether one was open.
    pub async fn close(&self, file: &TorrentFile) -> bool {
        self.cache.lock().await.close_stream(&file.path).await
    }

    pub async fn close_all(&self, files: &[TorrentFile]) {
        let mut cache = self.cache.lock().await;
        for file in files {
            cache.close_stream(&file.path).await;
        }
    }

    /// Moves `file` to `new_path`, replacing an existing file only when
    /// `overwrite` is set.
    pub async fn move_file(
        &self,
        file: &TorrentFile,
        new_path: &Path,
        overwrite: bool,
    ) -> Result<(), StorageError> {
        let mut cache = self.cache.lock().await;
        cache.close_stream(&file.path).await;

        if overwrite {
            match fs::remove_file(new_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(parent) = new_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StorageError::CreateDirectory {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        debug!(from = %file.path.display(), to = %new_path.display(), "moving file");
        retry(MOVE_RETRY_ATTEMPTS, MOVE_RETRY_INTERVAL, || {
            fs::rename(&file.path, new_path)
        })
        .await?;
        Ok(())
    }

    pub async fn exists(&self, file: &TorrentFile) -> Result<bool, StorageError> {
        Ok(fs::try_exists(&file.path).await?)
    }

    /// Number of handles currently open.
    pub async fn open_files(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Closes every open handle.
    pub async fn dispose(&self) {
        self.cache.lock().await.dispose().await;
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &Mutex<FileStreamCache> {
        &self.cache
    }
}

fn check_range(file: &TorrentFile, offset: u64, length: usize) -> Result<(), StorageError> {
    let length = length as u64;
    match offset.checked_add(length) {
        Some(end) if end <= file.length => Ok(()),
        _ => Err(StorageError::OutOfRange {
            path: file.path.clone(),
            offset,
            length,
            file_length: file.length,
        }),
    }
}
