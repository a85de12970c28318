use std::sync::Arc;

use tracing::trace;

use super::error::StorageError;
use super::file::{file_spans, TorrentFile};
use super::writer::DiskWriter;

/// Reads and writes torrent byte ranges across the torrent's files.
#[derive(Debug, Clone)]
pub struct DiskManager {
    writer: Arc<DiskWriter>,
}

impl DiskManager {
    pub fn new(writer: Arc<DiskWriter>) -> Self {
        Self { writer }
    }

    pub fn writer(&self) -> &Arc<DiskWriter> {
        &self.writer
    }

    /// Fills `buf` from torrent offset `offset`.
    ///
    /// Returns the number of bytes read, which is short when a file on disk
    /// does not yet hold the requested range.
    pub async fn read(
        &self,
        files: &[TorrentFile],
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let mut position = 0usize;
        for span in file_spans(files, offset, buf.len() as u64) {
            let file = &files[span.file_index];
            let end = position + span.length as usize;
            let n = self
                .writer
                .read(file, span.file_offset, &mut buf[position..end])
                .await?;
            position += n;
            if n as u64 != span.length {
                trace!(path = %file.path.display(), "short read");
                break;
            }
        }
        Ok(position)
    }

    /// Like [`read`](Self::read) but fails unless `buf` is filled.
    pub async fn read_exact(
        &self,
        files: &[TorrentFile],
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let n = self.read(files, offset, buf).await?;
        if n != buf.len() {
            return Err(StorageError::ShortRead {
                expected: buf.len(),
                actual: n,
            });
        }
        Ok(())
    }

    /// Writes `data` at torrent offset `offset`.
    pub async fn write(
        &self,
        files: &[TorrentFile],
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let spans = file_spans(files, offset, data.len() as u64);
        let covered: u64 = spans.iter().map(|s| s.length).sum();
        if covered != data.len() as u64 {
            return Err(StorageError::OutOfRange {
                path: files.last().map(|f| f.path.clone()).unwrap_or_default(),
                offset,
                length: data.len() as u64,
                file_length: files.iter().map(|f| f.length).sum(),
            });
        }

        let mut position = 0usize;
        for span in spans {
            let end = position + span.length as usize;
            self.writer
                .write(&files[span.file_index], span.file_offset, &data[position..end])
                .await?;
            position = end;
        }
        Ok(())
    }

    pub async fn flush_files(&self, files: &[TorrentFile]) -> Result<(), StorageError> {
        for file in files {
            self.writer.flush(file).await?;
        }
        Ok(())
    }

    /// Closes every handle belonging to `files`.
    pub async fn close_files(&self, files: &[TorrentFile]) {
        self.writer.close_all(files).await;
    }
}
