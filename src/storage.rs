//! Disk storage behind a bounded file-handle cache.
//!
//! Torrent data is addressed by absolute offset and may span several files.
//! [`DiskManager`] maps offsets onto the ordered [`TorrentFile`] list and
//! hands each piece of the range to a [`DiskWriter`], which serializes I/O
//! over a [`FileStreamCache`] of open handles.
//!
//! # Components
//!
//! - [`TorrentFile`] - A file within the torrent, with its [`Priority`]
//! - [`FileStreamCache`] - LRU cache of open handles with a fixed capacity
//! - [`DiskWriter`] - Serialized read/write/flush/close/move
//! - [`DiskManager`] - Torrent offset to file span mapping
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::storage::{DiskManager, DiskWriter, TorrentFile};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let files = vec![
//!     TorrentFile::new("downloads/a.bin", 1000, 0),
//!     TorrentFile::new("downloads/b.bin", 500, 1000),
//! ];
//! let disk = DiskManager::new(Arc::new(DiskWriter::new(20)));
//!
//! // A block straddling both files.
//! disk.write(&files, 900, &[0u8; 200]).await?;
//!
//! let mut buf = [0u8; 200];
//! disk.read_exact(&files, 900, &mut buf).await?;
//! disk.close_files(&files).await;
//! # Ok(())
//! # }
//! ```

mod error;
mod file;
mod manager;
mod stream_cache;
mod writer;


pub use error::StorageError;
pub use file::{file_spans, FileAccess, FileSpan, Priority, TorrentFile};
pub use manager::DiskManager;
pub use stream_cache::{FileStreamCache, TorrentFileStream};
pub use writer::DiskWriter;
