use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("range {offset}+{length} outside {path} of {file_length} bytes")]
    OutOfRange {
        path: PathBuf,
        offset: u64,
        length: u64,
        file_length: u64,
    },

    #[error("short read: wanted {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("could not create directory {path}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not create file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("path traversal detected in file path: {0}")]
    PathTraversal(String),
}
