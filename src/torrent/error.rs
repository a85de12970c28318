use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("tracker returned error: {0}")]
    Failure(String),

    #[error("timeout")]
    Timeout,

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Why a torrent entered the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    ReadFailure,
    WriteFailure,
}

impl fmt::Display for ErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorReason::ReadFailure => f.write_str("read failure"),
            ErrorReason::WriteFailure => f.write_str("write failure"),
        }
    }
}

/// The first fatal error a torrent hit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}: {message}")]
pub struct TorrentError {
    pub reason: ErrorReason,
    pub message: String,
}
