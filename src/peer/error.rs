use std::fmt;

use thiserror::Error;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer sent an invalid handshake.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash doesn't match ours.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Received a malformed protocol message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Received an unknown message ID.
    #[error("invalid message id: {0}")]
    InvalidMessageId(u8),

    /// A frame declared a body longer than we accept.
    #[error("invalid message length received: {0}")]
    MessageTooLarge(i64),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The transport was disposed locally.
    #[error("connection disposed")]
    Disposed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Encryption negotiation failed.
    #[error("encryption negotiation failed: {0}")]
    Encryption(String),

    /// HTTP seed request failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PeerError {
    /// True when the error came from a malformed frame rather than the link.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::InvalidHandshake
                | PeerError::InvalidMessage(_)
                | PeerError::InvalidMessageId(_)
                | PeerError::MessageTooLarge(_)
                | PeerError::Protocol(_)
        )
    }
}

/// Why an outgoing connection attempt was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailureReason {
    /// The transport could not connect.
    Unreachable,
    /// Building the encrypted channel or sending our handshake failed.
    EncryptionNegotiationFailed,
    /// The peer's handshake was missing, malformed or for another torrent.
    HandshakeFailed,
    /// The peer broke the wire protocol.
    ProtocolError,
    /// The disk layer failed while serving this peer.
    IoError,
    /// Anything else while setting up the established session.
    Unknown,
}

impl fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionFailureReason::Unreachable => "unreachable",
            ConnectionFailureReason::EncryptionNegotiationFailed => "encryption negotiation failed",
            ConnectionFailureReason::HandshakeFailed => "handshake failed",
            ConnectionFailureReason::ProtocolError => "protocol error",
            ConnectionFailureReason::IoError => "io error",
            ConnectionFailureReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}
