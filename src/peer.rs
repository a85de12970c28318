//! Peer wire protocol (BEP-3, BEP-6, BEP-10)
//!
//! Message types and framing, encryption negotiation, and the per-peer
//! records the connection manager keeps: a durable [`Peer`] that survives
//! reconnects and a [`PeerSession`] for each live connection.

mod bitfield;
mod encryption;
mod error;
pub mod io;
mod message;
mod peer_id;
mod record;
mod session;

pub use bitfield::Bitfield;
pub use encryption::{
    EncryptionNegotiator, EncryptionTypes, EncryptorPair, PlainText, PlainTextNegotiator,
    StreamCipher,
};
pub use error::{ConnectionFailureReason, PeerError};
pub use message::{BlockRequest, Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
pub use record::Peer;
pub use session::{Outgoing, PeerSession};

#[cfg(test)]
mod tests;
