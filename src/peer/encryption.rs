use std::fmt;
use std::ops::{BitAnd, BitOr};

use async_trait::async_trait;

use super::error::PeerError;
use super::io;
use super::message::Handshake;
use crate::connection::Transport;

/// Set of connection encryption modes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EncryptionTypes(u8);

impl EncryptionTypes {
    pub const NONE: Self = Self(0);
    pub const PLAIN_TEXT: Self = Self(1);
    /// Only the handshake is obfuscated.
    pub const RC4_HEADER: Self = Self(2);
    /// The whole stream is obfuscated.
    pub const RC4_FULL: Self = Self(4);
    pub const RC4_ALL: Self = Self(2 | 4);
    pub const ALL: Self = Self(1 | 2 | 4);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for EncryptionTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EncryptionTypes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EncryptionTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::PLAIN_TEXT) {
            names.push("PlainText");
        }
        if self.contains(Self::RC4_HEADER) {
            names.push("RC4Header");
        }
        if self.contains(Self::RC4_FULL) {
            names.push("RC4Full");
        }
        if names.is_empty() {
            names.push("None");
        }
        write!(f, "EncryptionTypes({})", names.join("|"))
    }
}

/// One direction of an obfuscated stream. Transforms bytes in place.
pub trait StreamCipher: Send {
    fn apply(&mut self, data: &mut [u8]);
}

/// The identity cipher used for unencrypted connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainText;

impl StreamCipher for PlainText {
    fn apply(&mut self, _data: &mut [u8]) {}
}

/// The ciphers agreed for a connection.
pub struct EncryptorPair {
    pub encryptor: Box<dyn StreamCipher>,
    pub decryptor: Box<dyn StreamCipher>,
    /// The single mode that was negotiated.
    pub kind: EncryptionTypes,
    /// True when the negotiator already delivered our handshake inside the
    /// encrypted preamble.
    pub handshake_sent: bool,
}

impl EncryptorPair {
    pub fn plain_text() -> Self {
        Self {
            encryptor: Box::new(PlainText),
            decryptor: Box::new(PlainText),
            kind: EncryptionTypes::PLAIN_TEXT,
            handshake_sent: false,
        }
    }
}

impl fmt::Debug for EncryptorPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptorPair")
            .field("kind", &self.kind)
            .field("handshake_sent", &self.handshake_sent)
            .finish()
    }
}

/// Agrees an encryption mode with a remote peer on a connected transport.
#[async_trait]
pub trait EncryptionNegotiator: Send + Sync {
    /// Negotiates for an outgoing connection, restricted to `allowed`.
    async fn outgoing(
        &self,
        transport: &dyn Transport,
        allowed: EncryptionTypes,
        handshake: &Handshake,
    ) -> Result<EncryptorPair, PeerError>;
}

/// Negotiator that only speaks plain text.
///
/// Peers whose allowed set no longer includes plain text cannot be served
/// and fail negotiation.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextNegotiator;

#[async_trait]
impl EncryptionNegotiator for PlainTextNegotiator {
    async fn outgoing(
        &self,
        transport: &dyn Transport,
        allowed: EncryptionTypes,
        handshake: &Handshake,
    ) -> Result<EncryptorPair, PeerError> {
        if !allowed.contains(EncryptionTypes::PLAIN_TEXT) {
            return Err(PeerError::Encryption(format!(
                "no supported mode in {:?}",
                allowed
            )));
        }

        let mut pair = EncryptorPair::plain_text();
        io::send_handshake(transport, pair.encryptor.as_mut(), handshake).await?;
        pair.handshake_sent = true;
        Ok(pair)
    }
}
