use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};

use super::error::PeerError;
use crate::cache::{BufferPool, PooledBuffer};
use crate::constants::BLOCK_SIZE;
use crate::torrent::TorrentContext;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved-bit for the fast extension (BEP-6), in byte 7.
const FAST_EXTENSION_BIT: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        let id = match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            13 => Suggest,
            14 => HaveAll,
            15 => HaveNone,
            16 => Reject,
            17 => AllowedFast,
            other => return Err(PeerError::InvalidMessageId(other)),
        };
        Ok(id)
    }
}

/// The fixed-length frame that opens every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// A handshake advertising the fast extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[7] = FAST_EXTENSION_BIT;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[7] & FAST_EXTENSION_BIT != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        let mut buf = &mut out[..];
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN || data[0] as usize != PROTOCOL.len() {
            return Err(PeerError::InvalidHandshake);
        }
        let (protocol, rest) = data[1..HANDSHAKE_LEN].split_at(PROTOCOL.len());
        if protocol != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut handshake = Self {
            info_hash: [0; 20],
            peer_id: [0; 20],
            reserved: [0; 8],
        };
        handshake.reserved.copy_from_slice(&rest[..8]);
        handshake.info_hash.copy_from_slice(&rest[8..28]);
        handshake.peer_id.copy_from_slice(&rest[28..48]);
        Ok(handshake)
    }
}

/// A length-prefixed peer wire message.
///
/// Piece payloads live in pooled buffers; dropping a [`Message::Piece`]
/// returns its buffer to the pool.
#[derive(Debug)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: PooledBuffer },
    Cancel { index: u32, begin: u32, length: u32 },
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
        };
        Some(id)
    }

    /// Length of the body, excluding the 4-byte length prefix.
    pub fn body_length(&self) -> usize {
        match self {
            Message::KeepAlive => 0,
            Message::Have { .. } | Message::Suggest { .. } | Message::AllowedFast { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request { .. } | Message::Cancel { .. } | Message::Reject { .. } => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            _ => 1,
        }
    }

    /// Full encoded length including the length prefix.
    pub fn byte_length(&self) -> usize {
        4 + self.body_length()
    }

    /// Payload bytes counted as data rather than protocol traffic.
    pub fn data_length(&self) -> usize {
        match self {
            Message::Piece { data, .. } => data.len(),
            _ => 0,
        }
    }

    pub fn is_piece(&self) -> bool {
        matches!(self, Message::Piece { .. })
    }

    /// Encodes into `out`, which must hold at least [`Message::byte_length`]
    /// bytes. Returns the number of bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> usize {
        let len = self.byte_length();
        let mut buf = &mut out[..len];
        buf.put_u32(self.body_length() as u32);
        let Some(id) = self.id() else {
            return len;
        };
        buf.put_u8(id as u8);

        match self {
            Message::Have { piece } | Message::Suggest { piece } | Message::AllowedFast { piece } => {
                buf.put_u32(*piece)
            }
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::Reject {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            _ => {}
        }
        len
    }

    /// Decodes a message body (everything after the length prefix).
    ///
    /// The torrent context bounds piece-carrying and bitfield messages; a
    /// context without metadata (zero pieces) skips those checks.
    pub fn decode_body(
        body: &[u8],
        context: &TorrentContext,
        pool: &Arc<BufferPool>,
    ) -> Result<Self, PeerError> {
        let Some((&first, mut data)) = body.split_first() else {
            return Ok(Message::KeepAlive);
        };
        let id = MessageId::try_from(first)?;

        let message = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::HaveAll => Message::HaveAll,
            MessageId::HaveNone => Message::HaveNone,
            MessageId::Have => Message::Have {
                piece: read_piece(&mut data, id)?,
            },
            MessageId::Suggest => Message::Suggest {
                piece: read_piece(&mut data, id)?,
            },
            MessageId::AllowedFast => Message::AllowedFast {
                piece: read_piece(&mut data, id)?,
            },
            MessageId::Request => {
                let (index, begin, length) = read_request(&mut data, id, context)?;
                Message::Request {
                    index,
                    begin,
                    length,
                }
            }
            MessageId::Cancel => {
                let (index, begin, length) = read_request(&mut data, id, context)?;
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
            MessageId::Reject => {
                let (index, begin, length) = read_request(&mut data, id, context)?;
                Message::Reject {
                    index,
                    begin,
                    length,
                }
            }
            MessageId::Bitfield => {
                let expected = context.bitfield_byte_length();
                if context.has_metadata() && data.len() != expected {
                    return Err(PeerError::InvalidMessage(format!(
                        "bitfield of {} bytes, expected {}",
                        data.len(),
                        expected
                    )));
                }
                Message::Bitfield(Bytes::copy_from_slice(data))
            }
            MessageId::Piece => {
                if data.len() < 8 {
                    return Err(too_short(id));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                check_block(context, index, begin, data.len())?;
                Message::Piece {
                    index,
                    begin,
                    data: pool.rent_copy(data),
                }
            }
        };
        Ok(message)
    }
}

fn too_short(id: MessageId) -> PeerError {
    PeerError::InvalidMessage(format!("{:?} message too short", id))
}

fn read_piece(data: &mut &[u8], id: MessageId) -> Result<u32, PeerError> {
    if data.len() < 4 {
        return Err(too_short(id));
    }
    Ok(data.get_u32())
}

fn read_block(data: &mut &[u8], id: MessageId) -> Result<(u32, u32, u32), PeerError> {
    if data.len() < 12 {
        return Err(too_short(id));
    }
    Ok((data.get_u32(), data.get_u32(), data.get_u32()))
}

/// Reads a request-shaped body, rejecting lengths above [`BLOCK_SIZE`]
/// and blocks outside the torrent.
fn read_request(
    data: &mut &[u8],
    id: MessageId,
    context: &TorrentContext,
) -> Result<(u32, u32, u32), PeerError> {
    let (index, begin, length) = read_block(data, id)?;
    if length == 0 || length as usize > BLOCK_SIZE {
        return Err(PeerError::InvalidMessage(format!("{:?} of {} bytes", id, length)));
    }
    check_block(context, index, begin, length as usize)?;
    Ok((index, begin, length))
}

/// Rejects a block that does not fit inside its piece.
fn check_block(
    context: &TorrentContext,
    index: u32,
    begin: u32,
    block_len: usize,
) -> Result<(), PeerError> {
    if !context.has_metadata() {
        return Ok(());
    }
    let piece_size = context
        .piece_size(index)
        .ok_or_else(|| PeerError::InvalidMessage(format!("piece index {} out of range", index)))?;
    if begin as u64 + block_len as u64 > piece_size {
        return Err(PeerError::InvalidMessage(format!(
            "block {}+{} exceeds piece {} of {} bytes",
            begin, block_len, index, piece_size
        )));
    }
    Ok(())
}

/// A block of piece data requested by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}
