//! Length-prefixed message framing over a [`Transport`].
//!
//! Every network chunk is charged to the optional rate limiter and counted
//! as protocol traffic on the per-peer and per-torrent monitors. Piece
//! payloads are moved over to data accounting once the frame is known to
//! carry one.

use std::sync::Arc;

use tracing::trace;

use super::encryption::StreamCipher;
use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::bandwidth::RateLimiter;
use crate::cache::BufferPool;
use crate::connection::Transport;
use crate::constants::{CHUNK_LENGTH, MAX_MESSAGE_LENGTH};
use crate::monitor::ConnectionMonitor;
use crate::torrent::TorrentContext;

/// Where traffic for one transfer is charged.
#[derive(Clone, Copy, Default)]
pub struct Accounting<'a> {
    pub limiter: Option<&'a RateLimiter>,
    pub peer: Option<&'a ConnectionMonitor>,
    pub manager: Option<&'a ConnectionMonitor>,
}

impl<'a> Accounting<'a> {
    pub fn new(
        limiter: Option<&'a RateLimiter>,
        peer: Option<&'a ConnectionMonitor>,
        manager: Option<&'a ConnectionMonitor>,
    ) -> Self {
        Self {
            limiter,
            peer,
            manager,
        }
    }

    fn chunk_size(&self, remaining: usize) -> usize {
        match self.limiter {
            Some(limiter) if !limiter.is_unlimited() => remaining.min(CHUNK_LENGTH),
            _ => remaining,
        }
    }

    fn protocol_down(&self, bytes: usize) {
        for monitor in [self.peer, self.manager].into_iter().flatten() {
            monitor.protocol_down.add_delta(bytes as i64);
        }
    }

    fn protocol_up(&self, bytes: usize) {
        for monitor in [self.peer, self.manager].into_iter().flatten() {
            monitor.protocol_up.add_delta(bytes as i64);
        }
    }

    fn data_down(&self, bytes: usize) {
        for monitor in [self.peer, self.manager].into_iter().flatten() {
            monitor.reclassify_down(bytes as i64);
        }
    }

    fn data_up(&self, bytes: usize) {
        for monitor in [self.peer, self.manager].into_iter().flatten() {
            monitor.reclassify_up(bytes as i64);
        }
    }
}

/// Reads exactly `buf.len()` bytes. A zero-byte read means the remote closed.
pub async fn receive_exact(
    conn: &dyn Transport,
    buf: &mut [u8],
    accounting: Accounting<'_>,
) -> Result<(), PeerError> {
    let mut filled = 0;
    while filled < buf.len() {
        let size = accounting.chunk_size(buf.len() - filled);
        if let Some(limiter) = accounting.limiter {
            limiter.acquire(size).await;
        }

        let n = conn.receive(&mut buf[filled..filled + size]).await?;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        accounting.protocol_down(n);
        filled += n;
    }
    Ok(())
}

/// Writes all of `buf`.
pub async fn send_all(
    conn: &dyn Transport,
    buf: &[u8],
    accounting: Accounting<'_>,
) -> Result<(), PeerError> {
    let mut sent = 0;
    while sent < buf.len() {
        let size = accounting.chunk_size(buf.len() - sent);
        if let Some(limiter) = accounting.limiter {
            limiter.acquire(size).await;
        }

        let n = conn.send(&buf[sent..sent + size]).await?;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        accounting.protocol_up(n);
        sent += n;
    }
    Ok(())
}

pub async fn send_handshake(
    conn: &dyn Transport,
    encryptor: &mut dyn StreamCipher,
    handshake: &Handshake,
) -> Result<(), PeerError> {
    let mut frame = handshake.encode();
    encryptor.apply(&mut frame);
    send_all(conn, &frame, Accounting::default()).await
}

pub async fn receive_handshake(
    conn: &dyn Transport,
    decryptor: &mut dyn StreamCipher,
) -> Result<Handshake, PeerError> {
    let mut frame = [0u8; HANDSHAKE_LEN];
    receive_exact(conn, &mut frame, Accounting::default()).await?;
    decryptor.apply(&mut frame);
    Handshake::decode(&frame)
}

/// Reads and decodes one message.
///
/// An out-of-range length prefix disposes the connection before any of the
/// body is read.
pub async fn receive_message(
    conn: &dyn Transport,
    decryptor: &mut dyn StreamCipher,
    accounting: Accounting<'_>,
    context: &TorrentContext,
    pool: &Arc<BufferPool>,
) -> Result<Message, PeerError> {
    let mut prefix = [0u8; 4];
    receive_exact(conn, &mut prefix, accounting).await?;
    decryptor.apply(&mut prefix);

    let length = i32::from_be_bytes(prefix);
    if length < 0 || length as usize > MAX_MESSAGE_LENGTH {
        conn.dispose();
        return Err(PeerError::MessageTooLarge(length as i64));
    }
    if length == 0 {
        return Ok(Message::KeepAlive);
    }

    let mut body = pool.rent(length as usize);
    receive_exact(conn, &mut body, accounting).await?;
    decryptor.apply(&mut body);

    let message = Message::decode_body(&body, context, pool)?;
    if message.is_piece() {
        accounting.data_down(message.data_length());
    }
    trace!(?message, "received");
    Ok(message)
}

/// Encodes, encrypts and writes one message.
pub async fn send_message(
    conn: &dyn Transport,
    encryptor: &mut dyn StreamCipher,
    message: &Message,
    accounting: Accounting<'_>,
    pool: &Arc<BufferPool>,
) -> Result<(), PeerError> {
    let mut frame = pool.rent(message.byte_length());
    message.encode_into(&mut frame);
    encryptor.apply(&mut frame);
    send_all(conn, &frame, accounting).await?;

    if message.is_piece() {
        accounting.data_up(message.data_length());
    }
    Ok(())
}
