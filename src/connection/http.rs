//! BEP-19 web seed presented as a seeding peer.
//!
//! Frames written to the connection are interpreted locally: our handshake
//! is echoed back followed by `HaveAll`, `Interested` is answered with
//! `Unchoke`, and each `Request` becomes an HTTP `Range` GET whose body is
//! returned as a `Piece` frame. Other messages are ignored.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use reqwest::{header, Client, StatusCode};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{DisposeSignal, PeerAddress, Transport, TransportKind};
use crate::cache::BufferPool;
use crate::constants::{HTTP_CONNECT_TIMEOUT, HTTP_READ_TIMEOUT};
use crate::peer::{Handshake, Message, MessageId, PeerError, PeerId, HANDSHAKE_LEN};
use crate::torrent::TorrentContext;

#[derive(Debug)]
struct Outbound {
    buf: BytesMut,
    handshake_seen: bool,
}

#[derive(Debug)]
struct Inbound {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

/// An HTTP web seed transport.
#[derive(Debug)]
pub struct HttpConnection {
    address: PeerAddress,
    client: Client,
    piece_length: AtomicU64,
    total_length: AtomicU64,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    tx: mpsc::UnboundedSender<Bytes>,
    connected: AtomicBool,
    disposed: DisposeSignal,
}

/// What a complete frame written by the engine asks of the seed.
enum Action {
    Reply(Message),
    Fetch { index: u32, begin: u32, length: u32 },
}

impl HttpConnection {
    pub fn new(address: PeerAddress) -> Result<Self, PeerError> {
        let client = Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .read_timeout(HTTP_READ_TIMEOUT)
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();

        Ok(Self {
            address,
            client,
            piece_length: AtomicU64::new(0),
            total_length: AtomicU64::new(0),
            outbound: Mutex::new(Outbound {
                buf: BytesMut::new(),
                handshake_seen: false,
            }),
            inbound: Mutex::new(Inbound {
                rx,
                pending: Bytes::new(),
            }),
            tx,
            connected: AtomicBool::new(false),
            disposed: DisposeSignal::new(),
        })
    }

    fn push(&self, frame: Bytes) -> Result<(), PeerError> {
        self.tx.send(frame).map_err(|_| PeerError::ConnectionClosed)
    }

    fn push_message(&self, message: &Message) -> Result<(), PeerError> {
        let mut frame = vec![0u8; message.byte_length()];
        message.encode_into(&mut frame);
        self.push(Bytes::from(frame))
    }

    /// Splits complete frames off the outbound buffer.
    fn drain_frames(&self, out: &mut Outbound) -> Result<Vec<Action>, PeerError> {
        let mut actions = Vec::new();

        if !out.handshake_seen {
            if out.buf.len() < HANDSHAKE_LEN {
                return Ok(actions);
            }
            let ours = Handshake::decode(&out.buf.split_to(HANDSHAKE_LEN))?;
            out.handshake_seen = true;

            let seed_id = PeerId::generate();
            let reply = Handshake {
                info_hash: ours.info_hash,
                peer_id: *seed_id.as_bytes(),
                reserved: ours.reserved,
            };
            self.push(Bytes::copy_from_slice(&reply.encode()))?;
            actions.push(Action::Reply(Message::HaveAll));
        }

        while out.buf.len() >= 4 {
            let length = u32::from_be_bytes([out.buf[0], out.buf[1], out.buf[2], out.buf[3]]) as usize;
            if out.buf.len() < 4 + length {
                break;
            }
            let mut frame = out.buf.split_to(4 + length).freeze();
            frame.advance(4);
            if frame.is_empty() {
                continue;
            }

            match MessageId::try_from(frame.get_u8()) {
                Ok(MessageId::Interested) => actions.push(Action::Reply(Message::Unchoke)),
                Ok(MessageId::Request) if frame.remaining() >= 12 => actions.push(Action::Fetch {
                    index: frame.get_u32(),
                    begin: frame.get_u32(),
                    length: frame.get_u32(),
                }),
                _ => {}
            }
        }
        Ok(actions)
    }

    async fn fetch(&self, index: u32, begin: u32, length: u32) -> Result<Bytes, PeerError> {
        let piece_length = self.piece_length.load(Ordering::Acquire);
        let start = index as u64 * piece_length + begin as u64;
        let mut end = start + length as u64 - 1;
        let total = self.total_length.load(Ordering::Acquire);
        if total > 0 {
            end = end.min(total - 1);
        }

        debug!(url = %self.address, start, end, "web seed range request");
        let response = self
            .client
            .get(self.address.url().clone())
            .header(header::RANGE, format!("bytes={}-{}", start, end))
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => Ok(response.bytes().await?),
            StatusCode::OK => {
                // No range support: the whole resource came back.
                let body = response.bytes().await?;
                let from = start as usize;
                if from >= body.len() {
                    return Err(PeerError::Protocol("range beyond web seed content".into()));
                }
                let to = ((end + 1) as usize).min(body.len());
                Ok(body.slice(from..to))
            }
            status => Err(PeerError::Protocol(format!("web seed returned {}", status))),
        }
    }
}

#[async_trait]
impl Transport for HttpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        None
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn can_reconnect(&self) -> bool {
        false
    }

    fn is_incoming(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), PeerError> {
        if self.disposed.is_raised() {
            return Err(PeerError::Disposed);
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, PeerError> {
        if self.disposed.is_raised() {
            return Err(PeerError::Disposed);
        }

        let actions = {
            let mut out = self.outbound.lock().await;
            out.buf.extend_from_slice(buf);
            self.drain_frames(&mut out)?
        };

        for action in actions {
            match action {
                Action::Reply(message) => self.push_message(&message)?,
                Action::Fetch {
                    index,
                    begin,
                    length,
                } => {
                    let body = tokio::select! {
                        body = self.fetch(index, begin, length) => body?,
                        _ = self.disposed.wait() => return Err(PeerError::Disposed),
                    };
                    let piece = Message::Piece {
                        index,
                        begin,
                        data: BufferPool::shared().rent_copy(&body),
                    };
                    self.push_message(&piece)?;
                }
            }
        }
        Ok(buf.len())
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, PeerError> {
        let mut inbound = self.inbound.lock().await;

        if inbound.pending.is_empty() {
            let next = tokio::select! {
                chunk = inbound.rx.recv() => chunk,
                _ = self.disposed.wait() => return Err(PeerError::Disposed),
            };
            match next {
                Some(chunk) => inbound.pending = chunk,
                None => return Ok(0),
            }
        }

        let n = buf.len().min(inbound.pending.len());
        buf[..n].copy_from_slice(&inbound.pending[..n]);
        inbound.pending.advance(n);
        Ok(n)
    }

    fn dispose(&self) {
        if self.disposed.raise() {
            self.connected.store(false, Ordering::Release);
        }
    }

    fn attach_torrent(&self, context: &TorrentContext) {
        self.piece_length
            .store(context.piece_length, Ordering::Release);
        self.total_length
            .store(context.total_length, Ordering::Release);
    }
}
