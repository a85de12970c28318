//! A minimal uTP (BEP-29) client.
//!
//! Each connection owns a connected UDP socket and a reader task. Data is
//! sent stop-and-wait: one packet in flight, retransmitted on ack timeout.
//! Only outgoing connections are supported.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{DisposeSignal, PeerAddress, Transport, TransportKind};
use crate::constants::{
    UTP_ACK_TIMEOUT, UTP_HEADER_LEN, UTP_MAX_RETRANSMITS, UTP_PAYLOAD_MAX, UTP_VERSION,
    UTP_WINDOW_SIZE,
};
use crate::peer::PeerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

impl PacketType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PacketType::Data),
            1 => Some(PacketType::Fin),
            2 => Some(PacketType::State),
            3 => Some(PacketType::Reset),
            4 => Some(PacketType::Syn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Header {
    packet_type: PacketType,
    connection_id: u16,
    seq_nr: u16,
    ack_nr: u16,
}

impl Header {
    fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(UTP_HEADER_LEN + payload.len());
        buf.put_u8(((self.packet_type as u8) << 4) | UTP_VERSION);
        buf.put_u8(0);
        buf.put_u16(self.connection_id);
        buf.put_u32(timestamp_us());
        buf.put_u32(0);
        buf.put_u32(UTP_WINDOW_SIZE);
        buf.put_u16(self.seq_nr);
        buf.put_u16(self.ack_nr);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn decode(data: &[u8]) -> Option<(Self, &[u8])> {
        if data.len() < UTP_HEADER_LEN {
            return None;
        }
        let mut buf = data;
        let ver_type = buf.get_u8();
        if ver_type & 0x0F != UTP_VERSION {
            return None;
        }
        let packet_type = PacketType::from_u8(ver_type >> 4)?;
        let mut extension = buf.get_u8();
        let connection_id = buf.get_u16();
        buf.advance(12); // timestamp, timestamp diff, window
        let seq_nr = buf.get_u16();
        let ack_nr = buf.get_u16();

        while extension != 0 {
            if buf.remaining() < 2 {
                return None;
            }
            extension = buf.get_u8();
            let len = buf.get_u8() as usize;
            if buf.remaining() < len {
                return None;
            }
            buf.advance(len);
        }

        Some((
            Header {
                packet_type,
                connection_id,
                seq_nr,
                ack_nr,
            },
            buf,
        ))
    }
}

fn timestamp_us() -> u32 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u32
}

/// True if `seq` is at or before `ack`, allowing for wrap-around.
fn seq_acked(seq: u16, ack: u16) -> bool {
    ack.wrapping_sub(seq) < 0x8000
}

#[derive(Debug)]
struct Sequence {
    recv_id: u16,
    send_id: u16,
    seq_nr: u16,
    ack_nr: u16,
}

#[derive(Debug)]
struct Inbound {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

#[derive(Debug)]
struct Shared {
    socket: UdpSocket,
    seq: Mutex<Sequence>,
    // Highest ack_nr received from the remote.
    acked: watch::Sender<Option<u16>>,
    // Remote seq_nr from the SYN reply, once connected.
    established: watch::Sender<Option<u16>>,
    closed: AtomicBool,
}

impl Shared {
    async fn send_packet(&self, header: Header, payload: &[u8]) -> Result<(), PeerError> {
        self.socket.send(&header.encode(payload)).await?;
        Ok(())
    }

    fn state_header(&self) -> Header {
        let seq = self.seq.lock();
        Header {
            packet_type: PacketType::State,
            connection_id: seq.send_id,
            seq_nr: seq.seq_nr,
            ack_nr: seq.ack_nr,
        }
    }
}

/// A uTP transport.
#[derive(Debug)]
pub struct UtpConnection {
    address: PeerAddress,
    endpoint: SocketAddr,
    shared: tokio::sync::Mutex<Option<Arc<Shared>>>,
    inbound: tokio::sync::Mutex<Option<Inbound>>,
    send_turn: tokio::sync::Mutex<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    disposed: DisposeSignal,
}

impl UtpConnection {
    pub fn new(address: PeerAddress, endpoint: SocketAddr) -> Self {
        Self {
            address,
            endpoint,
            shared: tokio::sync::Mutex::new(None),
            inbound: tokio::sync::Mutex::new(None),
            send_turn: tokio::sync::Mutex::new(()),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            disposed: DisposeSignal::new(),
        }
    }

    async fn shared(&self) -> Result<Arc<Shared>, PeerError> {
        self.shared
            .lock()
            .await
            .clone()
            .ok_or(PeerError::ConnectionClosed)
    }

    async fn handshake(&self, shared: &Shared) -> Result<(), PeerError> {
        let syn = {
            let mut seq = shared.seq.lock();
            let header = Header {
                packet_type: PacketType::Syn,
                connection_id: seq.recv_id,
                seq_nr: seq.seq_nr,
                ack_nr: 0,
            };
            seq.seq_nr = seq.seq_nr.wrapping_add(1);
            header
        };

        let mut established = shared.established.subscribe();
        for attempt in 0..=UTP_MAX_RETRANSMITS {
            trace!(endpoint = %self.endpoint, attempt, "utp syn");
            shared.send_packet(syn, &[]).await?;
            let wait = tokio::time::timeout(UTP_ACK_TIMEOUT * (attempt + 1), async {
                established.wait_for(|remote| remote.is_some()).await.is_ok()
            });
            tokio::select! {
                result = wait => match result {
                    Ok(true) => return Ok(()),
                    Ok(false) => return Err(PeerError::ConnectionClosed),
                    Err(_) => {
                        if shared.closed.load(Ordering::Acquire) {
                            return Err(PeerError::ConnectionClosed);
                        }
                    }
                },
                _ = self.disposed.wait() => return Err(PeerError::Disposed),
            }
        }
        Err(PeerError::Timeout)
    }
}

async fn read_loop(shared: Arc<Shared>, tx: mpsc::UnboundedSender<Bytes>) {
    let mut buf = vec![0u8; UTP_HEADER_LEN + UTP_PAYLOAD_MAX + 256];
    loop {
        let n = match shared.socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "utp socket error");
                break;
            }
        };
        let Some((header, payload)) = Header::decode(&buf[..n]) else {
            continue;
        };
        if header.connection_id != shared.seq.lock().recv_id {
            continue;
        }

        match header.packet_type {
            PacketType::State => {
                if shared.established.borrow().is_none() {
                    shared.seq.lock().ack_nr = header.seq_nr.wrapping_sub(1);
                    shared.established.send_replace(Some(header.seq_nr));
                }
                shared.acked.send_replace(Some(header.ack_nr));
            }
            PacketType::Data => {
                let accepted = {
                    let mut seq = shared.seq.lock();
                    if header.seq_nr == seq.ack_nr.wrapping_add(1) {
                        seq.ack_nr = header.seq_nr;
                        true
                    } else {
                        false
                    }
                };
                if accepted
                    && !payload.is_empty()
                    && tx.send(Bytes::copy_from_slice(payload)).is_err()
                {
                    break;
                }
                shared.acked.send_replace(Some(header.ack_nr));
                if shared.send_packet(shared.state_header(), &[]).await.is_err() {
                    break;
                }
            }
            PacketType::Fin | PacketType::Reset => {
                trace!(kind = ?header.packet_type, "utp remote closed");
                break;
            }
            PacketType::Syn => {}
        }
    }
    shared.closed.store(true, Ordering::Release);
    // Wake a pending handshake or ack wait.
    shared.acked.send_replace(None);
}

#[async_trait]
impl Transport for UtpConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Utp
    }

    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        Some(self.endpoint)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn can_reconnect(&self) -> bool {
        true
    }

    fn is_incoming(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), PeerError> {
        if self.disposed.is_raised() {
            return Err(PeerError::Disposed);
        }

        let bind: SocketAddr = if self.endpoint.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.endpoint).await?;

        let recv_id: u16 = rand::rng().random();
        let shared = Arc::new(Shared {
            socket,
            seq: Mutex::new(Sequence {
                recv_id,
                send_id: recv_id.wrapping_add(1),
                seq_nr: 1,
                ack_nr: 0,
            }),
            acked: watch::Sender::new(None),
            established: watch::Sender::new(None),
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().await = Some(Inbound {
            rx,
            pending: Bytes::new(),
        });
        *self.shared.lock().await = Some(Arc::clone(&shared));
        *self.reader.lock() = Some(tokio::spawn(read_loop(Arc::clone(&shared), tx)));

        self.handshake(&shared).await?;
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, PeerError> {
        let shared = self.shared().await?;
        let _turn = self.send_turn.lock().await;
        let payload = &buf[..buf.len().min(UTP_PAYLOAD_MAX)];

        let header = {
            let mut seq = shared.seq.lock();
            let header = Header {
                packet_type: PacketType::Data,
                connection_id: seq.send_id,
                seq_nr: seq.seq_nr,
                ack_nr: seq.ack_nr,
            };
            seq.seq_nr = seq.seq_nr.wrapping_add(1);
            header
        };

        let mut acked = shared.acked.subscribe();
        for _ in 0..=UTP_MAX_RETRANSMITS {
            if shared.closed.load(Ordering::Acquire) {
                return Err(PeerError::ConnectionClosed);
            }
            shared.send_packet(header, payload).await?;

            let wait = tokio::time::timeout(UTP_ACK_TIMEOUT, async {
                acked
                    .wait_for(|ack| match ack {
                        Some(ack) => seq_acked(header.seq_nr, *ack),
                        None => shared.closed.load(Ordering::Acquire),
                    })
                    .await
                    .is_ok()
            });
            tokio::select! {
                result = wait => match result {
                    Ok(true) if !shared.closed.load(Ordering::Acquire) => return Ok(payload.len()),
                    Ok(_) => return Err(PeerError::ConnectionClosed),
                    Err(_) => trace!(seq = header.seq_nr, "utp retransmit"),
                },
                _ = self.disposed.wait() => return Err(PeerError::Disposed),
            }
        }
        Err(PeerError::Timeout)
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, PeerError> {
        let mut guard = self.inbound.lock().await;
        let inbound = guard.as_mut().ok_or(PeerError::ConnectionClosed)?;

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
        if !self.disposed.raise() {
            return;
        }
        self.connected.store(false, Ordering::Release);

        if let Ok(guard) = self.shared.try_lock() {
            if let Some(shared) = guard.as_ref() {
                let fin = {
                    let seq = shared.seq.lock();
                    Header {
                        packet_type: PacketType::Fin,
                        connection_id: seq.send_id,
                        seq_nr: seq.seq_nr,
                        ack_nr: seq.ack_nr,
                    }
                };
                // Best effort; the remote times out otherwise.
                let _ = shared.socket.try_send(&fin.encode(&[]));
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
