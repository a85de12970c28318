use super::*;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::bandwidth::RateLimiter;
use crate::cache::BufferPool;
use crate::connection::{PeerAddress, Transport, TransportKind};
use crate::constants::{CHUNK_LENGTH, MAX_MESSAGE_LENGTH};
use crate::monitor::ConnectionMonitor;
use crate::torrent::TorrentContext;

/// In-memory transport fed from a byte queue.
#[derive(Debug)]
struct MockTransport {
    address: PeerAddress,
    inbound: Mutex<VecDeque<u8>>,
    sent: Mutex<Vec<Vec<u8>>>,
    bytes_read: AtomicUsize,
    disposed: AtomicBool,
}

impl MockTransport {
    fn new(inbound: &[u8]) -> Self {
        Self {
            address: PeerAddress::parse("ipv4://127.0.0.1:6881").unwrap(),
            inbound: Mutex::new(inbound.iter().copied().collect()),
            sent: Mutex::new(Vec::new()),
            bytes_read: AtomicUsize::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn sent_bytes(&self) -> Vec<u8> {
        self.sent.lock().concat()
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn address(&self) -> &PeerAddress {
        &self.address
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.address.socket_addr()
    }

    fn is_connected(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst)
    }

    fn can_reconnect(&self) -> bool {
        true
    }

    fn is_incoming(&self) -> bool {
        false
    }

    async fn connect(&self) -> Result<(), PeerError> {
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> Result<usize, PeerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PeerError::Disposed);
        }
        self.sent.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize, PeerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(PeerError::Disposed);
        }
        let mut inbound = self.inbound.lock();
        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        self.bytes_read.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// XORs every byte with a fixed key.
struct XorCipher(u8);

impl StreamCipher for XorCipher {
    fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            *byte ^= self.0;
        }
    }
}

fn context() -> TorrentContext {
    TorrentContext::new(16384, 16384 * 3 + 100)
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = (body.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

fn decode(body: &[u8]) -> Result<Message, PeerError> {
    Message::decode_body(body, &context(), &BufferPool::new())
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1, id2);
    assert_eq!(id1.client_id(), Some("PW0001"));
    assert!(PeerId::from_bytes(&[0u8; 19]).is_none());
    assert_eq!(PeerId::from_bytes(id1.as_bytes()), Some(id1));
}

#[test]
fn test_bitfield_spare_bits_and_completion() {
    let mut bf = Bitfield::new(10);
    assert_eq!(bf.byte_length(), 2);
    assert!(!bf.is_complete());

    bf.fill_from(&[0xFF, 0xFF]);
    assert_eq!(bf.count(), 10);
    assert!(bf.is_complete());
    assert_eq!(&bf.to_bytes()[..], &[0xFF, 0xC0]);

    bf.fill_from(&[0x80]);
    assert!(bf.has_piece(0));
    assert!(!bf.has_piece(9));
    bf.set_piece(42);
    assert_eq!(bf.count(), 1);

    bf.set_all();
    assert_eq!(bf, Bitfield::full(10));
}

#[test]
fn test_handshake_validation() {
    let handshake = Handshake::new([1u8; 20], [2u8; 20]);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), HANDSHAKE_LEN);
    assert_eq!(encoded[0] as usize, PROTOCOL.len());

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, [1u8; 20]);
    assert_eq!(decoded.peer_id, [2u8; 20]);
    assert!(decoded.supports_fast_extension());

    assert!(Handshake::decode(&encoded[..40]).is_err());
    assert!(Handshake::decode(&[0u8; HANDSHAKE_LEN]).is_err());
}

#[test]
fn test_message_decode_validation() {
    assert!(matches!(decode(&[]), Ok(Message::KeepAlive)));
    assert!(matches!(decode(&[4, 0, 0, 0, 7]), Ok(Message::Have { piece: 7 })));
    assert!(matches!(decode(&[4, 0, 0]), Err(PeerError::InvalidMessage(_))));
    assert!(matches!(decode(&[99]), Err(PeerError::InvalidMessageId(99))));

    // Four pieces need exactly one bitfield byte.
    assert!(matches!(decode(&[5, 0xF0]), Ok(Message::Bitfield(_))));
    assert!(decode(&[5, 0xF0, 0x00]).is_err());

    // The last piece is only 100 bytes long.
    let mut piece = vec![7, 0, 0, 0, 3, 0, 0, 0, 90];
    piece.extend_from_slice(&[1u8; 10]);
    match decode(&piece).unwrap() {
        Message::Piece { index, begin, data } => {
            assert_eq!((index, begin), (3, 90));
            assert_eq!(&data[..], &[1u8; 10]);
        }
        other => panic!("expected piece, got {:?}", other),
    }
    piece.push(1);
    assert!(decode(&piece).is_err());

    let out_of_range = [7, 0, 0, 0, 4, 0, 0, 0, 0, 1];
    assert!(decode(&out_of_range).unwrap_err().is_protocol_violation());
}

#[test]
fn test_request_decode_bounds() {
    let request = [6, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0x40, 0];
    assert!(matches!(
        decode(&request),
        Ok(Message::Request {
            index: 1,
            begin: 0,
            length: 16384
        })
    ));

    // Index past the last piece with a 4 GiB length.
    let huge = [6, 0, 0, 0, 0x7F, 0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF];
    assert!(decode(&huge).unwrap_err().is_protocol_violation());

    // One byte over a block, inside a valid piece.
    let oversized = [6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x40, 1];
    assert!(matches!(decode(&oversized), Err(PeerError::InvalidMessage(_))));

    let empty = [6, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    assert!(decode(&empty).is_err());

    // The last piece is only 100 bytes long.
    let past_end = [6, 0, 0, 0, 3, 0, 0, 0, 90, 0, 0, 0, 20];
    assert!(decode(&past_end).is_err());

    let cancel = [8, 0, 0, 0, 9, 0, 0, 0, 0, 0, 0, 0x40, 0];
    assert!(decode(&cancel).is_err());
    let reject = [16, 0, 0, 0, 2, 0, 0, 0, 0, 0, 1, 0, 0];
    assert!(decode(&reject).is_err());
    let reject = [16, 0, 0, 0, 2, 0, 0, 0x20, 0, 0, 0, 0x20, 0];
    assert!(matches!(decode(&reject), Ok(Message::Reject { .. })));
}

#[test]
fn test_message_encoding() {
    let pool = BufferPool::new();
    let message = Message::Request {
        index: 1,
        begin: 16384,
        length: 16384,
    };
    let mut out = vec![0u8; message.byte_length()];
    assert_eq!(message.encode_into(&mut out), 17);
    assert_eq!(out, frame(&[6, 0, 0, 0, 1, 0, 0, 64, 0, 0, 0, 64, 0]));

    let piece = Message::Piece {
        index: 2,
        begin: 0,
        data: pool.rent_copy(b"abc"),
    };
    assert!(piece.is_piece());
    assert_eq!(piece.data_length(), 3);
    assert_eq!(piece.byte_length(), 4 + 9 + 3);

    let bits = Message::Bitfield(Bytes::from_static(&[0xA0]));
    let mut out = vec![0u8; bits.byte_length()];
    bits.encode_into(&mut out);
    assert_eq!(out, frame(&[5, 0xA0]));
}

#[test]
fn test_encryption_types() {
    let all = EncryptionTypes::ALL;
    assert!(all.contains(EncryptionTypes::RC4_ALL));
    assert_eq!(all.without(EncryptionTypes::RC4_ALL), EncryptionTypes::PLAIN_TEXT);
    assert_eq!(
        EncryptionTypes::RC4_HEADER | EncryptionTypes::RC4_FULL,
        EncryptionTypes::RC4_ALL
    );
    assert!(!EncryptionTypes::PLAIN_TEXT.intersects(EncryptionTypes::RC4_ALL));
    assert!(EncryptionTypes::from_bits(0xF8).is_empty());
    assert_eq!(
        format!("{:?}", EncryptionTypes::RC4_ALL),
        "EncryptionTypes(RC4Header|RC4Full)"
    );
}

#[test]
fn test_peer_record_counters() {
    let peer = Peer::new(
        PeerAddress::parse("ipv4://10.0.0.1:6881").unwrap(),
        EncryptionTypes::ALL,
    );
    assert_eq!(peer.record_failed_attempt(), 1);
    assert_eq!(peer.record_failed_attempt(), 2);
    assert_eq!(peer.record_cleanup(), 1);
    assert_eq!(peer.failed_attempts(), 2);
    assert_eq!(peer.cleaned_up(), 1);

    peer.forbid_encryption(EncryptionTypes::PLAIN_TEXT);
    assert_eq!(peer.allowed_encryption(), EncryptionTypes::RC4_ALL);
    peer.forbid_encryption(EncryptionTypes::RC4_ALL);
    assert!(peer.allowed_encryption().is_empty());

    assert!(peer.peer_id().is_none());
    peer.set_peer_id(PeerId([3u8; 20]));
    assert_eq!(peer.peer_id(), Some(PeerId([3u8; 20])));
}

#[tokio::test]
async fn test_receive_message_with_cipher() {
    let mut wire = frame(&[4, 0, 0, 0, 2]);
    wire.extend_from_slice(&frame(&[]));
    XorCipher(0x5A).apply(&mut wire);

    let conn = MockTransport::new(&wire);
    let pool = BufferPool::new();
    let mut cipher = XorCipher(0x5A);
    let first = io::receive_message(&conn, &mut cipher, Default::default(), &context(), &pool)
        .await
        .unwrap();
    assert!(matches!(first, Message::Have { piece: 2 }));
    let second = io::receive_message(&conn, &mut cipher, Default::default(), &context(), &pool)
        .await
        .unwrap();
    assert!(matches!(second, Message::KeepAlive));

    // Nothing left: the remote closed.
    let closed = io::receive_message(&conn, &mut cipher, Default::default(), &context(), &pool).await;
    assert!(matches!(closed, Err(PeerError::ConnectionClosed)));
}

#[tokio::test]
async fn test_oversized_frame_disposes_before_body() {
    let mut wire = ((MAX_MESSAGE_LENGTH + 1) as u32).to_be_bytes().to_vec();
    wire.extend_from_slice(&[7u8; 64]);
    let conn = MockTransport::new(&wire);

    let result = io::receive_message(
        &conn,
        &mut PlainText,
        Default::default(),
        &context(),
        &BufferPool::new(),
    )
    .await;
    assert!(matches!(result, Err(PeerError::MessageTooLarge(_))));
    assert!(!conn.is_connected());
    assert_eq!(conn.bytes_read.load(Ordering::SeqCst), 4);

    let negative = MockTransport::new(&(-1i32).to_be_bytes());
    let result = io::receive_message(
        &negative,
        &mut PlainText,
        Default::default(),
        &context(),
        &BufferPool::new(),
    )
    .await;
    assert!(matches!(result, Err(PeerError::MessageTooLarge(-1))));
}

#[tokio::test]
async fn test_piece_bytes_reclassified_as_data() {
    let mut body = vec![7, 0, 0, 0, 0, 0, 0, 0, 0];
    body.extend_from_slice(&[9u8; 100]);
    let conn = MockTransport::new(&frame(&body));

    let peer_monitor = ConnectionMonitor::new();
    let torrent_monitor = ConnectionMonitor::new();
    let accounting = io::Accounting::new(None, Some(&peer_monitor), Some(&torrent_monitor));
    let message = io::receive_message(
        &conn,
        &mut PlainText,
        accounting,
        &context(),
        &BufferPool::new(),
    )
    .await
    .unwrap();
    assert_eq!(message.data_length(), 100);

    for monitor in [&peer_monitor, &torrent_monitor] {
        assert_eq!(monitor.data_down.total(), 100);
        assert_eq!(monitor.protocol_down.total(), 13);
    }
}

#[tokio::test]
async fn test_rate_limited_send_is_chunked() {
    let conn = MockTransport::new(&[]);
    let pool = BufferPool::new();
    let limiter = RateLimiter::new(1024 * 1024);
    let monitor = ConnectionMonitor::new();
    let message = Message::Piece {
        index: 0,
        begin: 0,
        data: pool.rent_copy(&[1u8; 5000]),
    };

    let accounting = io::Accounting::new(Some(limiter.as_ref()), Some(&monitor), None);
    io::send_message(&conn, &mut XorCipher(0xFF), &message, accounting, &pool)
        .await
        .unwrap();

    let chunks = conn.sent.lock().clone();
    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|c| c.len() <= CHUNK_LENGTH));
    let wire = conn.sent_bytes();
    assert_eq!(wire.len(), 5013);
    // 5009 = 0x1391, XORed with 0xFF.
    assert_eq!(&wire[..4], &[0xFF, 0xFF, 0xEC, 0x6E]);
    assert_eq!(monitor.data_up.total(), 5000);
    assert_eq!(monitor.protocol_up.total(), 13);
}

#[tokio::test]
async fn test_handshake_io() {
    let theirs = Handshake::new([4u8; 20], [5u8; 20]);
    let conn = MockTransport::new(&theirs.encode());

    let ours = Handshake::new([4u8; 20], [6u8; 20]);
    io::send_handshake(&conn, &mut PlainText, &ours).await.unwrap();
    assert_eq!(conn.sent_bytes(), ours.encode().to_vec());

    let received = io::receive_handshake(&conn, &mut PlainText).await.unwrap();
    assert_eq!(received.peer_id, [5u8; 20]);
}

#[tokio::test]
async fn test_session_queue_and_dispose() {
    let peer = Arc::new(Peer::new(
        PeerAddress::parse("ipv4://10.0.0.2:6881").unwrap(),
        EncryptionTypes::ALL,
    ));
    let transport = Arc::new(MockTransport::new(&[]));
    let session = PeerSession::new(Arc::clone(&peer), transport.clone(), 4);
    assert_eq!(session.bitfield().len(), 4);
    assert!(session.am_choking());

    assert!(!session.begin_processing());
    assert!(session.enqueue(Outgoing::Message(Message::Interested)));
    assert!(!session.enqueue(Outgoing::Piece(BlockRequest::new(0, 0, 16))));
    assert!(session.is_processing_queue());
    assert_eq!(session.queue_len(), 2);

    assert!(matches!(
        session.next_outgoing(),
        Some(Outgoing::Message(Message::Interested))
    ));
    session.stop_processing();
    assert!(session.begin_processing());
    assert!(matches!(session.next_outgoing(), Some(Outgoing::Piece(_))));
    assert!(session.next_outgoing().is_none());
    assert!(!session.is_processing_queue());

    session.add_requesting_piece();
    session.piece_sent();
    session.piece_sent();
    assert_eq!(session.pieces_sent(), 2);
    assert_eq!(session.requesting_pieces(), 0);

    session.add_requesting_piece();
    session.add_requesting_piece();
    session.piece_abandoned();
    assert_eq!(session.requesting_pieces(), 1);
    assert_eq!(session.pieces_sent(), 2);

    let pair = EncryptorPair {
        encryptor: Box::new(XorCipher(1)),
        decryptor: Box::new(XorCipher(1)),
        kind: EncryptionTypes::RC4_FULL,
        handshake_sent: false,
    };
    session.install_encryption(pair).await;
    assert_eq!(session.encryption(), EncryptionTypes::RC4_FULL);

    let pex = tokio::spawn(std::future::pending::<()>());
    session.set_pex(pex.abort_handle());
    session.enqueue(Outgoing::Message(Message::Choke));
    assert!(session.dispose());
    assert!(!session.dispose());
    assert!(session.is_disposed());
    assert!(!transport.is_connected());
    assert_eq!(session.queue_len(), 0);
    assert_eq!(session.requesting_pieces(), 0);
    assert!(pex.await.unwrap_err().is_cancelled());
}
