use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection::{PeerAddress, TcpConnection, Transport, TransportKind};
use crate::peer::{
    BlockRequest, ConnectionFailureReason, EncryptionNegotiator, EncryptionTypes, EncryptorPair,
    Handshake, Message, Outgoing, Peer, PeerError, PeerId, PeerSession, PlainTextNegotiator,
    HANDSHAKE_LEN,
};
use crate::settings::{EngineSettings, ProtocolPolicy};
use crate::storage::{DiskManager, DiskWriter, TorrentFile};
use crate::torrent::{
    Announcer, ErrorReason, MessageHandler, PiecePicker, TorrentContext, TorrentManager,
    TorrentMode, TrackerError, TrackerEvent,
};

const INFO_HASH: [u8; 20] = [0xAB; 20];
const REMOTE_ID: [u8; 20] = [9; 20];

#[derive(Default)]
struct RecordingHandler {
    connected: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

impl MessageHandler for RecordingHandler {
    fn handle_peer_connected(&self, _session: &Arc<PeerSession>) -> Vec<Outgoing> {
        self.connected.fetch_add(1, Ordering::SeqCst);
        Vec::new()
    }

    fn handle_message(
        &self,
        _session: &Arc<PeerSession>,
        message: Message,
    ) -> Result<Vec<Outgoing>, PeerError> {
        self.messages.lock().push(format!("{:?}", message));
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct CountingPicker {
    cancelled: AtomicUsize,
    resets: AtomicUsize,
}

impl PiecePicker for CountingPicker {
    fn cancel_requests(&self, _session: &PeerSession) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}

struct PanickingPicker;

impl PiecePicker for PanickingPicker {
    fn cancel_requests(&self, _session: &PeerSession) {
        panic!("picker failure");
    }

    fn reset(&self) {}
}

/// Records the event, then never finishes.
#[derive(Default)]
struct HangingAnnouncer {
    events: Mutex<Vec<TrackerEvent>>,
}

#[async_trait]
impl Announcer for HangingAnnouncer {
    async fn announce(&self, event: TrackerEvent) -> Result<(), TrackerError> {
        self.events.lock().push(event);
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Fails the first `failures` negotiations, then speaks plain text.
struct FlakyNegotiator {
    failures: AtomicUsize,
}

#[async_trait]
impl EncryptionNegotiator for FlakyNegotiator {
    async fn outgoing(
        &self,
        transport: &dyn Transport,
        allowed: EncryptionTypes,
        handshake: &Handshake,
    ) -> Result<EncryptorPair, PeerError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PeerError::Encryption("negotiation refused".into()));
        }
        PlainTextNegotiator.outgoing(transport, allowed, handshake).await
    }
}

struct Harness {
    engine: Arc<ConnectionManager>,
}

fn harness(settings: EngineSettings) -> Harness {
    harness_with(settings, Arc::new(PlainTextNegotiator))
}

fn harness_with(settings: EngineSettings, negotiator: Arc<dyn EncryptionNegotiator>) -> Harness {
    let disk = DiskManager::new(Arc::new(DiskWriter::new(4)));
    Harness {
        engine: ConnectionManager::new(PeerId::generate(), settings, negotiator, disk),
    }
}

fn torrent(context: TorrentContext, handler: Arc<RecordingHandler>) -> Arc<TorrentManager> {
    Arc::new(
        TorrentManager::new(INFO_HASH, context, Vec::new())
            .with_mode(TorrentMode::Downloading)
            .with_handler(handler),
    )
}

fn peer_at(addr: std::net::SocketAddr) -> Arc<Peer> {
    Arc::new(Peer::new(
        PeerAddress::from_socket_addr(addr).unwrap(),
        EncryptionTypes::ALL,
    ))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn next_failure(
    rx: &mut broadcast::Receiver<ConnectionEvent>,
) -> (Arc<Peer>, ConnectionFailureReason, Arc<TorrentManager>) {
    loop {
        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event in time")
            .unwrap();
        if let ConnectionEvent::AttemptFailed {
            peer,
            reason,
            torrent,
        } = event
        {
            return (peer, reason, torrent);
        }
    }
}

/// Reads our handshake and answers with a valid one.
async fn answer_handshake(stream: &mut TcpStream) -> Handshake {
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.unwrap();
    let ours = Handshake::decode(&buf).unwrap();
    stream
        .write_all(&Handshake::new(INFO_HASH, REMOTE_ID).encode())
        .await
        .unwrap();
    ours
}

async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let remote = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (ours, _) = listener.accept().await.unwrap();
    (ours, remote)
}

fn incoming_session(stream: TcpStream, piece_count: usize) -> Arc<PeerSession> {
    let address = PeerAddress::from_socket_addr(stream.peer_addr().unwrap()).unwrap();
    let transport = Arc::new(TcpConnection::from_stream(stream, address.clone()).unwrap());
    let peer = Arc::new(Peer::new(address, EncryptionTypes::ALL));
    peer.set_peer_id(PeerId::from_bytes(&REMOTE_ID).unwrap());
    PeerSession::new(peer, transport, piece_count)
}

#[tokio::test]
async fn test_outgoing_connect_established() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let h = harness(EngineSettings::default());
    let handler = Arc::new(RecordingHandler::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::clone(&handler));
    let peer = peer_at(addr);
    torrent.peers().add_available(Arc::clone(&peer));
    h.engine.add(Arc::clone(&torrent));

    let local_id = *h.engine.local_peer_id().as_bytes();
    let remote = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let ours = answer_handshake(&mut stream).await;
        assert_eq!(ours.info_hash, INFO_HASH);
        assert_eq!(ours.peer_id, local_id);
        // Have piece 2.
        stream.write_all(&[0, 0, 0, 5, 4, 0, 0, 0, 2]).await.unwrap();
        stream
    });

    h.engine.try_connect();
    let _stream = remote.await.unwrap();
    wait_until(|| !handler.messages.lock().is_empty()).await;

    assert_eq!(handler.connected.load(Ordering::SeqCst), 1);
    assert_eq!(handler.messages.lock()[0], "Have { piece: 2 }");
    assert_eq!(h.engine.open_connections(), 1);
    assert_eq!(h.engine.half_open_connections(), 0);
    assert_eq!(peer.peer_id(), PeerId::from_bytes(&REMOTE_ID));

    let session = Arc::clone(&torrent.peers().connected[0]);
    assert!(session.is_established());
    assert!(session.bitfield().has_piece(2));
    assert!(torrent.peers().is_active(peer.address()));
    assert!(!torrent.peers().is_available(peer.address()));
}

#[tokio::test]
async fn test_unreachable_peer_raises_event() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let h = harness(EngineSettings::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::default());
    let peer = peer_at(addr);
    torrent.peers().add_available(Arc::clone(&peer));
    h.engine.add(Arc::clone(&torrent));
    let mut events = h.engine.subscribe();

    h.engine.try_connect();
    let (failed, reason, owner) = next_failure(&mut events).await;
    assert_eq!(failed.address(), peer.address());
    assert_eq!(reason, ConnectionFailureReason::Unreachable);
    assert!(Arc::ptr_eq(&owner, &torrent));

    assert_eq!(peer.failed_attempts(), 1);
    assert!(!torrent.peers().is_known(peer.address()));
    wait_until(|| h.engine.half_open_connections() == 0).await;
}

#[tokio::test]
async fn test_handshake_failure_retries_once_over_fallback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let udp = UdpSocket::bind(addr).await.unwrap();

    let h = harness(EngineSettings::default().with_protocol_policy(ProtocolPolicy::TcpThenUtp));
    let torrent = torrent(TorrentContext::new(16, 64), Arc::default());
    let peer = peer_at(addr);
    torrent.peers().add_available(Arc::clone(&peer));
    h.engine.add(Arc::clone(&torrent));
    let mut events = h.engine.subscribe();

    h.engine.try_connect();
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();

    let (_, reason, _) = next_failure(&mut events).await;
    assert_eq!(reason, ConnectionFailureReason::HandshakeFailed);

    // The retry arrives as a uTP SYN, not a second TCP connect.
    let mut datagram = [0u8; 64];
    let (n, _) = timeout(Duration::from_secs(5), udp.recv_from(&mut datagram))
        .await
        .unwrap()
        .unwrap();
    assert!(n >= 20);
    assert_eq!(datagram[0], 0x41);
    assert!(timeout(Duration::from_millis(300), listener.accept())
        .await
        .is_err());

    assert_eq!(peer.allowed_encryption(), EncryptionTypes::ALL);
    assert_eq!(peer.cleaned_up(), 1);
    assert!(torrent.peers().is_connecting(peer.address()));
}

/// A raw uTP packet with no extensions.
fn utp_packet(kind: u8, connection_id: u16, seq_nr: u16, ack_nr: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![(kind << 4) | 1, 0];
    packet.extend_from_slice(&connection_id.to_be_bytes());
    packet.extend_from_slice(&[0u8; 12]);
    packet.extend_from_slice(&seq_nr.to_be_bytes());
    packet.extend_from_slice(&ack_nr.to_be_bytes());
    packet.extend_from_slice(payload);
    packet
}

#[tokio::test]
async fn test_handshake_fallback_connects_over_utp() {
    const DATA: u8 = 0;
    const STATE: u8 = 2;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let udp = UdpSocket::bind(addr).await.unwrap();

    let h = harness(EngineSettings::default().with_protocol_policy(ProtocolPolicy::TcpThenUtp));
    let handler = Arc::new(RecordingHandler::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::clone(&handler));
    let peer = peer_at(addr);
    torrent.peers().add_available(Arc::clone(&peer));
    h.engine.add(Arc::clone(&torrent));

    let remote = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        stream.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();

        let mut datagram = [0u8; 1500];
        let (n, from) = udp.recv_from(&mut datagram).await.unwrap();
        assert!(n >= 20);
        assert_eq!(datagram[0], 0x41);
        let connection_id = u16::from_be_bytes([datagram[2], datagram[3]]);
        let syn_seq = u16::from_be_bytes([datagram[16], datagram[17]]);
        let our_seq = 100u16;
        udp.send_to(&utp_packet(STATE, connection_id, our_seq, syn_seq, &[]), from)
            .await
            .unwrap();

        // The handshake arrives as one data packet.
        let (n, _) = udp.recv_from(&mut datagram).await.unwrap();
        assert_eq!(datagram[0] >> 4, DATA);
        let data_seq = u16::from_be_bytes([datagram[16], datagram[17]]);
        let ours = Handshake::decode(&datagram[20..n]).unwrap();
        assert_eq!(ours.info_hash, INFO_HASH);
        udp.send_to(&utp_packet(STATE, connection_id, our_seq, data_seq, &[]), from)
            .await
            .unwrap();

        let reply = Handshake::new(INFO_HASH, REMOTE_ID).encode();
        udp.send_to(&utp_packet(DATA, connection_id, our_seq, data_seq, &reply), from)
            .await
            .unwrap();
        (stream, udp)
    });

    h.engine.try_connect();
    let _remote = timeout(Duration::from_secs(5), remote).await.unwrap().unwrap();
    wait_until(|| handler.connected.load(Ordering::SeqCst) == 1).await;

    let session = Arc::clone(&torrent.peers().connected[0]);
    assert_eq!(session.transport().kind(), TransportKind::Utp);
    assert_eq!(peer.peer_id(), PeerId::from_bytes(&REMOTE_ID));
    assert!(peer.allowed_encryption().contains(EncryptionTypes::PLAIN_TEXT));
    assert_eq!(h.engine.open_connections(), 1);
}

#[tokio::test]
async fn test_encryption_failure_narrows_and_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let negotiator = Arc::new(FlakyNegotiator {
        failures: AtomicUsize::new(1),
    });
    let h = harness_with(EngineSettings::default(), negotiator);
    let handler = Arc::new(RecordingHandler::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::clone(&handler));
    let peer = peer_at(addr);
    torrent.peers().add_available(Arc::clone(&peer));
    h.engine.add(Arc::clone(&torrent));
    let mut events = h.engine.subscribe();

    let remote = tokio::spawn(async move {
        let (_first, _) = listener.accept().await.unwrap();
        let (mut second, _) = listener.accept().await.unwrap();
        answer_handshake(&mut second).await;
        second
    });

    h.engine.try_connect();
    let (_, reason, _) = next_failure(&mut events).await;
    assert_eq!(reason, ConnectionFailureReason::EncryptionNegotiationFailed);

    let _stream = timeout(Duration::from_secs(5), remote).await.unwrap().unwrap();
    wait_until(|| handler.connected.load(Ordering::SeqCst) == 1).await;

    assert_eq!(peer.allowed_encryption(), EncryptionTypes::PLAIN_TEXT);
    assert_eq!(peer.cleaned_up(), 1);
    assert_eq!(h.engine.open_connections(), 1);
}

#[tokio::test]
async fn test_incoming_bitfield_mismatch_cleans_up() {
    let h = harness(EngineSettings::default());
    let handler = Arc::new(RecordingHandler::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::clone(&handler));
    h.engine.add(Arc::clone(&torrent));
    let mut events = h.engine.subscribe();

    let (ours, _remote) = tcp_pair().await;
    let session = incoming_session(ours, 3);

    assert!(!h.engine.incoming_connection_accepted(&torrent, Arc::clone(&session)).await);
    let (_, reason, _) = next_failure(&mut events).await;
    assert_eq!(reason, ConnectionFailureReason::ProtocolError);
    assert!(session.is_disposed());
    assert_eq!(handler.connected.load(Ordering::SeqCst), 0);
    assert!(handler.messages.lock().is_empty());
    assert_eq!(torrent.open_connections(), 0);
}

#[tokio::test]
async fn test_incoming_rejects_own_peer_id() {
    let h = harness(EngineSettings::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::default());
    h.engine.add(Arc::clone(&torrent));

    let (ours, _remote) = tcp_pair().await;
    let session = incoming_session(ours, 4);
    session.peer().set_peer_id(*h.engine.local_peer_id());

    assert!(!h.engine.incoming_connection_accepted(&torrent, Arc::clone(&session)).await);
    assert!(session.is_disposed());
    // Our own address is never re-admitted.
    assert!(!torrent.peers().is_available(session.peer().address()));
}

#[tokio::test]
async fn test_incoming_rejected_at_connection_ceiling() {
    let h = harness(EngineSettings::default().with_max_connections(0));
    let torrent = torrent(TorrentContext::new(16, 64), Arc::default());
    h.engine.add(Arc::clone(&torrent));

    let (ours, _remote) = tcp_pair().await;
    let session = incoming_session(ours, 4);
    assert!(!h.engine.incoming_connection_accepted(&torrent, Arc::clone(&session)).await);
    assert!(session.is_disposed());
}

#[tokio::test]
async fn test_incoming_accepted_serves_piece_from_disk() {
    let dir = TempDir::new().unwrap();
    let content: Vec<u8> = (0u8..32).collect();
    let files = vec![TorrentFile::new(dir.path().join("data.bin"), 32, 0)];

    let h = harness(EngineSettings::default());
    h.engine.disk().write(&files, 0, &content).await.unwrap();
    let torrent = Arc::new(
        TorrentManager::new(INFO_HASH, TorrentContext::new(16, 32), files)
            .with_mode(TorrentMode::Seeding),
    );
    h.engine.add(Arc::clone(&torrent));

    let (ours, mut remote) = tcp_pair().await;
    let session = incoming_session(ours, 2);
    assert!(h.engine.incoming_connection_accepted(&torrent, Arc::clone(&session)).await);

    let mut handshake = [0u8; HANDSHAKE_LEN];
    remote.read_exact(&mut handshake).await.unwrap();
    let ours = Handshake::decode(&handshake).unwrap();
    assert_eq!(ours.info_hash, INFO_HASH);
    assert_eq!(&ours.peer_id, h.engine.local_peer_id().as_bytes());
    assert!(torrent.peers().is_active(session.peer().address()));

    // Never served: too long, past the end of piece 1, unknown piece.
    for invalid in [
        BlockRequest::new(0, 0, u32::MAX),
        BlockRequest::new(1, 10, 8),
        BlockRequest::new(5, 0, 4),
    ] {
        h.engine.enqueue(&torrent, &session, Outgoing::Piece(invalid));
    }
    assert_eq!(session.requesting_pieces(), 0);
    assert_eq!(session.queue_len(), 0);

    h.engine.enqueue(
        &torrent,
        &session,
        Outgoing::Piece(BlockRequest::new(1, 4, 8)),
    );

    let mut frame = [0u8; 4 + 9 + 8];
    remote.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame[..4], &17u32.to_be_bytes());
    assert_eq!(frame[4], 7);
    assert_eq!(&frame[5..9], &1u32.to_be_bytes());
    assert_eq!(&frame[9..13], &4u32.to_be_bytes());
    assert_eq!(&frame[13..], &content[20..28]);

    wait_until(|| session.pieces_sent() == 1).await;
    assert_eq!(session.requesting_pieces(), 0);
    assert_eq!(session.monitor().data_up.total(), 8);
    assert_eq!(torrent.monitor().protocol_up.total(), 13);
}

#[tokio::test]
async fn test_disk_failure_sets_error_without_closing() {
    let dir = TempDir::new().unwrap();
    // Declared geometry is larger than the files on disk.
    let files = vec![TorrentFile::new(dir.path().join("short.bin"), 8, 0)];
    let h = harness(EngineSettings::default());
    let torrent = Arc::new(
        TorrentManager::new(INFO_HASH, TorrentContext::new(16, 32), files)
            .with_mode(TorrentMode::Seeding),
    );
    h.engine.add(Arc::clone(&torrent));

    let (ours, mut remote) = tcp_pair().await;
    let session = incoming_session(ours, 2);
    assert!(h.engine.incoming_connection_accepted(&torrent, Arc::clone(&session)).await);
    let mut handshake = [0u8; HANDSHAKE_LEN];
    remote.read_exact(&mut handshake).await.unwrap();

    h.engine.enqueue(
        &torrent,
        &session,
        Outgoing::Piece(BlockRequest::new(1, 0, 16)),
    );
    wait_until(|| torrent.error().is_some()).await;

    assert_eq!(torrent.error().unwrap().reason, ErrorReason::ReadFailure);
    assert_eq!(torrent.mode(), TorrentMode::Error);
    assert!(!session.is_disposed());
    assert_eq!(session.pieces_sent(), 0);
    wait_until(|| !session.is_processing_queue()).await;
    assert_eq!(session.requesting_pieces(), 0);
}

#[tokio::test]
async fn test_cleanup_survives_panicking_picker() {
    let h = harness(EngineSettings::default());
    let torrent = Arc::new(
        TorrentManager::new(INFO_HASH, TorrentContext::new(16, 64), Vec::new())
            .with_mode(TorrentMode::Downloading)
            .with_picker(Arc::new(PanickingPicker)),
    );
    let addr: std::net::SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let peer = peer_at(addr);
    let transport = Arc::new(TcpConnection::new(peer.address().clone(), addr));
    let session = PeerSession::new(Arc::clone(&peer), transport, 4);
    {
        let mut peers = torrent.peers();
        peers.active.push(Arc::clone(&peer));
        peers.connected.push(Arc::clone(&session));
    }
    let mut events = h.engine.subscribe();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        h.engine.cleanup_socket(&torrent, &session)
    }));
    assert!(result.is_err());

    assert!(session.is_disposed());
    assert_eq!(torrent.open_connections(), 0);
    assert!(!torrent.peers().is_active(peer.address()));
    assert!(torrent.peers().is_available(peer.address()));
    let ConnectionEvent::PeerDisconnected { session: gone, .. } = events.try_recv().unwrap() else {
        panic!("expected a disconnect event");
    };
    assert!(Arc::ptr_eq(&gone, &session));

    // Already torn down.
    assert!(!h.engine.cleanup_socket(&torrent, &session));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_cleanup_is_idempotent_and_bans_after_threshold() {
    let h = harness(EngineSettings::default());
    let picker = Arc::new(CountingPicker::default());
    let torrent = Arc::new(
        TorrentManager::new(INFO_HASH, TorrentContext::new(16, 64), Vec::new())
            .with_mode(TorrentMode::Downloading)
            .with_picker(picker.clone()),
    );
    let addr: std::net::SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let peer = peer_at(addr);
    let mut events = h.engine.subscribe();

    for round in 1..=5u32 {
        let transport = Arc::new(TcpConnection::new(peer.address().clone(), addr));
        let session = PeerSession::new(Arc::clone(&peer), transport, 4);
        {
            let mut peers = torrent.peers();
            peers.remove_available(peer.address());
            peers.active.push(Arc::clone(&peer));
            peers.connected.push(Arc::clone(&session));
        }

        let readmitted = h.engine.cleanup_socket(&torrent, &session);
        assert_eq!(readmitted, round < 5, "round {}", round);
        assert!(!h.engine.cleanup_socket(&torrent, &session));
        assert!(session.is_disposed());
        assert!(!torrent.peers().is_active(peer.address()));
    }

    assert_eq!(peer.cleaned_up(), 5);
    assert_eq!(picker.cancelled.load(Ordering::SeqCst), 5);
    let peers = torrent.peers();
    assert!(peers.is_banned(peer.address()));
    assert!(!peers.is_available(peer.address()));
    drop(peers);

    let mut disconnects = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ConnectionEvent::PeerDisconnected { .. }) {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 5);
}

#[tokio::test]
async fn test_cleanup_releases_upload_slot() {
    let h = harness(EngineSettings::default());
    let torrent = torrent(TorrentContext::new(16, 64), Arc::default());
    let addr: std::net::SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let peer = peer_at(addr);
    let transport = Arc::new(TcpConnection::new(peer.address().clone(), addr));
    let session = PeerSession::new(Arc::clone(&peer), transport, 4);

    session.set_am_choking(false);
    torrent.start_uploading();
    torrent.mark_inactive(peer.address().clone());

    assert!(!h.engine.cleanup_socket(&torrent, &session));
    assert_eq!(torrent.uploading_to(), 0);
    // Inactive peers are not re-admitted.
    assert!(!torrent.peers().is_known(peer.address()));
}

#[tokio::test]
async fn test_cancel_pending_connects_only_touches_expired_for_torrent() {
    let silent_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let h = harness(
        EngineSettings::default()
            .with_protocol_policy(ProtocolPolicy::Utp)
            .with_connection_timeout(Duration::from_millis(50)),
    );
    let torrent_a = torrent(TorrentContext::new(16, 64), Arc::default());
    let torrent_b = torrent(TorrentContext::new(16, 64), Arc::default());
    let peer_a = peer_at(silent_a.local_addr().unwrap());
    torrent_a.peers().add_available(Arc::clone(&peer_a));
    torrent_b
        .peers()
        .add_available(peer_at(silent_b.local_addr().unwrap()));
    h.engine.add(Arc::clone(&torrent_a));
    h.engine.add(Arc::clone(&torrent_b));
    let mut events = h.engine.subscribe();

    h.engine.try_connect();
    assert_eq!(h.engine.half_open_connections(), 2);
    assert_eq!(h.engine.cancel_pending_connects(&torrent_a), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.engine.cancel_pending_connects(&torrent_a), 1);
    assert_eq!(h.engine.half_open_connections(), 1);
    assert!(!torrent_a.peers().is_connecting(peer_a.address()));

    let (failed, reason, owner) = next_failure(&mut events).await;
    assert_eq!(failed.address(), peer_a.address());
    assert_eq!(reason, ConnectionFailureReason::Unreachable);
    assert!(Arc::ptr_eq(&owner, &torrent_a));
    assert_eq!(h.engine.half_open_connections(), 1);
}

#[tokio::test]
async fn test_ban_filter_and_seeder_skipping() {
    let h = harness(EngineSettings::default());
    h.engine.set_ban_filter(|peer| peer.address().port() == Some(1));

    let torrent = Arc::new(
        TorrentManager::new(INFO_HASH, TorrentContext::new(16, 64), Vec::new())
            .with_mode(TorrentMode::Seeding),
    );
    let banned = peer_at("127.0.0.1:1".parse().unwrap());
    let seeder = peer_at("127.0.0.1:2".parse().unwrap());
    seeder.set_seeder(true);
    torrent.peers().add_available(Arc::clone(&banned));
    torrent.peers().add_available(Arc::clone(&seeder));
    h.engine.add(Arc::clone(&torrent));

    h.engine.try_connect();
    assert_eq!(h.engine.half_open_connections(), 0);
    let peers = torrent.peers();
    assert!(peers.is_banned(banned.address()));
    assert!(peers.is_available(seeder.address()));
}

#[tokio::test]
async fn test_stopped_torrent_does_not_connect() {
    let h = harness(EngineSettings::default());
    let torrent = Arc::new(TorrentManager::new(
        INFO_HASH,
        TorrentContext::new(16, 64),
        Vec::new(),
    ));
    torrent
        .peers()
        .add_available(peer_at("127.0.0.1:3".parse().unwrap()));
    h.engine.add(Arc::clone(&torrent));

    h.engine.try_connect();
    assert_eq!(h.engine.half_open_connections(), 0);
    assert_eq!(torrent.peers().available.len(), 1);
}

#[tokio::test]
async fn test_stop_torrent_tears_down_without_waiting_for_announce() {
    let dir = TempDir::new().unwrap();
    let files = vec![TorrentFile::new(dir.path().join("data.bin"), 32, 0)];
    let h = harness(EngineSettings::default());
    h.engine.disk().write(&files, 0, &[1u8; 32]).await.unwrap();
    assert_eq!(h.engine.disk().writer().open_files().await, 1);

    let picker = Arc::new(CountingPicker::default());
    let announcer = Arc::new(HangingAnnouncer::default());
    let torrent = Arc::new(
        TorrentManager::new(INFO_HASH, TorrentContext::new(16, 32), files)
            .with_mode(TorrentMode::Seeding)
            .with_picker(picker.clone())
            .with_announcer(announcer.clone()),
    );
    h.engine.add(Arc::clone(&torrent));

    let (ours, mut remote) = tcp_pair().await;
    let session = incoming_session(ours, 2);
    assert!(h.engine.incoming_connection_accepted(&torrent, Arc::clone(&session)).await);
    let mut handshake = [0u8; HANDSHAKE_LEN];
    remote.read_exact(&mut handshake).await.unwrap();

    timeout(Duration::from_secs(5), h.engine.stop_torrent(&torrent))
        .await
        .expect("stop blocked");

    assert_eq!(torrent.mode(), TorrentMode::Stopped);
    assert!(session.is_disposed());
    assert_eq!(torrent.open_connections(), 0);
    assert!(torrent.peers().available.is_empty());
    assert_eq!(picker.resets.load(Ordering::SeqCst), 1);
    assert_eq!(h.engine.disk().writer().open_files().await, 0);

    wait_until(|| !announcer.events.lock().is_empty()).await;
    assert_eq!(announcer.events.lock()[0], TrackerEvent::Stopped);
}
