use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::AbortHandle;

use super::bitfield::Bitfield;
use super::encryption::{EncryptionTypes, EncryptorPair, PlainText, StreamCipher};
use super::message::{BlockRequest, Message};
use super::record::Peer;
use crate::connection::Transport;
use crate::monitor::ConnectionMonitor;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// An entry in a session's outbound queue.
#[derive(Debug)]
pub enum Outgoing {
    /// Sent as-is.
    Message(Message),
    /// Filled from disk when the queue is drained.
    Piece(BlockRequest),
}

struct SessionState {
    queue: VecDeque<Outgoing>,
    processing_queue: bool,
    pieces_sent: u64,
    requesting_pieces: u32,
    connected_at: Instant,
    last_message_sent: Instant,
    last_message_received: Instant,
    last_block_received: Option<Instant>,
}

/// A live connection to one peer.
pub struct PeerSession {
    id: u64,
    peer: Arc<Peer>,
    transport: Arc<dyn Transport>,
    encryptor: tokio::sync::Mutex<Box<dyn StreamCipher>>,
    decryptor: tokio::sync::Mutex<Box<dyn StreamCipher>>,
    encryption: AtomicU8,
    bitfield: Mutex<Bitfield>,
    state: Mutex<SessionState>,
    disposed: AtomicBool,
    established: AtomicBool,
    am_choking: AtomicBool,
    pex: Mutex<Option<AbortHandle>>,
    monitor: ConnectionMonitor,
}

impl PeerSession {
    /// Creates a plain-text session whose bitfield tracks `piece_count`
    /// pieces.
    pub fn new(peer: Arc<Peer>, transport: Arc<dyn Transport>, piece_count: usize) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            transport,
            encryptor: tokio::sync::Mutex::new(Box::new(PlainText)),
            decryptor: tokio::sync::Mutex::new(Box::new(PlainText)),
            encryption: AtomicU8::new(EncryptionTypes::NONE.bits()),
            bitfield: Mutex::new(Bitfield::new(piece_count)),
            state: Mutex::new(SessionState {
                queue: VecDeque::new(),
                processing_queue: false,
                pieces_sent: 0,
                requesting_pieces: 0,
                connected_at: now,
                last_message_sent: now,
                last_message_received: now,
                last_block_received: None,
            }),
            disposed: AtomicBool::new(false),
            established: AtomicBool::new(false),
            am_choking: AtomicBool::new(true),
            pex: Mutex::new(None),
            monitor: ConnectionMonitor::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn encryptor(&self) -> &tokio::sync::Mutex<Box<dyn StreamCipher>> {
        &self.encryptor
    }

    pub fn decryptor(&self) -> &tokio::sync::Mutex<Box<dyn StreamCipher>> {
        &self.decryptor
    }

    /// Installs negotiated ciphers.
    pub async fn install_encryption(&self, pair: EncryptorPair) {
        self.encryption.store(pair.kind.bits(), Ordering::Release);
        *self.encryptor.lock().await = pair.encryptor;
        *self.decryptor.lock().await = pair.decryptor;
    }

    /// Forgets the negotiated mode.
    pub fn clear_encryption(&self) {
        self.encryption
            .store(EncryptionTypes::NONE.bits(), Ordering::Release);
    }

    /// The negotiated mode, or [`EncryptionTypes::NONE`] before negotiation.
    pub fn encryption(&self) -> EncryptionTypes {
        EncryptionTypes::from_bits(self.encryption.load(Ordering::Acquire))
    }

    pub fn bitfield(&self) -> parking_lot::MutexGuard<'_, Bitfield> {
        self.bitfield.lock()
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Marks the session disposed and closes the transport. Returns false if
    /// it was already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.dispose_pex();
        self.transport.dispose();
        let mut state = self.state.lock();
        state.queue.clear();
        state.requesting_pieces = 0;
        true
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking.load(Ordering::Acquire)
    }

    pub fn set_am_choking(&self, choking: bool) {
        self.am_choking.store(choking, Ordering::Release);
    }

    /// Attaches the peer-exchange task for this session.
    pub fn set_pex(&self, handle: AbortHandle) {
        if let Some(old) = self.pex.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn dispose_pex(&self) {
        if let Some(handle) = self.pex.lock().take() {
            handle.abort();
        }
    }

    /// Queues `item`. Returns true if the caller should start draining.
    pub fn enqueue(&self, item: Outgoing) -> bool {
        let mut state = self.state.lock();
        state.queue.push_back(item);
        if state.processing_queue {
            false
        } else {
            state.processing_queue = true;
            true
        }
    }

    /// Claims the drainer role if the queue has work and nobody holds it.
    pub fn begin_processing(&self) -> bool {
        let mut state = self.state.lock();
        if state.processing_queue || state.queue.is_empty() {
            return false;
        }
        state.processing_queue = true;
        true
    }

    /// Pops the next item, releasing the drainer role when the queue is empty.
    pub fn next_outgoing(&self) -> Option<Outgoing> {
        let mut state = self.state.lock();
        let item = state.queue.pop_front();
        if item.is_none() {
            state.processing_queue = false;
        }
        item
    }

    /// Gives up the drainer role without emptying the queue.
    pub fn stop_processing(&self) {
        self.state.lock().processing_queue = false;
    }

    pub fn is_processing_queue(&self) -> bool {
        self.state.lock().processing_queue
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Resets every timer to now.
    pub fn restart_timers(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.connected_at = now;
        state.last_message_sent = now;
        state.last_message_received = now;
        state.last_block_received = None;
    }

    pub fn message_sent(&self) {
        self.state.lock().last_message_sent = Instant::now();
    }

    pub fn message_received(&self, piece: bool) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_message_received = now;
        if piece {
            state.last_block_received = Some(now);
        }
    }

    /// Records a request from the peer that we still owe a piece for.
    pub fn add_requesting_piece(&self) {
        self.state.lock().requesting_pieces += 1;
    }

    /// Records a piece response leaving the queue.
    pub fn piece_sent(&self) {
        let mut state = self.state.lock();
        state.pieces_sent += 1;
        state.requesting_pieces = state.requesting_pieces.saturating_sub(1);
    }

    /// Records a queued piece response that will never be sent.
    pub fn piece_abandoned(&self) {
        let mut state = self.state.lock();
        state.requesting_pieces = state.requesting_pieces.saturating_sub(1);
    }

    pub fn pieces_sent(&self) -> u64 {
        self.state.lock().pieces_sent
    }

    pub fn requesting_pieces(&self) -> u32 {
        self.state.lock().requesting_pieces
    }

    pub fn time_since_connected(&self) -> Duration {
        self.state.lock().connected_at.elapsed()
    }

    pub fn time_since_last_message_sent(&self) -> Duration {
        self.state.lock().last_message_sent.elapsed()
    }

    pub fn time_since_last_message_received(&self) -> Duration {
        self.state.lock().last_message_received.elapsed()
    }

    pub fn time_since_last_block(&self) -> Option<Duration> {
        self.state.lock().last_block_received.map(|t| t.elapsed())
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("address", self.peer.address())
            .field("transport", &self.transport.kind())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
