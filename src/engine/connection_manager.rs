use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::events::{BanFilter, ConnectionEvent};
use crate::cache::BufferPool;
use crate::connection::{ConnectionFactory, Transport};
use crate::constants::{
    BLOCK_SIZE, EVENT_CHANNEL_CAPACITY, MAX_AUTOMATIC_RETRIES, MAX_CLEANUPS_BEFORE_BAN,
};
use crate::peer::io::{self, Accounting};
use crate::peer::{
    ConnectionFailureReason, EncryptionNegotiator, EncryptionTypes, Handshake, Message, Outgoing,
    Peer, PeerError, PeerId, PeerSession,
};
use crate::settings::EngineSettings;
use crate::storage::DiskManager;
use crate::torrent::{ErrorReason, TorrentManager};

/// An outgoing connect that has not completed yet.
struct PendingConnect {
    torrent: Arc<TorrentManager>,
    transport: Arc<dyn Transport>,
    peer: Arc<Peer>,
    started: Instant,
}

#[derive(Default)]
struct EngineState {
    /// Round-robin order for the connect scheduler.
    torrents: VecDeque<Arc<TorrentManager>>,
    pending: Vec<PendingConnect>,
}

/// How one pass through the outgoing pipeline ended.
enum AttemptOutcome {
    Established,
    /// Dropped without counting against the peer.
    Abandoned,
    Failed,
    /// The peer was re-admitted and may be tried again on this transport.
    Retry(Arc<dyn Transport>),
}

/// Sends [`ConnectionEvent::PeerDisconnected`] when dropped.
struct DisconnectNotice<'a> {
    events: &'a broadcast::Sender<ConnectionEvent>,
    torrent: &'a Arc<TorrentManager>,
    session: &'a Arc<PeerSession>,
}

impl Drop for DisconnectNotice<'_> {
    fn drop(&mut self) {
        let _ = self.events.send(ConnectionEvent::PeerDisconnected {
            torrent: Arc::clone(self.torrent),
            session: Arc::clone(self.session),
        });
    }
}

fn same_transport(a: &Arc<dyn Transport>, b: &Arc<dyn Transport>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Opens, accepts, drives and tears down peer connections for every
/// registered torrent.
pub struct ConnectionManager {
    local_peer_id: PeerId,
    settings: EngineSettings,
    negotiator: Arc<dyn EncryptionNegotiator>,
    disk: DiskManager,
    pool: Arc<BufferPool>,
    state: Mutex<EngineState>,
    ban_filter: Mutex<Option<BanFilter>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        local_peer_id: PeerId,
        settings: EngineSettings,
        negotiator: Arc<dyn EncryptionNegotiator>,
        disk: DiskManager,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            local_peer_id,
            settings,
            negotiator,
            disk,
            pool: BufferPool::shared(),
            state: Mutex::new(EngineState::default()),
            ban_filter: Mutex::new(None),
            events,
        })
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn disk(&self) -> &DiskManager {
        &self.disk
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Installs the callback consulted before connecting to a peer.
    pub fn set_ban_filter<F>(&self, filter: F)
    where
        F: Fn(&Peer) -> bool + Send + Sync + 'static,
    {
        *self.ban_filter.lock() = Some(Arc::new(filter));
    }

    /// Registers a torrent. Returns false if it was already registered.
    pub fn add(&self, torrent: Arc<TorrentManager>) -> bool {
        let mut state = self.state.lock();
        if state.torrents.iter().any(|t| Arc::ptr_eq(t, &torrent)) {
            return false;
        }
        state.torrents.push_back(torrent);
        true
    }

    pub fn remove(&self, torrent: &Arc<TorrentManager>) -> bool {
        let mut state = self.state.lock();
        match state.torrents.iter().position(|t| Arc::ptr_eq(t, torrent)) {
            Some(index) => {
                state.torrents.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, torrent: &Arc<TorrentManager>) -> bool {
        self.state
            .lock()
            .torrents
            .iter()
            .any(|t| Arc::ptr_eq(t, torrent))
    }

    fn torrents(&self) -> Vec<Arc<TorrentManager>> {
        self.state.lock().torrents.iter().cloned().collect()
    }

    /// Sessions currently registered across all torrents.
    pub fn open_connections(&self) -> usize {
        self.torrents().iter().map(|t| t.open_connections()).sum()
    }

    /// Outgoing connects still in progress.
    pub fn half_open_connections(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn can_open_more(&self) -> bool {
        self.open_connections() < self.settings.max_connections
            && self.half_open_connections() < self.settings.max_half_open_connections
    }

    fn is_banned(&self, peer: &Peer) -> bool {
        let filter = self.ban_filter.lock().clone();
        filter.is_some_and(|f| f(peer))
    }

    fn raise_failed(
        &self,
        peer: &Arc<Peer>,
        reason: ConnectionFailureReason,
        torrent: &Arc<TorrentManager>,
    ) {
        debug!(peer = %peer.address(), %reason, "connection attempt failed");
        let _ = self.events.send(ConnectionEvent::AttemptFailed {
            peer: Arc::clone(peer),
            reason,
            torrent: Arc::clone(torrent),
        });
    }

    /// Starts outgoing connects until a ceiling is reached or no torrent
    /// has a connectable peer.
    pub fn try_connect(self: &Arc<Self>) {
        loop {
            let mut launched = None;
            for torrent in self.torrents() {
                if !self.can_open_more() {
                    return;
                }
                if self.try_connect_torrent(&torrent) {
                    launched = Some(torrent);
                    break;
                }
            }

            let Some(torrent) = launched else {
                return;
            };
            let mut state = self.state.lock();
            if let Some(index) = state.torrents.iter().position(|t| Arc::ptr_eq(t, &torrent)) {
                if let Some(torrent) = state.torrents.remove(index) {
                    state.torrents.push_back(torrent);
                }
            }
        }
    }

    fn try_connect_torrent(self: &Arc<Self>, torrent: &Arc<TorrentManager>) -> bool {
        let mode = torrent.mode();
        if !mode.can_accept_connections()
            || torrent.open_connections() >= torrent.settings().max_connections
        {
            return false;
        }

        let peer = loop {
            let Some(candidate) = torrent.peers().take_available(|p| mode.should_connect(p)) else {
                return false;
            };
            if self.is_banned(&candidate) {
                debug!(peer = %candidate.address(), "peer banned by filter");
                torrent.peers().ban(candidate);
                continue;
            }
            break candidate;
        };

        let Some(transport) = ConnectionFactory::create(peer.address(), self.settings.protocol_policy)
        else {
            trace!(peer = %peer.address(), "no transport for address");
            torrent.peers().available.push_back(peer);
            return false;
        };

        self.register_pending(torrent, &peer, &transport);
        let this = Arc::clone(self);
        let torrent = Arc::clone(torrent);
        tokio::spawn(async move {
            this.run_outgoing(torrent, peer, transport).await;
        });
        true
    }

    fn register_pending(
        &self,
        torrent: &Arc<TorrentManager>,
        peer: &Arc<Peer>,
        transport: &Arc<dyn Transport>,
    ) {
        torrent.peers().connecting.push(Arc::clone(peer));
        self.state.lock().pending.push(PendingConnect {
            torrent: Arc::clone(torrent),
            transport: Arc::clone(transport),
            peer: Arc::clone(peer),
            started: Instant::now(),
        });
    }

    fn remove_pending(&self, transport: &Arc<dyn Transport>) -> bool {
        let mut state = self.state.lock();
        match state
            .pending
            .iter()
            .position(|p| same_transport(&p.transport, transport))
        {
            Some(index) => {
                state.pending.swap_remove(index);
                true
            }
            None => false,
        }
    }

    async fn run_outgoing(
        self: Arc<Self>,
        torrent: Arc<TorrentManager>,
        peer: Arc<Peer>,
        transport: Arc<dyn Transport>,
    ) {
        let mut transport = transport;
        let mut retries = 0;
        loop {
            match self.attempt(&torrent, &peer, Arc::clone(&transport)).await {
                AttemptOutcome::Retry(next) if retries < MAX_AUTOMATIC_RETRIES => {
                    // Cleanup re-admitted the peer; claim it back for the retry.
                    if torrent.peers().remove_available(peer.address()).is_none() {
                        break;
                    }
                    retries += 1;
                    debug!(peer = %peer.address(), transport = %next.kind(), "retrying connection");
                    self.register_pending(&torrent, &peer, &next);
                    transport = next;
                }
                AttemptOutcome::Retry(_)
                | AttemptOutcome::Established
                | AttemptOutcome::Abandoned
                | AttemptOutcome::Failed => break,
            }
        }
        self.try_connect();
    }

    async fn attempt(
        self: &Arc<Self>,
        torrent: &Arc<TorrentManager>,
        peer: &Arc<Peer>,
        transport: Arc<dyn Transport>,
    ) -> AttemptOutcome {
        debug!(peer = %peer.address(), transport = %transport.kind(), "connecting");
        let connected = transport.connect().await;
        self.remove_pending(&transport);
        torrent.peers().remove_connecting(peer.address());

        if let Err(e) = connected {
            trace!(peer = %peer.address(), error = %e, "connect failed");
            peer.record_failed_attempt();
            transport.dispose();
            self.raise_failed(peer, ConnectionFailureReason::Unreachable, torrent);
            return AttemptOutcome::Failed;
        }

        if !self.contains(torrent)
            || !torrent.mode().can_accept_connections()
            || self.open_connections() >= self.settings.max_connections
        {
            trace!(peer = %peer.address(), "torrent not accepting connections");
            transport.dispose();
            torrent.peers().add_available(Arc::clone(peer));
            return AttemptOutcome::Abandoned;
        }

        let session = PeerSession::new(
            Arc::clone(peer),
            Arc::clone(&transport),
            torrent.context().piece_count(),
        );
        {
            let mut peers = torrent.peers();
            peers.active.push(Arc::clone(peer));
            peers.connected.push(Arc::clone(&session));
        }

        let handshake = Handshake::new(*torrent.info_hash(), *self.local_peer_id.as_bytes());
        if let Err(e) = self.negotiate(&session, &handshake).await {
            trace!(peer = %peer.address(), error = %e, "encryption negotiation failed");
            peer.forbid_encryption(EncryptionTypes::RC4_ALL);
            self.raise_failed(peer, ConnectionFailureReason::EncryptionNegotiationFailed, torrent);
            if self.cleanup_socket(torrent, &session) {
                return ConnectionFactory::create(peer.address(), self.settings.protocol_policy)
                    .map_or(AttemptOutcome::Failed, AttemptOutcome::Retry);
            }
            return AttemptOutcome::Failed;
        }

        if let Err(e) = self.receive_handshake(torrent, &session).await {
            trace!(peer = %peer.address(), error = %e, "handshake failed");
            peer.forbid_encryption(session.encryption());
            self.raise_failed(peer, ConnectionFailureReason::HandshakeFailed, torrent);
            if self.cleanup_socket(torrent, &session) {
                let Some(next) = ConnectionFactory::fallback(
                    peer.address(),
                    transport.kind(),
                    self.settings.protocol_policy,
                ) else {
                    return AttemptOutcome::Failed;
                };
                // A fresh transport starts from the configured encryption set.
                peer.set_allowed_encryption(self.settings.allowed_encryption);
                return AttemptOutcome::Retry(next);
            }
            return AttemptOutcome::Failed;
        }

        if !bitfield_matches(torrent, &session) {
            self.raise_failed(peer, ConnectionFailureReason::ProtocolError, torrent);
            self.cleanup_socket(torrent, &session);
            return AttemptOutcome::Failed;
        }

        if self.open_connections() > self.settings.max_connections {
            trace!(peer = %peer.address(), "open connection ceiling reached");
            self.cleanup_socket(torrent, &session);
            return AttemptOutcome::Abandoned;
        }

        match self.establish(torrent, &session) {
            Ok(()) => AttemptOutcome::Established,
            Err(reason) => {
                self.raise_failed(peer, reason, torrent);
                self.cleanup_socket(torrent, &session);
                AttemptOutcome::Failed
            }
        }
    }

    async fn negotiate(&self, session: &PeerSession, handshake: &Handshake) -> Result<(), PeerError> {
        let transport = session.transport();
        let pair = self
            .negotiator
            .outgoing(transport.as_ref(), session.peer().allowed_encryption(), handshake)
            .await?;
        let handshake_sent = pair.handshake_sent;
        session.install_encryption(pair).await;

        if !handshake_sent {
            let mut encryptor = session.encryptor().lock().await;
            io::send_handshake(transport.as_ref(), &mut **encryptor, handshake).await?;
        }
        Ok(())
    }

    async fn receive_handshake(
        &self,
        torrent: &TorrentManager,
        session: &PeerSession,
    ) -> Result<(), PeerError> {
        let handshake = {
            let mut decryptor = session.decryptor().lock().await;
            io::receive_handshake(session.transport().as_ref(), &mut **decryptor).await?
        };
        if handshake.info_hash != *torrent.info_hash() {
            return Err(PeerError::InfoHashMismatch);
        }
        if let Some(id) = PeerId::from_bytes(&handshake.peer_id) {
            session.peer().set_peer_id(id);
        }
        Ok(())
    }

    /// Marks the session connected, lets the torrent react and starts the
    /// receive loop.
    fn establish(
        self: &Arc<Self>,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
    ) -> Result<(), ConnectionFailureReason> {
        if session.is_disposed() {
            return Err(ConnectionFailureReason::Unknown);
        }
        session.mark_established();
        session.transport().attach_torrent(torrent.context());
        debug!(peer = %session.peer().address(), "peer connected");

        for item in torrent.handler().handle_peer_connected(session) {
            self.enqueue(torrent, session, item);
        }
        if session.begin_processing() {
            self.spawn_queue(torrent, session);
        }

        let this = Arc::clone(self);
        let torrent = Arc::clone(torrent);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            this.receive_loop(torrent, session).await;
        });
        Ok(())
    }

    /// Takes ownership of a connection accepted by a listener whose
    /// handshake has already been read.
    ///
    /// Returns false if the connection was rejected.
    pub async fn incoming_connection_accepted(
        self: &Arc<Self>,
        torrent: &Arc<TorrentManager>,
        session: Arc<PeerSession>,
    ) -> bool {
        let peer = Arc::clone(session.peer());
        let limit = self
            .settings
            .max_connections
            .min(torrent.settings().max_connections);

        if peer.peer_id() == Some(self.local_peer_id) || self.open_connections() >= limit {
            debug!(peer = %peer.address(), "rejecting incoming connection");
            self.cleanup_socket(torrent, &session);
            return false;
        }

        if torrent.peers().is_active(peer.address()) {
            trace!(peer = %peer.address(), "already connected to peer");
            session.transport().dispose();
            return false;
        }

        if !bitfield_matches(torrent, &session) {
            self.raise_failed(&peer, ConnectionFailureReason::ProtocolError, torrent);
            self.cleanup_socket(torrent, &session);
            return false;
        }

        {
            let mut peers = torrent.peers();
            peers.remove_available(peer.address());
            peers.active.push(Arc::clone(&peer));
            peers.connected.push(Arc::clone(&session));
        }
        session.restart_timers();

        let handshake = Handshake::new(*torrent.info_hash(), *self.local_peer_id.as_bytes());
        let sent = {
            let mut encryptor = session.encryptor().lock().await;
            io::send_handshake(session.transport().as_ref(), &mut **encryptor, &handshake).await
        };
        if let Err(e) = sent {
            debug!(peer = %peer.address(), error = %e, "failed to send handshake");
            self.cleanup_socket(torrent, &session);
            return false;
        }

        if let Err(reason) = self.establish(torrent, &session) {
            self.raise_failed(&peer, reason, torrent);
            self.cleanup_socket(torrent, &session);
            return false;
        }
        true
    }

    /// Cancels this torrent's connects that have been pending longer than
    /// the connection timeout. Returns how many were cancelled.
    pub fn cancel_pending_connects(&self, torrent: &Arc<TorrentManager>) -> usize {
        self.cancel_pending(torrent, Some(self.settings.connection_timeout))
    }

    pub(crate) fn cancel_all_pending_connects(&self, torrent: &Arc<TorrentManager>) -> usize {
        self.cancel_pending(torrent, None)
    }

    fn cancel_pending(&self, torrent: &Arc<TorrentManager>, older_than: Option<Duration>) -> usize {
        let cancelled: Vec<PendingConnect> = {
            let mut state = self.state.lock();
            let (cancel, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|p| {
                    Arc::ptr_eq(&p.torrent, torrent)
                        && older_than.map_or(true, |timeout| p.started.elapsed() > timeout)
                });
            state.pending = keep;
            cancel
        };

        for pending in &cancelled {
            debug!(peer = %pending.peer.address(), "cancelling pending connect");
            torrent.peers().remove_connecting(pending.peer.address());
            pending.transport.dispose();
        }
        cancelled.len()
    }

    /// Tears down `session`. Calling it again for the same session does
    /// nothing.
    ///
    /// Returns true if the peer went back to the front of the available
    /// queue.
    pub fn cleanup_socket(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) -> bool {
        let was_choking = session.am_choking();
        if !session.dispose() {
            return false;
        }

        let peer = session.peer();
        let address = peer.address();
        let can_reuse = session.transport().can_reconnect()
            && !torrent.is_inactive(address)
            && !peer.allowed_encryption().is_empty();
        let cleaned_up = peer.record_cleanup();

        let readmitted = {
            let mut peers = torrent.peers();
            peers.remove_connected(session.id());
            peers.remove_active(address);

            if can_reuse && peer.peer_id() != Some(self.local_peer_id) {
                if cleaned_up < MAX_CLEANUPS_BEFORE_BAN {
                    peers.readmit(Arc::clone(peer));
                    true
                } else {
                    debug!(peer = %address, cleaned_up, "banning peer");
                    peers.remove_available(address);
                    peers.ban(Arc::clone(peer));
                    false
                }
            } else {
                false
            }
        };

        // Sent on drop, even if the picker panics.
        let _notice = DisconnectNotice {
            events: &self.events,
            torrent,
            session,
        };
        if !was_choking {
            torrent.stop_uploading();
        }
        trace!(peer = %address, readmitted, "peer disconnected");
        torrent.picker().cancel_requests(session);
        readmitted
    }

    /// Queues `item` for `session`, starting the drainer if it is idle.
    pub fn enqueue(
        self: &Arc<Self>,
        torrent: &Arc<TorrentManager>,
        session: &Arc<PeerSession>,
        item: Outgoing,
    ) {
        if session.is_disposed() {
            return;
        }
        if let Outgoing::Piece(request) = &item {
            if request.length == 0
                || request.length as usize > BLOCK_SIZE
                || !torrent
                    .context()
                    .contains_block(request.index, request.begin, request.length as u64)
            {
                debug!(
                    peer = %session.peer().address(),
                    index = request.index,
                    begin = request.begin,
                    length = request.length,
                    "dropping invalid block request"
                );
                return;
            }
            session.add_requesting_piece();
        }
        if session.enqueue(item) {
            self.spawn_queue(torrent, session);
        }
    }

    fn spawn_queue(self: &Arc<Self>, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        let this = Arc::clone(self);
        let torrent = Arc::clone(torrent);
        let session = Arc::clone(session);
        tokio::spawn(async move {
            this.process_queue(&torrent, &session).await;
        });
    }

    /// Sends queued items until the queue is empty, a send fails or a
    /// piece cannot be read from disk.
    async fn process_queue(&self, torrent: &Arc<TorrentManager>, session: &Arc<PeerSession>) {
        while let Some(item) = session.next_outgoing() {
            let message = match item {
                Outgoing::Message(message) => message,
                Outgoing::Piece(request) => {
                    let mut data = self.pool.rent(request.length as usize);
                    let offset = torrent.context().offset_of(request.index, request.begin);
                    if let Err(e) = self.disk.read_exact(torrent.files(), offset, &mut data).await {
                        warn!(
                            peer = %session.peer().address(),
                            index = request.index,
                            begin = request.begin,
                            error = %e,
                            "failed to read block for peer"
                        );
                        torrent.try_set_error(ErrorReason::ReadFailure, e.to_string());
                        session.piece_abandoned();
                        session.stop_processing();
                        return;
                    }
                    Message::Piece {
                        index: request.index,
                        begin: request.begin,
                        data,
                    }
                }
            };

            let is_piece = message.is_piece();
            let accounting = Accounting::new(
                Some(torrent.limiters().upload().as_ref()),
                Some(session.monitor()),
                Some(torrent.monitor()),
            );
            let sent = {
                let mut encryptor = session.encryptor().lock().await;
                io::send_message(
                    session.transport().as_ref(),
                    &mut **encryptor,
                    &message,
                    accounting,
                    &self.pool,
                )
                .await
            };
            drop(message);

            if let Err(e) = sent {
                debug!(peer = %session.peer().address(), error = %e, "send failed");
                session.stop_processing();
                self.cleanup_socket(torrent, session);
                return;
            }
            if is_piece {
                session.piece_sent();
            }
            session.message_sent();
        }
    }

    async fn receive_loop(self: Arc<Self>, torrent: Arc<TorrentManager>, session: Arc<PeerSession>) {
        loop {
            let accounting = Accounting::new(
                Some(torrent.limiters().download().as_ref()),
                Some(session.monitor()),
                Some(torrent.monitor()),
            );
            let received = {
                let mut decryptor = session.decryptor().lock().await;
                io::receive_message(
                    session.transport().as_ref(),
                    &mut **decryptor,
                    accounting,
                    torrent.context(),
                    &self.pool,
                )
                .await
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => {
                    trace!(peer = %session.peer().address(), error = %e, "receive loop ended");
                    self.cleanup_socket(&torrent, &session);
                    return;
                }
            };

            if session.is_disposed() {
                // Drop without dispatch; piece buffers go back to the pool.
                return;
            }
            session.message_received(message.is_piece());
            if !torrent.mode().can_handle_messages() {
                continue;
            }

            apply_availability(&session, &message);
            match torrent.handler().handle_message(&session, message) {
                Ok(replies) => {
                    for item in replies {
                        self.enqueue(&torrent, &session, item);
                    }
                }
                Err(e) => {
                    debug!(peer = %session.peer().address(), error = %e, "message rejected");
                    self.cleanup_socket(&torrent, &session);
                    return;
                }
            }
        }
    }
}

fn bitfield_matches(torrent: &TorrentManager, session: &PeerSession) -> bool {
    let ours = torrent.context().piece_count();
    let theirs = session.bitfield().len();
    if ours != theirs {
        debug!(peer = %session.peer().address(), ours, theirs, "bitfield length mismatch");
        return false;
    }
    true
}

/// Records which pieces the remote side advertises.
fn apply_availability(session: &PeerSession, message: &Message) {
    let complete = {
        let mut bitfield = session.bitfield();
        match message {
            Message::Have { piece } => bitfield.set_piece(*piece as usize),
            Message::Bitfield(bytes) => bitfield.fill_from(bytes),
            Message::HaveAll => bitfield.set_all(),
            _ => return,
        }
        bitfield.is_complete()
    };
    session.peer().set_seeder(complete);
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_peer_id", &self.local_peer_id)
            .field("half_open", &self.half_open_connections())
            .finish()
    }
}
