use std::fmt;
use std::sync::Arc;

use crate::peer::{ConnectionFailureReason, Peer, PeerSession};
use crate::torrent::TorrentManager;

/// Notifications raised by the [`ConnectionManager`](super::ConnectionManager).
#[derive(Clone)]
pub enum ConnectionEvent {
    /// An outgoing attempt, or the setup of an accepted connection, failed.
    AttemptFailed {
        peer: Arc<Peer>,
        reason: ConnectionFailureReason,
        torrent: Arc<TorrentManager>,
    },
    /// A session was cleaned up.
    PeerDisconnected {
        torrent: Arc<TorrentManager>,
        session: Arc<PeerSession>,
    },
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::AttemptFailed { peer, reason, .. } => f
                .debug_struct("AttemptFailed")
                .field("peer", peer.address())
                .field("reason", reason)
                .finish(),
            ConnectionEvent::PeerDisconnected { session, .. } => f
                .debug_struct("PeerDisconnected")
                .field("session", &session.id())
                .field("peer", session.peer().address())
                .finish(),
        }
    }
}

/// Decides whether a peer must not be connected to.
pub type BanFilter = Arc<dyn Fn(&Peer) -> bool + Send + Sync>;
